//! Operator-driven block rules pushed into a Web ACL.
//!
//! Each push creates a fresh match set (IP set or regex pattern set), then
//! inserts a block rule referencing it ahead of every existing rule through
//! the guarded updater.

use crate::config::RuleSettings;
use crate::error::WafError;
use crate::model::{
    BlockAddress, BlockRule, CollectionRef, LockToken, RuleStatement, Scope, VisibilityConfig,
};
use crate::updater::GuardedUpdater;
use crate::waf::WafApi;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// What a successful push created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub rule_name: String,
    /// ARN of the IP set or regex pattern set the rule references.
    pub set_arn: String,
    /// Web ACL version after the insert.
    pub lock_token: LockToken,
}

/// Seconds since the epoch, used to keep generated names unique.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Pushes block rules into Web ACLs.
pub struct BlockPusher<'a, W> {
    waf: &'a W,
    settings: &'a RuleSettings,
}

impl<'a, W: WafApi> BlockPusher<'a, W> {
    pub fn new(waf: &'a W, settings: &'a RuleSettings) -> Self {
        Self { waf, settings }
    }

    /// Resolve a Web ACL by name, failing with `NotFound` if absent.
    pub async fn resolve_web_acl(
        &self,
        name: &str,
        scope: Scope,
    ) -> Result<CollectionRef, WafError> {
        self.waf
            .find_web_acl(name, scope)
            .await?
            .ok_or_else(|| WafError::NotFound(format!("Web ACL '{}' in scope {}", name, scope)))
    }

    /// Block an IP address or CIDR.
    pub async fn push_ip(
        &self,
        web_acl: &CollectionRef,
        address: &BlockAddress,
        stamp: u64,
    ) -> Result<PushReport, WafError> {
        info!(ip = %address, web_acl = %web_acl.name, "Blocking IP");

        let set_name = format!("{}-{}-{}", web_acl.name, self.settings.ip_set_suffix, stamp);
        info!(ip_set = %set_name, "Creating IP set");
        let arn = self
            .waf
            .create_ip_set(&set_name, web_acl.scope, std::slice::from_ref(address))
            .await?;

        let rule = self.block_rule(
            format!("{}-{}", self.settings.ip_rule_prefix, stamp),
            RuleStatement::IpSetReference { arn: arn.clone() },
        );
        self.insert(web_acl, rule, arn).await
    }

    /// Block request URIs matching a regular expression.
    pub async fn push_uri(
        &self,
        web_acl: &CollectionRef,
        pattern: &str,
        stamp: u64,
    ) -> Result<PushReport, WafError> {
        if pattern.is_empty() {
            return Err(WafError::InvalidInput("URI pattern is empty".to_string()));
        }
        regex::Regex::new(pattern)
            .map_err(|e| WafError::InvalidInput(format!("invalid URI pattern: {}", e)))?;

        info!(pattern = %pattern, web_acl = %web_acl.name, "Blocking URI pattern");

        let set_name = format!("{}-{}-{}", web_acl.name, self.settings.regex_set_suffix, stamp);
        info!(regex_set = %set_name, "Creating regex pattern set");
        let arn = self
            .waf
            .create_regex_pattern_set(&set_name, web_acl.scope, &[pattern.to_string()])
            .await?;

        let rule = self.block_rule(
            format!("{}-{}", self.settings.uri_rule_prefix, stamp),
            RuleStatement::UriRegexPatternSetReference { arn: arn.clone() },
        );
        self.insert(web_acl, rule, arn).await
    }

    fn block_rule(&self, name: String, statement: RuleStatement) -> BlockRule {
        BlockRule {
            visibility: VisibilityConfig {
                sampled_requests_enabled: self.settings.sampled_requests_enabled,
                cloudwatch_metrics_enabled: self.settings.cloudwatch_metrics_enabled,
                metric_name: name.clone(),
            },
            name,
            priority: 0,
            statement,
        }
    }

    async fn insert(
        &self,
        web_acl: &CollectionRef,
        rule: BlockRule,
        set_arn: String,
    ) -> Result<PushReport, WafError> {
        info!(rule = %rule.name, web_acl = %web_acl.name, "Updating Web ACL");

        match GuardedUpdater::new(self.waf).insert_rule(web_acl, &rule).await {
            Ok(lock_token) => {
                info!(rule = %rule.name, web_acl = %web_acl.name, "Block rule pushed");
                Ok(PushReport {
                    rule_name: rule.name,
                    set_arn,
                    lock_token,
                })
            }
            Err(e) => {
                // The match set exists but nothing references it yet
                warn!(
                    set_arn = %set_arn,
                    error = %e,
                    "Web ACL not updated; match set left unreferenced"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WebAcl;
    use crate::waf::{AclDocument, InMemoryWaf};

    fn existing_rule() -> BlockRule {
        BlockRule {
            name: "AWS-AWSManagedRulesSQLiRuleSet".to_string(),
            priority: 1,
            statement: RuleStatement::IpSetReference {
                arn: "arn:existing".to_string(),
            },
            visibility: VisibilityConfig {
                sampled_requests_enabled: true,
                cloudwatch_metrics_enabled: true,
                metric_name: "sqli".to_string(),
            },
        }
    }

    fn acl(waf: &InMemoryWaf, target: &CollectionRef) -> WebAcl {
        waf.web_acl(target).unwrap()
    }

    #[tokio::test]
    async fn test_resolve_missing_web_acl() {
        let waf = InMemoryWaf::new();
        let settings = RuleSettings::default();
        waf.seed_web_acl("juice-shop", Scope::Regional, vec![]);

        let err = BlockPusher::new(&waf, &settings)
            .resolve_web_acl("juice-shop", Scope::Cloudfront)
            .await
            .unwrap_err();

        assert!(matches!(err, WafError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_push_ip() {
        let waf = InMemoryWaf::new();
        let settings = RuleSettings::default();
        let target = waf.seed_web_acl("juice-shop", Scope::Regional, vec![existing_rule()]);
        let pusher = BlockPusher::new(&waf, &settings);

        let web_acl = pusher.resolve_web_acl("juice-shop", Scope::Regional).await.unwrap();
        let report = pusher
            .push_ip(&web_acl, &BlockAddress::parse("203.0.113.9").unwrap(), 1_700_000_000)
            .await
            .unwrap();

        assert_eq!(report.rule_name, "IPBlockRule-1700000000");
        assert_eq!(
            waf.ip_set_addresses_by_arn(&report.set_arn),
            Some(vec!["203.0.113.9/32".to_string()])
        );

        let acl = acl(&waf, &target);
        assert_eq!(
            acl.rule_names(),
            vec!["IPBlockRule-1700000000", "AWS-AWSManagedRulesSQLiRuleSet"]
        );
        assert_eq!(acl.rules[0].priority, 0);
        assert_eq!(acl.rules[0].visibility.metric_name, "IPBlockRule-1700000000");
        assert_eq!(
            acl.rules[0].statement,
            RuleStatement::IpSetReference { arn: report.set_arn.clone() }
        );
        assert_eq!(waf.lock_token(&target), Some(report.lock_token));
    }

    #[tokio::test]
    async fn test_push_uri() {
        let waf = InMemoryWaf::new();
        let settings = RuleSettings {
            cloudwatch_metrics_enabled: false,
            ..RuleSettings::default()
        };
        let target = waf.seed_web_acl("juice-shop", Scope::Cloudfront, vec![existing_rule()]);
        let pusher = BlockPusher::new(&waf, &settings);

        let report = pusher.push_uri(&target, "^/ftp/.*\\.bak$", 42).await.unwrap();

        assert_eq!(report.rule_name, "URIBlockRule-42");
        assert_eq!(
            waf.regex_patterns(&report.set_arn),
            Some(vec!["^/ftp/.*\\.bak$".to_string()])
        );

        let acl = acl(&waf, &target);
        assert_eq!(acl.rules[0].name, "URIBlockRule-42");
        assert!(!acl.rules[0].visibility.cloudwatch_metrics_enabled);
        assert!(matches!(
            acl.rules[0].statement,
            RuleStatement::UriRegexPatternSetReference { .. }
        ));
        assert_eq!(acl.rules[1].name, "AWS-AWSManagedRulesSQLiRuleSet");
    }

    #[tokio::test]
    async fn test_push_invalid_pattern() {
        let waf = InMemoryWaf::new();
        let settings = RuleSettings::default();
        let target = waf.seed_web_acl("juice-shop", Scope::Regional, vec![]);

        let err = BlockPusher::new(&waf, &settings)
            .push_uri(&target, "(unclosed", 1)
            .await
            .unwrap_err();

        assert!(matches!(err, WafError::InvalidInput(_)));
        assert_eq!(waf.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_push_conflict_surfaces() {
        let waf = InMemoryWaf::new();
        let settings = RuleSettings::default();
        let target = waf.seed_web_acl("juice-shop", Scope::Regional, vec![existing_rule()]);
        let mut other = existing_rule();
        other.name = "IPBlockRule-1".to_string();
        waf.stage_concurrent_rule_insert(&target, other);

        let err = BlockPusher::new(&waf, &settings)
            .push_ip(&target, &BlockAddress::parse("198.51.100.4").unwrap(), 2)
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(
            acl(&waf, &target).rule_names(),
            vec!["IPBlockRule-1", "AWS-AWSManagedRulesSQLiRuleSet"]
        );
    }

    #[test]
    fn test_unix_timestamp() {
        assert!(unix_timestamp() > 1_600_000_000);
    }
}
