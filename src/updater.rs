//! Guarded read-merge-write cycle over a shared rule collection.
//!
//! Each call performs exactly one fetch and at most one conditional write
//! carrying the fetched lock token. A stale token surfaces as
//! [`WafError::Conflict`]; the cycle is never retried here, the caller
//! decides whether to run it again.

use crate::error::WafError;
use crate::merge::{self, IpSetMerge};
use crate::model::{BlockAddress, BlockRule, CollectionRef, LockToken};
use crate::waf::{AclDocument, WafApi};
use std::fmt;
use tracing::{debug, warn};

/// Progress of one update cycle, reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Fetched,
    Merged,
    WriteOk,
    WriteRejected,
    WriteError,
    SkippedDuplicate,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Start => "START",
            Phase::Fetched => "FETCHED",
            Phase::Merged => "MERGED",
            Phase::WriteOk => "WRITE_OK",
            Phase::WriteRejected => "WRITE_REJECTED",
            Phase::WriteError => "WRITE_ERROR",
            Phase::SkippedDuplicate => "SKIPPED_DUPLICATE",
        }
    }

    /// Terminal phase for a failed conditional write.
    fn for_write_error(err: &WafError) -> Self {
        if err.is_conflict() {
            Phase::WriteRejected
        } else {
            Phase::WriteError
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful end of an IP set update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The write was accepted; the collection is now at `lock_token`.
    Written { lock_token: LockToken },
    /// The address was already in the set and no write was issued.
    AlreadyPresent,
}

/// Applies single mutations to remote collections through a [`WafApi`].
pub struct GuardedUpdater<'a, W> {
    waf: &'a W,
}

impl<'a, W: WafApi> GuardedUpdater<'a, W> {
    pub fn new(waf: &'a W) -> Self {
        Self { waf }
    }

    /// Add an address to an IP set unless it is already there.
    pub async fn add_address(
        &self,
        target: &CollectionRef,
        address: &BlockAddress,
    ) -> Result<UpdateOutcome, WafError> {
        debug!(phase = %Phase::Start, ip_set = %target, ip = %address, "Updating IP set");

        let snapshot = self.waf.get_ip_set(target).await?;
        debug!(
            phase = %Phase::Fetched,
            ip_set = %target,
            entries = snapshot.value.addresses.len(),
            "Fetched IP set"
        );

        let updated = match merge::add_address(&snapshot.value, address) {
            IpSetMerge::AlreadyPresent => {
                debug!(
                    phase = %Phase::SkippedDuplicate,
                    ip_set = %target,
                    ip = %address,
                    "Address already present"
                );
                return Ok(UpdateOutcome::AlreadyPresent);
            }
            IpSetMerge::Updated(set) => set,
        };
        debug!(
            phase = %Phase::Merged,
            ip_set = %target,
            entries = updated.addresses.len(),
            "Merged address"
        );

        let result = self
            .waf
            .update_ip_set(target, &snapshot.lock_token, &updated)
            .await;
        finish(target, result).map(|lock_token| UpdateOutcome::Written { lock_token })
    }

    /// Insert a rule ahead of every existing rule of a Web ACL.
    ///
    /// A rule with the same name already in the ACL is rejected before any
    /// write, since the service requires unique rule names.
    pub async fn insert_rule(
        &self,
        target: &CollectionRef,
        rule: &BlockRule,
    ) -> Result<LockToken, WafError> {
        debug!(phase = %Phase::Start, web_acl = %target, rule = %rule.name, "Updating Web ACL");

        let snapshot = self.waf.get_web_acl(target).await?;
        let existing = snapshot.value.rule_names();
        debug!(
            phase = %Phase::Fetched,
            web_acl = %target,
            rules = existing.len(),
            "Fetched Web ACL"
        );

        if existing.iter().any(|name| *name == rule.name) {
            return Err(WafError::InvalidInput(format!(
                "rule {} already exists in Web ACL {}",
                rule.name, target
            )));
        }

        let updated = snapshot.value.with_rule_first(rule)?;
        debug!(
            phase = %Phase::Merged,
            web_acl = %target,
            rules = existing.len() + 1,
            "Merged rule"
        );

        let result = self
            .waf
            .update_web_acl(target, &snapshot.lock_token, &updated)
            .await;
        finish(target, result)
    }
}

fn finish(
    target: &CollectionRef,
    result: Result<LockToken, WafError>,
) -> Result<LockToken, WafError> {
    match result {
        Ok(lock_token) => {
            debug!(phase = %Phase::WriteOk, collection = %target, "Conditional write accepted");
            Ok(lock_token)
        }
        Err(e) => {
            warn!(
                phase = %Phase::for_write_error(&e),
                collection = %target,
                error = %e,
                "Conditional write failed"
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RuleStatement, Scope, VisibilityConfig};
    use crate::waf::InMemoryWaf;

    fn addr(s: &str) -> BlockAddress {
        BlockAddress::parse(s).unwrap()
    }

    fn rule(name: &str, priority: i32) -> BlockRule {
        BlockRule {
            name: name.to_string(),
            priority,
            statement: RuleStatement::UriRegexPatternSetReference {
                arn: format!("arn:test:{}", name),
            },
            visibility: VisibilityConfig {
                sampled_requests_enabled: true,
                cloudwatch_metrics_enabled: true,
                metric_name: name.to_string(),
            },
        }
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::SkippedDuplicate.to_string(), "SKIPPED_DUPLICATE");
        assert_eq!(
            Phase::for_write_error(&WafError::Conflict("x".to_string())),
            Phase::WriteRejected
        );
        assert_eq!(
            Phase::for_write_error(&WafError::Transport("x".to_string())),
            Phase::WriteError
        );
    }

    #[tokio::test]
    async fn test_add_address_writes_once() {
        let waf = InMemoryWaf::new();
        let target = waf.seed_ip_set("blocked", Scope::Regional, &["1.2.3.4/32"]);

        let outcome = GuardedUpdater::new(&waf)
            .add_address(&target, &addr("5.6.7.8"))
            .await
            .unwrap();

        match outcome {
            UpdateOutcome::Written { lock_token } => {
                assert_eq!(waf.lock_token(&target), Some(lock_token));
            }
            other => panic!("expected write, got {:?}", other),
        }
        assert_eq!(waf.read_calls(), 1);
        assert_eq!(waf.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_add_duplicate_skips_write() {
        let waf = InMemoryWaf::new();
        let target = waf.seed_ip_set("blocked", Scope::Regional, &["1.2.3.4/32"]);
        let before = waf.lock_token(&target);

        let outcome = GuardedUpdater::new(&waf)
            .add_address(&target, &addr("1.2.3.4"))
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::AlreadyPresent);
        assert_eq!(waf.write_calls(), 0);
        assert_eq!(waf.lock_token(&target), before);
    }

    #[tokio::test]
    async fn test_concurrent_ip_set_write_is_rejected() {
        let waf = InMemoryWaf::new();
        let target = waf.seed_ip_set("blocked", Scope::Regional, &["1.2.3.4/32"]);
        waf.stage_concurrent_ip_set_write(&target, &["1.2.3.4/32", "9.9.9.9/32"]);

        let err = GuardedUpdater::new(&waf)
            .add_address(&target, &addr("5.6.7.8"))
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(
            waf.ip_set(&target).unwrap().addresses,
            vec!["1.2.3.4/32", "9.9.9.9/32"]
        );
    }

    #[tokio::test]
    async fn test_transport_fault_passes_through() {
        let waf = InMemoryWaf::new();
        let target = waf.seed_ip_set("blocked", Scope::Regional, &["1.2.3.4/32"]);
        let before = waf.lock_token(&target);
        waf.stage_write_fault(&target, "UpdateIPSet: connection reset by peer");

        let err = GuardedUpdater::new(&waf)
            .add_address(&target, &addr("5.6.7.8"))
            .await
            .unwrap_err();

        assert_eq!(Phase::for_write_error(&err), Phase::WriteError);
        assert!(matches!(
            &err,
            WafError::Transport(m) if m == "UpdateIPSet: connection reset by peer"
        ));
        assert_eq!(waf.ip_set(&target).unwrap().addresses, vec!["1.2.3.4/32"]);
        assert_eq!(waf.lock_token(&target), before);
        assert_eq!(waf.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_ip_set() {
        let waf = InMemoryWaf::new();
        let target = CollectionRef::new("absent", Scope::Regional, "nope");

        let err = GuardedUpdater::new(&waf)
            .add_address(&target, &addr("5.6.7.8"))
            .await
            .unwrap_err();

        assert!(matches!(err, WafError::NotFound(_)));
        assert_eq!(waf.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_insert_rule_first() {
        let waf = InMemoryWaf::new();
        let target = waf.seed_web_acl(
            "app",
            Scope::Regional,
            vec![rule("sqli", 1), rule("rate", 5)],
        );

        GuardedUpdater::new(&waf)
            .insert_rule(&target, &rule("block-new", 0))
            .await
            .unwrap();

        let acl = waf.web_acl(&target).unwrap();
        assert_eq!(acl.rule_names(), vec!["block-new", "sqli", "rate"]);
        assert_eq!(acl.rules[1].priority, 1);
        assert_eq!(acl.rules[2].priority, 5);
    }

    #[tokio::test]
    async fn test_insert_duplicate_rule_name() {
        let waf = InMemoryWaf::new();
        let target = waf.seed_web_acl("app", Scope::Regional, vec![rule("sqli", 1)]);

        let err = GuardedUpdater::new(&waf)
            .insert_rule(&target, &rule("sqli", 0))
            .await
            .unwrap_err();

        assert!(matches!(err, WafError::InvalidInput(_)));
        assert_eq!(waf.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_rule_insert_is_rejected() {
        let waf = InMemoryWaf::new();
        let target = waf.seed_web_acl("app", Scope::Regional, vec![rule("sqli", 1)]);
        waf.stage_concurrent_rule_insert(&target, rule("alarm-block", 0));

        let err = GuardedUpdater::new(&waf)
            .insert_rule(&target, &rule("operator-block", 0))
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(
            waf.web_acl(&target).unwrap().rule_names(),
            vec!["alarm-block", "sqli"]
        );
    }
}
