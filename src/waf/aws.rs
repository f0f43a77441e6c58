//! AWS WAFv2 backend.

use super::{common_version, AclDocument, WafApi};
use crate::error::WafError;
use crate::merge::prepend_rule;
use crate::model::{
    AddressVersion, BlockAddress, BlockRule, CollectionRef, IpSet, LockToken, RuleStatement,
    Scope, Versioned,
};
use async_trait::async_trait;
use aws_sdk_wafv2::config::Region;
use aws_sdk_wafv2::error::{BuildError, ProvideErrorMetadata, SdkError};
use aws_sdk_wafv2::types::{
    BlockAction, FieldToMatch, IpAddressVersion, IpSetReferenceStatement, Regex,
    RegexPatternSetReferenceStatement, Rule, RuleAction, Scope as AwsScope, Statement,
    TextTransformation, TextTransformationType, UriPath, VisibilityConfig, WebAcl,
};
use aws_sdk_wafv2::Client;
use std::error::Error as _;
use std::fmt::Debug;
use tracing::debug;

const OPTIMISTIC_LOCK: &str = "WAFOptimisticLockException";
const NONEXISTENT_ITEM: &str = "WAFNonexistentItemException";
const LIST_PAGE_SIZE: i32 = 100;

/// Web ACL as returned by WAFv2, kept whole so every rule and setting the
/// crate does not model is written back unchanged. UpdateWebACL replaces
/// the whole ACL, so every updatable field is resent.
#[derive(Debug, Clone)]
pub struct AwsWebAcl(pub WebAcl);

impl AclDocument for AwsWebAcl {
    fn rule_names(&self) -> Vec<String> {
        self.0.rules().iter().map(|r| r.name().to_string()).collect()
    }

    fn with_rule_first(&self, rule: &BlockRule) -> Result<Self, WafError> {
        let rule = to_aws_rule(rule).map_err(|e| {
            WafError::InvalidInput(format!("cannot build rule {}: {}", rule.name, e))
        })?;

        let mut acl = self.0.clone();
        acl.rules = Some(prepend_rule(self.0.rules(), rule));
        Ok(AwsWebAcl(acl))
    }
}

/// WAFv2 client wrapper.
pub struct AwsWaf {
    client: Client,
}

impl AwsWaf {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the default credential chain. `region` overrides
    /// the environment's region; CLOUDFRONT scope requires `us-east-1`.
    pub async fn connect(region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let sdk_config = loader.load().await;
        Self::new(Client::new(&sdk_config))
    }
}

fn aws_scope(scope: Scope) -> AwsScope {
    match scope {
        Scope::Regional => AwsScope::Regional,
        Scope::Cloudfront => AwsScope::Cloudfront,
    }
}

/// Map an SDK failure onto the error taxonomy by its service error code.
fn classify<E, R>(operation: &str, subject: &str, err: SdkError<E, R>) -> WafError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: Debug + Send + Sync + 'static,
{
    match err.code() {
        Some(OPTIMISTIC_LOCK) => WafError::Conflict(subject.to_string()),
        Some(NONEXISTENT_ITEM) => WafError::NotFound(subject.to_string()),
        Some(code) => WafError::Transport(format!(
            "{}: {}: {}",
            operation,
            code,
            err.message().unwrap_or("no message")
        )),
        // Timeouts, dispatch and decode failures carry their cause as source
        None => match err.source() {
            Some(cause) => WafError::Transport(format!("{}: {}: {}", operation, err, cause)),
            None => WafError::Transport(format!("{}: {}", operation, err)),
        },
    }
}

fn missing(operation: &str, field: &str) -> WafError {
    WafError::Transport(format!("{} response has no {}", operation, field))
}

fn to_aws_rule(rule: &BlockRule) -> Result<Rule, BuildError> {
    let statement = match &rule.statement {
        RuleStatement::IpSetReference { arn } => Statement::builder()
            .ip_set_reference_statement(IpSetReferenceStatement::builder().arn(arn).build()?)
            .build(),
        RuleStatement::UriRegexPatternSetReference { arn } => Statement::builder()
            .regex_pattern_set_reference_statement(
                RegexPatternSetReferenceStatement::builder()
                    .arn(arn)
                    .field_to_match(
                        FieldToMatch::builder()
                            .uri_path(UriPath::builder().build())
                            .build(),
                    )
                    .text_transformations(
                        TextTransformation::builder()
                            .priority(0)
                            .r#type(TextTransformationType::None)
                            .build()?,
                    )
                    .build()?,
            )
            .build(),
    };

    let visibility = VisibilityConfig::builder()
        .sampled_requests_enabled(rule.visibility.sampled_requests_enabled)
        .cloud_watch_metrics_enabled(rule.visibility.cloudwatch_metrics_enabled)
        .metric_name(&rule.visibility.metric_name)
        .build()?;

    Rule::builder()
        .name(&rule.name)
        .priority(rule.priority)
        .action(
            RuleAction::builder()
                .block(BlockAction::builder().build())
                .build(),
        )
        .statement(statement)
        .visibility_config(visibility)
        .build()
}

#[async_trait]
impl WafApi for AwsWaf {
    type Acl = AwsWebAcl;

    async fn get_ip_set(&self, target: &CollectionRef) -> Result<Versioned<IpSet>, WafError> {
        let subject = format!("IP set {}", target);
        let output = self
            .client
            .get_ip_set()
            .name(&target.name)
            .scope(aws_scope(target.scope))
            .id(&target.id)
            .send()
            .await
            .map_err(|e| classify("GetIPSet", &subject, e))?;

        let lock_token = output
            .lock_token()
            .ok_or_else(|| missing("GetIPSet", "lock token"))?;
        let ip_set = output.ip_set().ok_or_else(|| missing("GetIPSet", "IP set"))?;

        debug!(ip_set = %target, entries = ip_set.addresses().len(), "Fetched IP set");

        Ok(Versioned {
            value: IpSet {
                addresses: ip_set.addresses().to_vec(),
                description: ip_set.description().map(str::to_string),
            },
            lock_token: LockToken::new(lock_token),
        })
    }

    async fn update_ip_set(
        &self,
        target: &CollectionRef,
        lock_token: &LockToken,
        ip_set: &IpSet,
    ) -> Result<LockToken, WafError> {
        let subject = format!("IP set {}", target);
        let output = self
            .client
            .update_ip_set()
            .name(&target.name)
            .scope(aws_scope(target.scope))
            .id(&target.id)
            .set_addresses(Some(ip_set.addresses.clone()))
            .set_description(ip_set.description.clone())
            .lock_token(lock_token.as_str())
            .send()
            .await
            .map_err(|e| classify("UpdateIPSet", &subject, e))?;

        output
            .next_lock_token()
            .map(LockToken::new)
            .ok_or_else(|| missing("UpdateIPSet", "next lock token"))
    }

    async fn find_web_acl(
        &self,
        name: &str,
        scope: Scope,
    ) -> Result<Option<CollectionRef>, WafError> {
        let subject = format!("Web ACLs in scope {}", scope);
        let mut marker: Option<String> = None;

        loop {
            let output = self
                .client
                .list_web_acls()
                .scope(aws_scope(scope))
                .limit(LIST_PAGE_SIZE)
                .set_next_marker(marker.take())
                .send()
                .await
                .map_err(|e| classify("ListWebACLs", &subject, e))?;

            let found = output
                .web_acls()
                .iter()
                .find(|summary| summary.name() == Some(name))
                .and_then(|summary| summary.id());
            if let Some(id) = found {
                return Ok(Some(CollectionRef::new(name, scope, id)));
            }

            match output.next_marker() {
                Some(next) if !output.web_acls().is_empty() => marker = Some(next.to_string()),
                _ => return Ok(None),
            }
        }
    }

    async fn get_web_acl(&self, target: &CollectionRef) -> Result<Versioned<AwsWebAcl>, WafError> {
        let subject = format!("Web ACL {}", target);
        let output = self
            .client
            .get_web_acl()
            .name(&target.name)
            .scope(aws_scope(target.scope))
            .id(&target.id)
            .send()
            .await
            .map_err(|e| classify("GetWebACL", &subject, e))?;

        let lock_token = output
            .lock_token()
            .ok_or_else(|| missing("GetWebACL", "lock token"))?;
        let acl = output
            .web_acl()
            .ok_or_else(|| missing("GetWebACL", "Web ACL"))?;

        debug!(web_acl = %target, rules = acl.rules().len(), "Fetched Web ACL");

        Ok(Versioned {
            value: AwsWebAcl(acl.clone()),
            lock_token: LockToken::new(lock_token),
        })
    }

    async fn update_web_acl(
        &self,
        target: &CollectionRef,
        lock_token: &LockToken,
        acl: &AwsWebAcl,
    ) -> Result<LockToken, WafError> {
        let subject = format!("Web ACL {}", target);
        let acl = &acl.0;
        let output = self
            .client
            .update_web_acl()
            .name(&target.name)
            .scope(aws_scope(target.scope))
            .id(&target.id)
            .set_default_action(acl.default_action.clone())
            .set_description(acl.description.clone())
            .set_rules(Some(acl.rules().to_vec()))
            .set_visibility_config(acl.visibility_config.clone())
            .set_data_protection_config(acl.data_protection_config.clone())
            .set_custom_response_bodies(acl.custom_response_bodies.clone())
            .set_captcha_config(acl.captcha_config.clone())
            .set_challenge_config(acl.challenge_config.clone())
            .set_token_domains(acl.token_domains.clone())
            .set_association_config(acl.association_config.clone())
            .set_on_source_d_do_s_protection_config(acl.on_source_d_do_s_protection_config.clone())
            .set_application_config(acl.application_config.clone())
            .set_monetization_config(acl.monetization_config.clone())
            .lock_token(lock_token.as_str())
            .send()
            .await
            .map_err(|e| classify("UpdateWebACL", &subject, e))?;

        output
            .next_lock_token()
            .map(LockToken::new)
            .ok_or_else(|| missing("UpdateWebACL", "next lock token"))
    }

    async fn create_ip_set(
        &self,
        name: &str,
        scope: Scope,
        addresses: &[BlockAddress],
    ) -> Result<String, WafError> {
        let version = match common_version(addresses)? {
            AddressVersion::Ipv4 => IpAddressVersion::Ipv4,
            AddressVersion::Ipv6 => IpAddressVersion::Ipv6,
        };
        let subject = format!("IP set {} ({})", name, scope);

        let output = self
            .client
            .create_ip_set()
            .name(name)
            .scope(aws_scope(scope))
            .ip_address_version(version)
            .set_addresses(Some(addresses.iter().map(|a| a.to_string()).collect()))
            .send()
            .await
            .map_err(|e| classify("CreateIPSet", &subject, e))?;

        output
            .summary()
            .and_then(|s| s.arn())
            .map(str::to_string)
            .ok_or_else(|| missing("CreateIPSet", "ARN"))
    }

    async fn create_regex_pattern_set(
        &self,
        name: &str,
        scope: Scope,
        patterns: &[String],
    ) -> Result<String, WafError> {
        let subject = format!("regex pattern set {} ({})", name, scope);
        let expressions = patterns
            .iter()
            .map(|p| Regex::builder().regex_string(p).build())
            .collect();

        let output = self
            .client
            .create_regex_pattern_set()
            .name(name)
            .scope(aws_scope(scope))
            .set_regular_expression_list(Some(expressions))
            .send()
            .await
            .map_err(|e| classify("CreateRegexPatternSet", &subject, e))?;

        output
            .summary()
            .and_then(|s| s.arn())
            .map(str::to_string)
            .ok_or_else(|| missing("CreateRegexPatternSet", "ARN"))
    }
}
