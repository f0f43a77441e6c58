//! WAF management API backends.

pub mod aws;
pub mod memory;

use crate::error::WafError;
use crate::model::{BlockAddress, BlockRule, CollectionRef, IpSet, LockToken, Scope, Versioned};
use async_trait::async_trait;

pub use aws::AwsWaf;
pub use memory::InMemoryWaf;

/// A Web ACL body as returned by a backend.
///
/// Backends keep their own representation so rules this crate does not
/// model (managed rule groups, rate limits) survive the round trip.
pub trait AclDocument: Clone + Send + Sync {
    /// Rule names in evaluation order.
    fn rule_names(&self) -> Vec<String>;

    /// A copy of this ACL with `rule` placed ahead of every existing rule.
    fn with_rule_first(&self, rule: &BlockRule) -> Result<Self, WafError>;
}

/// Conditional-write API over IP sets and Web ACLs.
///
/// Every update takes the lock token of the read it is based on and fails
/// with [`WafError::Conflict`] when the collection changed since.
#[async_trait]
pub trait WafApi: Send + Sync {
    type Acl: AclDocument;

    /// Fetch an IP set and its current lock token.
    async fn get_ip_set(&self, target: &CollectionRef) -> Result<Versioned<IpSet>, WafError>;

    /// Replace the IP set contents if `lock_token` is still current.
    async fn update_ip_set(
        &self,
        target: &CollectionRef,
        lock_token: &LockToken,
        ip_set: &IpSet,
    ) -> Result<LockToken, WafError>;

    /// Look up a Web ACL by name within a scope.
    async fn find_web_acl(&self, name: &str, scope: Scope)
        -> Result<Option<CollectionRef>, WafError>;

    /// Fetch a Web ACL and its current lock token.
    async fn get_web_acl(&self, target: &CollectionRef)
        -> Result<Versioned<Self::Acl>, WafError>;

    /// Replace the Web ACL if `lock_token` is still current.
    async fn update_web_acl(
        &self,
        target: &CollectionRef,
        lock_token: &LockToken,
        acl: &Self::Acl,
    ) -> Result<LockToken, WafError>;

    /// Create an IP set and return its ARN.
    async fn create_ip_set(
        &self,
        name: &str,
        scope: Scope,
        addresses: &[BlockAddress],
    ) -> Result<String, WafError>;

    /// Create a regex pattern set and return its ARN.
    async fn create_regex_pattern_set(
        &self,
        name: &str,
        scope: Scope,
        patterns: &[String],
    ) -> Result<String, WafError>;
}

/// All addresses of one new IP set must share a family.
pub(crate) fn common_version(
    addresses: &[BlockAddress],
) -> Result<crate::model::AddressVersion, WafError> {
    let first = addresses
        .first()
        .ok_or_else(|| WafError::InvalidInput("an IP set needs at least one address".to_string()))?;
    let version = first.version();

    if addresses.iter().any(|a| a.version() != version) {
        return Err(WafError::InvalidInput(
            "IPv4 and IPv6 addresses cannot share an IP set".to_string(),
        ));
    }

    Ok(version)
}
