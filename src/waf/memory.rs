//! In-process WAF backend that enforces lock tokens like the real service.
//!
//! Used by tests and dry runs. A concurrent writer can be staged with
//! [`InMemoryWaf::stage_concurrent_ip_set_write`] or
//! [`InMemoryWaf::stage_concurrent_rule_insert`]: the staged write lands
//! between the next fetch and the next update of that collection. A
//! failing write can be staged with [`InMemoryWaf::stage_write_fault`].
//!
//! Like the service, IP sets hold one address family and names are unique
//! per scope.

use super::{common_version, AclDocument, WafApi};
use crate::error::WafError;
use crate::merge::prepend_rule;
use crate::model::{
    AddressVersion, BlockAddress, BlockRule, CollectionRef, DefaultAction, IpSet, LockToken,
    Scope, Versioned, WebAcl,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

impl AclDocument for WebAcl {
    fn rule_names(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.name.clone()).collect()
    }

    fn with_rule_first(&self, rule: &BlockRule) -> Result<Self, WafError> {
        Ok(WebAcl {
            rules: prepend_rule(&self.rules, rule.clone()),
            ..self.clone()
        })
    }
}

struct Stored<T> {
    name: String,
    scope: Scope,
    arn: String,
    revision: u64,
    value: T,
}

impl<T> Stored<T> {
    fn lock_token(&self, id: &str) -> LockToken {
        LockToken::new(format!("{}-r{}", id, self.revision))
    }

    fn matches(&self, target: &CollectionRef) -> bool {
        self.name == target.name && self.scope == target.scope
    }
}

struct RegexSet {
    name: String,
    scope: Scope,
    patterns: Vec<String>,
}

enum StagedWrite {
    IpSet { id: String, addresses: Vec<String> },
    Rule { id: String, rule: BlockRule },
}

#[derive(Default)]
struct State {
    next_id: u64,
    ip_sets: HashMap<String, Stored<IpSet>>,
    ip_set_versions: HashMap<String, AddressVersion>,
    web_acls: HashMap<String, Stored<WebAcl>>,
    regex_sets: HashMap<String, RegexSet>,
    staged: Vec<StagedWrite>,
    faults: HashMap<String, String>,
    reads: usize,
    writes: usize,
}

impl State {
    fn allocate(&mut self, scope: Scope, kind: &str, name: &str) -> (String, String) {
        self.next_id += 1;
        let id = format!("{:08x}-0000-4000-8000-{:012x}", self.next_id, self.next_id);
        let region = match scope {
            Scope::Regional => "regional",
            Scope::Cloudfront => "global",
        };
        let arn = format!(
            "arn:aws:wafv2:us-east-1:000000000000:{}/{}/{}/{}",
            region, kind, name, id
        );
        (id, arn)
    }

    fn insert_ip_set(
        &mut self,
        name: &str,
        scope: Scope,
        version: AddressVersion,
        addresses: Vec<String>,
    ) -> (String, String) {
        let (id, arn) = self.allocate(scope, "ipset", name);
        self.ip_set_versions.insert(id.clone(), version);
        self.ip_sets.insert(
            id.clone(),
            Stored {
                name: name.to_string(),
                scope,
                arn: arn.clone(),
                revision: 1,
                value: IpSet::with_addresses(addresses),
            },
        );
        (id, arn)
    }

    /// Reject entries the service would refuse for an IP set of `id`.
    fn check_addresses(&self, id: &str, ip_set: &IpSet) -> Result<(), WafError> {
        let Some(&version) = self.ip_set_versions.get(id) else {
            return Ok(());
        };

        for entry in &ip_set.addresses {
            let fits = BlockAddress::parse(entry).is_ok_and(|a| a.version() == version);
            if !fits {
                return Err(WafError::Transport(format!(
                    "WAFInvalidParameterException: {} is not a valid {:?} address",
                    entry, version
                )));
            }
        }
        Ok(())
    }

    fn take_fault(&mut self, id: &str) -> Result<(), WafError> {
        match self.faults.remove(id) {
            Some(message) => Err(WafError::Transport(message)),
            None => Ok(()),
        }
    }

    /// Apply staged concurrent writes aimed at `id`.
    fn land_staged(&mut self, id: &str) {
        let staged = std::mem::take(&mut self.staged);
        for write in staged {
            match write {
                StagedWrite::IpSet { id: target, addresses } if target == id => {
                    if let Some(stored) = self.ip_sets.get_mut(id) {
                        stored.value.addresses = addresses;
                        stored.revision += 1;
                        debug!(id, "Concurrent IP set write landed");
                    }
                }
                StagedWrite::Rule { id: target, rule } if target == id => {
                    if let Some(stored) = self.web_acls.get_mut(id) {
                        stored.value.rules = prepend_rule(&stored.value.rules, rule);
                        stored.revision += 1;
                        debug!(id, "Concurrent Web ACL write landed");
                    }
                }
                other => self.staged.push(other),
            }
        }
    }
}

/// In-memory WAF service.
#[derive(Default)]
pub struct InMemoryWaf {
    state: Mutex<State>,
}

impl InMemoryWaf {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an IP set directly, bypassing call accounting. The address
    /// family follows the first entry; an empty set is IPv4.
    pub fn seed_ip_set(&self, name: &str, scope: Scope, addresses: &[&str]) -> CollectionRef {
        let version = addresses
            .first()
            .and_then(|a| BlockAddress::parse(a).ok())
            .map_or(AddressVersion::Ipv4, |a| a.version());
        let addresses = addresses.iter().map(|a| a.to_string()).collect();

        let (id, _) = self.state().insert_ip_set(name, scope, version, addresses);
        CollectionRef::new(name, scope, id)
    }

    /// Create an empty IP set of the given family.
    pub fn seed_empty_ip_set(
        &self,
        name: &str,
        scope: Scope,
        version: AddressVersion,
    ) -> CollectionRef {
        let (id, _) = self.state().insert_ip_set(name, scope, version, Vec::new());
        CollectionRef::new(name, scope, id)
    }

    /// Create a Web ACL directly, bypassing call accounting.
    pub fn seed_web_acl(&self, name: &str, scope: Scope, rules: Vec<BlockRule>) -> CollectionRef {
        let mut state = self.state();
        let (id, arn) = state.allocate(scope, "webacl", name);
        state.web_acls.insert(
            id.clone(),
            Stored {
                name: name.to_string(),
                scope,
                arn,
                revision: 1,
                value: WebAcl {
                    name: name.to_string(),
                    description: None,
                    default_action: DefaultAction::Allow,
                    rules,
                },
            },
        );
        CollectionRef::new(name, scope, id)
    }

    /// Current contents of an IP set.
    pub fn ip_set(&self, target: &CollectionRef) -> Option<IpSet> {
        self.state()
            .ip_sets
            .get(&target.id)
            .filter(|s| s.matches(target))
            .map(|s| s.value.clone())
    }

    /// Addresses of the IP set with the given ARN.
    pub fn ip_set_addresses_by_arn(&self, arn: &str) -> Option<Vec<String>> {
        self.state()
            .ip_sets
            .values()
            .find(|s| s.arn == arn)
            .map(|s| s.value.addresses.clone())
    }

    /// Current contents of a Web ACL.
    pub fn web_acl(&self, target: &CollectionRef) -> Option<WebAcl> {
        self.state()
            .web_acls
            .get(&target.id)
            .filter(|s| s.matches(target))
            .map(|s| s.value.clone())
    }

    /// Patterns of the regex pattern set with the given ARN.
    pub fn regex_patterns(&self, arn: &str) -> Option<Vec<String>> {
        self.state().regex_sets.get(arn).map(|s| s.patterns.clone())
    }

    /// Current lock token of an IP set or Web ACL.
    pub fn lock_token(&self, target: &CollectionRef) -> Option<LockToken> {
        let state = self.state();
        state
            .ip_sets
            .get(&target.id)
            .map(|s| s.lock_token(&target.id))
            .or_else(|| state.web_acls.get(&target.id).map(|s| s.lock_token(&target.id)))
    }

    /// Have another actor replace the IP set contents right before the
    /// next update of that set.
    pub fn stage_concurrent_ip_set_write(&self, target: &CollectionRef, addresses: &[&str]) {
        self.state().staged.push(StagedWrite::IpSet {
            id: target.id.clone(),
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        });
    }

    /// Have another actor insert a rule right before the next update of
    /// that Web ACL.
    pub fn stage_concurrent_rule_insert(&self, target: &CollectionRef, rule: BlockRule) {
        self.state().staged.push(StagedWrite::Rule {
            id: target.id.clone(),
            rule,
        });
    }

    /// Make the next update of this collection fail with a transport error,
    /// leaving it unchanged.
    pub fn stage_write_fault(&self, target: &CollectionRef, message: &str) {
        self.state()
            .faults
            .insert(target.id.clone(), message.to_string());
    }

    /// Number of get/find calls served.
    pub fn read_calls(&self) -> usize {
        self.state().reads
    }

    /// Number of update/create calls received, accepted or not.
    pub fn write_calls(&self) -> usize {
        self.state().writes
    }
}

fn not_found(kind: &str, target: &CollectionRef) -> WafError {
    WafError::NotFound(format!("{} {} id {}", kind, target, target.id))
}

#[async_trait]
impl WafApi for InMemoryWaf {
    type Acl = WebAcl;

    async fn get_ip_set(&self, target: &CollectionRef) -> Result<Versioned<IpSet>, WafError> {
        let mut state = self.state();
        state.reads += 1;

        let stored = state
            .ip_sets
            .get(&target.id)
            .filter(|s| s.matches(target))
            .ok_or_else(|| not_found("IP set", target))?;

        Ok(Versioned {
            value: stored.value.clone(),
            lock_token: stored.lock_token(&target.id),
        })
    }

    async fn update_ip_set(
        &self,
        target: &CollectionRef,
        lock_token: &LockToken,
        ip_set: &IpSet,
    ) -> Result<LockToken, WafError> {
        let mut state = self.state();
        state.writes += 1;
        state.take_fault(&target.id)?;
        state.land_staged(&target.id);
        state.check_addresses(&target.id, ip_set)?;

        let stored = state
            .ip_sets
            .get_mut(&target.id)
            .filter(|s| s.matches(target))
            .ok_or_else(|| not_found("IP set", target))?;

        if stored.lock_token(&target.id) != *lock_token {
            return Err(WafError::Conflict(format!("IP set {}", target)));
        }

        stored.value = ip_set.clone();
        stored.revision += 1;
        Ok(stored.lock_token(&target.id))
    }

    async fn find_web_acl(
        &self,
        name: &str,
        scope: Scope,
    ) -> Result<Option<CollectionRef>, WafError> {
        let mut state = self.state();
        state.reads += 1;

        Ok(state
            .web_acls
            .iter()
            .find(|(_, s)| s.name == name && s.scope == scope)
            .map(|(id, s)| CollectionRef::new(s.name.clone(), s.scope, id.clone())))
    }

    async fn get_web_acl(&self, target: &CollectionRef) -> Result<Versioned<WebAcl>, WafError> {
        let mut state = self.state();
        state.reads += 1;

        let stored = state
            .web_acls
            .get(&target.id)
            .filter(|s| s.matches(target))
            .ok_or_else(|| not_found("Web ACL", target))?;

        Ok(Versioned {
            value: stored.value.clone(),
            lock_token: stored.lock_token(&target.id),
        })
    }

    async fn update_web_acl(
        &self,
        target: &CollectionRef,
        lock_token: &LockToken,
        acl: &WebAcl,
    ) -> Result<LockToken, WafError> {
        let mut state = self.state();
        state.writes += 1;
        state.take_fault(&target.id)?;
        state.land_staged(&target.id);

        let stored = state
            .web_acls
            .get_mut(&target.id)
            .filter(|s| s.matches(target))
            .ok_or_else(|| not_found("Web ACL", target))?;

        if stored.lock_token(&target.id) != *lock_token {
            return Err(WafError::Conflict(format!("Web ACL {}", target)));
        }

        stored.value = acl.clone();
        stored.revision += 1;
        Ok(stored.lock_token(&target.id))
    }

    async fn create_ip_set(
        &self,
        name: &str,
        scope: Scope,
        addresses: &[BlockAddress],
    ) -> Result<String, WafError> {
        let version = common_version(addresses)?;

        let mut state = self.state();
        state.writes += 1;

        if state
            .ip_sets
            .values()
            .any(|s| s.name == name && s.scope == scope)
        {
            return Err(WafError::Transport(format!(
                "WAFDuplicateItemException: IP set {} already exists",
                name
            )));
        }

        let addresses = addresses.iter().map(|a| a.to_string()).collect();
        let (_, arn) = state.insert_ip_set(name, scope, version, addresses);
        Ok(arn)
    }

    async fn create_regex_pattern_set(
        &self,
        name: &str,
        scope: Scope,
        patterns: &[String],
    ) -> Result<String, WafError> {
        let mut state = self.state();
        state.writes += 1;

        if state
            .regex_sets
            .values()
            .any(|s| s.name == name && s.scope == scope)
        {
            return Err(WafError::Transport(format!(
                "WAFDuplicateItemException: regex pattern set {} already exists",
                name
            )));
        }

        let (_, arn) = state.allocate(scope, "regexpatternset", name);
        state.regex_sets.insert(
            arn.clone(),
            RegexSet {
                name: name.to_string(),
                scope,
                patterns: patterns.to_vec(),
            },
        );
        Ok(arn)
    }
}
