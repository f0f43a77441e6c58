//! Pure merge steps: each takes the fetched collection by reference and
//! returns a new one, leaving the snapshot untouched.

use crate::model::{BlockAddress, IpSet};

/// Result of merging an address into an IP set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpSetMerge {
    /// The address is already in the set; nothing to write.
    AlreadyPresent,
    /// The set with the address appended.
    Updated(IpSet),
}

/// Append `address` to the set unless an equivalent entry exists.
pub fn add_address(current: &IpSet, address: &BlockAddress) -> IpSetMerge {
    if current.addresses.iter().any(|entry| address.matches(entry)) {
        return IpSetMerge::AlreadyPresent;
    }

    let mut addresses = Vec::with_capacity(current.addresses.len() + 1);
    addresses.extend(current.addresses.iter().cloned());
    addresses.push(address.to_string());

    IpSetMerge::Updated(IpSet {
        addresses,
        description: current.description.clone(),
    })
}

/// Place `rule` ahead of every existing rule. Stored priorities of the
/// existing rules are left as they are.
pub fn prepend_rule<R: Clone>(rules: &[R], rule: R) -> Vec<R> {
    let mut merged = Vec::with_capacity(rules.len() + 1);
    merged.push(rule);
    merged.extend(rules.iter().cloned());
    merged
}
