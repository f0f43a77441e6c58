//! Rule collection types shared by the updater and the WAF backends.

use crate::error::WafError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Where a WAF resource lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    /// Regional resources (ALB, API Gateway, AppSync).
    Regional,
    /// CloudFront distributions. Managed from us-east-1 only.
    Cloudfront,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Regional => "REGIONAL",
            Scope::Cloudfront => "CLOUDFRONT",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REGIONAL" => Ok(Scope::Regional),
            "CLOUDFRONT" => Ok(Scope::Cloudfront),
            other => Err(format!(
                "invalid scope '{}': expected REGIONAL or CLOUDFRONT",
                other
            )),
        }
    }
}

/// Identity of a remote rule collection (IP set or Web ACL).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    pub name: String,
    pub scope: Scope,
    pub id: String,
}

impl CollectionRef {
    pub fn new(name: impl Into<String>, scope: Scope, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope,
            id: id.into(),
        }
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.scope)
    }
}

/// Opaque version stamp returned by every read and successful write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A collection body together with the token of the read that produced it.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub lock_token: LockToken,
}

/// Contents of an IP set as far as updates are concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSet {
    /// CIDR strings, order as stored by the service.
    pub addresses: Vec<String>,
    /// Carried through updates so a write does not clear it.
    pub description: Option<String>,
}

impl IpSet {
    pub fn with_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            description: None,
        }
    }
}

/// IP family of an address or IP set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressVersion {
    Ipv4,
    Ipv6,
}

/// A normalized address to block: a single host becomes `/32` (or `/128`),
/// a network keeps its prefix with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockAddress(IpNet);

impl BlockAddress {
    /// Parse an IP address or CIDR.
    pub fn parse(input: &str) -> Result<Self, WafError> {
        let input = input.trim();

        if let Ok(ip) = input.parse::<IpAddr>() {
            let prefix = match ip {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            return IpNet::new(ip, prefix)
                .map(Self)
                .map_err(|e| WafError::InvalidInput(format!("{}: {}", input, e)));
        }

        input
            .parse::<IpNet>()
            .map(|net| Self(net.trunc()))
            .map_err(|_| WafError::InvalidInput(format!("not an IP address or CIDR: '{}'", input)))
    }

    pub fn network(&self) -> IpNet {
        self.0
    }

    pub fn version(&self) -> AddressVersion {
        match self.0 {
            IpNet::V4(_) => AddressVersion::Ipv4,
            IpNet::V6(_) => AddressVersion::Ipv6,
        }
    }

    /// Whether a stored IP set entry denotes this same network.
    ///
    /// Entries are compared as parsed networks so formatting differences
    /// (IPv6 zero compression, letter case) do not defeat deduplication.
    pub fn matches(&self, entry: &str) -> bool {
        BlockAddress::parse(entry).is_ok_and(|stored| stored == *self)
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Match condition of a block rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleStatement {
    /// Match requests whose source address is in the referenced IP set.
    IpSetReference { arn: String },
    /// Match requests whose URI path matches a pattern in the referenced
    /// regex pattern set, without text transformation.
    UriRegexPatternSetReference { arn: String },
}

/// Metrics and sampling settings attached to a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityConfig {
    pub sampled_requests_enabled: bool,
    pub cloudwatch_metrics_enabled: bool,
    pub metric_name: String,
}

/// A rule whose action is always block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRule {
    pub name: String,
    /// Lower is evaluated first.
    pub priority: i32,
    pub statement: RuleStatement,
    pub visibility: VisibilityConfig,
}

/// What a Web ACL does with requests no rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Allow,
    Block,
}

/// A Web ACL held entirely in this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebAcl {
    pub name: String,
    pub description: Option<String>,
    pub default_action: DefaultAction,
    /// Evaluation order is list order.
    pub rules: Vec<BlockRule>,
}
