//! Configuration types for the blocker tools.

use crate::error::WafError;
use crate::model::{CollectionRef, Scope};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Environment variable naming the IP set the alarm handler updates.
pub const IP_SET_NAME_VAR: &str = "IP_SET_NAME";
/// Environment variable carrying the IP set id.
pub const IP_SET_ID_VAR: &str = "IP_SET_ID";
/// Environment variable carrying the IP set scope.
pub const IP_SET_SCOPE_VAR: &str = "IP_SET_SCOPE";
/// Optional path to a YAML config file for the alarm handler.
pub const CONFIG_PATH_VAR: &str = "WAF_AUTO_BLOCK_CONFIG";

/// WAF resource names: letters, digits, underscore and hyphen.
const NAME_PATTERN: &str = r"^[\w\-]{1,64}$";

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// AWS client settings.
    #[serde(default)]
    pub aws: AwsSettings,

    /// Settings for rules created by the push tool.
    #[serde(default)]
    pub rules: RuleSettings,

    /// Which alarm dimension carries the client IP.
    #[serde(default)]
    pub alarm: AlarmConfig,

    /// Smoke test requests and expectations.
    #[serde(default)]
    pub smoke: SmokeConfig,
}

/// AWS client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AwsSettings {
    /// Region for the operator CLI. CLOUDFRONT scope is only served from
    /// us-east-1.
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            region: default_region(),
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Naming and visibility of pushed block rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleSettings {
    /// Sample matching requests.
    #[serde(default = "default_true")]
    pub sampled_requests_enabled: bool,

    /// Publish CloudWatch metrics per rule.
    #[serde(default = "default_true")]
    pub cloudwatch_metrics_enabled: bool,

    /// IP sets are named `{web_acl}-{suffix}-{timestamp}`.
    #[serde(default = "default_ip_set_suffix")]
    pub ip_set_suffix: String,

    /// Regex sets are named `{web_acl}-{suffix}-{timestamp}`.
    #[serde(default = "default_regex_set_suffix")]
    pub regex_set_suffix: String,

    /// IP rules are named `{prefix}-{timestamp}`.
    #[serde(default = "default_ip_rule_prefix")]
    pub ip_rule_prefix: String,

    /// URI rules are named `{prefix}-{timestamp}`.
    #[serde(default = "default_uri_rule_prefix")]
    pub uri_rule_prefix: String,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            sampled_requests_enabled: true,
            cloudwatch_metrics_enabled: true,
            ip_set_suffix: default_ip_set_suffix(),
            regex_set_suffix: default_regex_set_suffix(),
            ip_rule_prefix: default_ip_rule_prefix(),
            uri_rule_prefix: default_uri_rule_prefix(),
        }
    }
}

fn default_ip_set_suffix() -> String {
    "IPSet-Block".to_string()
}

fn default_regex_set_suffix() -> String {
    "RegexSet-Block".to_string()
}

fn default_ip_rule_prefix() -> String {
    "IPBlockRule".to_string()
}

fn default_uri_rule_prefix() -> String {
    "URIBlockRule".to_string()
}

/// Alarm notification settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlarmConfig {
    /// Only alarms on this metric namespace carry a blockable IP.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Dimension holding the client IP.
    #[serde(default = "default_ip_dimension")]
    pub ip_dimension: String,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            ip_dimension: default_ip_dimension(),
        }
    }
}

fn default_namespace() -> String {
    "WAFLogs".to_string()
}

fn default_ip_dimension() -> String {
    "ClientIP".to_string()
}

/// Smoke test settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmokeConfig {
    /// Per-request timeout in seconds.
    #[serde(default = "default_smoke_timeout")]
    pub timeout_seconds: u64,

    /// Path of the request that must pass.
    #[serde(default = "default_benign_path")]
    pub benign_path: String,

    /// Path and query of the request that must be blocked.
    #[serde(default = "default_malicious_path")]
    pub malicious_path: String,

    #[serde(default = "default_allowed_status")]
    pub expected_allowed_status: u16,

    #[serde(default = "default_blocked_status")]
    pub expected_blocked_status: u16,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_smoke_timeout(),
            benign_path: default_benign_path(),
            malicious_path: default_malicious_path(),
            expected_allowed_status: default_allowed_status(),
            expected_blocked_status: default_blocked_status(),
        }
    }
}

fn default_smoke_timeout() -> u64 {
    10
}

fn default_benign_path() -> String {
    "/".to_string()
}

fn default_malicious_path() -> String {
    "/rest/products/search?q=%27%20OR%201=1--".to_string()
}

fn default_allowed_status() -> u16 {
    200
}

fn default_blocked_status() -> u16 {
    403
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content)?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.aws.region.trim().is_empty() {
            anyhow::bail!("aws.region must not be empty");
        }

        // Generated names must stay valid WAF resource names
        let name = Regex::new(NAME_PATTERN)?;
        for (field, value) in [
            ("rules.ip_set_suffix", &self.rules.ip_set_suffix),
            ("rules.regex_set_suffix", &self.rules.regex_set_suffix),
            ("rules.ip_rule_prefix", &self.rules.ip_rule_prefix),
            ("rules.uri_rule_prefix", &self.rules.uri_rule_prefix),
        ] {
            if !name.is_match(value) {
                anyhow::bail!(
                    "{} ({:?}) may only contain letters, digits, '_' and '-'",
                    field,
                    value
                );
            }
        }

        if self.alarm.namespace.is_empty() || self.alarm.ip_dimension.is_empty() {
            anyhow::bail!("alarm.namespace and alarm.ip_dimension must not be empty");
        }

        if self.smoke.timeout_seconds == 0 {
            anyhow::bail!("smoke.timeout_seconds must be greater than 0");
        }

        for path in [&self.smoke.benign_path, &self.smoke.malicious_path] {
            if !path.starts_with('/') {
                anyhow::bail!("smoke paths must start with '/': {}", path);
            }
        }

        for status in [
            self.smoke.expected_allowed_status,
            self.smoke.expected_blocked_status,
        ] {
            if !(100..=599).contains(&status) {
                anyhow::bail!("invalid expected HTTP status: {}", status);
            }
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# WAF auto-block configuration

aws:
  region: us-east-1            # CLOUDFRONT scope requires us-east-1

# Rules pushed by `waf-block push`
rules:
  sampled_requests_enabled: true
  cloudwatch_metrics_enabled: true
  ip_set_suffix: "IPSet-Block"       # {web_acl}-IPSet-Block-{timestamp}
  regex_set_suffix: "RegexSet-Block" # {web_acl}-RegexSet-Block-{timestamp}
  ip_rule_prefix: "IPBlockRule"      # IPBlockRule-{timestamp}
  uri_rule_prefix: "URIBlockRule"    # URIBlockRule-{timestamp}

# Alarm notifications handled by the Lambda function
alarm:
  namespace: "WAFLogs"
  ip_dimension: "ClientIP"

# `waf-block smoke <base_url>`
smoke:
  timeout_seconds: 10
  benign_path: "/"
  malicious_path: "/rest/products/search?q=%27%20OR%201=1--"
  expected_allowed_status: 200
  expected_blocked_status: 403
"#
        .to_string()
    }
}

/// IP set the alarm handler updates, read from the process environment.
pub fn ip_set_target_from_env() -> Result<CollectionRef, WafError> {
    ip_set_target_from(|key| std::env::var(key).ok())
}

/// IP set identity from a variable lookup. All three identifiers are
/// required; every missing one is named in the error.
pub fn ip_set_target_from<F>(lookup: F) -> Result<CollectionRef, WafError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let name = get(IP_SET_NAME_VAR);
    let id = get(IP_SET_ID_VAR);
    let scope = get(IP_SET_SCOPE_VAR);

    let (Some(name), Some(id), Some(scope)) = (name.clone(), id.clone(), scope.clone()) else {
        let missing: Vec<&str> = [
            (IP_SET_NAME_VAR, name.is_none()),
            (IP_SET_ID_VAR, id.is_none()),
            (IP_SET_SCOPE_VAR, scope.is_none()),
        ]
        .into_iter()
        .filter_map(|(key, absent)| absent.then_some(key))
        .collect();

        return Err(WafError::Configuration(format!(
            "missing required environment variables: {}",
            missing.join(", ")
        )));
    };

    let scope: Scope = scope
        .parse()
        .map_err(|e: String| WafError::Configuration(format!("{}: {}", IP_SET_SCOPE_VAR, e)))?;

    Ok(CollectionRef::new(name, scope, id))
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> anyhow::Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;
    let expanded = re.replace_all(content, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.aws.region, "us-east-1");
        assert!(config.rules.cloudwatch_metrics_enabled);
        assert_eq!(config.rules.ip_rule_prefix, "IPBlockRule");
        assert_eq!(config.alarm.namespace, "WAFLogs");
        assert_eq!(config.alarm.ip_dimension, "ClientIP");
        assert_eq!(config.smoke.expected_blocked_status, 403);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_example_parses() {
        let config: Config = serde_yaml::from_str(&Config::example()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.smoke.timeout_seconds, 10);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
rules:
  cloudwatch_metrics_enabled: false
alarm:
  namespace: "Custom/Waf"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.rules.cloudwatch_metrics_enabled);
        assert!(config.rules.sampled_requests_enabled);
        assert_eq!(config.alarm.namespace, "Custom/Waf");
        assert_eq!(config.alarm.ip_dimension, "ClientIP");
    }

    #[test]
    fn test_validate_bad_rule_prefix() {
        let mut config = Config::default();
        config.rules.ip_rule_prefix = "bad prefix!".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_smoke() {
        let mut config = Config::default();
        config.smoke.timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.smoke.malicious_path = "rest/products".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.smoke.expected_blocked_status = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_with_env_expansion() {
        std::env::set_var("WAF_AUTO_BLOCK_TEST_REGION", "eu-west-1");
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"aws:\n  region: \"${WAF_AUTO_BLOCK_TEST_REGION}\"\n")
            .unwrap();
        file.flush().unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.aws.region, "eu-west-1");
        std::env::remove_var("WAF_AUTO_BLOCK_TEST_REGION");
    }

    #[test]
    fn test_load_invalid_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"smoke:\n  timeout_seconds: 0\n").unwrap();
        file.flush().unwrap();

        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key: \"${WAF_AUTO_BLOCK_NONEXISTENT}\"").unwrap();
        assert_eq!(result, "key: \"\"");
    }

    #[test]
    fn test_ip_set_target() {
        let target = ip_set_target_from(lookup(&[
            ("IP_SET_NAME", "blocked-ips"),
            ("IP_SET_ID", "a1b2c3"),
            ("IP_SET_SCOPE", "REGIONAL"),
        ]))
        .unwrap();

        assert_eq!(target, CollectionRef::new("blocked-ips", Scope::Regional, "a1b2c3"));
    }

    #[test]
    fn test_ip_set_target_missing() {
        let env = lookup(&[("IP_SET_NAME", "blocked-ips"), ("IP_SET_SCOPE", "")]);
        let err = ip_set_target_from(env).unwrap_err();

        match err {
            WafError::Configuration(msg) => {
                assert!(msg.contains("IP_SET_ID"));
                assert!(msg.contains("IP_SET_SCOPE"));
                assert!(!msg.contains("IP_SET_NAME"));
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_ip_set_target_bad_scope() {
        let err = ip_set_target_from(lookup(&[
            ("IP_SET_NAME", "blocked-ips"),
            ("IP_SET_ID", "a1b2c3"),
            ("IP_SET_SCOPE", "GLOBAL"),
        ]))
        .unwrap_err();

        assert!(matches!(err, WafError::Configuration(_)));
    }
}
