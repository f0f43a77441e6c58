//! Smoke checks confirming the WAF lets benign traffic through and blocks
//! an obvious SQL injection.

use crate::config::SmokeConfig;
use crate::error::WafError;
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// How one check went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed { status: u16 },
    UnexpectedStatus { expected: u16, actual: u16 },
    RequestFailed(String),
}

/// One request and its verdict.
#[derive(Debug, Clone)]
pub struct SmokeCheck {
    pub name: &'static str,
    pub url: String,
    pub outcome: CheckOutcome,
}

impl SmokeCheck {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, CheckOutcome::Passed { .. })
    }
}

impl fmt::Display for SmokeCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            CheckOutcome::Passed { status } => {
                write!(f, "PASS {} ({}): received {}", self.name, self.url, status)
            }
            CheckOutcome::UnexpectedStatus { expected, actual } => write!(
                f,
                "FAIL {} ({}): expected {}, received {}",
                self.name, self.url, expected, actual
            ),
            CheckOutcome::RequestFailed(e) => {
                write!(f, "FAIL {} ({}): request failed: {}", self.name, self.url, e)
            }
        }
    }
}

/// Results of a smoke run.
#[derive(Debug, Clone, Default)]
pub struct SmokeReport {
    pub checks: Vec<SmokeCheck>,
}

impl SmokeReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(SmokeCheck::passed)
    }

    pub fn failures(&self) -> usize {
        self.checks.iter().filter(|c| !c.passed()).count()
    }
}

/// Issues the smoke requests.
pub struct SmokeTester {
    client: Client,
    config: SmokeConfig,
}

impl SmokeTester {
    pub fn new(config: SmokeConfig) -> Result<Self, WafError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(format!("waf-auto-block/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WafError::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Run the benign and the malicious request against `base_url`.
    pub async fn run(&self, base_url: &str) -> SmokeReport {
        let base = base_url.trim_end_matches('/');

        let benign = self
            .check(
                "benign request",
                format!("{}{}", base, self.config.benign_path),
                self.config.expected_allowed_status,
            )
            .await;
        let malicious = self
            .check(
                "SQL injection request",
                format!("{}{}", base, self.config.malicious_path),
                self.config.expected_blocked_status,
            )
            .await;

        SmokeReport {
            checks: vec![benign, malicious],
        }
    }

    async fn check(&self, name: &'static str, url: String, expected: u16) -> SmokeCheck {
        info!(check = name, url = %url, expected, "Running smoke check");

        let outcome = match self.client.get(&url).send().await {
            Ok(response) => {
                let actual = response.status().as_u16();
                if actual == expected {
                    CheckOutcome::Passed { status: actual }
                } else {
                    CheckOutcome::UnexpectedStatus { expected, actual }
                }
            }
            Err(e) => CheckOutcome::RequestFailed(e.to_string()),
        };

        let check = SmokeCheck { name, url, outcome };
        if check.passed() {
            info!("{}", check);
        } else {
            warn!("{}", check);
        }
        check
    }
}
