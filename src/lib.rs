//! Reactive IP and URI blocking for AWS WAFv2.
//!
//! Blocks are applied to shared, versioned WAF collections with an
//! optimistic fetch-merge-write cycle: every write carries the lock token of
//! the read it was built from, so a concurrent change makes the write fail
//! instead of being overwritten.
//!
//! # Features
//!
//! - **Alarm handler** - Adds the `ClientIP` of a CloudWatch alarm (via SNS)
//!   to an IP set, skipping addresses already present
//! - **Block push** - Operator tool inserting an IP or URI-pattern block rule
//!   at the top of a Web ACL
//! - **Smoke test** - Confirms benign traffic passes and SQL injection is
//!   blocked
//! - **Backends** - AWS WAFv2, plus an in-memory service with lock tokens
//!
//! # Example Configuration
//!
//! ```yaml
//! aws:
//!   region: us-east-1
//!
//! rules:
//!   cloudwatch_metrics_enabled: true
//!
//! alarm:
//!   namespace: "WAFLogs"
//!   ip_dimension: "ClientIP"
//! ```

pub mod alarm;
pub mod config;
pub mod error;
pub mod handler;
pub mod merge;
pub mod model;
pub mod push;
pub mod smoke;
pub mod updater;
pub mod waf;

pub use config::Config;
pub use error::WafError;
pub use handler::{AlarmHandler, HandlerResponse};
pub use push::BlockPusher;
pub use updater::{GuardedUpdater, UpdateOutcome};
