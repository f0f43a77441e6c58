//! CloudWatch alarm notifications delivered through SNS.

use crate::config::AlarmConfig;
use crate::error::WafError;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Deserialize)]
struct SnsEvent {
    #[serde(rename = "Records")]
    records: Vec<SnsRecord>,
}

#[derive(Debug, Deserialize)]
struct SnsRecord {
    #[serde(rename = "Sns")]
    sns: SnsMessage,
}

#[derive(Debug, Deserialize)]
struct SnsMessage {
    #[serde(rename = "Message")]
    message: String,
}

/// The alarm state-change message carried in the SNS body.
#[derive(Debug, Clone, Deserialize)]
pub struct AlarmMessage {
    #[serde(rename = "AlarmName", default)]
    pub alarm_name: Option<String>,

    #[serde(rename = "NewStateValue", default)]
    pub new_state: Option<String>,

    #[serde(rename = "Trigger")]
    pub trigger: Trigger,
}

/// Metric the alarm watches.
#[derive(Debug, Clone, Deserialize)]
pub struct Trigger {
    #[serde(rename = "Namespace", default)]
    pub namespace: Option<String>,

    #[serde(rename = "MetricName", default)]
    pub metric_name: Option<String>,

    #[serde(rename = "Dimensions", default)]
    pub dimensions: Vec<Dimension>,
}

/// A metric dimension. CloudWatch sends these keys in lower case.
#[derive(Debug, Clone, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub value: String,
}

impl fmt::Display for AlarmMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unknown = "-";
        write!(
            f,
            "{} {} on {}/{}",
            self.alarm_name.as_deref().unwrap_or(unknown),
            self.new_state.as_deref().unwrap_or(unknown),
            self.trigger.namespace.as_deref().unwrap_or(unknown),
            self.trigger.metric_name.as_deref().unwrap_or(unknown),
        )
    }
}

/// Decode the alarm message from the first record of an SNS event.
pub fn parse_notification(event: &Value) -> Result<AlarmMessage, WafError> {
    let event: SnsEvent = serde_json::from_value(event.clone())
        .map_err(|e| WafError::InvalidInput(format!("not an SNS event: {}", e)))?;

    let record = event
        .records
        .into_iter()
        .next()
        .ok_or_else(|| WafError::InvalidInput("SNS event has no records".to_string()))?;

    serde_json::from_str(&record.sns.message)
        .map_err(|e| WafError::InvalidInput(format!("SNS message is not an alarm: {}", e)))
}

/// Client IP carried by the alarm's dimensions, if the alarm watches the
/// expected namespace.
pub fn client_ip<'a>(message: &'a AlarmMessage, config: &AlarmConfig) -> Option<&'a str> {
    let trigger = &message.trigger;
    if trigger.namespace.as_deref() != Some(config.namespace.as_str()) {
        return None;
    }

    trigger
        .dimensions
        .iter()
        .find(|d| d.name == config.ip_dimension)
        .map(|d| d.value.trim())
        .filter(|v| !v.is_empty())
}
