//! Alarm-driven IP blocking, as run inside the Lambda function.

use crate::alarm;
use crate::config::AlarmConfig;
use crate::error::WafError;
use crate::model::{BlockAddress, CollectionRef};
use crate::updater::{GuardedUpdater, UpdateOutcome};
use crate::waf::WafApi;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

/// Response returned to the Lambda runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerResponse {
    pub status_code: u16,
    pub body: String,
}

impl HandlerResponse {
    fn new(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            status_code,
            body: body.into(),
        }
    }
}

/// Adds the client IP of each alarm notification to one IP set.
pub struct AlarmHandler<W> {
    waf: W,
    target: Result<CollectionRef, WafError>,
    alarm: AlarmConfig,
}

impl<W: WafApi> AlarmHandler<W> {
    /// `target` is the IP set identity as resolved at startup. A
    /// configuration error is kept and answered on every invocation,
    /// without calling the service.
    pub fn new(waf: W, target: Result<CollectionRef, WafError>, alarm: AlarmConfig) -> Self {
        Self { waf, target, alarm }
    }

    pub fn waf(&self) -> &W {
        &self.waf
    }

    /// Handle one notification.
    ///
    /// Bad configuration and events without a usable IP are answered with
    /// 500 and 400. Service failures (conflict, missing IP set, transport)
    /// are returned as errors so the invocation fails and the platform can
    /// run it again.
    pub async fn handle(&self, event: &Value) -> Result<HandlerResponse, WafError> {
        info!(event = %event, "Received event");

        let target = match &self.target {
            Ok(target) => target,
            Err(e) => {
                error!(error = %e, "Missing required configuration");
                return Ok(HandlerResponse::new(500, "Configuration error"));
            }
        };

        let raw_ip = match alarm::parse_notification(event) {
            Ok(message) => {
                info!(alarm = %message, "Alarm notification received");
                alarm::client_ip(&message, &self.alarm).map(str::to_string)
            }
            Err(e) => {
                error!(error = %e, "Malformed alarm notification");
                None
            }
        };

        let Some(raw_ip) = raw_ip else {
            error!("Could not extract IP address from the event");
            return Ok(HandlerResponse::new(400, "IP address not found in event"));
        };

        let address = match BlockAddress::parse(&raw_ip) {
            Ok(address) => address,
            Err(e) => {
                error!(ip = %raw_ip, error = %e, "Alarm carried an invalid IP address");
                return Ok(HandlerResponse::new(400, "IP address not found in event"));
            }
        };

        info!(ip = %address, ip_set = %target, "Attempting to block IP address");

        match GuardedUpdater::new(&self.waf).add_address(target, &address).await {
            Ok(UpdateOutcome::Written { .. }) => {
                info!(ip = %address, ip_set = %target.name, "Added address to IP set");
            }
            Ok(UpdateOutcome::AlreadyPresent) => {
                info!(
                    ip = %address,
                    ip_set = %target.name,
                    "Address already in IP set, no action taken"
                );
            }
            Err(e) => {
                error!(
                    ip = %address,
                    ip_set = %target.name,
                    error = %e,
                    "Failed to update WAF IP set"
                );
                return Err(e);
            }
        }

        Ok(HandlerResponse::new(200, format!("IP {} processed.", raw_ip)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Scope;
    use crate::waf::InMemoryWaf;
    use serde_json::json;

    fn alarm_event(namespace: &str, ip: &str) -> Value {
        let message = json!({
            "AlarmName": "waf-blocked-ip",
            "Trigger": {
                "Namespace": namespace,
                "Dimensions": [{"name": "ClientIP", "value": ip}]
            }
        });
        json!({"Records": [{"Sns": {"Message": message.to_string()}}]})
    }

    fn handler_with(addresses: &[&str]) -> (AlarmHandler<InMemoryWaf>, CollectionRef) {
        let waf = InMemoryWaf::new();
        let target = waf.seed_ip_set("blocked-ips", Scope::Regional, addresses);
        let handler = AlarmHandler::new(waf, Ok(target.clone()), AlarmConfig::default());
        (handler, target)
    }

    #[tokio::test]
    async fn test_blocks_new_ip() {
        let (handler, target) = handler_with(&["1.2.3.4/32"]);

        let response = handler.handle(&alarm_event("WAFLogs", "5.6.7.8")).await.unwrap();

        assert_eq!(response, HandlerResponse::new(200, "IP 5.6.7.8 processed."));
        assert_eq!(
            handler.waf().ip_set(&target).unwrap().addresses,
            vec!["1.2.3.4/32", "5.6.7.8/32"]
        );
    }

    #[tokio::test]
    async fn test_known_ip_is_noop() {
        let (handler, target) = handler_with(&["1.2.3.4/32"]);

        let response = handler.handle(&alarm_event("WAFLogs", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(handler.waf().write_calls(), 0);
        assert_eq!(handler.waf().ip_set(&target).unwrap().addresses, vec!["1.2.3.4/32"]);
    }

    #[tokio::test]
    async fn test_configuration_error() {
        let handler = AlarmHandler::new(
            InMemoryWaf::new(),
            Err(WafError::Configuration("missing IP_SET_ID".to_string())),
            AlarmConfig::default(),
        );

        let response = handler.handle(&alarm_event("WAFLogs", "5.6.7.8")).await.unwrap();

        assert_eq!(response, HandlerResponse::new(500, "Configuration error"));
        assert_eq!(handler.waf().read_calls(), 0);
        assert_eq!(handler.waf().write_calls(), 0);
    }

    #[tokio::test]
    async fn test_wrong_namespace() {
        let (handler, _) = handler_with(&[]);

        let response = handler.handle(&alarm_event("AWS/EC2", "5.6.7.8")).await.unwrap();

        assert_eq!(response.status_code, 400);
        assert_eq!(handler.waf().read_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_ip() {
        let (handler, _) = handler_with(&[]);

        let response = handler.handle(&alarm_event("WAFLogs", "not-an-ip")).await.unwrap();

        assert_eq!(response, HandlerResponse::new(400, "IP address not found in event"));
    }

    #[tokio::test]
    async fn test_malformed_event() {
        let (handler, _) = handler_with(&[]);

        let response = handler.handle(&json!({"detail": {}})).await.unwrap();

        assert_eq!(response.status_code, 400);
    }

    #[tokio::test]
    async fn test_conflict_fails_invocation() {
        let (handler, target) = handler_with(&["1.2.3.4/32"]);
        handler
            .waf()
            .stage_concurrent_ip_set_write(&target, &["1.2.3.4/32", "9.9.9.9/32"]);

        let err = handler
            .handle(&alarm_event("WAFLogs", "5.6.7.8"))
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(
            handler.waf().ip_set(&target).unwrap().addresses,
            vec!["1.2.3.4/32", "9.9.9.9/32"]
        );
    }

    #[test]
    fn test_response_serialization() {
        let value = serde_json::to_value(HandlerResponse::new(200, "ok")).unwrap();
        assert_eq!(value, json!({"statusCode": 200, "body": "ok"}));
    }
}
