//! Lambda entry point: block the client IP named by a CloudWatch alarm.

use lambda_runtime::{service_fn, LambdaEvent};
use serde_json::Value;
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use waf_auto_block::config::{ip_set_target_from_env, CONFIG_PATH_VAR};
use waf_auto_block::waf::AwsWaf;
use waf_auto_block::{AlarmHandler, Config, HandlerResponse};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), lambda_runtime::Error> {
    // CloudWatch timestamps every line
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let config = match std::env::var_os(CONFIG_PATH_VAR) {
        Some(path) => Config::load(Path::new(&path))?,
        None => Config::default(),
    };

    let target = ip_set_target_from_env();
    match &target {
        Ok(target) => info!(ip_set = %target, "Alarm handler configured"),
        Err(e) => error!(error = %e, "Alarm handler is not configured; every invocation will fail"),
    }

    // Region comes from the Lambda environment
    let waf = AwsWaf::connect(None).await;
    let handler = AlarmHandler::new(waf, target, config.alarm);
    let handler = &handler;

    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| async move {
        let response: HandlerResponse = handler.handle(&event.payload).await?;
        Ok::<_, lambda_runtime::Error>(response)
    }))
    .await
}
