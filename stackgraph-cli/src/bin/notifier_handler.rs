//! Scheduled notifier function
//!
//! Built for the `provided.al2023` runtime and packaged as `bootstrap`.
//! Each invocation publishes the morning message to the topic named by the
//! `topic_arn` environment variable.

use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;
use stackgraph_stacks::function::{handle, HandlerResponse, SnsPublisher};
use stackgraph_stacks::names::notifier::TOPIC_ARN_ENV;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let publisher = SnsPublisher::new(aws_sdk_sns::Client::new(&config));
    let topic_arn = std::env::var(TOPIC_ARN_ENV).ok();

    let publisher = &publisher;
    let topic_arn = topic_arn.as_deref();
    lambda_runtime::run(service_fn(move |_event: LambdaEvent<Value>| async move {
        let response: HandlerResponse = handle(publisher, topic_arn).await?;
        Ok::<_, Error>(response)
    }))
    .await
}
