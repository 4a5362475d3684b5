//! Notifier function logic
//!
//! Publishes one fixed message to the topic named by the `topic_arn`
//! environment variable. The publish client sits behind [`Publisher`] so the
//! handler can be exercised without AWS.

use crate::error::{HandlerError, PublishError};
use crate::names::notifier::TOPIC_ARN_ENV;
use async_trait::async_trait;
use aws_sdk_sns::error::DisplayErrorContext;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

pub const SUBJECT: &str = "Hi Travis";
pub const MESSAGE: &str = "Test from SNS";

/// What the messaging service reports for an accepted message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishOutput {
    #[serde(rename = "MessageId", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(rename = "SequenceNumber", skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        subject: &str,
    ) -> Result<PublishOutput, PublishError>;
}

/// Publisher backed by the SNS API
#[derive(Clone)]
pub struct SnsPublisher {
    client: aws_sdk_sns::Client,
}

impl SnsPublisher {
    pub fn new(client: aws_sdk_sns::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Publisher for SnsPublisher {
    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        subject: &str,
    ) -> Result<PublishOutput, PublishError> {
        let output = self
            .client
            .publish()
            .topic_arn(topic_arn)
            .message(message)
            .subject(subject)
            .send()
            .await
            .map_err(|e| PublishError::Service(DisplayErrorContext(e).to_string()))?;
        Ok(PublishOutput {
            message_id: output.message_id().map(str::to_string),
            sequence_number: output.sequence_number().map(str::to_string),
        })
    }
}

/// Response returned to the invoking trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// JSON text `{"response": <publish output>}`
    pub body: String,
}

/// Publish the morning message once. A publish failure is logged and
/// returned so the invocation is recorded as failed.
pub async fn handle(
    publisher: &dyn Publisher,
    topic_arn: Option<&str>,
) -> Result<HandlerResponse, HandlerError> {
    let topic_arn = topic_arn
        .filter(|arn| !arn.is_empty())
        .ok_or(HandlerError::MissingTopicArn(TOPIC_ARN_ENV))?;

    let output = match publisher.publish(topic_arn, MESSAGE, SUBJECT).await {
        Ok(output) => output,
        Err(err) => {
            error!("Error publishing message: {}", err);
            return Err(err.into());
        }
    };
    info!(message_id = ?output.message_id, "Message published");

    let body = serde_json::to_string(&json!({ "response": output }))?;
    Ok(HandlerResponse {
        status_code: 200,
        body,
    })
}
