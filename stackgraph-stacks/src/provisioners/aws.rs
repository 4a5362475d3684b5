//! AWS provisioner: IAM, SNS, Lambda and EventBridge

use super::{output, required, Provisioner};
use crate::error::{ProvisionError, ProvisionResult};
use crate::package::zip_directory;
use async_trait::async_trait;
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{Environment, FunctionCode, Runtime};
use stackgraph_models::{Outputs, ResolvedResource, ResourceKind};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const RETRY_ATTEMPTS: u32 = 10;
#[cfg(not(test))]
const RETRY_DELAY: Duration = Duration::from_secs(3);
#[cfg(test)]
const RETRY_DELAY: Duration = Duration::from_millis(5);

#[derive(Clone)]
pub struct AwsProvisioner {
    iam: aws_sdk_iam::Client,
    sns: aws_sdk_sns::Client,
    lambda: aws_sdk_lambda::Client,
    events: aws_sdk_eventbridge::Client,
}

impl AwsProvisioner {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            iam: aws_sdk_iam::Client::new(config),
            sns: aws_sdk_sns::Client::new(config),
            lambda: aws_sdk_lambda::Client::new(config),
            events: aws_sdk_eventbridge::Client::new(config),
        }
    }

    /// Credentials and region from the usual AWS environment chain
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(&config)
    }

    async fn create_role(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        let name = required(resource, "name")?;
        let created = self
            .iam
            .create_role()
            .role_name(name)
            .assume_role_policy_document(required(resource, "assume_role_policy")?)
            .send()
            .await
            .map_err(|e| ProvisionError::aws("CreateRole", e))?;
        let arn = created
            .role()
            .map(|role| role.arn().to_string())
            .ok_or_else(|| missing(resource, "arn"))?;
        Ok(named(name, arn))
    }

    async fn create_policy(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        let name = required(resource, "name")?;
        let created = self
            .iam
            .create_policy()
            .policy_name(name)
            .policy_document(required(resource, "policy")?)
            .set_description(resource.str_property("description").map(str::to_string))
            .send()
            .await
            .map_err(|e| ProvisionError::aws("CreatePolicy", e))?;
        let arn = created
            .policy()
            .and_then(|policy| policy.arn())
            .ok_or_else(|| missing(resource, "arn"))?;
        Ok(named(name, arn.to_string()))
    }

    async fn attach_policy(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        let role = required(resource, "role")?;
        let policy_arn = required(resource, "policy_arn")?;
        self.iam
            .attach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| ProvisionError::aws("AttachRolePolicy", e))?;
        Ok(Outputs::from([
            ("role".to_string(), role.to_string()),
            ("policy_arn".to_string(), policy_arn.to_string()),
        ]))
    }

    async fn create_topic(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        let name = required(resource, "name")?;
        let created = self
            .sns
            .create_topic()
            .name(name)
            .send()
            .await
            .map_err(|e| ProvisionError::aws("CreateTopic", e))?;
        let arn = created.topic_arn().ok_or_else(|| missing(resource, "arn"))?;
        Ok(named(name, arn.to_string()))
    }

    async fn subscribe(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        let endpoint = required(resource, "endpoint")?;
        let subscribed = self
            .sns
            .subscribe()
            .topic_arn(required(resource, "topic")?)
            .protocol(required(resource, "protocol")?)
            .endpoint(endpoint)
            .return_subscription_arn(true)
            .send()
            .await
            .map_err(|e| ProvisionError::aws("Subscribe", e))?;
        warn!(
            %endpoint,
            "Subscription created; delivery starts once the recipient confirms it"
        );
        let arn = subscribed
            .subscription_arn()
            .ok_or_else(|| missing(resource, "arn"))?;
        Ok(Outputs::from([("arn".to_string(), arn.to_string())]))
    }

    async fn create_function(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        let name = required(resource, "name")?;
        let role = required(resource, "role")?;
        let handler = required(resource, "handler")?;
        let runtime = Runtime::from(required(resource, "runtime")?);
        let code = Blob::new(zip_directory(Path::new(required(resource, "code_dir")?))?);
        let environment = environment(resource);

        // a freshly created role takes a few seconds to become assumable
        let created = with_retry("CreateFunction", role_not_assumable, || {
            self.lambda
                .create_function()
                .function_name(name)
                .role(role)
                .handler(handler)
                .runtime(runtime.clone())
                .code(FunctionCode::builder().zip_file(code.clone()).build())
                .environment(environment.clone())
                .send()
        })
        .await?;

        let arn = created
            .function_arn()
            .ok_or_else(|| missing(resource, "arn"))?;
        Ok(named(name, arn.to_string()))
    }

    async fn update_function(
        &self,
        resource: &ResolvedResource,
        outputs: &Outputs,
    ) -> ProvisionResult<Outputs> {
        let name = required(resource, "name")?;
        let code = Blob::new(zip_directory(Path::new(required(resource, "code_dir")?))?);

        with_retry("UpdateFunctionCode", update_in_progress, || {
            self.lambda
                .update_function_code()
                .function_name(name)
                .zip_file(code.clone())
                .send()
        })
        .await?;

        let role = required(resource, "role")?;
        let handler = required(resource, "handler")?;
        let runtime = Runtime::from(required(resource, "runtime")?);
        let environment = environment(resource);
        with_retry("UpdateFunctionConfiguration", update_in_progress, || {
            self.lambda
                .update_function_configuration()
                .function_name(name)
                .role(role)
                .handler(handler)
                .runtime(runtime.clone())
                .environment(environment.clone())
                .send()
        })
        .await?;

        Ok(outputs.clone())
    }

    async fn add_permission(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        let statement_id = required(resource, "statement_id")?;
        self.lambda
            .add_permission()
            .function_name(required(resource, "function")?)
            .statement_id(statement_id)
            .action(required(resource, "action")?)
            .principal(required(resource, "principal")?)
            .set_source_arn(resource.str_property("source_arn").map(str::to_string))
            .send()
            .await
            .map_err(|e| ProvisionError::aws("AddPermission", e))?;
        Ok(Outputs::from([(
            "statement_id".to_string(),
            statement_id.to_string(),
        )]))
    }

    async fn put_rule(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        let name = required(resource, "name")?;
        let rule = self
            .events
            .put_rule()
            .name(name)
            .schedule_expression(required(resource, "schedule_expression")?)
            .set_description(resource.str_property("description").map(str::to_string))
            .send()
            .await
            .map_err(|e| ProvisionError::aws("PutRule", e))?;
        let arn = rule.rule_arn().ok_or_else(|| missing(resource, "arn"))?;
        Ok(named(name, arn.to_string()))
    }

    async fn put_target(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        let rule = required(resource, "rule")?;
        let target_id = required(resource, "target_id")?;
        let target = aws_sdk_eventbridge::types::Target::builder()
            .id(target_id)
            .arn(required(resource, "arn")?)
            .build()
            .map_err(|e| ProvisionError::aws("PutTargets", e))?;

        let result = self
            .events
            .put_targets()
            .rule(rule)
            .targets(target)
            .send()
            .await
            .map_err(|e| ProvisionError::aws("PutTargets", e))?;
        if let Some(failed) = result.failed_entries().first() {
            return Err(ProvisionError::Aws {
                operation: "PutTargets",
                message: failed
                    .error_message()
                    .unwrap_or("target was rejected")
                    .to_string(),
            });
        }
        Ok(Outputs::from([
            ("rule".to_string(), rule.to_string()),
            ("target_id".to_string(), target_id.to_string()),
        ]))
    }

    /// New default policy version; older non-default versions are removed so
    /// the five-version limit is never reached
    async fn update_policy(
        &self,
        resource: &ResolvedResource,
        outputs: &Outputs,
    ) -> ProvisionResult<Outputs> {
        let arn = output(resource, outputs, "arn")?;
        self.delete_policy_versions(arn).await?;
        self.iam
            .create_policy_version()
            .policy_arn(arn)
            .policy_document(required(resource, "policy")?)
            .set_as_default(true)
            .send()
            .await
            .map_err(|e| ProvisionError::aws("CreatePolicyVersion", e))?;
        Ok(outputs.clone())
    }

    async fn delete_policy_versions(&self, arn: &str) -> ProvisionResult<()> {
        let versions = self
            .iam
            .list_policy_versions()
            .policy_arn(arn)
            .send()
            .await
            .map_err(|e| ProvisionError::aws("ListPolicyVersions", e))?;
        for version in versions.versions() {
            if version.is_default_version() {
                continue;
            }
            if let Some(version_id) = version.version_id() {
                debug!(%arn, version_id, "Deleting policy version");
                self.iam
                    .delete_policy_version()
                    .policy_arn(arn)
                    .version_id(version_id)
                    .send()
                    .await
                    .map_err(|e| ProvisionError::aws("DeletePolicyVersion", e))?;
            }
        }
        Ok(())
    }

    async fn remove(&self, resource: &ResolvedResource, outputs: &Outputs) -> ProvisionResult<()> {
        match resource.kind {
            ResourceKind::IamRole => {
                let name = named_output(resource, outputs)?;
                let result = self.iam.delete_role().role_name(name).send().await;
                tolerate_missing("DeleteRole", result)
            }
            ResourceKind::IamPolicy => {
                let arn = output(resource, outputs, "arn")?;
                self.delete_policy_versions(arn).await?;
                let result = self.iam.delete_policy().policy_arn(arn).send().await;
                tolerate_missing("DeletePolicy", result)
            }
            ResourceKind::RolePolicyAttachment => {
                let result = self
                    .iam
                    .detach_role_policy()
                    .role_name(required(resource, "role")?)
                    .policy_arn(required(resource, "policy_arn")?)
                    .send()
                    .await;
                tolerate_missing("DetachRolePolicy", result)
            }
            ResourceKind::SnsTopic => {
                let arn = output(resource, outputs, "arn")?;
                let result = self.sns.delete_topic().topic_arn(arn).send().await;
                tolerate_missing("DeleteTopic", result)
            }
            ResourceKind::SnsTopicSubscription => {
                self.unsubscribe(resource, outputs).await;
                Ok(())
            }
            ResourceKind::LambdaFunction => {
                let name = named_output(resource, outputs)?;
                let result = self.lambda.delete_function().function_name(name).send().await;
                tolerate_missing("DeleteFunction", result)
            }
            ResourceKind::LambdaPermission => {
                let result = self
                    .lambda
                    .remove_permission()
                    .function_name(required(resource, "function")?)
                    .statement_id(required(resource, "statement_id")?)
                    .send()
                    .await;
                tolerate_missing("RemovePermission", result)
            }
            ResourceKind::EventRule => {
                let name = named_output(resource, outputs)?;
                let result = self.events.delete_rule().name(name).send().await;
                tolerate_missing("DeleteRule", result)
            }
            ResourceKind::EventTarget => {
                let result = self
                    .events
                    .remove_targets()
                    .rule(required(resource, "rule")?)
                    .ids(required(resource, "target_id")?)
                    .send()
                    .await;
                tolerate_missing("RemoveTargets", result)
            }
            kind => Err(ProvisionError::Unsupported { kind }),
        }
    }

    /// Pending email subscriptions have no ARN yet and cannot be removed
    /// through the API; failures here are logged and ignored
    async fn unsubscribe(&self, resource: &ResolvedResource, outputs: &Outputs) {
        let Some(arn) = outputs.get("arn").filter(|arn| arn.starts_with("arn:")) else {
            warn!(resource = %resource.id, "Subscription still pending confirmation, nothing to remove");
            return;
        };
        if let Err(err) = self.sns.unsubscribe().subscription_arn(arn).send().await {
            warn!(
                resource = %resource.id,
                "Failed to unsubscribe, ignoring: {}",
                DisplayErrorContext(&err)
            );
        }
    }

    async fn replace(
        &self,
        resource: &ResolvedResource,
        previous: &ResolvedResource,
        outputs: &Outputs,
    ) -> ProvisionResult<Outputs> {
        info!(resource = %resource.id, "Replacing resource");
        self.remove(previous, outputs).await?;
        self.create(resource).await
    }
}

#[async_trait]
impl Provisioner for AwsProvisioner {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn create(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        match resource.kind {
            ResourceKind::IamRole => self.create_role(resource).await,
            ResourceKind::IamPolicy => self.create_policy(resource).await,
            ResourceKind::RolePolicyAttachment => self.attach_policy(resource).await,
            ResourceKind::SnsTopic => self.create_topic(resource).await,
            ResourceKind::SnsTopicSubscription => self.subscribe(resource).await,
            ResourceKind::LambdaFunction => self.create_function(resource).await,
            ResourceKind::LambdaPermission => self.add_permission(resource).await,
            ResourceKind::EventRule => self.put_rule(resource).await,
            ResourceKind::EventTarget => self.put_target(resource).await,
            kind => Err(ProvisionError::Unsupported { kind }),
        }
    }

    async fn update(
        &self,
        resource: &ResolvedResource,
        previous: &ResolvedResource,
        outputs: &Outputs,
    ) -> ProvisionResult<Outputs> {
        let same_name = resource.str_property("name") == previous.str_property("name");
        if resource.kind != previous.kind || !same_name {
            return self.replace(resource, previous, outputs).await;
        }

        match resource.kind {
            ResourceKind::IamRole => {
                self.iam
                    .update_assume_role_policy()
                    .role_name(required(resource, "name")?)
                    .policy_document(required(resource, "assume_role_policy")?)
                    .send()
                    .await
                    .map_err(|e| ProvisionError::aws("UpdateAssumeRolePolicy", e))?;
                Ok(outputs.clone())
            }
            ResourceKind::IamPolicy => self.update_policy(resource, outputs).await,
            // the name is the topic's only property
            ResourceKind::SnsTopic => Ok(outputs.clone()),
            ResourceKind::LambdaFunction => self.update_function(resource, outputs).await,
            // both calls are upserts
            ResourceKind::EventRule | ResourceKind::EventTarget => self.create(resource).await,
            _ => self.replace(resource, previous, outputs).await,
        }
    }

    async fn delete(&self, resource: &ResolvedResource, outputs: &Outputs) -> ProvisionResult<()> {
        info!(resource = %resource.id, kind = %resource.kind, "Deleting AWS resource");
        self.remove(resource, outputs).await
    }
}

fn named(name: &str, arn: String) -> Outputs {
    Outputs::from([("name".to_string(), name.to_string()), ("arn".to_string(), arn)])
}

fn named_output<'a>(resource: &'a ResolvedResource, outputs: &'a Outputs) -> ProvisionResult<&'a str> {
    match outputs.get("name") {
        Some(name) => Ok(name),
        None => required(resource, "name"),
    }
}

fn missing(resource: &ResolvedResource, attribute: &str) -> ProvisionError {
    ProvisionError::MissingOutput {
        resource: resource.id.clone(),
        attribute: attribute.to_string(),
    }
}

fn environment(resource: &ResolvedResource) -> Environment {
    let variables: HashMap<String, String> = resource.prefixed("environment").into_iter().collect();
    Environment::builder().set_variables(Some(variables)).build()
}

fn is_not_found<E: ProvideErrorMetadata>(err: &E) -> bool {
    matches!(
        err.code(),
        Some("NoSuchEntity" | "ResourceNotFoundException" | "NotFound")
    )
}

fn role_not_assumable<E: ProvideErrorMetadata>(err: &E) -> bool {
    err.code() == Some("InvalidParameterValueException")
        && err.message().is_some_and(|m| m.contains("cannot be assumed"))
}

fn update_in_progress<E: ProvideErrorMetadata>(err: &E) -> bool {
    err.code() == Some("ResourceConflictException")
}

/// A delete of something that no longer exists counts as done
fn tolerate_missing<T, E>(operation: &'static str, result: Result<T, E>) -> ProvisionResult<()>
where
    E: ProvideErrorMetadata + std::error::Error,
{
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => {
            debug!(operation, "Resource already gone");
            Ok(())
        }
        Err(err) => Err(ProvisionError::aws(operation, err)),
    }
}

async fn with_retry<T, E, F, Fut>(
    operation: &'static str,
    retryable: impl Fn(&E) -> bool,
    mut call: F,
) -> ProvisionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < RETRY_ATTEMPTS && retryable(&err) => {
                debug!(operation, attempt, "Retrying: {}", DisplayErrorContext(&err));
                tokio::time::sleep(RETRY_DELAY).await;
                attempt += 1;
            }
            Err(err) => return Err(ProvisionError::aws(operation, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_iam::error::ErrorMetadata;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("service error")]
    struct FakeError(ErrorMetadata);

    impl FakeError {
        fn new(code: &str, message: &str) -> Self {
            Self(ErrorMetadata::builder().code(code).message(message).build())
        }
    }

    impl ProvideErrorMetadata for FakeError {
        fn meta(&self) -> &ErrorMetadata {
            &self.0
        }
    }

    fn function() -> ResolvedResource {
        ResolvedResource {
            id: "notifier-function".into(),
            kind: ResourceKind::LambdaFunction,
            properties: serde_json::from_value(json!({
                "name": "dev-notifier-function",
                "environment.topic_arn": "arn:aws:sns:us-east-1:123:morningUpdates",
            }))
            .unwrap(),
        }
    }

    #[test]
    fn environment_carries_prefixed_properties() {
        let env = environment(&function());
        let variables = env.variables().unwrap();
        assert_eq!(variables.len(), 1);
        assert_eq!(variables["topic_arn"], "arn:aws:sns:us-east-1:123:morningUpdates");
    }

    #[test]
    fn recorded_name_wins_over_declared_name() {
        let resource = function();
        assert_eq!(named_output(&resource, &Outputs::new()).unwrap(), "dev-notifier-function");
        let outputs = Outputs::from([("name".to_string(), "older".to_string())]);
        assert_eq!(named_output(&resource, &outputs).unwrap(), "older");
    }

    #[test]
    fn missing_resources_are_tolerated_on_delete() {
        let gone: Result<(), FakeError> = Err(FakeError::new("NoSuchEntity", "role not found"));
        assert!(tolerate_missing("DeleteRole", gone).is_ok());

        let denied: Result<(), FakeError> = Err(FakeError::new("AccessDenied", "not allowed"));
        assert!(matches!(
            tolerate_missing("DeleteRole", denied),
            Err(ProvisionError::Aws { operation: "DeleteRole", .. })
        ));
    }

    #[tokio::test]
    async fn role_propagation_errors_are_retried() {
        let attempts = AtomicU32::new(0);
        let result = with_retry("CreateFunction", role_not_assumable, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(FakeError::new(
                        "InvalidParameterValueException",
                        "The role defined for the function cannot be assumed by Lambda.",
                    ))
                } else {
                    Ok("created")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "created");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_fail_immediately() {
        let attempts = AtomicU32::new(0);
        let result: ProvisionResult<()> = with_retry("CreateFunction", role_not_assumable, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(FakeError::new("InvalidParameterValueException", "Unsupported runtime"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
