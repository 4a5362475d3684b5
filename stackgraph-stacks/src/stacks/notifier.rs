//! Scheduled notifier stack
//!
//! role + policy -> attachment -> function <- topic, then the daily rule,
//! its target and the invoke permission, and an email subscription on the
//! topic.

use crate::error::StackError;
use crate::graph::StackGraph;
use crate::names::notifier as names;
use crate::package;
use crate::schedule::CronSchedule;
use crate::stacks::StackDefinition;
use crate::types::NotifierConfig;
use serde_json::{json, Value};
use stackgraph_models::{
    OutputRef, PropertyValue, ResourceDecl, ResourceId, ResourceKind, StackKind,
};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_EMAIL: &str = "travis@travis.media";
pub const DEFAULT_FUNCTION_DIR: &str = "./function";
pub const DEFAULT_RUNTIME: &str = "provided.al2023";
pub const DEFAULT_HANDLER: &str = "bootstrap";
const STATEMENT_ID: &str = "AllowExecutionFromEventBridge";

pub fn trust_policy() -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Action": "sts:AssumeRole",
                "Principal": { "Service": names::LAMBDA_PRINCIPAL },
                "Effect": "Allow",
                "Sid": ""
            }
        ]
    })
}

pub fn publish_policy() -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Action": ["sns:Publish"],
                "Effect": "Allow",
                "Resource": "*"
            }
        ]
    })
}

pub fn build(config: &NotifierConfig) -> Result<StackDefinition, StackError> {
    let stack = &config.stack;
    let physical = |id: &str| format!("{}-{}", stack, id);

    let email = config.email.clone().unwrap_or_else(|| DEFAULT_EMAIL.to_string());
    let function_dir = config
        .function_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FUNCTION_DIR));
    let mut warnings = vec![format!(
        "email subscription for {} stays pending until the recipient confirms it; \
         nothing is delivered before that",
        email
    )];
    let schedule = CronSchedule::parse(
        config.schedule.as_deref().unwrap_or(names::SCHEDULE_EXPRESSION),
    )?;

    let trust = trust_policy();
    validate_trust_policy(&trust)?;
    let policy = publish_policy();
    validate_publish_policy(&policy)?;

    let mut function = ResourceDecl::new(names::FUNCTION, ResourceKind::LambdaFunction)
        .literal("name", physical(names::FUNCTION))
        .literal("code_dir", function_dir.display().to_string());
    // the digest makes a code edit diff as an update
    match package::code_sha256(&function_dir) {
        Ok(digest) => function = function.literal("code_sha256", digest),
        Err(err) => warnings.push(format!(
            "function code could not be packaged ({}); code changes will not be detected",
            err
        )),
    }
    let function = function
        .literal(
            "runtime",
            config.runtime.clone().unwrap_or_else(|| DEFAULT_RUNTIME.to_string()),
        )
        .literal(
            "handler",
            config.handler.clone().unwrap_or_else(|| DEFAULT_HANDLER.to_string()),
        )
        .output("role", names::LAMBDA_ROLE, "arn")
        .output(
            &format!("environment.{}", names::TOPIC_ARN_ENV),
            names::TOPIC,
            "arn",
        )
        // the role must carry the publish grant before the function runs
        .depends_on(names::ROLE_ATTACHMENT);

    let decls = vec![
        ResourceDecl::new(names::LAMBDA_ROLE, ResourceKind::IamRole)
            .literal("name", physical(names::LAMBDA_ROLE))
            .literal("assume_role_policy", trust.to_string()),
        ResourceDecl::new(names::PUBLISH_POLICY, ResourceKind::IamPolicy)
            .literal("name", physical(names::PUBLISH_POLICY))
            .literal("description", "A test policy")
            .literal("policy", policy.to_string()),
        ResourceDecl::new(names::ROLE_ATTACHMENT, ResourceKind::RolePolicyAttachment)
            .output("role", names::LAMBDA_ROLE, "name")
            .output("policy_arn", names::PUBLISH_POLICY, "arn"),
        ResourceDecl::new(names::TOPIC, ResourceKind::SnsTopic)
            .literal("name", physical(names::TOPIC)),
        function,
        ResourceDecl::new(names::TRIGGER, ResourceKind::EventRule)
            .literal("name", physical(names::TRIGGER))
            .literal("schedule_expression", schedule.expression())
            .literal("description", names::SCHEDULE_DESCRIPTION),
        ResourceDecl::new(names::EVENT_TARGET, ResourceKind::EventTarget)
            .literal("target_id", names::FUNCTION)
            .output("rule", names::TRIGGER, "name")
            .output("arn", names::FUNCTION, "arn"),
        ResourceDecl::new(names::INVOKE_PERMISSION, ResourceKind::LambdaPermission)
            .literal("statement_id", STATEMENT_ID)
            .literal("action", "lambda:InvokeFunction")
            .literal("principal", names::EVENTS_PRINCIPAL)
            .output("function", names::FUNCTION, "name")
            .output("source_arn", names::TRIGGER, "arn"),
        ResourceDecl::new(names::SUBSCRIPTION, ResourceKind::SnsTopicSubscription)
            .literal("protocol", "email")
            .literal("endpoint", email.clone())
            .output("topic", names::TOPIC, "arn"),
    ];

    ensure_invoke_permissions(&decls)?;
    let graph = StackGraph::build(decls)?;

    let mut outputs = BTreeMap::new();
    outputs.insert(
        "topic_arn".to_string(),
        PropertyValue::Output(OutputRef::new(names::TOPIC, "arn")),
    );
    outputs.insert(
        "function_name".to_string(),
        PropertyValue::Output(OutputRef::new(names::FUNCTION, "name")),
    );
    outputs.insert(
        "schedule".to_string(),
        PropertyValue::Literal(Value::String(schedule.expression().to_string())),
    );

    Ok(StackDefinition {
        name: stack.clone(),
        kind: StackKind::Notifier,
        graph,
        outputs,
        warnings,
    })
}

/// The role must be assumable by the function runtime
pub fn validate_trust_policy(document: &Value) -> Result<(), StackError> {
    let allowed = statements(document).any(|statement| {
        statement["Effect"] == "Allow"
            && actions(statement).iter().any(|action| action == "sts:AssumeRole")
            && statement["Principal"]["Service"] == names::LAMBDA_PRINCIPAL
    });
    if allowed {
        Ok(())
    } else {
        Err(StackError::Invalid(format!(
            "trust policy does not let {} assume the role",
            names::LAMBDA_PRINCIPAL
        )))
    }
}

/// The policy grants publishing and nothing else
pub fn validate_publish_policy(document: &Value) -> Result<(), StackError> {
    let granted: Vec<String> = statements(document).flat_map(actions).collect();
    if granted == ["sns:Publish"] {
        Ok(())
    } else {
        Err(StackError::Invalid(format!(
            "publish policy must grant exactly sns:Publish, found {:?}",
            granted
        )))
    }
}

/// Every event target aimed at a function needs a permission letting
/// EventBridge invoke that function from that rule
pub fn ensure_invoke_permissions(decls: &[ResourceDecl]) -> Result<(), StackError> {
    for target in decls.iter().filter(|d| d.kind == ResourceKind::EventTarget) {
        let (Some(function), Some(rule)) = (
            referenced(target, "arn"),
            referenced(target, "rule"),
        ) else {
            return Err(StackError::Invalid(format!(
                "event target {} must reference a function and a rule",
                target.id
            )));
        };

        let permitted = decls.iter().any(|permission| {
            permission.kind == ResourceKind::LambdaPermission
                && referenced(permission, "function") == Some(function)
                && referenced(permission, "source_arn") == Some(rule)
                && literal(permission, "principal") == Some(names::EVENTS_PRINCIPAL)
                && literal(permission, "action") == Some("lambda:InvokeFunction")
        });
        if !permitted {
            return Err(StackError::MissingInvokePermission {
                target: target.id.clone(),
                function: function.clone(),
                rule: rule.clone(),
            });
        }
    }
    Ok(())
}

fn referenced<'a>(decl: &'a ResourceDecl, key: &str) -> Option<&'a ResourceId> {
    match decl.properties.get(key)? {
        PropertyValue::Output(output) => Some(&output.resource),
        PropertyValue::Literal(_) => None,
    }
}

fn literal<'a>(decl: &'a ResourceDecl, key: &str) -> Option<&'a str> {
    match decl.properties.get(key)? {
        PropertyValue::Literal(value) => value.as_str(),
        PropertyValue::Output(_) => None,
    }
}

fn statements(document: &Value) -> impl Iterator<Item = &Value> {
    document["Statement"].as_array().into_iter().flatten()
}

fn actions(statement: &Value) -> Vec<String> {
    match &statement["Action"] {
        Value::String(action) => vec![action.clone()],
        Value::Array(actions) => actions
            .iter()
            .filter_map(|action| action.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> StackDefinition {
        build(&NotifierConfig::new("dev")).unwrap()
    }

    fn ids(order: Vec<&ResourceDecl>) -> Vec<String> {
        order.iter().map(|d| d.id.to_string()).collect()
    }

    #[test]
    fn declares_every_resource() {
        let stack = stack();
        assert_eq!(stack.graph.len(), 9);
        assert_eq!(stack.kind, StackKind::Notifier);
        for id in [
            names::LAMBDA_ROLE,
            names::PUBLISH_POLICY,
            names::ROLE_ATTACHMENT,
            names::TOPIC,
            names::FUNCTION,
            names::TRIGGER,
            names::EVENT_TARGET,
            names::INVOKE_PERMISSION,
            names::SUBSCRIPTION,
        ] {
            assert!(stack.graph.contains(&id.into()), "missing {}", id);
        }
    }

    #[test]
    fn apply_order_follows_references() {
        let order = ids(stack().graph.apply_order());
        let at = |id: &str| order.iter().position(|o| o == id).unwrap();

        assert!(at(names::LAMBDA_ROLE) < at(names::ROLE_ATTACHMENT));
        assert!(at(names::PUBLISH_POLICY) < at(names::ROLE_ATTACHMENT));
        assert!(at(names::ROLE_ATTACHMENT) < at(names::FUNCTION));
        assert!(at(names::TOPIC) < at(names::FUNCTION));
        assert!(at(names::FUNCTION) < at(names::EVENT_TARGET));
        assert!(at(names::FUNCTION) < at(names::INVOKE_PERMISSION));
        assert!(at(names::TRIGGER) < at(names::INVOKE_PERMISSION));
        assert!(at(names::TOPIC) < at(names::SUBSCRIPTION));
    }

    #[test]
    fn policy_and_topic_can_be_created_together() {
        let waves = stack().graph.waves();
        assert!(waves[0].contains(&names::PUBLISH_POLICY.into()));
        assert!(waves[0].contains(&names::TOPIC.into()));
        assert!(waves[0].contains(&names::LAMBDA_ROLE.into()));
    }

    #[test]
    fn function_receives_topic_arn_through_environment() {
        let stack = stack();
        let function = stack.graph.get(&names::FUNCTION.into()).unwrap();
        assert_eq!(
            function.properties["environment.topic_arn"],
            PropertyValue::Output(OutputRef::new(names::TOPIC, "arn"))
        );
        assert_eq!(
            function.properties["role"],
            PropertyValue::Output(OutputRef::new(names::LAMBDA_ROLE, "arn"))
        );
    }

    #[test]
    fn rule_uses_daily_schedule() {
        let stack = stack();
        let rule = stack.graph.get(&names::TRIGGER.into()).unwrap();
        assert_eq!(
            rule.properties["schedule_expression"],
            PropertyValue::Literal(json!("cron(0 7 * * ? *)"))
        );
    }

    #[test]
    fn subscription_is_flagged_as_needing_confirmation() {
        let stack = stack();
        assert!(stack.warnings[0].contains(DEFAULT_EMAIL));
    }

    #[test]
    fn missing_invoke_permission_is_rejected() {
        let stack = stack();
        let decls: Vec<ResourceDecl> = stack
            .graph
            .decls()
            .iter()
            .filter(|d| d.id.as_str() != names::INVOKE_PERMISSION)
            .cloned()
            .collect();

        let err = ensure_invoke_permissions(&decls).unwrap_err();
        assert!(matches!(err, StackError::MissingInvokePermission { .. }));
    }

    #[test]
    fn permission_for_wrong_principal_does_not_count() {
        let stack = stack();
        let decls: Vec<ResourceDecl> = stack
            .graph
            .decls()
            .iter()
            .cloned()
            .map(|d| {
                if d.id.as_str() == names::INVOKE_PERMISSION {
                    d.literal("principal", "s3.amazonaws.com")
                } else {
                    d
                }
            })
            .collect();
        assert!(ensure_invoke_permissions(&decls).is_err());
    }

    #[test]
    fn policy_documents_are_validated() {
        assert!(validate_trust_policy(&trust_policy()).is_ok());
        assert!(validate_publish_policy(&publish_policy()).is_ok());

        let broad = json!({"Statement": [{"Action": ["sns:*"], "Effect": "Allow", "Resource": "*"}]});
        assert!(validate_publish_policy(&broad).is_err());

        let wrong = json!({"Statement": [{
            "Action": "sts:AssumeRole",
            "Principal": {"Service": "ec2.amazonaws.com"},
            "Effect": "Allow"
        }]});
        assert!(validate_trust_policy(&wrong).is_err());
    }

    #[test]
    fn invalid_schedule_fails_the_build() {
        let mut config = NotifierConfig::new("dev");
        config.schedule = Some("cron(0 7 * * * *)".to_string());
        assert!(matches!(build(&config), Err(StackError::Schedule(_))));
    }

    #[test]
    fn function_records_code_digest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bootstrap"), b"v1").unwrap();
        let mut config = NotifierConfig::new("dev");
        config.function_dir = Some(dir.path().to_path_buf());

        let stack = build(&config).unwrap();
        let function = stack.graph.get(&names::FUNCTION.into()).unwrap();
        assert_eq!(
            function.properties["code_sha256"],
            PropertyValue::Literal(json!(package::code_sha256(dir.path()).unwrap()))
        );
        assert_eq!(stack.warnings.len(), 1);
    }

    #[test]
    fn missing_function_code_is_a_warning() {
        let mut config = NotifierConfig::new("dev");
        config.function_dir = Some(PathBuf::from("/nonexistent/function"));

        let stack = build(&config).unwrap();
        let function = stack.graph.get(&names::FUNCTION.into()).unwrap();
        assert!(!function.properties.contains_key("code_sha256"));
        assert!(stack.warnings.iter().any(|w| w.contains("could not be packaged")));
    }
}
