use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a resource, unique within one stack
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The API a resource kind is provisioned through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Kubernetes,
}

/// Every resource kind either stack declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    // AWS
    IamRole,
    IamPolicy,
    RolePolicyAttachment,
    SnsTopic,
    SnsTopicSubscription,
    LambdaFunction,
    LambdaPermission,
    EventRule,
    EventTarget,
    // Kubernetes
    Namespace,
    ClusterRole,
    ClusterRoleBinding,
    ServiceAccount,
    Secret,
    StorageClass,
    PersistentVolume,
    PersistentVolumeClaim,
    Deployment,
    Service,
}

impl ResourceKind {
    pub fn provider(&self) -> Provider {
        match self {
            ResourceKind::IamRole
            | ResourceKind::IamPolicy
            | ResourceKind::RolePolicyAttachment
            | ResourceKind::SnsTopic
            | ResourceKind::SnsTopicSubscription
            | ResourceKind::LambdaFunction
            | ResourceKind::LambdaPermission
            | ResourceKind::EventRule
            | ResourceKind::EventTarget => Provider::Aws,
            _ => Provider::Kubernetes,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::IamRole => "aws:iam:Role",
            ResourceKind::IamPolicy => "aws:iam:Policy",
            ResourceKind::RolePolicyAttachment => "aws:iam:RolePolicyAttachment",
            ResourceKind::SnsTopic => "aws:sns:Topic",
            ResourceKind::SnsTopicSubscription => "aws:sns:TopicSubscription",
            ResourceKind::LambdaFunction => "aws:lambda:Function",
            ResourceKind::LambdaPermission => "aws:lambda:Permission",
            ResourceKind::EventRule => "aws:cloudwatch:EventRule",
            ResourceKind::EventTarget => "aws:cloudwatch:EventTarget",
            ResourceKind::Namespace => "kubernetes:core/v1:Namespace",
            ResourceKind::ClusterRole => "kubernetes:rbac.authorization.k8s.io/v1:ClusterRole",
            ResourceKind::ClusterRoleBinding => {
                "kubernetes:rbac.authorization.k8s.io/v1:ClusterRoleBinding"
            }
            ResourceKind::ServiceAccount => "kubernetes:core/v1:ServiceAccount",
            ResourceKind::Secret => "kubernetes:core/v1:Secret",
            ResourceKind::StorageClass => "kubernetes:storage.k8s.io/v1:StorageClass",
            ResourceKind::PersistentVolume => "kubernetes:core/v1:PersistentVolume",
            ResourceKind::PersistentVolumeClaim => "kubernetes:core/v1:PersistentVolumeClaim",
            ResourceKind::Deployment => "kubernetes:apps/v1:Deployment",
            ResourceKind::Service => "kubernetes:core/v1:Service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Reference to an output (`arn`, `name`, ...) of another resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub resource: ResourceId,
    pub attribute: String,
}

impl OutputRef {
    pub fn new(resource: impl Into<ResourceId>, attribute: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.attribute)
    }
}

/// A declared property: either known at declaration time or resolved from
/// another resource's outputs during apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    Literal(Value),
    Output(OutputRef),
}

/// Desired state of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub properties: BTreeMap<String, PropertyValue>,
    /// Resources whose creation must complete before this one is submitted
    pub depends_on: Vec<ResourceId>,
}

impl ResourceDecl {
    pub fn new(id: impl Into<ResourceId>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn literal(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties
            .insert(key.to_string(), PropertyValue::Literal(value.into()));
        self
    }

    /// Reference an output of `resource`; the dependency is declared as well
    pub fn output(mut self, key: &str, resource: impl Into<ResourceId>, attribute: &str) -> Self {
        let output = OutputRef::new(resource, attribute);
        if !self.depends_on.contains(&output.resource) {
            self.depends_on.push(output.resource.clone());
        }
        self.properties
            .insert(key.to_string(), PropertyValue::Output(output));
        self
    }

    pub fn depends_on(mut self, resource: impl Into<ResourceId>) -> Self {
        let resource = resource.into();
        if !self.depends_on.contains(&resource) {
            self.depends_on.push(resource);
        }
        self
    }

    /// Every output reference among the properties
    pub fn references(&self) -> impl Iterator<Item = &OutputRef> {
        self.properties.values().filter_map(|value| match value {
            PropertyValue::Output(output) => Some(output),
            PropertyValue::Literal(_) => None,
        })
    }
}

/// Outputs a provisioner reports for a created resource
pub type Outputs = BTreeMap<String, String>;

/// A resource with every output reference substituted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub properties: BTreeMap<String, Value>,
}

impl ResolvedResource {
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn str_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// Properties sharing a `prefix.` namespace, keyed by the remainder
    pub fn prefixed(&self, prefix: &str) -> BTreeMap<String, String> {
        let prefix = format!("{}.", prefix);
        self.properties
            .iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(&prefix)?;
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some((name.to_string(), value))
            })
            .collect()
    }
}

/// The two stacks this workspace knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackKind {
    Notifier,
    Jenkins,
}

impl StackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackKind::Notifier => "notifier",
            StackKind::Jenkins => "jenkins",
        }
    }
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for StackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "notifier" => Ok(StackKind::Notifier),
            "jenkins" => Ok(StackKind::Jenkins),
            other => Err(format!(
                "unknown stack '{}' (expected 'notifier' or 'jenkins')",
                other
            )),
        }
    }
}

/// What a plan intends to do with a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlannedAction {
    Create,
    Update,
    Unchanged,
    Delete,
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlannedAction::Create => "create",
            PlannedAction::Update => "update",
            PlannedAction::Unchanged => "unchanged",
            PlannedAction::Delete => "delete",
        };
        f.pad(s)
    }
}

/// What actually happened to a resource during apply or destroy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResourceOutcome {
    Created { outputs: Outputs },
    Updated { outputs: Outputs },
    Unchanged,
    Deleted,
    Failed { error: String },
    /// Not attempted because a resource it depends on failed
    Skipped { blocked_by: ResourceId },
}

impl ResourceOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ResourceOutcome::Failed { .. } | ResourceOutcome::Skipped { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ResourceOutcome::Created { .. } => "created",
            ResourceOutcome::Updated { .. } => "updated",
            ResourceOutcome::Unchanged => "unchanged",
            ResourceOutcome::Deleted => "deleted",
            ResourceOutcome::Failed { .. } => "failed",
            ResourceOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Metadata about one apply or destroy run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn output_reference_declares_dependency_once() {
        let decl = ResourceDecl::new("function", ResourceKind::LambdaFunction)
            .output("role", "role", "arn")
            .output("role_name", "role", "name")
            .depends_on("role");

        assert_eq!(decl.depends_on, vec![ResourceId::from("role")]);
        assert_eq!(decl.references().count(), 2);
    }

    #[test]
    fn prefixed_properties_strip_namespace() {
        let mut properties = BTreeMap::new();
        properties.insert("environment.topic_arn".to_string(), json!("arn:topic"));
        properties.insert("handler".to_string(), json!("bootstrap"));
        let resource = ResolvedResource {
            id: "function".into(),
            kind: ResourceKind::LambdaFunction,
            properties,
        };

        let env = resource.prefixed("environment");
        assert_eq!(env.len(), 1);
        assert_eq!(env["topic_arn"], "arn:topic");
    }

    #[test]
    fn stack_kind_parses_case_insensitively() {
        assert_eq!("Jenkins".parse::<StackKind>(), Ok(StackKind::Jenkins));
        assert!("terraform".parse::<StackKind>().is_err());
    }

    #[test]
    fn kinds_map_to_providers() {
        assert_eq!(ResourceKind::EventTarget.provider(), Provider::Aws);
        assert_eq!(ResourceKind::PersistentVolume.provider(), Provider::Kubernetes);
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = ResourceOutcome::Skipped {
            blocked_by: "role".into(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value, json!({"status": "skipped", "blocked_by": "role"}));
        assert!(outcome.is_failure());
    }
}
