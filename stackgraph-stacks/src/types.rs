//! Configuration inputs and run reports for the stacks

use serde::{Deserialize, Serialize};
use stackgraph_models::{PlannedAction, ResourceId, ResourceKind, ResourceOutcome, RunInfo};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ============================================================================
// Notifier stack
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifierConfig {
    /// Stack name, prefixed onto physical resource names
    pub stack: String,
    /// Email endpoint subscribed to the topic (default: "travis@travis.media")
    pub email: Option<String>,
    /// Directory zipped into the function's code archive (default: "./function")
    pub function_dir: Option<PathBuf>,
    /// Function runtime (default: "provided.al2023")
    pub runtime: Option<String>,
    /// Function handler (default: "bootstrap")
    pub handler: Option<String>,
    /// Schedule expression (default: "cron(0 7 * * ? *)")
    pub schedule: Option<String>,
}

impl NotifierConfig {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            email: None,
            function_dir: None,
            runtime: None,
            handler: None,
            schedule: None,
        }
    }
}

// ============================================================================
// Jenkins stack
// ============================================================================

#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct JenkinsConfig {
    /// Stack name; also the name of the credentials secret
    pub stack: String,
    /// Jenkins admin username (required)
    pub username: String,
    /// Jenkins admin password (required)
    pub password: String,
    /// Kubernetes namespace (default: "jenkins")
    pub namespace: Option<String>,
    /// Node the local volume is pinned to (default: "docker-desktop")
    pub node_name: Option<String>,
    /// Container image (default: "bitnami/jenkins")
    pub image: Option<String>,
}

impl JenkinsConfig {
    /// Fails before anything is declared when a credential is absent
    pub fn new(
        stack: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, crate::error::StackError> {
        use crate::error::StackError;

        let username = username
            .filter(|value| !value.is_empty())
            .ok_or(StackError::MissingConfig("username"))?;
        let password = password
            .filter(|value| !value.is_empty())
            .ok_or(StackError::MissingConfig("password"))?;
        Ok(Self {
            stack: stack.into(),
            username,
            password,
            namespace: None,
            node_name: None,
            image: None,
        })
    }
}

impl std::fmt::Debug for JenkinsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JenkinsConfig")
            .field("stack", &self.stack)
            .field("username", &self.username)
            .field("password", &"****")
            .field("namespace", &self.namespace)
            .field("node_name", &self.node_name)
            .field("image", &self.image)
            .finish()
    }
}

// ============================================================================
// Plan / apply reports
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub resource: ResourceId,
    pub kind: ResourceKind,
    pub action: PlannedAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub stack: String,
    /// Steps in the order they would run
    pub steps: Vec<PlanStep>,
    /// Resources that could be created concurrently, wave by wave
    pub waves: Vec<Vec<ResourceId>>,
    pub warnings: Vec<String>,
}

impl Plan {
    pub fn count(&self, action: PlannedAction) -> usize {
        self.steps.iter().filter(|step| step.action == action).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportEntry {
    pub resource: ResourceId,
    pub kind: ResourceKind,
    pub outcome: ResourceOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub stack: String,
    pub run: RunInfo,
    pub entries: Vec<ReportEntry>,
    /// Stack outputs, only present after a successful apply
    pub outputs: BTreeMap<String, String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        !self.entries.iter().any(|entry| entry.outcome.is_failure())
    }

    pub fn outcome(&self, resource: &str) -> Option<&ResourceOutcome> {
        self.entries
            .iter()
            .find(|entry| entry.resource.as_str() == resource)
            .map(|entry| &entry.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|entry| entry.outcome.is_failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackError;

    #[test]
    fn jenkins_config_requires_credentials() {
        let err = JenkinsConfig::new("dev", None, Some("secret".into())).unwrap_err();
        assert!(matches!(err, StackError::MissingConfig("username")));

        let err = JenkinsConfig::new("dev", Some("admin".into()), Some(String::new())).unwrap_err();
        assert!(matches!(err, StackError::MissingConfig("password")));

        let config = JenkinsConfig::new("dev", Some("admin".into()), Some("secret".into())).unwrap();
        assert_eq!(config.username, "admin");
    }

    #[test]
    fn jenkins_config_debug_hides_password() {
        let config = JenkinsConfig::new("dev", Some("admin".into()), Some("hunter2".into())).unwrap();
        let printed = format!("{:?}", config);
        assert!(printed.contains("admin"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn notifier_config_serialization() {
        let mut config = NotifierConfig::new("dev");
        config.email = Some("ops@example.com".to_string());

        let json = serde_json::to_string(&config).unwrap();
        let parsed: NotifierConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
