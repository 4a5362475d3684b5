use anyhow::{Context, Result};
use stackgraph_stacks::stacks::{jenkins, notifier};
use stackgraph_stacks::state::StateStore;
use stackgraph_stacks::{JenkinsConfig, NotifierConfig};
use std::path::PathBuf;

const DEFAULT_STACK: &str = "dev";

#[derive(Clone)]
pub struct Config {
    pub stack: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub namespace: String,
    pub node_name: String,
    pub email: String,
    pub function_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("stack", &self.stack)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("namespace", &self.namespace)
            .field("node_name", &self.node_name)
            .field("email", &self.email)
            .field("function_dir", &self.function_dir)
            .field("state_dir", &self.state_dir)
            .finish()
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let stack = var("STACKGRAPH_STACK").unwrap_or_else(|| DEFAULT_STACK.to_string());
        if !valid_stack_name(&stack) {
            anyhow::bail!(
                "STACKGRAPH_STACK must start with a lowercase letter or digit and contain only \
                 lowercase letters, digits and '-', got '{}'",
                stack
            );
        }

        Ok(Self {
            stack,
            username: var("STACKGRAPH_USERNAME"),
            password: var("STACKGRAPH_PASSWORD"),
            namespace: var("STACKGRAPH_NAMESPACE")
                .unwrap_or_else(|| jenkins::DEFAULT_NAMESPACE.to_string()),
            node_name: var("STACKGRAPH_NODE_NAME")
                .unwrap_or_else(|| jenkins::DEFAULT_NODE_NAME.to_string()),
            email: var("STACKGRAPH_EMAIL").unwrap_or_else(|| notifier::DEFAULT_EMAIL.to_string()),
            function_dir: var("STACKGRAPH_FUNCTION_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(notifier::DEFAULT_FUNCTION_DIR)),
            state_dir: var("STACKGRAPH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(StateStore::default_dir),
        })
    }

    pub fn notifier(&self) -> NotifierConfig {
        NotifierConfig {
            email: Some(self.email.clone()),
            function_dir: Some(self.function_dir.clone()),
            ..NotifierConfig::new(&self.stack)
        }
    }

    /// Fails when either credential is missing, before anything is declared
    pub fn jenkins(&self) -> Result<JenkinsConfig> {
        let mut config = JenkinsConfig::new(&self.stack, self.username.clone(), self.password.clone())
            .context("STACKGRAPH_USERNAME and STACKGRAPH_PASSWORD must be set for the jenkins stack")?;
        config.namespace = Some(self.namespace.clone());
        config.node_name = Some(self.node_name.clone());
        Ok(config)
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(&self.state_dir)
    }
}

/// Stack names prefix AWS and Kubernetes resource names, which must start
/// with an alphanumeric character
fn valid_stack_name(name: &str) -> bool {
    let lower_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    name.starts_with(lower_alnum) && name.chars().all(|c| lower_alnum(c) || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.stack, "dev");
        assert_eq!(config.namespace, "jenkins");
        assert_eq!(config.node_name, "docker-desktop");
        assert_eq!(config.email, "travis@travis.media");
        assert_eq!(config.function_dir, PathBuf::from("./function"));
    }

    #[test]
    fn jenkins_requires_both_credentials() {
        let missing = config(&[("STACKGRAPH_USERNAME", "admin")]).unwrap();
        assert!(missing.jenkins().is_err());

        let complete = config(&[
            ("STACKGRAPH_USERNAME", "admin"),
            ("STACKGRAPH_PASSWORD", "secret"),
            ("STACKGRAPH_NAMESPACE", "ci"),
        ])
        .unwrap();
        let jenkins = complete.jenkins().unwrap();
        assert_eq!(jenkins.username, "admin");
        assert_eq!(jenkins.namespace.as_deref(), Some("ci"));
    }

    #[test]
    fn invalid_stack_names_are_rejected() {
        assert!(config(&[("STACKGRAPH_STACK", "Prod_1")]).is_err());
        assert!(config(&[("STACKGRAPH_STACK", "-dev")]).is_err());
        assert!(config(&[("STACKGRAPH_STACK", "--")]).is_err());
        assert_eq!(config(&[("STACKGRAPH_STACK", "dev-2")]).unwrap().stack, "dev-2");
        assert_eq!(config(&[("STACKGRAPH_STACK", "2nd")]).unwrap().stack, "2nd");
    }
}
