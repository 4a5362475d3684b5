//! Recorded state of applied stacks
//!
//! One JSON file per stack under the state directory. The engine saves after
//! every resource outcome, so an interrupted or partially failed apply still
//! leaves an accurate record of what exists.

use crate::error::StateError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stackgraph_models::{Outputs, ResourceDecl, ResourceId, ResourceKind, RunInfo};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// What was last applied for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    /// Properties as resolved at apply time
    pub properties: BTreeMap<String, Value>,
    pub outputs: Outputs,
    pub depends_on: Vec<ResourceId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    pub stack: String,
    pub resources: BTreeMap<ResourceId, ResourceRecord>,
    pub outputs: BTreeMap<String, String>,
    pub last_run: Option<RunInfo>,
}

impl StackState {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Recorded resources as literal declarations, so the recorded
    /// dependency edges can be ordered for deletion
    pub fn as_decls(&self) -> Vec<ResourceDecl> {
        self.resources
            .iter()
            .map(|(id, record)| {
                let mut decl = ResourceDecl::new(id.clone(), record.kind);
                for dependency in &record.depends_on {
                    // a dependency removed from the record is already gone
                    if self.resources.contains_key(dependency) {
                        decl = decl.depends_on(dependency.clone());
                    }
                }
                for (key, value) in &record.properties {
                    decl = decl.literal(key, value.clone());
                }
                decl
            })
            .collect()
    }
}

/// File-backed store, one `<stack>.json` per stack
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.stackgraph/state`, falling back to the working directory
    pub fn default_dir() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".stackgraph").join("state")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, stack: &str) -> PathBuf {
        self.dir.join(format!("{}.json", stack))
    }

    /// Load a stack's state; a missing file is an empty state
    pub fn load(&self, stack: &str) -> Result<StackState, StateError> {
        let path = self.path_for(stack);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StackState::new(stack));
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|source| StateError::Corrupt {
            path: path.display().to_string(),
            source,
        })
    }

    /// Write via a temp file and rename so readers never see a torn file
    pub fn save(&self, state: &StackState) -> Result<(), StateError> {
        let path = self.path_for(&state.stack);
        let write_err = |source| StateError::Write {
            path: path.display().to_string(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(write_err)?;
        let json = serde_json::to_string_pretty(state).map_err(|source| StateError::Corrupt {
            path: path.display().to_string(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(write_err)?;
        std::fs::rename(&tmp, &path).map_err(write_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(kind: ResourceKind, depends_on: &[&str]) -> ResourceRecord {
        ResourceRecord {
            kind,
            properties: BTreeMap::from([("name".to_string(), json!("dev-topic"))]),
            outputs: Outputs::from([("arn".to_string(), "arn:aws:sns:us-east-1:000000000000:dev-topic".to_string())]),
            depends_on: depends_on.iter().map(|id| ResourceId::from(*id)).collect(),
        }
    }

    #[test]
    fn missing_file_loads_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = store.load("dev").unwrap();
        assert_eq!(state.stack, "dev");
        assert!(state.is_empty());
    }

    #[test]
    fn save_then_load_returns_same_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested"));

        let mut state = StackState::new("dev");
        state.resources.insert("topic".into(), record(ResourceKind::SnsTopic, &[]));
        state.outputs.insert("topic_arn".to_string(), "arn".to_string());
        store.save(&state).unwrap();

        assert!(store.path_for("dev").exists());
        assert_eq!(store.load("dev").unwrap(), state);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        std::fs::write(store.path_for("dev"), "{not json").unwrap();
        assert!(matches!(store.load("dev"), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn decls_drop_edges_to_forgotten_resources() {
        let mut state = StackState::new("dev");
        state.resources.insert("topic".into(), record(ResourceKind::SnsTopic, &[]));
        state.resources.insert(
            "subscription".into(),
            record(ResourceKind::SnsTopicSubscription, &["topic", "deleted-earlier"]),
        );

        let decls = state.as_decls();
        let subscription = decls.iter().find(|d| d.id.as_str() == "subscription").unwrap();
        assert_eq!(subscription.depends_on, vec![ResourceId::from("topic")]);
    }
}
