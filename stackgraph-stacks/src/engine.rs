//! Plan, apply and destroy a stack against a provisioner
//!
//! Resources are submitted one at a time in topological order. When a
//! resource fails, everything that transitively depends on it is skipped;
//! independent branches continue and nothing already created is rolled back.

use crate::error::{EngineError, ProvisionError, ProvisionResult};
use crate::graph::StackGraph;
use crate::provisioners::Provisioner;
use crate::stacks::StackDefinition;
use crate::state::{ResourceRecord, StackState, StateStore};
use crate::types::{Plan, PlanStep, ReportEntry, RunReport};
use chrono::Utc;
use serde_json::Value;
use stackgraph_models::{
    PlannedAction, PropertyValue, ResolvedResource, ResourceDecl, ResourceId, ResourceOutcome,
    RunInfo,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Engine {
    provisioner: Arc<dyn Provisioner>,
    store: Option<StateStore>,
}

impl Engine {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            store: None,
        }
    }

    /// Persist state after every resource outcome
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn apply(
        &self,
        stack: &StackDefinition,
        state: &mut StackState,
    ) -> Result<RunReport, EngineError> {
        let mut run = start_run("apply");
        info!(
            stack = %stack.name,
            run_id = %run.run_id,
            provisioner = self.provisioner.name(),
            resources = stack.graph.len(),
            "Applying stack"
        );

        let mut entries = Vec::with_capacity(stack.graph.len());
        let mut blocked: HashMap<ResourceId, ResourceId> = HashMap::new();

        for decl in stack.graph.apply_order() {
            let outcome = if let Some(root) = blocked.get(&decl.id) {
                debug!(resource = %decl.id, blocked_by = %root, "Skipping resource");
                ResourceOutcome::Skipped {
                    blocked_by: root.clone(),
                }
            } else {
                match self.apply_resource(decl, state).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(resource = %decl.id, kind = %decl.kind, "Failed to apply resource: {}", err);
                        for dependent in stack.graph.dependents_of(&decl.id) {
                            blocked.entry(dependent).or_insert_with(|| decl.id.clone());
                        }
                        ResourceOutcome::Failed {
                            error: err.to_string(),
                        }
                    }
                }
            };

            entries.push(ReportEntry {
                resource: decl.id.clone(),
                kind: decl.kind,
                outcome,
            });
            self.save(state)?;
        }

        let stale = orphans(stack, state)?;
        if !stale.is_empty() {
            info!(count = stale.len(), "Deleting resources no longer declared");
            let recorded = StackGraph::build(state.as_decls())?;
            let deletions = self.delete_in_order(&recorded, &stale, state).await?;
            entries.extend(deletions);
        }

        let mut outputs = BTreeMap::new();
        if entries.iter().all(|entry| !entry.outcome.is_failure()) {
            outputs = resolve_stack_outputs(stack, state);
            state.outputs = outputs.clone();
        }

        run.finished_at = Some(Utc::now());
        state.last_run = Some(run.clone());
        self.save(state)?;

        let report = RunReport {
            stack: stack.name.clone(),
            run,
            entries,
            outputs,
        };
        log_summary(&report);
        Ok(report)
    }

    /// Delete every recorded resource, dependents before their dependencies
    pub async fn destroy(&self, state: &mut StackState) -> Result<RunReport, EngineError> {
        let mut run = start_run("destroy");
        info!(
            stack = %state.stack,
            run_id = %run.run_id,
            provisioner = self.provisioner.name(),
            resources = state.resources.len(),
            "Destroying stack"
        );

        let recorded = StackGraph::build(state.as_decls())?;
        let all: Vec<ResourceId> = recorded.decls().iter().map(|d| d.id.clone()).collect();
        let entries = self.delete_in_order(&recorded, &all, state).await?;

        if state.is_empty() {
            state.outputs.clear();
        }
        run.finished_at = Some(Utc::now());
        state.last_run = Some(run.clone());
        self.save(state)?;

        let report = RunReport {
            stack: state.stack.clone(),
            run,
            entries,
            outputs: BTreeMap::new(),
        };
        log_summary(&report);
        Ok(report)
    }

    async fn apply_resource(
        &self,
        decl: &ResourceDecl,
        state: &mut StackState,
    ) -> ProvisionResult<ResourceOutcome> {
        let resolved = resolve(decl, state)?;

        let outcome = match state.resources.get_mut(&decl.id) {
            Some(record) if record.kind == decl.kind && record.properties == resolved.properties => {
                debug!(resource = %decl.id, "Resource unchanged");
                // edges can change without any property changing
                record.depends_on = decl.depends_on.clone();
                return Ok(ResourceOutcome::Unchanged);
            }
            Some(record) => {
                info!(resource = %decl.id, kind = %decl.kind, "Updating resource");
                let previous = ResolvedResource {
                    id: decl.id.clone(),
                    kind: record.kind,
                    properties: record.properties.clone(),
                };
                let outputs = self
                    .provisioner
                    .update(&resolved, &previous, &record.outputs)
                    .await?;
                ResourceOutcome::Updated { outputs }
            }
            None => {
                info!(resource = %decl.id, kind = %decl.kind, "Creating resource");
                let outputs = self.provisioner.create(&resolved).await?;
                ResourceOutcome::Created { outputs }
            }
        };

        if let ResourceOutcome::Created { outputs } | ResourceOutcome::Updated { outputs } = &outcome {
            state.resources.insert(
                decl.id.clone(),
                ResourceRecord {
                    kind: decl.kind,
                    properties: resolved.properties,
                    outputs: outputs.clone(),
                    depends_on: decl.depends_on.clone(),
                },
            );
        }
        Ok(outcome)
    }

    /// Delete `targets` in reverse dependency order. A failed delete blocks
    /// deletion of everything the failed resource depends on.
    async fn delete_in_order(
        &self,
        recorded: &StackGraph,
        targets: &[ResourceId],
        state: &mut StackState,
    ) -> Result<Vec<ReportEntry>, EngineError> {
        let mut entries = Vec::with_capacity(targets.len());
        let mut blocked: HashMap<ResourceId, ResourceId> = HashMap::new();

        for decl in recorded.destroy_order() {
            if !targets.contains(&decl.id) {
                continue;
            }
            let Some(record) = state.resources.get(&decl.id).cloned() else {
                continue;
            };

            let outcome = if let Some(root) = blocked.get(&decl.id) {
                ResourceOutcome::Skipped {
                    blocked_by: root.clone(),
                }
            } else {
                info!(resource = %decl.id, kind = %record.kind, "Deleting resource");
                let resource = ResolvedResource {
                    id: decl.id.clone(),
                    kind: record.kind,
                    properties: record.properties.clone(),
                };
                match self.provisioner.delete(&resource, &record.outputs).await {
                    Ok(()) => {
                        state.resources.remove(&decl.id);
                        ResourceOutcome::Deleted
                    }
                    Err(err) => {
                        warn!(resource = %decl.id, "Failed to delete resource: {}", err);
                        for dependency in recorded.dependencies_of(&decl.id) {
                            blocked.entry(dependency).or_insert_with(|| decl.id.clone());
                        }
                        ResourceOutcome::Failed {
                            error: err.to_string(),
                        }
                    }
                }
            };

            entries.push(ReportEntry {
                resource: decl.id.clone(),
                kind: record.kind,
                outcome,
            });
            self.save(state)?;
        }
        Ok(entries)
    }

    fn save(&self, state: &StackState) -> Result<(), EngineError> {
        if let Some(store) = &self.store {
            store.save(state)?;
        }
        Ok(())
    }
}

/// What [`Engine::apply`] would do. Needs only the declarations and the
/// recorded state.
pub fn plan(stack: &StackDefinition, state: &StackState) -> Result<Plan, EngineError> {
    let mut steps = Vec::with_capacity(stack.graph.len());
    for decl in stack.graph.apply_order() {
        let action = match state.resources.get(&decl.id) {
            None => PlannedAction::Create,
            Some(record) if record.kind != decl.kind => PlannedAction::Update,
            Some(record) => match resolve(decl, state) {
                Ok(resolved) if resolved.properties == record.properties => {
                    PlannedAction::Unchanged
                }
                // unresolvable references mean an upstream resource changes first
                _ => PlannedAction::Update,
            },
        };
        steps.push(PlanStep {
            resource: decl.id.clone(),
            kind: decl.kind,
            action,
        });
    }

    for id in orphans(stack, state)? {
        if let Some(record) = state.resources.get(&id) {
            steps.push(PlanStep {
                resource: id,
                kind: record.kind,
                action: PlannedAction::Delete,
            });
        }
    }

    Ok(Plan {
        stack: stack.name.clone(),
        steps,
        waves: stack.graph.waves(),
        warnings: stack.warnings.clone(),
    })
}

/// Substitute every output reference with the referenced resource's
/// recorded output
pub fn resolve(decl: &ResourceDecl, state: &StackState) -> ProvisionResult<ResolvedResource> {
    let mut properties = BTreeMap::new();
    for (key, value) in &decl.properties {
        let resolved = match value {
            PropertyValue::Literal(value) => value.clone(),
            PropertyValue::Output(reference) => state
                .resources
                .get(&reference.resource)
                .and_then(|record| record.outputs.get(&reference.attribute))
                .map(|output| Value::String(output.clone()))
                .ok_or_else(|| ProvisionError::Unresolved {
                    resource: decl.id.clone(),
                    reference: reference.clone(),
                })?,
        };
        properties.insert(key.clone(), resolved);
    }
    Ok(ResolvedResource {
        id: decl.id.clone(),
        kind: decl.kind,
        properties,
    })
}

/// Recorded resources that the stack no longer declares, in deletion order
fn orphans(stack: &StackDefinition, state: &StackState) -> Result<Vec<ResourceId>, EngineError> {
    if state.resources.keys().all(|id| stack.graph.contains(id)) {
        return Ok(Vec::new());
    }
    let recorded = StackGraph::build(state.as_decls())?;
    Ok(recorded
        .destroy_order()
        .into_iter()
        .filter(|decl| !stack.graph.contains(&decl.id))
        .map(|decl| decl.id.clone())
        .collect())
}

fn resolve_stack_outputs(stack: &StackDefinition, state: &StackState) -> BTreeMap<String, String> {
    let mut outputs = BTreeMap::new();
    for (name, value) in &stack.outputs {
        let resolved = match value {
            PropertyValue::Literal(Value::String(s)) => Some(s.clone()),
            PropertyValue::Literal(other) => Some(other.to_string()),
            PropertyValue::Output(reference) => state
                .resources
                .get(&reference.resource)
                .and_then(|record| record.outputs.get(&reference.attribute))
                .cloned(),
        };
        match resolved {
            Some(resolved) => {
                outputs.insert(name.clone(), resolved);
            }
            None => warn!(output = %name, "Stack output could not be resolved"),
        }
    }
    outputs
}

fn start_run(operation: &str) -> RunInfo {
    RunInfo {
        run_id: Uuid::new_v4(),
        operation: operation.to_string(),
        started_at: Utc::now(),
        finished_at: None,
    }
}

fn log_summary(report: &RunReport) {
    let failed = report.failures().count();
    if failed == 0 {
        info!(
            stack = %report.stack,
            operation = %report.run.operation,
            resources = report.entries.len(),
            "Run complete"
        );
    } else {
        warn!(
            stack = %report.stack,
            operation = %report.run.operation,
            failed,
            "Run finished with failures"
        );
    }
}
