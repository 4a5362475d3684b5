//! In-process provisioner
//!
//! Assigns deterministic ARNs and names without touching any API. Backs
//! `--dry-run` and the engine tests; selected resources can be made to fail.

use super::Provisioner;
use crate::error::{ProvisionError, ProvisionResult};
use async_trait::async_trait;
use stackgraph_models::{Outputs, Provider, ResolvedResource, ResourceId, ResourceKind};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

const ACCOUNT: &str = "000000000000";
const REGION: &str = "us-east-1";

/// Operation recorded by [`MemoryProvisioner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(ResourceId),
    Update(ResourceId),
    Delete(ResourceId),
}

#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    live: Mutex<BTreeMap<ResourceId, Outputs>>,
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<ResourceId>>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later operation on `id` fails
    pub fn fail_on(&self, id: impl Into<ResourceId>) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).insert(id.into());
    }

    pub fn recover(&self, id: &ResourceId) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn live(&self) -> BTreeMap<ResourceId, Outputs> {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    fn check(&self, id: &ResourceId) -> ProvisionResult<()> {
        if self.failing.lock().unwrap_or_else(|e| e.into_inner()).contains(id) {
            return Err(ProvisionError::Rejected(format!("injected failure for {}", id)));
        }
        Ok(())
    }
}

/// Outputs a real API would report for this resource
pub fn synthetic_outputs(resource: &ResolvedResource) -> Outputs {
    let name = resource
        .str_property("name")
        .map(str::to_string)
        .or_else(|| manifest_name(resource))
        .unwrap_or_else(|| resource.id.to_string());

    let arn = match resource.kind {
        ResourceKind::IamRole => Some(format!("arn:aws:iam::{}:role/{}", ACCOUNT, name)),
        ResourceKind::IamPolicy => Some(format!("arn:aws:iam::{}:policy/{}", ACCOUNT, name)),
        ResourceKind::SnsTopic => Some(format!("arn:aws:sns:{}:{}:{}", REGION, ACCOUNT, name)),
        ResourceKind::SnsTopicSubscription => resource
            .str_property("topic")
            .map(|topic| format!("{}:{}", topic, resource.id)),
        ResourceKind::LambdaFunction => Some(format!(
            "arn:aws:lambda:{}:{}:function:{}",
            REGION, ACCOUNT, name
        )),
        ResourceKind::EventRule => Some(format!(
            "arn:aws:events:{}:{}:rule/{}",
            REGION, ACCOUNT, name
        )),
        _ => None,
    };

    let mut outputs = Outputs::new();
    outputs.insert("name".to_string(), name);
    if let Some(arn) = arn {
        outputs.insert("arn".to_string(), arn);
    }
    if resource.kind.provider() == Provider::Kubernetes {
        if let Some(namespace) = resource.str_property("namespace") {
            outputs.insert("namespace".to_string(), namespace.to_string());
        }
    }
    outputs
}

fn manifest_name(resource: &ResolvedResource) -> Option<String> {
    resource
        .property("manifest")?
        .pointer("/metadata/name")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        self.record(Call::Create(resource.id.clone()));
        self.check(&resource.id)?;
        let outputs = synthetic_outputs(resource);
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(resource.id.clone(), outputs.clone());
        Ok(outputs)
    }

    async fn update(
        &self,
        resource: &ResolvedResource,
        _previous: &ResolvedResource,
        _outputs: &Outputs,
    ) -> ProvisionResult<Outputs> {
        self.record(Call::Update(resource.id.clone()));
        self.check(&resource.id)?;
        let outputs = synthetic_outputs(resource);
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(resource.id.clone(), outputs.clone());
        Ok(outputs)
    }

    async fn delete(&self, resource: &ResolvedResource, _outputs: &Outputs) -> ProvisionResult<()> {
        self.record(Call::Delete(resource.id.clone()));
        self.check(&resource.id)?;
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&resource.id);
        Ok(())
    }
}
