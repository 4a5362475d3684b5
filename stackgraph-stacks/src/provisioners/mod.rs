//! Provisioners turn resolved declarations into calls against a real API

pub mod aws;
pub mod kube;
pub mod memory;

use crate::error::{ProvisionError, ProvisionResult};
use async_trait::async_trait;
use stackgraph_models::{Outputs, ResolvedResource};

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn create(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs>;

    /// Bring an existing resource to the new properties. Replaces it unless
    /// the provisioner can update in place.
    async fn update(
        &self,
        resource: &ResolvedResource,
        previous: &ResolvedResource,
        outputs: &Outputs,
    ) -> ProvisionResult<Outputs> {
        self.delete(previous, outputs).await?;
        self.create(resource).await
    }

    /// Delete a resource; one that is already gone counts as deleted
    async fn delete(&self, resource: &ResolvedResource, outputs: &Outputs) -> ProvisionResult<()>;
}

pub(crate) fn required<'a>(
    resource: &'a ResolvedResource,
    property: &'static str,
) -> ProvisionResult<&'a str> {
    resource
        .str_property(property)
        .ok_or_else(|| ProvisionError::MissingProperty {
            resource: resource.id.clone(),
            property,
        })
}

pub(crate) fn output<'a>(
    resource: &ResolvedResource,
    outputs: &'a Outputs,
    attribute: &str,
) -> ProvisionResult<&'a str> {
    outputs
        .get(attribute)
        .map(String::as_str)
        .ok_or_else(|| ProvisionError::MissingOutput {
            resource: resource.id.clone(),
            attribute: attribute.to_string(),
        })
}
