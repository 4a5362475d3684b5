//! Kubernetes provisioner
//!
//! Each declaration carries its typed manifest as JSON. Create and update are
//! both server-side apply, so re-running against an existing object converges
//! instead of failing with a conflict.

use super::Provisioner;
use crate::error::{ProvisionError, ProvisionResult};
use crate::k8s_client::get_k8s_client;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Namespace, PersistentVolume, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use stackgraph_models::{Outputs, ResolvedResource, ResourceKind};
use std::fmt::Debug;
use tracing::{debug, info};

const FIELD_MANAGER: &str = "stackgraph";

pub struct KubeProvisioner {
    client: Client,
}

impl KubeProvisioner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with the ambient kubeconfig or in-cluster config
    pub async fn connect() -> anyhow::Result<Self> {
        Ok(Self::new(get_k8s_client().await?))
    }

    async fn apply(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        let client = self.client.clone();
        match resource.kind {
            ResourceKind::Namespace => apply_object::<Namespace>(Api::all(client), resource).await,
            ResourceKind::ClusterRole => {
                apply_object::<ClusterRole>(Api::all(client), resource).await
            }
            ResourceKind::ClusterRoleBinding => {
                apply_object::<ClusterRoleBinding>(Api::all(client), resource).await
            }
            ResourceKind::StorageClass => {
                apply_object::<StorageClass>(Api::all(client), resource).await
            }
            ResourceKind::PersistentVolume => {
                apply_object::<PersistentVolume>(Api::all(client), resource).await
            }
            ResourceKind::ServiceAccount => {
                let api = Api::namespaced(client, namespace(resource)?);
                apply_object::<ServiceAccount>(api, resource).await
            }
            ResourceKind::Secret => {
                let api = Api::namespaced(client, namespace(resource)?);
                apply_object::<Secret>(api, resource).await
            }
            ResourceKind::PersistentVolumeClaim => {
                let api = Api::namespaced(client, namespace(resource)?);
                apply_object::<PersistentVolumeClaim>(api, resource).await
            }
            ResourceKind::Deployment => {
                let api = Api::namespaced(client, namespace(resource)?);
                apply_object::<Deployment>(api, resource).await
            }
            ResourceKind::Service => {
                let api = Api::namespaced(client, namespace(resource)?);
                apply_object::<Service>(api, resource).await
            }
            kind => Err(ProvisionError::Unsupported { kind }),
        }
    }

    async fn remove(&self, resource: &ResolvedResource, outputs: &Outputs) -> ProvisionResult<()> {
        let client = self.client.clone();
        let name = object_name(resource, outputs)?;
        match resource.kind {
            ResourceKind::Namespace => delete_object::<Namespace>(Api::all(client), &name).await,
            ResourceKind::ClusterRole => {
                delete_object::<ClusterRole>(Api::all(client), &name).await
            }
            ResourceKind::ClusterRoleBinding => {
                delete_object::<ClusterRoleBinding>(Api::all(client), &name).await
            }
            ResourceKind::StorageClass => {
                delete_object::<StorageClass>(Api::all(client), &name).await
            }
            ResourceKind::PersistentVolume => {
                delete_object::<PersistentVolume>(Api::all(client), &name).await
            }
            ResourceKind::ServiceAccount => {
                let api = Api::namespaced(client, namespace(resource)?);
                delete_object::<ServiceAccount>(api, &name).await
            }
            ResourceKind::Secret => {
                let api = Api::namespaced(client, namespace(resource)?);
                delete_object::<Secret>(api, &name).await
            }
            ResourceKind::PersistentVolumeClaim => {
                let api = Api::namespaced(client, namespace(resource)?);
                delete_object::<PersistentVolumeClaim>(api, &name).await
            }
            ResourceKind::Deployment => {
                let api = Api::namespaced(client, namespace(resource)?);
                delete_object::<Deployment>(api, &name).await
            }
            ResourceKind::Service => {
                let api = Api::namespaced(client, namespace(resource)?);
                delete_object::<Service>(api, &name).await
            }
            kind => Err(ProvisionError::Unsupported { kind }),
        }
    }
}

#[async_trait]
impl Provisioner for KubeProvisioner {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn create(&self, resource: &ResolvedResource) -> ProvisionResult<Outputs> {
        self.apply(resource).await
    }

    async fn update(
        &self,
        resource: &ResolvedResource,
        previous: &ResolvedResource,
        outputs: &Outputs,
    ) -> ProvisionResult<Outputs> {
        if replaces_object(resource, previous, outputs)? {
            self.remove(previous, outputs).await?;
        }
        self.apply(resource).await
    }

    async fn delete(&self, resource: &ResolvedResource, outputs: &Outputs) -> ProvisionResult<()> {
        self.remove(resource, outputs).await
    }
}

fn namespace(resource: &ResolvedResource) -> ProvisionResult<&str> {
    super::required(resource, "namespace")
}

fn manifest_value(resource: &ResolvedResource) -> ProvisionResult<&serde_json::Value> {
    resource
        .property("manifest")
        .ok_or_else(|| ProvisionError::MissingProperty {
            resource: resource.id.clone(),
            property: "manifest",
        })
}

fn parse_manifest<K: DeserializeOwned>(resource: &ResolvedResource) -> ProvisionResult<K> {
    serde_json::from_value(manifest_value(resource)?.clone()).map_err(|source| {
        ProvisionError::Manifest {
            resource: resource.id.clone(),
            source,
        }
    })
}

fn manifest_name(resource: &ResolvedResource) -> ProvisionResult<String> {
    manifest_value(resource)?
        .pointer("/metadata/name")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::MissingProperty {
            resource: resource.id.clone(),
            property: "metadata.name",
        })
}

fn object_name(resource: &ResolvedResource, outputs: &Outputs) -> ProvisionResult<String> {
    match outputs.get("name") {
        Some(name) => Ok(name.clone()),
        None => manifest_name(resource),
    }
}

/// Server-side apply only updates in place when kind, name and namespace
/// all stay the same; anything else leaves the old object behind unless it
/// is removed first
fn replaces_object(
    resource: &ResolvedResource,
    previous: &ResolvedResource,
    outputs: &Outputs,
) -> ProvisionResult<bool> {
    let renamed = object_name(previous, outputs)? != manifest_name(resource)?;
    let previous_namespace = outputs
        .get("namespace")
        .map(String::as_str)
        .or_else(|| previous.str_property("namespace"));
    let moved = previous_namespace != resource.str_property("namespace");
    Ok(previous.kind != resource.kind || renamed || moved)
}

async fn apply_object<K>(api: Api<K>, resource: &ResolvedResource) -> ProvisionResult<Outputs>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    let object: K = parse_manifest(resource)?;
    let name = object.name_any();

    info!(resource = %resource.id, kind = %resource.kind, %name, "Applying manifest");
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let applied = api.patch(&name, &params, &Patch::Apply(&object)).await?;

    let mut outputs = Outputs::new();
    outputs.insert("name".to_string(), applied.name_any());
    if let Some(namespace) = applied.namespace() {
        outputs.insert("namespace".to_string(), namespace);
    }
    if let Some(uid) = applied.uid() {
        outputs.insert("uid".to_string(), uid);
    }
    Ok(outputs)
}

async fn delete_object<K>(api: Api<K>, name: &str) -> ProvisionResult<()>
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(%name, "Deleted");
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!(%name, "Not found, skipping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stacks::jenkins;
    use crate::types::JenkinsConfig;

    fn jenkins_resources() -> Vec<ResolvedResource> {
        let config = JenkinsConfig::new("dev", Some("admin".into()), Some("secret".into())).unwrap();
        let stack = jenkins::build(&config).unwrap();
        stack
            .graph
            .apply_order()
            .into_iter()
            .map(|decl| crate::engine::resolve(decl, &Default::default()).unwrap())
            .collect()
    }

    #[test]
    fn every_jenkins_manifest_parses_into_its_kind() {
        for resource in jenkins_resources() {
            let result = match resource.kind {
                ResourceKind::Namespace => parse_manifest::<Namespace>(&resource).map(|_| ()),
                ResourceKind::ClusterRole => parse_manifest::<ClusterRole>(&resource).map(|_| ()),
                ResourceKind::ClusterRoleBinding => {
                    parse_manifest::<ClusterRoleBinding>(&resource).map(|_| ())
                }
                ResourceKind::ServiceAccount => {
                    parse_manifest::<ServiceAccount>(&resource).map(|_| ())
                }
                ResourceKind::Secret => parse_manifest::<Secret>(&resource).map(|_| ()),
                ResourceKind::StorageClass => parse_manifest::<StorageClass>(&resource).map(|_| ()),
                ResourceKind::PersistentVolume => {
                    parse_manifest::<PersistentVolume>(&resource).map(|_| ())
                }
                ResourceKind::PersistentVolumeClaim => {
                    parse_manifest::<PersistentVolumeClaim>(&resource).map(|_| ())
                }
                ResourceKind::Deployment => parse_manifest::<Deployment>(&resource).map(|_| ()),
                ResourceKind::Service => parse_manifest::<Service>(&resource).map(|_| ()),
                kind => panic!("unexpected kind {}", kind),
            };
            assert!(result.is_ok(), "{} failed to parse", resource.id);
        }
    }

    #[test]
    fn object_name_prefers_recorded_output() {
        let resources = jenkins_resources();
        let service = resources
            .iter()
            .find(|r| r.kind == ResourceKind::Service)
            .unwrap();

        assert_eq!(object_name(service, &Outputs::new()).unwrap(), "jenkins-service");

        let recorded = Outputs::from([("name".to_string(), "old-service".to_string())]);
        assert_eq!(object_name(service, &recorded).unwrap(), "old-service");
    }

    #[test]
    fn namespaced_kinds_carry_a_namespace() {
        for resource in jenkins_resources() {
            let namespaced = matches!(
                resource.kind,
                ResourceKind::ServiceAccount
                    | ResourceKind::Secret
                    | ResourceKind::PersistentVolumeClaim
                    | ResourceKind::Deployment
                    | ResourceKind::Service
            );
            assert_eq!(namespace(&resource).is_ok(), namespaced, "{}", resource.id);
        }
    }

    #[test]
    fn moving_namespace_replaces_the_object() {
        let resources = jenkins_resources();
        let previous = resources
            .iter()
            .find(|r| r.kind == ResourceKind::Deployment)
            .unwrap()
            .clone();
        let mut outputs = Outputs::new();
        outputs.insert("name".to_string(), manifest_name(&previous).unwrap());
        outputs.insert("namespace".to_string(), "default".to_string());

        let mut moved = previous.clone();
        moved
            .properties
            .insert("namespace".to_string(), serde_json::json!("jenkins"));
        assert!(replaces_object(&moved, &previous, &outputs).unwrap());

        outputs.insert("namespace".to_string(), "jenkins".to_string());
        assert!(!replaces_object(&moved, &previous, &outputs).unwrap());
    }

    #[test]
    fn cluster_scoped_objects_update_in_place() {
        let resources = jenkins_resources();
        let role = resources
            .iter()
            .find(|r| r.kind == ResourceKind::ClusterRole)
            .unwrap();
        assert!(!replaces_object(role, role, &Outputs::new()).unwrap());
    }
}
