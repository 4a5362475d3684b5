//! Jenkins on Kubernetes
//!
//! Manifests are Tera templates rendered with the stack config and parsed into
//! `k8s-openapi` types, so every object is checked against the API schema
//! before it is declared.
//!
//! The service account is bound to a wildcard cluster role. That grant is
//! cluster-admin-equivalent; it is kept as declared and reported as a
//! warning on every plan.

use crate::error::StackError;
use crate::graph::StackGraph;
use crate::names::jenkins as names;
use crate::stacks::StackDefinition;
use crate::storage;
use crate::types::JenkinsConfig;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Namespace, PersistentVolume, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use stackgraph_models::{PropertyValue, ResourceDecl, ResourceKind, StackKind};
use std::collections::BTreeMap;
use tera::{Context as TeraContext, Tera};

pub const DEFAULT_NAMESPACE: &str = "jenkins";
pub const DEFAULT_NODE_NAME: &str = "docker-desktop";
pub const DEFAULT_IMAGE: &str = "bitnami/jenkins";
pub const VOLUME_CAPACITY: &str = "10Gi";
pub const CLAIM_REQUEST: &str = "1Gi";
pub const NODE_PORT_RANGE: std::ops::RangeInclusive<i32> = 30000..=32767;

const TEMPLATES: &[(&str, &str)] = &[
    ("namespace", include_str!("../templates/jenkins-namespace.yaml")),
    ("cluster-role", include_str!("../templates/jenkins-cluster-role.yaml")),
    ("service-account", include_str!("../templates/jenkins-service-account.yaml")),
    ("cluster-role-binding", include_str!("../templates/jenkins-cluster-role-binding.yaml")),
    ("secret", include_str!("../templates/jenkins-secret.yaml")),
    ("storage-class", include_str!("../templates/jenkins-storage-class.yaml")),
    ("pv", include_str!("../templates/jenkins-pv.yaml")),
    ("pvc", include_str!("../templates/jenkins-pvc.yaml")),
    ("deployment", include_str!("../templates/jenkins-deployment.yaml")),
    ("service", include_str!("../templates/jenkins-service.yaml")),
];

/// Base64-encode a secret value, once
pub fn encode_secret_value(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

pub fn decode_secret_value(encoded: &str) -> Option<String> {
    let bytes = STANDARD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// Every object the stack declares
#[derive(Debug, Clone)]
pub struct JenkinsManifests {
    pub namespace: Option<Namespace>,
    pub cluster_role: ClusterRole,
    pub service_account: ServiceAccount,
    pub cluster_role_binding: ClusterRoleBinding,
    pub secret: Secret,
    pub storage_class: StorageClass,
    pub volume: PersistentVolume,
    pub claim: PersistentVolumeClaim,
    pub deployment: Deployment,
    pub service: Service,
}

impl JenkinsManifests {
    pub fn render(config: &JenkinsConfig) -> Result<Self, StackError> {
        let mut tera = Tera::default();
        for (name, template) in TEMPLATES {
            tera.add_raw_template(name, template)?;
        }

        let namespace = config.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        let mut ctx = TeraContext::new();
        ctx.insert("stack", &config.stack);
        ctx.insert("namespace", namespace);
        ctx.insert("node_name", config.node_name.as_deref().unwrap_or(DEFAULT_NODE_NAME));
        ctx.insert("image", config.image.as_deref().unwrap_or(DEFAULT_IMAGE));
        ctx.insert("username_b64", &encode_secret_value(&config.username));
        ctx.insert("password_b64", &encode_secret_value(&config.password));
        ctx.insert("username_key", names::USERNAME_KEY);
        ctx.insert("password_key", names::PASSWORD_KEY);
        ctx.insert("admin_account", names::ADMIN_ACCOUNT);
        ctx.insert("storage_class", names::STORAGE_CLASS_NAME);
        ctx.insert("volume_name", names::VOLUME_NAME);
        ctx.insert("claim_name", names::CLAIM_NAME);
        ctx.insert("volume_capacity", VOLUME_CAPACITY);
        ctx.insert("claim_request", CLAIM_REQUEST);
        ctx.insert("deployment_name", names::DEPLOYMENT_NAME);
        ctx.insert("service_name", names::SERVICE_NAME);
        ctx.insert("app_label", names::APP_LABEL);
        ctx.insert("node_port", &names::NODE_PORT);

        let namespace_object = if namespace == "default" {
            None
        } else {
            Some(render_one(&tera, "namespace", &ctx)?)
        };

        Ok(Self {
            namespace: namespace_object,
            cluster_role: render_one(&tera, "cluster-role", &ctx)?,
            service_account: render_one(&tera, "service-account", &ctx)?,
            cluster_role_binding: render_one(&tera, "cluster-role-binding", &ctx)?,
            secret: render_one(&tera, "secret", &ctx)?,
            storage_class: render_one(&tera, "storage-class", &ctx)?,
            volume: render_one(&tera, "pv", &ctx)?,
            claim: render_one(&tera, "pvc", &ctx)?,
            deployment: render_one(&tera, "deployment", &ctx)?,
            service: render_one(&tera, "service", &ctx)?,
        })
    }

    /// Check the invariants the objects must hold together; returns warnings
    pub fn validate(&self, config: &JenkinsConfig) -> Result<Vec<String>, StackError> {
        let mut warnings = Vec::new();

        for (key, expected) in [
            (names::USERNAME_KEY, &config.username),
            (names::PASSWORD_KEY, &config.password),
        ] {
            let stored = self
                .secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .ok_or_else(|| StackError::Invalid(format!("secret is missing key {}", key)))?;
            if stored.0 != expected.as_bytes() {
                return Err(StackError::Invalid(format!(
                    "secret key {} does not round-trip",
                    key
                )));
            }
        }

        let binding = storage::check_binding(&self.volume, &self.claim)?;
        warnings.push(format!(
            "volume {} is pinned to node {}; pods using claim {} can only run there",
            names::VOLUME_NAME,
            binding.pinned_nodes.join(", "),
            names::CLAIM_NAME
        ));

        let replicas = self.deployment.spec.as_ref().and_then(|spec| spec.replicas);
        if replicas != Some(1) {
            return Err(StackError::Invalid(format!(
                "deployment must run exactly one replica, found {:?}",
                replicas
            )));
        }

        let pod_labels = self
            .deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.metadata.as_ref())
            .and_then(|meta| meta.labels.clone())
            .unwrap_or_default();
        let selector = self
            .service
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.clone())
            .unwrap_or_default();
        if selector.is_empty() || !selector.iter().all(|(k, v)| pod_labels.get(k) == Some(v)) {
            return Err(StackError::Invalid(
                "service selector does not match the deployment's pod labels".to_string(),
            ));
        }

        for port in self
            .service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .into_iter()
            .flatten()
        {
            if let Some(node_port) = port.node_port {
                if !NODE_PORT_RANGE.contains(&node_port) {
                    return Err(StackError::Invalid(format!(
                        "node port {} is outside {}-{}",
                        node_port,
                        NODE_PORT_RANGE.start(),
                        NODE_PORT_RANGE.end()
                    )));
                }
            }
        }

        let wildcard = self.cluster_role.rules.iter().flatten().any(|rule| {
            rule.verbs.iter().any(|verb| verb == "*")
                && rule.resources.iter().flatten().any(|resource| resource == "*")
        });
        if wildcard {
            warnings.push(format!(
                "service account {} is bound to cluster role {} with wildcard verbs and \
                 resources (cluster-admin equivalent)",
                names::ADMIN_ACCOUNT,
                names::ADMIN_ACCOUNT
            ));
        }

        Ok(warnings)
    }

    /// All manifests as one multi-document YAML stream, in apply order
    pub fn to_yaml(&self) -> Result<String, StackError> {
        let mut documents = Vec::new();
        if let Some(namespace) = &self.namespace {
            documents.push(serde_yaml::to_string(namespace)?);
        }
        documents.push(serde_yaml::to_string(&self.cluster_role)?);
        documents.push(serde_yaml::to_string(&self.service_account)?);
        documents.push(serde_yaml::to_string(&self.cluster_role_binding)?);
        documents.push(serde_yaml::to_string(&self.secret)?);
        documents.push(serde_yaml::to_string(&self.storage_class)?);
        documents.push(serde_yaml::to_string(&self.volume)?);
        documents.push(serde_yaml::to_string(&self.claim)?);
        documents.push(serde_yaml::to_string(&self.deployment)?);
        documents.push(serde_yaml::to_string(&self.service)?);
        Ok(documents.join("---\n"))
    }
}

pub fn build(config: &JenkinsConfig) -> Result<StackDefinition, StackError> {
    let manifests = JenkinsManifests::render(config)?;
    let warnings = manifests.validate(config)?;
    let namespace = config.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
    let id = |suffix: &str| format!("{}-{}", config.stack, suffix);

    let namespaced = |decl: ResourceDecl| -> ResourceDecl {
        let decl = decl.literal("namespace", namespace);
        if manifests.namespace.is_some() {
            decl.depends_on(id(names::NAMESPACE))
        } else {
            decl
        }
    };

    let mut decls = Vec::new();
    if let Some(ns) = &manifests.namespace {
        decls.push(manifest_decl(id(names::NAMESPACE), ResourceKind::Namespace, ns)?);
    }
    decls.push(manifest_decl(
        id(names::CLUSTER_ROLE),
        ResourceKind::ClusterRole,
        &manifests.cluster_role,
    )?);
    decls.push(namespaced(manifest_decl(
        id(names::SERVICE_ACCOUNT),
        ResourceKind::ServiceAccount,
        &manifests.service_account,
    )?));
    decls.push(
        manifest_decl(
            id(names::CLUSTER_ROLE_BINDING),
            ResourceKind::ClusterRoleBinding,
            &manifests.cluster_role_binding,
        )?
        .depends_on(id(names::CLUSTER_ROLE))
        .depends_on(id(names::SERVICE_ACCOUNT)),
    );
    decls.push(namespaced(manifest_decl(
        id(names::SECRET),
        ResourceKind::Secret,
        &manifests.secret,
    )?));
    decls.push(manifest_decl(
        id(names::STORAGE_CLASS),
        ResourceKind::StorageClass,
        &manifests.storage_class,
    )?);
    decls.push(
        manifest_decl(
            id(names::PERSISTENT_VOLUME),
            ResourceKind::PersistentVolume,
            &manifests.volume,
        )?
        .depends_on(id(names::STORAGE_CLASS)),
    );
    decls.push(namespaced(
        manifest_decl(
            id(names::PERSISTENT_VOLUME_CLAIM),
            ResourceKind::PersistentVolumeClaim,
            &manifests.claim,
        )?
        .depends_on(id(names::STORAGE_CLASS))
        .depends_on(id(names::PERSISTENT_VOLUME)),
    ));
    decls.push(namespaced(
        manifest_decl(
            id(names::DEPLOYMENT),
            ResourceKind::Deployment,
            &manifests.deployment,
        )?
        .depends_on(id(names::SERVICE_ACCOUNT))
        .depends_on(id(names::CLUSTER_ROLE_BINDING))
        .depends_on(id(names::SECRET))
        .depends_on(id(names::PERSISTENT_VOLUME_CLAIM)),
    ));
    decls.push(namespaced(
        manifest_decl(id(names::SERVICE), ResourceKind::Service, &manifests.service)?
            .depends_on(id(names::DEPLOYMENT)),
    ));

    let graph = StackGraph::build(decls)?;

    let mut outputs = BTreeMap::new();
    outputs.insert(
        names::URL_OUTPUT.to_string(),
        PropertyValue::Literal(Value::String(format!("http://localhost:{}", names::NODE_PORT))),
    );

    Ok(StackDefinition {
        name: config.stack.clone(),
        kind: StackKind::Jenkins,
        graph,
        outputs,
        warnings,
    })
}

fn render_one<T: DeserializeOwned>(
    tera: &Tera,
    template: &str,
    ctx: &TeraContext,
) -> Result<T, StackError> {
    let yaml = tera.render(template, ctx)?;
    Ok(serde_yaml::from_str(&yaml)?)
}

fn manifest_decl<T: Serialize>(
    id: String,
    kind: ResourceKind,
    object: &T,
) -> Result<ResourceDecl, StackError> {
    Ok(ResourceDecl::new(id, kind).literal("manifest", serde_json::to_value(object)?))
}
