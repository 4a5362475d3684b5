//! Error types for stack declaration, planning and provisioning

use stackgraph_models::{OutputRef, ResourceId, ResourceKind};
use thiserror::Error;

/// Errors raised while assembling a resource graph
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("resource declared twice: {0}")]
    DuplicateResource(ResourceId),

    #[error("{resource} depends on unknown resource {dependency}")]
    UnknownDependency {
        resource: ResourceId,
        dependency: ResourceId,
    },

    #[error("{resource} references {reference} without declaring a dependency on it")]
    UndeclaredReference {
        resource: ResourceId,
        reference: OutputRef,
    },

    #[error("dependency cycle between: {}", format_ids(.0))]
    Cycle(Vec<ResourceId>),
}

fn format_ids(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(ResourceId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while parsing or evaluating a schedule expression
#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("expected 6 cron fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} is outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("unsupported {field} syntax '{value}'")]
    Unsupported { field: &'static str, value: String },

    #[error("exactly one of day-of-month and day-of-week must be '?'")]
    DayFieldConflict,
}

/// Errors raised by the storage binding checks
#[derive(Debug, Error, PartialEq)]
pub enum StorageError {
    #[error("invalid quantity '{0}'")]
    InvalidQuantity(String),

    #[error("{object} is missing {field}")]
    MissingField { object: String, field: &'static str },

    #[error("storage class mismatch: volume uses '{volume}', claim requests '{claim}'")]
    StorageClassMismatch { volume: String, claim: String },

    #[error("no access mode shared between volume {volume:?} and claim {claim:?}")]
    AccessModeMismatch {
        volume: Vec<String>,
        claim: Vec<String>,
    },

    #[error("claim requests {requested} but volume capacity is {capacity}")]
    InsufficientCapacity { requested: String, capacity: String },

    #[error("volume is reserved for claim {expected}, not {actual}")]
    ClaimRefMismatch { expected: String, actual: String },

    #[error("volume is not pinned to a node")]
    MissingNodeAffinity,
}

/// Errors raised while declaring a stack
#[derive(Debug, Error)]
pub enum StackError {
    #[error("missing required configuration value: {0}")]
    MissingConfig(&'static str),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("event target {target} has no invoke permission for {function} from rule {rule}")]
    MissingInvokePermission {
        target: ResourceId,
        function: ResourceId,
        rule: ResourceId,
    },

    #[error("invalid declaration: {0}")]
    Invalid(String),
}

/// Errors raised by a provisioner while talking to AWS or Kubernetes
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{operation} failed: {message}")]
    Aws {
        operation: &'static str,
        message: String,
    },

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{resource} is missing property '{property}'")]
    MissingProperty {
        resource: ResourceId,
        property: &'static str,
    },

    #[error("{resource} reports no output '{attribute}'")]
    MissingOutput {
        resource: ResourceId,
        attribute: String,
    },

    #[error("cannot resolve {reference} for {resource}")]
    Unresolved {
        resource: ResourceId,
        reference: OutputRef,
    },

    #[error("{kind} is not handled by this provisioner")]
    Unsupported { kind: ResourceKind },

    #[error("invalid manifest for {resource}: {source}")]
    Manifest {
        resource: ResourceId,
        source: serde_json::Error,
    },

    #[error("failed to package {path}: {message}")]
    Package { path: String, message: String },

    #[error("{0}")]
    Rejected(String),
}

impl ProvisionError {
    pub fn aws(operation: &'static str, err: impl std::error::Error) -> Self {
        ProvisionError::Aws {
            operation,
            message: aws_sdk_iam::error::DisplayErrorContext(err).to_string(),
        }
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Errors raised by the state file store
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },
}

/// Errors raised by the apply engine itself (not by individual resources)
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors returned by a message publisher
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{0}")]
    Service(String),
}

/// Errors returned by the notifier function handler
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("environment variable '{0}' is not set")]
    MissingTopicArn(&'static str),

    #[error("failed to publish message: {0}")]
    Publish(#[from] PublishError),

    #[error("failed to encode response: {0}")]
    Serialize(#[from] serde_json::Error),
}
