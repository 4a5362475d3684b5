//! Stack declarations
//!
//! Each stack is built from an explicit config struct into a validated
//! [`StackDefinition`]; nothing is read from the environment here.

pub mod jenkins;
pub mod notifier;

use crate::graph::StackGraph;
use stackgraph_models::{PropertyValue, StackKind};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct StackDefinition {
    pub name: String,
    pub kind: StackKind,
    pub graph: StackGraph,
    /// Values exported after a successful apply
    pub outputs: BTreeMap<String, PropertyValue>,
    /// Noteworthy properties of the declaration an operator should see
    pub warnings: Vec<String>,
}
