//! StackGraph stacks - resource graphs, stack declarations and provisioners
//!
//! This crate declares two independently deployable stacks (a scheduled
//! notifier on AWS and a single-node Jenkins on Kubernetes), orders their
//! resources by dependency, and applies them through a [`Provisioner`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stackgraph_stacks::engine::Engine;
//! use stackgraph_stacks::provisioners::memory::MemoryProvisioner;
//! use stackgraph_stacks::stacks::notifier;
//! use stackgraph_stacks::state::StackState;
//! use stackgraph_stacks::NotifierConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let stack = notifier::build(&NotifierConfig::new("dev"))?;
//! let engine = Engine::new(Arc::new(MemoryProvisioner::new()));
//! let mut state = StackState::new("dev");
//! let report = engine.apply(&stack, &mut state).await?;
//! assert!(report.succeeded());
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod function;
pub mod graph;
pub mod k8s_client;
pub mod names;
pub mod package;
pub mod provisioners;
pub mod schedule;
pub mod stacks;
pub mod state;
pub mod storage;
pub mod types;

pub use provisioners::Provisioner;
pub use types::*;
