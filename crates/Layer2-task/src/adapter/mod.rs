//! Runtime adapters
//!
//! Provides the execution backends behind one lifecycle contract:
//! - `InProcessAdapter` - drives an `ExecutionCollaborator` inside this process
//! - `SandboxAdapter` - runs the task in an isolated container
//!
//! `RuntimeAdapterFactory` picks one per task from its assigned runtime.

pub mod collaborator;
pub mod container;
pub mod in_process;
pub mod sandbox;
pub mod tree;
pub mod r#trait;

pub use collaborator::{ExecutionCollaborator, TurnOutcome, TurnRequest, TurnStatus};
pub use container::{ContainerRuntime, ContainerSpec, DockerRuntime, Mount};
pub use in_process::InProcessAdapter;
pub use r#trait::{AdapterContext, AdapterEvent, AdapterFactory, AdapterState, RuntimeAdapter};
pub use sandbox::SandboxAdapter;
pub use tree::{ChildReport, ChildSpec, ChildStatus, TreeLimits};

use crate::task::Task;
use hive_foundation::{Error, HiveConfig, Result, RetryConfig, RuntimeKind};
use std::sync::Arc;

/// Default factory: in-process or sandbox per the task's runtime
pub struct RuntimeAdapterFactory {
    config: HiveConfig,
    collaborator: Option<Arc<dyn ExecutionCollaborator>>,
    containers: Option<Arc<dyn ContainerRuntime>>,
}

impl RuntimeAdapterFactory {
    pub fn new(config: HiveConfig) -> Self {
        Self {
            config,
            collaborator: None,
            containers: None,
        }
    }

    /// Enable the in-process runtime
    pub fn with_collaborator(mut self, collaborator: Arc<dyn ExecutionCollaborator>) -> Self {
        self.collaborator = Some(collaborator);
        self
    }

    /// Enable the sandbox runtime
    pub fn with_containers(mut self, containers: Arc<dyn ContainerRuntime>) -> Self {
        self.containers = Some(containers);
        self
    }

    fn runtime_for(&self, task: &Task) -> RuntimeKind {
        task.runtime().unwrap_or(self.config.default_runtime)
    }
}

impl AdapterFactory for RuntimeAdapterFactory {
    fn create(&self, task: &Task, ctx: AdapterContext) -> Result<Box<dyn RuntimeAdapter>> {
        match self.runtime_for(task) {
            RuntimeKind::InProcess => {
                let collaborator = self.collaborator.clone().ok_or_else(|| {
                    Error::Adapter("no execution collaborator configured for in-process runtime".into())
                })?;
                Ok(Box::new(
                    InProcessAdapter::new(
                        ctx,
                        collaborator,
                        TreeLimits::from(&self.config.in_process),
                        RetryConfig::from(&self.config.retry),
                    )
                    .with_inbox_poll(self.config.sandbox.progress_poll()),
                ))
            }
            RuntimeKind::Sandbox => {
                let containers = self.containers.clone().ok_or_else(|| {
                    Error::Adapter("no container runtime configured for sandbox runtime".into())
                })?;
                Ok(Box::new(SandboxAdapter::new(
                    ctx,
                    containers,
                    self.config.sandbox.clone(),
                    self.config.data_dir.clone(),
                )))
            }
        }
    }
}
