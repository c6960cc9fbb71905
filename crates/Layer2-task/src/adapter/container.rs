//! Container runtime abstraction
//!
//! The sandboxed adapter talks to containers only through `ContainerRuntime`.
//! `DockerRuntime` implements it on top of the local Docker daemon.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use hive_foundation::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Log lines kept when capturing diagnostics
const LOG_TAIL: &str = "500";

/// One bind mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn read_write(host: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(host: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// Docker `binds` entry
    pub fn bind(&self) -> String {
        let mut bind = format!("{}:{}", self.host.display(), self.target.display());
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// Everything needed to launch one container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Empty = image default command
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub network: String,
    pub labels: BTreeMap<String, String>,
}

/// Container lifecycle operations used by the sandboxed adapter
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start detached; returns the container id
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String>;

    /// Block until the container exits; returns the exit code
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Freeze every process in place
    async fn pause(&self, id: &str) -> Result<()>;

    async fn unpause(&self, id: &str) -> Result<()>;

    /// Combined stdout/stderr
    async fn logs(&self, id: &str) -> Result<String>;

    async fn remove(&self, id: &str) -> Result<()>;
}

// ============================================================================
// DockerRuntime
// ============================================================================

/// `ContainerRuntime` backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    /// Connect using the platform defaults (socket or named pipe)
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Container(format!("Failed to connect to Docker: {}", e)))?;
        Ok(Self {
            docker: Arc::new(docker),
        })
    }

    /// Whether the daemon answers
    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let binds: Vec<String> = spec.mounts.iter().map(Mount::bind).collect();
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            labels: Some(labels),
            host_config: Some(bollard::models::HostConfig {
                binds: if binds.is_empty() { None } else { Some(binds) },
                network_mode: Some(spec.network.clone()),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::Container(format!("Failed to create container: {}", e)))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Container(format!("Failed to start container: {}", e)))?;

        debug!(container = %response.id, name = %spec.name, "Container started");
        Ok(response.id)
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::Container(format!("Failed to wait for container: {}", e))),
            None => Err(Error::Container(format!(
                "Wait stream for {} ended without a status",
                id
            ))),
        }
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.docker
            .pause_container(id)
            .await
            .map_err(|e| Error::Container(format!("Failed to pause container: {}", e)))
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(|e| Error::Container(format!("Failed to unpause container: {}", e)))
    }

    async fn logs(&self, id: &str) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: LOG_TAIL.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));

        let mut output = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(Error::Container(format!("Failed to read logs: {}", e)));
                }
            }
        }
        Ok(output)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| Error::Container(format!("Failed to remove container: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_format() {
        assert_eq!(
            Mount::read_write("/data/tasks/t1", "/hive/task").bind(),
            "/data/tasks/t1:/hive/task"
        );
        assert_eq!(
            Mount::read_only("/data/shared", "/hive/shared").bind(),
            "/data/shared:/hive/shared:ro"
        );
    }
}
