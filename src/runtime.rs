//! Narrow container-runtime seam: spawn and kill, nothing else.
//!
//! Image construction, network isolation policy, and resource quotas are the
//! runtime's business; the lifecycle manager only asks it to run a named
//! container and to tear it down.

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{RelayError, Result};
use crate::lifecycle::PortMap;

/// The spawn/kill interface the lifecycle manager drives.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container. The flag is injected via the `FLAG`
    /// environment variable; `ports` maps host ports onto the image's
    /// ssh/vscode/desktop services.
    async fn run_container(
        &self,
        name: &str,
        image: &str,
        flag: &str,
        ports: &PortMap,
    ) -> Result<()>;

    /// Stop and remove a container. Must be idempotent: stopping a container
    /// that is already gone is not an error.
    async fn stop_container(&self, name: &str) -> Result<()>;

    /// Whether a container with this name exists (running or not).
    async fn container_exists(&self, name: &str) -> bool;
}

/// `ContainerRuntime` backed by the docker CLI.
pub struct DockerCli {
    network: String,
}

impl DockerCli {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
        }
    }

    async fn run_docker(&self, args: &[String]) -> Result<std::process::Output> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| RelayError::Runtime(format!("failed to invoke docker: {e}")))?;
        Ok(output)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run_container(
        &self,
        name: &str,
        image: &str,
        flag: &str,
        ports: &PortMap,
    ) -> Result<()> {
        validate_container_name(name)?;
        validate_image_name(image)?;

        let args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--network".into(),
            self.network.clone(),
            "-e".into(),
            format!("FLAG={flag}"),
            "-p".into(),
            format!("{}:22", ports.ssh),
            "-p".into(),
            format!("{}:8080", ports.vscode),
            "-p".into(),
            format!("{}:6080", ports.desktop),
            image.into(),
        ];

        tracing::info!(
            target = "challenge_relay::runtime",
            container = %name,
            image = %image,
            ssh = ports.ssh,
            "starting container"
        );

        let output = self.run_docker(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::Provision(format!(
                "docker run exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        validate_container_name(name)?;

        // Graceful stop with a bounded timeout, then force-remove. The rm is
        // what makes this idempotent: a missing container fails `stop` but
        // `rm -f` on a missing name is the converged end state.
        let stop = self
            .run_docker(&["stop".into(), "-t".into(), "10".into(), name.into()])
            .await?;
        if !stop.status.success() {
            tracing::debug!(
                target = "challenge_relay::runtime",
                container = %name,
                "docker stop failed, container may already be gone"
            );
        }

        let rm = self
            .run_docker(&["rm".into(), "-f".into(), name.into()])
            .await?;
        if !rm.status.success() && self.container_exists(name).await {
            let stderr = String::from_utf8_lossy(&rm.stderr);
            return Err(RelayError::Runtime(format!(
                "failed to remove container {name}: {}",
                stderr.trim()
            )));
        }

        tracing::info!(
            target = "challenge_relay::runtime",
            container = %name,
            "container stopped and removed"
        );
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> bool {
        if validate_container_name(name).is_err() {
            return false;
        }
        match self.run_docker(&["inspect".into(), name.into()]).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }
}

/// Container names are generated internally, but validate anyway so a bad id
/// can never reach the docker argv.
fn validate_container_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            name.len() <= 63
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RelayError::Runtime(format!(
            "invalid container name: {name:?}"
        )))
    }
}

fn validate_image_name(image: &str) -> Result<()> {
    let mut chars = image.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first.is_ascii_digit() => {
            image.len() <= 255
                && chars.all(|c| {
                    c.is_ascii_lowercase()
                        || c.is_ascii_digit()
                        || matches!(c, '.' | '_' | '/' | '-' | ':')
                })
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RelayError::Runtime(format!("invalid image name: {image:?}")))
    }
}
