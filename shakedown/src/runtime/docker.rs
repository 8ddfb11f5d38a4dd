//! [`ContainerRuntime`] backed by the `docker` command-line client.

use std::process::Stdio;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    ActiveResources, BuildRequest, ContainerId, ContainerLogs, ContainerRequest,
    ContainerRuntime, ImageId, NetworkId, SESSION_LABEL,
};
use crate::error::RuntimeError;
use crate::time::unix_seconds;

/// Runtime that shells out to `docker`.
#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    binary: String,
    host: String,
    session: String,
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCliRuntime {
    /// Runtime using `docker` from `PATH`, ports reachable on `localhost`.
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            host: "localhost".to_string(),
            session: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Use a different client binary (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Host name under which published ports are reachable.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Whether the daemon answers `docker info`.
    pub async fn is_available(&self) -> bool {
        self.run(&["info"]).await.is_ok()
    }

    fn session_label(&self) -> String {
        format!("{SESSION_LABEL}={}", self.session)
    }

    async fn output(&self, args: &[&str]) -> Result<std::process::Output, RuntimeError> {
        tracing::trace!(binary = %self.binary, ?args, "running container command");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            return Ok(output);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let command = format!("{} {}", self.binary, args.join(" "));
        Err(classify_failure(args, command, stderr))
    }

    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = self.output(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn list_ids(&self, args: &[&str]) -> Result<Vec<String>, RuntimeError> {
        let text = self.run(args).await?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Remove a container `run` created but could not start.
    ///
    /// Only containers carrying this session's label are touched, so a name
    /// conflict with a foreign container leaves that container alone.
    async fn remove_unstarted(&self, name: &str) {
        let label = format!("label={}", self.session_label());
        let exact = format!("name=^/{name}$");
        let leftovers = match self
            .list_ids(&["ps", "-aq", "--filter", &label, "--filter", &exact])
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(%name, error = %err, "could not look for unstarted container");
                return;
            }
        };
        for id in leftovers {
            match self.run(&["rm", "-f", "-v", &id]).await {
                Ok(_) => tracing::debug!(%name, %id, "removed unstarted container"),
                Err(err) => tracing::warn!(%name, %id, error = %err, "unstarted container left behind"),
            }
        }
    }
}

fn classify_failure(args: &[&str], command: String, stderr: String) -> RuntimeError {
    let lower = stderr.to_ascii_lowercase();
    let missing = lower.contains("no such") || lower.contains("not found");
    let kind = match args.first().copied() {
        Some("network") => "network",
        Some("image") => "image",
        Some("rm" | "port" | "logs") => "container",
        _ => "",
    };
    if missing && !kind.is_empty() {
        let id = args
            .iter()
            .rev()
            .find(|a| !a.starts_with('-') && !a.contains('/'))
            .copied()
            .unwrap_or_default();
        return RuntimeError::NotFound {
            kind,
            id: id.to_string(),
        };
    }
    RuntimeError::CommandFailed { command, stderr }
}

/// Parse `docker port` output such as `0.0.0.0:49153\n[::]:49153`.
fn parse_port_binding(raw: &str) -> Result<u16, RuntimeError> {
    raw.lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find_map(|port| port.parse::<u16>().ok())
        .ok_or_else(|| RuntimeError::Unparseable {
            what: "port binding",
            raw: raw.to_string(),
        })
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    fn session(&self) -> &str {
        &self.session
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn create_network(&self, name: &str) -> Result<NetworkId, RuntimeError> {
        let label = self.session_label();
        let id = self
            .run(&["network", "create", "--label", &label, name])
            .await?;
        tracing::debug!(network = name, %id, "network created");
        Ok(NetworkId(id))
    }

    async fn remove_network(&self, id: &NetworkId) -> Result<(), RuntimeError> {
        self.run(&["network", "rm", id.as_str()]).await?;
        Ok(())
    }

    async fn build_image(&self, request: &BuildRequest) -> Result<ImageId, RuntimeError> {
        let label = self.session_label();
        let dockerfile = request.context.join(&request.dockerfile);
        let dockerfile = dockerfile.to_string_lossy();
        let context = request.context.to_string_lossy();

        tracing::info!(tag = %request.tag, %dockerfile, "building image");
        self.run(&[
            "build",
            "--label",
            &label,
            "-t",
            &request.tag,
            "-f",
            &dockerfile,
            &context,
        ])
        .await?;
        Ok(ImageId(request.tag.clone()))
    }

    async fn remove_image(&self, id: &ImageId) -> Result<(), RuntimeError> {
        self.run(&["image", "rm", "-f", id.as_str()]).await?;
        Ok(())
    }

    async fn start_container(
        &self,
        request: &ContainerRequest,
    ) -> Result<ContainerId, RuntimeError> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            request.name.clone(),
            "--label".into(),
            self.session_label(),
        ];
        if let Some(network) = &request.network {
            args.extend(["--network".into(), network.0.clone()]);
        }
        if let Some(hostname) = &request.hostname {
            args.extend([
                "--hostname".into(),
                hostname.clone(),
                "--network-alias".into(),
                hostname.clone(),
            ]);
        }
        for (key, value) in &request.env {
            args.extend(["-e".into(), format!("{key}={value}")]);
        }
        for port in &request.exposed_ports {
            args.extend(["-p".into(), port.to_string()]);
        }
        args.push(request.image.clone());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        // `run -d` creates the container before starting it.
        let id = match self.run(&args).await {
            Ok(id) => id,
            Err(err) => {
                self.remove_unstarted(&request.name).await;
                return Err(err);
            }
        };
        tracing::debug!(name = %request.name, image = %request.image, %id, "container started");
        Ok(ContainerId(id))
    }

    async fn mapped_port(
        &self,
        id: &ContainerId,
        container_port: u16,
    ) -> Result<u16, RuntimeError> {
        let port = format!("{container_port}/tcp");
        let raw = self.run(&["port", id.as_str(), &port]).await?;
        parse_port_binding(&raw)
    }

    async fn logs(
        &self,
        id: &ContainerId,
        since: Option<SystemTime>,
    ) -> Result<ContainerLogs, RuntimeError> {
        let output = match since {
            Some(at) => {
                let since = unix_seconds(at);
                self.output(&["logs", "--since", &since, id.as_str()]).await?
            }
            None => self.output(&["logs", id.as_str()]).await?,
        };
        Ok(ContainerLogs {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.run(&["rm", "-f", "-v", id.as_str()]).await?;
        Ok(())
    }

    async fn list_active(&self) -> Result<ActiveResources, RuntimeError> {
        let filter = format!("label={}", self.session_label());
        let containers = self.list_ids(&["ps", "-aq", "--filter", &filter]).await?;
        let networks = self
            .list_ids(&["network", "ls", "-q", "--filter", &filter])
            .await?;
        let images = self
            .list_ids(&["images", "-q", "--filter", &filter])
            .await?;

        Ok(ActiveResources {
            networks: networks.into_iter().map(NetworkId).collect(),
            images: images.into_iter().map(ImageId).collect(),
            containers: containers.into_iter().map(ContainerId).collect(),
        })
    }
}
