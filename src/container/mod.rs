//! Container runtime management module.
//!
//! Provides an async interface to the container engine via the Docker or
//! Podman CLI. The engine only sees the [`ContainerRuntimeApi`] trait; the
//! CLI implementation assembles validated argument lists and parses the
//! tools' JSON output.

mod config;
mod error;

pub use config::{
    ContainerDetails, ContainerSummary, IMAGE_TAG_PREFIX, ImageBuildSpec, SESSION_DOCKERFILE,
    SESSION_LABEL, SessionContainerSpec, validate_container_id_or_name, validate_container_name,
    validate_image_name,
};
pub use error::{ContainerError, ContainerResult};

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeType {
    /// Docker runtime.
    #[default]
    Docker,
    /// Podman runtime.
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Container runtime abstraction the session engine depends on.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create the private bridge network if absent. Idempotent.
    async fn ensure_network(&self, name: &str, subnet: &str) -> ContainerResult<()>;

    /// Build a per-session image with the public key injected as a build
    /// argument; returns the image tag.
    async fn build_session_image(&self, build: &ImageBuildSpec) -> ContainerResult<String>;

    /// Create (but do not start) a session container; returns its id.
    async fn create_container(&self, spec: &SessionContainerSpec) -> ContainerResult<String>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> ContainerResult<()>;

    /// Stop a container with a graceful timeout, escalating to SIGKILL.
    async fn stop_container(&self, id: &str, timeout_seconds: u32) -> ContainerResult<()>;

    /// Remove a container.
    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> ContainerResult<()>;

    /// Inspect a container. Returns `None` when it does not exist.
    async fn inspect_container(&self, id: &str) -> ContainerResult<Option<ContainerDetails>>;

    /// List all containers (running or not) carrying the session label.
    async fn list_session_containers(&self) -> ContainerResult<Vec<ContainerSummary>>;

    /// Addresses currently assigned on the given network.
    async fn network_container_ips(&self, network: &str) -> ContainerResult<Vec<String>>;
}

/// CLI-driven container runtime client.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection: Docker first,
    /// Podman as the fallback.
    pub fn new() -> Self {
        if Self::is_binary_available("docker") {
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        } else if Self::is_binary_available("podman") {
            Self {
                runtime_type: RuntimeType::Podman,
                binary: "podman".to_string(),
            }
        } else {
            // Fall back to docker, will fail at runtime.
            Self {
                runtime_type: RuntimeType::Docker,
                binary: "docker".to_string(),
            }
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Check that the runtime is reachable; returns its version output.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = self.run(&["version", "--format", "json"]).await?;
        Ok(output)
    }

    /// Run the engine binary with the given args, returning stdout on
    /// success and a CommandFailed error carrying stderr otherwise.
    async fn run(&self, args: &[&str]) -> ContainerResult<String> {
        let command = args.first().copied().unwrap_or_default().to_string();
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command,
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn ensure_network(&self, name: &str, subnet: &str) -> ContainerResult<()> {
        validate_container_name(name)?;

        if self.run(&["network", "inspect", name]).await.is_ok() {
            debug!(network = name, "bridge network already exists");
            return Ok(());
        }

        self.run(&[
            "network",
            "create",
            "--driver",
            "bridge",
            "--subnet",
            subnet,
            "-o",
            &format!("com.docker.network.bridge.name={name}"),
            name,
        ])
        .await?;

        info!(network = name, subnet, "created bridge network");
        Ok(())
    }

    async fn build_session_image(&self, build: &ImageBuildSpec) -> ContainerResult<String> {
        build.validate()?;

        let tag = build.image_tag();
        let context = build.context_dir.display().to_string();
        let dockerfile = build
            .context_dir
            .join(SESSION_DOCKERFILE)
            .display()
            .to_string();

        let username_arg = format!("USERNAME={}", build.user_id);
        let pubkey_arg = format!("PUBKEY={}", build.public_key);

        info!(image = %tag, "building session image");
        self.run(&[
            "build",
            "-f",
            &dockerfile,
            "-t",
            &tag,
            "--build-arg",
            &username_arg,
            "--build-arg",
            "UID=1001",
            "--build-arg",
            "GID=1001",
            "--build-arg",
            &pubkey_arg,
            &context,
        ])
        .await?;

        Ok(tag)
    }

    async fn create_container(&self, spec: &SessionContainerSpec) -> ContainerResult<String> {
        spec.validate()?;

        let mut args: Vec<String> = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--network".to_string(),
            spec.network.clone(),
            "--ip".to_string(),
            spec.ip.clone(),
            "-p".to_string(),
            format!("0.0.0.0:{}:22/tcp", spec.host_ssh_port),
            "-w".to_string(),
            "/workspace".to_string(),
            "--label".to_string(),
            format!("{}={}", SESSION_LABEL, spec.label),
        ];

        // Workspace bind mount, SELinux-labeled on podman.
        args.push("-v".to_string());
        if self.runtime_type.needs_selinux_labels() {
            args.push(format!("{}:/workspace:Z", spec.workspace_dir));
        } else {
            args.push(format!("{}:/workspace", spec.workspace_dir));
        }

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        // GPU device passthrough and hardening.
        args.push("--gpus".to_string());
        args.push(format!("device={}", spec.gpu_uuid));
        args.push("--security-opt".to_string());
        args.push("no-new-privileges:true".to_string());
        args.push("--cap-drop".to_string());
        args.push("ALL".to_string());
        for cap in ["SETUID", "SETGID", "DAC_OVERRIDE", "CHOWN"] {
            args.push("--cap-add".to_string());
            args.push(cap.to_string());
        }
        args.push("--pids-limit".to_string());
        args.push("100".to_string());
        args.push("--restart".to_string());
        args.push("no".to_string());

        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run(&arg_refs).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(ContainerError::ParseError(
                "create returned no container id".to_string(),
            ));
        }

        info!(container_id = %short_id(&id), name = %spec.name, "created container");
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(id)?;
        self.run(&["start", id]).await?;
        info!(container_id = %short_id(id), "started container");
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_seconds: u32) -> ContainerResult<()> {
        validate_container_id_or_name(id)?;

        let timeout = timeout_seconds.to_string();
        match self.run(&["stop", "-t", &timeout, id]).await {
            Ok(_) => {
                info!(container_id = %short_id(id), "stopped container");
                Ok(())
            }
            Err(stop_err) => {
                warn!(container_id = %short_id(id), error = %stop_err, "graceful stop failed, killing");
                self.run(&["kill", id]).await?;
                Ok(())
            }
        }
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(id)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        if remove_volumes {
            args.push("-v");
        }
        args.push(id);

        self.run(&args).await?;
        info!(container_id = %short_id(id), "removed container");
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> ContainerResult<Option<ContainerDetails>> {
        validate_container_id_or_name(id)?;

        // A missing container is not an error; callers treat it as gone.
        let stdout = match self.run(&["inspect", "--format", "json", id]).await {
            Ok(stdout) => stdout,
            Err(_) => return Ok(None),
        };

        let entries: Vec<InspectEntry> = serde_json::from_str(stdout.trim())
            .map_err(|e| ContainerError::ParseError(e.to_string()))?;

        Ok(entries.into_iter().next().map(ContainerDetails::from))
    }

    async fn list_session_containers(&self) -> ContainerResult<Vec<ContainerSummary>> {
        let filter = format!("label={SESSION_LABEL}");
        let stdout = self
            .run(&["ps", "-a", "--filter", &filter, "--format", "json"])
            .await?;
        parse_container_listing(&stdout)
    }

    async fn network_container_ips(&self, network: &str) -> ContainerResult<Vec<String>> {
        validate_container_name(network)?;

        // A missing network means no addresses are held.
        let stdout = match self
            .run(&["network", "inspect", "--format", "json", network])
            .await
        {
            Ok(stdout) => stdout,
            Err(_) => return Ok(Vec::new()),
        };

        parse_network_ips(&stdout)
    }
}

/// Shorten a container id for log output.
fn short_id(id: &str) -> &str {
    if id.len() > 12 { &id[..12] } else { id }
}

/// Parse `ps --format json` output: podman emits one JSON array, docker
/// emits one JSON object per line.
fn parse_container_listing(stdout: &str) -> ContainerResult<Vec<ContainerSummary>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| ContainerError::ParseError(e.to_string()));
    }

    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| ContainerError::ParseError(e.to_string()))
        })
        .collect()
}

/// Parse `network inspect --format json` output into the list of assigned
/// IPv4 addresses (CIDR suffixes stripped).
fn parse_network_ips(stdout: &str) -> ContainerResult<Vec<String>> {
    let entries: Vec<NetworkInspectEntry> = serde_json::from_str(stdout.trim())
        .map_err(|e| ContainerError::ParseError(e.to_string()))?;

    let mut ips = Vec::new();
    for entry in entries {
        for attached in entry.containers.into_values() {
            let ip = attached
                .ipv4_address
                .split('/')
                .next()
                .unwrap_or_default()
                .to_string();
            if !ip.is_empty() {
                ips.push(ip);
            }
        }
    }
    Ok(ips)
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Created", default)]
    created: String,
    #[serde(rename = "State", default)]
    state: InspectState,
    #[serde(rename = "Config", default)]
    config: InspectConfig,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: InspectNetworkSettings,
    #[serde(rename = "HostConfig", default)]
    host_config: InspectHostConfig,
}

#[derive(Debug, Default, Deserialize)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Image", default)]
    image: String,
}

#[derive(Debug, Default, Deserialize)]
struct InspectNetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: HashMap<String, InspectNetwork>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct InspectHostConfig {
    #[serde(rename = "PortBindings", default)]
    port_bindings: HashMap<String, Vec<PortBindingEntry>>,
}

#[derive(Debug, Default, Deserialize)]
struct PortBindingEntry {
    #[serde(rename = "HostPort", default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct NetworkInspectEntry {
    #[serde(rename = "Containers", default)]
    containers: HashMap<String, NetworkAttachedContainer>,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkAttachedContainer {
    #[serde(rename = "IPv4Address", default)]
    ipv4_address: String,
}

impl From<InspectEntry> for ContainerDetails {
    fn from(entry: InspectEntry) -> Self {
        let networks = entry
            .network_settings
            .networks
            .into_iter()
            .map(|(name, net)| (name, net.ip_address))
            .collect();

        let host_ssh_port = entry
            .host_config
            .port_bindings
            .get("22/tcp")
            .and_then(|bindings| bindings.first())
            .and_then(|binding| binding.host_port.parse().ok());

        ContainerDetails {
            id: entry.id,
            status: entry.state.status,
            image: entry.config.image,
            created: entry.created,
            networks,
            host_ssh_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_type_selinux() {
        assert!(!RuntimeType::Docker.needs_selinux_labels());
        assert!(RuntimeType::Podman.needs_selinux_labels());
    }

    #[test]
    fn parses_docker_jsonl_listing() {
        let stdout = concat!(
            r#"{"ID":"abc123","Names":"u1-container","Image":"gpu-workspace-u1","State":"running"}"#,
            "\n",
            r#"{"ID":"def456","Names":"u2-container","Image":"gpu-workspace-u2","State":"exited"}"#,
            "\n",
        );
        let containers = parse_container_listing(stdout).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].id, "abc123");
        assert_eq!(containers[1].state, "exited");
    }

    #[test]
    fn parses_podman_array_listing() {
        let stdout = r#"[{"Id":"abc123","Names":["u1-container"],"Image":"gpu-workspace-u1","State":"running"}]"#;
        let containers = parse_container_listing(stdout).unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].names, vec!["u1-container"]);
    }

    #[test]
    fn empty_listing_is_empty() {
        assert!(parse_container_listing("").unwrap().is_empty());
        assert!(parse_container_listing("\n").unwrap().is_empty());
    }

    #[test]
    fn parses_network_ips() {
        let stdout = r#"[{"Name":"sandman_worknet","Containers":{
            "aaa":{"Name":"u1-container","IPv4Address":"10.100.0.100/16"},
            "bbb":{"Name":"u2-container","IPv4Address":"10.100.0.101/16"}
        }}]"#;
        let mut ips = parse_network_ips(stdout).unwrap();
        ips.sort();
        assert_eq!(ips, vec!["10.100.0.100", "10.100.0.101"]);
    }

    #[test]
    fn inspect_entry_to_details() {
        let raw = r#"[{
            "Id": "abc123def456",
            "Created": "2025-01-01T00:00:00Z",
            "State": {"Status": "running"},
            "Config": {"Image": "gpu-workspace-u1"},
            "NetworkSettings": {"Networks": {"sandman_worknet": {"IPAddress": "10.100.0.100"}}},
            "HostConfig": {"PortBindings": {"22/tcp": [{"HostIp": "0.0.0.0", "HostPort": "10000"}]}}
        }]"#;
        let entries: Vec<InspectEntry> = serde_json::from_str(raw).unwrap();
        let details = ContainerDetails::from(entries.into_iter().next().unwrap());
        assert_eq!(details.status, "running");
        assert_eq!(details.ip_on("sandman_worknet"), Some("10.100.0.100"));
        assert_eq!(details.ip_on("other"), None);
        assert_eq!(details.host_ssh_port, Some(10000));
    }

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("abcdef123456789"), "abcdef123456");
        assert_eq!(short_id("abc"), "abc");
    }
}
