//! Container specs and input validation.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::error::{ContainerError, ContainerResult};

/// Label applied to every session container; reconciliation and orphan
/// cleanup key off it.
pub const SESSION_LABEL: &str = "sandman.session";

/// Image tag prefix for per-session builds.
pub const IMAGE_TAG_PREFIX: &str = "gpu-workspace";

/// Dockerfile name inside the bundled build context.
pub const SESSION_DOCKERFILE: &str = "Dockerfile.gpu-workspace";

/// Build spec for a per-session image.
///
/// The user's public key is injected as a build argument so the image's
/// authorized_keys file is complete before the container ever starts; no
/// runtime key delivery is needed.
#[derive(Debug, Clone)]
pub struct ImageBuildSpec {
    /// Session owner; becomes the in-container username and the tag suffix.
    pub user_id: String,
    /// OpenSSH authorized-keys line baked into the image.
    pub public_key: String,
    /// Directory holding the Dockerfile and its companion files.
    pub context_dir: PathBuf,
}

impl ImageBuildSpec {
    /// The tag the built image carries: `gpu-workspace-<user_id>`.
    pub fn image_tag(&self) -> String {
        format!("{}-{}", IMAGE_TAG_PREFIX, self.user_id)
    }

    pub fn validate(&self) -> ContainerResult<()> {
        validate_container_name(&self.user_id)?;
        if self.public_key.trim().is_empty() {
            return Err(ContainerError::InvalidInput(
                "public key cannot be empty".to_string(),
            ));
        }
        if self.public_key.contains('\n') {
            return Err(ContainerError::InvalidInput(
                "public key must be a single authorized-keys line".to_string(),
            ));
        }
        Ok(())
    }
}

/// Spec for a session container.
#[derive(Debug, Clone)]
pub struct SessionContainerSpec {
    /// Container name, `<user_id>-container`.
    pub name: String,
    /// Image reference (the per-session build).
    pub image: String,
    /// Private bridge network to attach to.
    pub network: String,
    /// Static IPv4 address on that network.
    pub ip: String,
    /// Host port bound to the container's SSH listener (22/tcp).
    pub host_ssh_port: u16,
    /// Host workspace directory bind-mounted at /workspace.
    pub workspace_dir: String,
    /// MIG instance UUID passed through as a device request.
    pub gpu_uuid: String,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Value of the session label (the owning user id).
    pub label: String,
}

impl SessionContainerSpec {
    /// Validate all fields before any of them reach a command line.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_container_name(&self.name)?;
        validate_image_name(&self.image)?;
        validate_container_name(&self.label)?;
        validate_network_name(&self.network)?;
        validate_ipv4(&self.ip)?;
        validate_host_path(&self.workspace_dir)?;
        validate_device_uuid(&self.gpu_uuid)?;
        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }
        if self.host_ssh_port == 0 {
            return Err(ContainerError::InvalidInput(
                "host SSH port cannot be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runtime details for one container, from `inspect`.
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub status: String,
    pub image: String,
    pub created: String,
    /// Network name -> assigned IPv4 address.
    pub networks: HashMap<String, String>,
    /// Host port bound to 22/tcp, when present.
    pub host_ssh_port: Option<u16>,
}

impl ContainerDetails {
    /// The container's address on the given network, if attached.
    pub fn ip_on(&self, network: &str) -> Option<&str> {
        self.networks
            .get(network)
            .map(String::as_str)
            .filter(|ip| !ip.is_empty())
    }
}

/// One entry from the container listing (`ps`).
///
/// Field shapes differ between engines: docker emits `ID` and a
/// comma-separated `Names` string, podman emits `Id` and a JSON array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    #[serde(alias = "Id", alias = "ID")]
    pub id: String,

    #[serde(default, alias = "Names", deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    #[serde(default, alias = "Image")]
    pub image: String,

    #[serde(default, alias = "State")]
    pub state: String,
}

impl ContainerSummary {
    /// Whether this listing entry refers to the stored container id. The
    /// listing may carry a truncated id, so match on prefixes both ways.
    pub fn matches_id(&self, container_id: &str) -> bool {
        if self.id.is_empty() || container_id.is_empty() {
            return false;
        }
        self.id.starts_with(container_id) || container_id.starts_with(&self.id)
    }
}

/// Deserialize a names field that is either a single (possibly
/// comma-separated) string or an array of strings.
fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, SeqAccess, Visitor};
    use std::fmt;

    struct NamesVisitor;

    impl<'de> Visitor<'de> for NamesVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(',')
                .map(|s| s.trim().trim_start_matches('/').to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut names = Vec::new();
            while let Some(name) = seq.next_element::<String>()? {
                names.push(name.trim_start_matches('/').to_string());
            }
            Ok(names)
        }
    }

    deserializer.deserialize_any(NamesVisitor)
}

// ============================================================================
// Input validation
// ============================================================================
//
// Every value the runtime receives ends up as one element of an argv the
// engine binary executes, so shell quoting is never in play. What can go
// wrong is narrower and specific to each flag: a value that parses as an
// option (leading '-'), a separator that splits a flag's own syntax (':'
// and ',' in mount specs), or a value outside the shape the orchestrator
// itself generates. Everything is checked against a whitelist; the
// orchestrator builds these values from validated user ids and discovery
// output, so a rejection means a bug upstream, caught before any command
// runs.

/// Reject any character outside ASCII alphanumerics plus the given extras.
fn check_charset(value: &str, what: &str, extra: &[char]) -> ContainerResult<()> {
    match value
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !extra.contains(c))
    {
        Some(c) => Err(ContainerError::InvalidInput(format!(
            "{what} {value:?} may not contain {c:?}"
        ))),
        None => Ok(()),
    }
}

/// Validate an image reference.
///
/// The engine only runs images it tagged itself (`gpu-workspace-<user>`),
/// so this accepts a plain registry reference and nothing resembling a
/// path escape or an option.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() || image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image reference is empty or too long".to_string(),
        ));
    }
    if image.starts_with('-') || image.contains("..") {
        return Err(ContainerError::InvalidInput(format!(
            "image reference {image:?} is not acceptable"
        )));
    }
    check_charset(image, "image reference", &['.', '-', '_', '/', ':', '@'])
}

/// Validate a container reference: either an engine-issued hex id or a
/// `<user>-container` name.
pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() || id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container reference is empty or too long".to_string(),
        ));
    }
    check_charset(id, "container reference", &['-', '_'])
}

/// Validate a container name the orchestrator is about to assign.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    validate_container_id_or_name(name)?;
    if name.starts_with('-') {
        return Err(ContainerError::InvalidInput(format!(
            "container name {name:?} may not begin with '-'"
        )));
    }
    Ok(())
}

/// Validate a bridge network name.
pub fn validate_network_name(name: &str) -> ContainerResult<()> {
    validate_container_name(name)
}

/// Validate a dotted-quad IPv4 address.
pub fn validate_ipv4(ip: &str) -> ContainerResult<()> {
    if ip.parse::<std::net::Ipv4Addr>().is_err() {
        return Err(ContainerError::InvalidInput(format!(
            "{ip:?} is not a valid IPv4 address"
        )));
    }
    Ok(())
}

/// Validate a device identifier destined for the GPU flag. Discovery only
/// ever yields `MIG-` or `GPU-` prefixed UUIDs.
pub fn validate_device_uuid(uuid: &str) -> ContainerResult<()> {
    if !(uuid.starts_with("MIG-") || uuid.starts_with("GPU-")) {
        return Err(ContainerError::InvalidInput(format!(
            "device UUID {uuid:?} is not an NVIDIA device identifier"
        )));
    }
    check_charset(uuid, "device UUID", &['-'])
}

/// Validate an environment variable name. The engine sets a fixed
/// handful (`USER_ID`, `NVIDIA_VISIBLE_DEVICES`, `SSH_PASSWORD`), so
/// anything outside UPPER_SNAKE_CASE is a programming error caught early.
pub fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let mut chars = key.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_uppercase() || c == '_');
    if !head_ok || !chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable name {key:?} is not UPPER_SNAKE_CASE"
        )));
    }
    Ok(())
}

/// Validate the workspace directory handed to the bind-mount flag.
///
/// The path is the configured workspace root joined with a validated user
/// id. It must be absolute (a relative host path reads as a volume name),
/// and ':' or ',' would split the mount spec itself.
pub fn validate_host_path(path: &str) -> ContainerResult<()> {
    if path.is_empty() || path.len() > 1024 {
        return Err(ContainerError::InvalidInput(
            "host path is empty or too long".to_string(),
        ));
    }
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(format!(
            "host path {path:?} must be absolute"
        )));
    }
    check_charset(path, "host path", &['/', '.', '-', '_'])
}
