//! MIG instance discovery via the device listing tool.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use super::profiles::{MigSlice, profile_from_name};

/// Errors from GPU inventory discovery.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to run {command}: {message}")]
    CommandFailed { command: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Port over GPU partition discovery.
#[async_trait]
pub trait GpuInventory: Send + Sync {
    /// Enumerate the MIG instances visible on this host.
    async fn list_slices(&self) -> Result<Vec<MigSlice>, InventoryError>;
}

/// Discovers MIG instances by parsing `nvidia-smi -L` output.
#[derive(Debug, Clone)]
pub struct NvidiaSmiInventory {
    binary: String,
    device_node: String,
}

impl Default for NvidiaSmiInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl NvidiaSmiInventory {
    pub fn new() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
            device_node: "/dev/nvidia0".to_string(),
        }
    }
}

#[async_trait]
impl GpuInventory for NvidiaSmiInventory {
    async fn list_slices(&self) -> Result<Vec<MigSlice>, InventoryError> {
        // Hosts without an NVIDIA device serve in degraded mode with an
        // empty pool rather than failing startup.
        if !Path::new(&self.device_node).exists() {
            warn!(
                device = %self.device_node,
                "no NVIDIA device detected, continuing without GPU slices"
            );
            return Ok(Vec::new());
        }

        let output = Command::new(&self.binary)
            .arg("-L")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| InventoryError::CommandFailed {
                command: format!("{} -L", self.binary),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InventoryError::CommandFailed {
                command: format!("{} -L", self.binary),
                message: stderr.trim().to_string(),
            });
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let slices = parse_mig_listing(&listing);
        debug!(count = slices.len(), "parsed MIG listing");
        Ok(slices)
    }
}

/// Parse `nvidia-smi -L` output into MIG slice descriptors.
///
/// MIG lines look like:
/// `  MIG 3g.20gb     Device  1: (UUID: MIG-0042c8df-65bb-5d61-beb7-655f4b4318ea)`
///
/// Whole-GPU lines (`GPU 0: NVIDIA H100 ... (UUID: GPU-...)`) are skipped.
pub fn parse_mig_listing(output: &str) -> Vec<MigSlice> {
    let mut slices = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if !line.contains("UUID:") {
            continue;
        }

        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("MIG") {
            continue;
        }
        let profile_name = match tokens.next() {
            Some(name) => name,
            None => continue,
        };

        let uuid = match line.split("UUID:").nth(1) {
            Some(rest) => rest.trim().trim_matches(|c| c == '(' || c == ')').to_string(),
            None => continue,
        };
        if uuid.is_empty() {
            continue;
        }

        slices.push(MigSlice {
            uuid,
            profile: profile_from_name(profile_name),
        });
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
GPU 0: NVIDIA H100 80GB HBM3 (UUID: GPU-372cf708-4ec1-0f35-bfef-a24bae2df638)
  MIG 3g.20gb     Device  0: (UUID: MIG-0042c8df-65bb-5d61-beb7-655f4b4318ea)
  MIG 3g.20gb     Device  1: (UUID: MIG-11a2b3c4-d5e6-5f61-beb7-655f4b4318eb)
  MIG 1g.5gb      Device  2: (UUID: MIG-22b3c4d5-e6f7-5a61-beb7-655f4b4318ec)
";

    #[test]
    fn parses_mig_lines_and_skips_gpu_lines() {
        let slices = parse_mig_listing(SAMPLE);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].uuid, "MIG-0042c8df-65bb-5d61-beb7-655f4b4318ea");
        assert_eq!(slices[0].profile.name, "3g.20gb");
        assert_eq!(slices[2].profile.name, "1g.5gb");
        assert_eq!(slices[2].profile.compute_slices, 1);
    }

    #[test]
    fn unknown_profile_is_synthesized() {
        let listing = "  MIG 2g.24gb Device 0: (UUID: MIG-aaaa)";
        let slices = parse_mig_listing(listing);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].profile.name, "2g.24gb");
        assert_eq!(slices[0].profile.compute_slices, 2);
    }

    #[test]
    fn empty_and_garbage_input() {
        assert!(parse_mig_listing("").is_empty());
        assert!(parse_mig_listing("no gpus here\n").is_empty());
        // A GPU line alone yields nothing.
        assert!(parse_mig_listing("GPU 0: A100 (UUID: GPU-x)").is_empty());
    }
}
