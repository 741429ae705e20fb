//! Bridge-network IP allocation.
//!
//! The container runtime is the source of truth for held addresses: every
//! allocation lists the live containers attached to the private bridge and
//! picks the lowest unused address in the configured host sub-range. A
//! small in-flight set covers the window between picking an address and
//! the container existing; entries are dropped once the container owns the
//! address or the create rolled back. Post-destruction release is a no-op,
//! the runtime reclaims the address with the container.

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::container::ContainerRuntimeApi;

/// Errors from IP allocation.
#[derive(Debug, Error)]
pub enum IpPoolError {
    #[error("no free addresses in {prefix}{start}-{prefix}{end}")]
    Exhausted { prefix: String, start: u8, end: u8 },

    #[error("querying container runtime for addresses: {0}")]
    Runtime(String),

    #[error("invalid subnet '{0}'")]
    InvalidSubnet(String),
}

/// IP pool configuration: network name plus the host sub-range.
#[derive(Debug, Clone)]
pub struct IpPoolConfig {
    /// Bridge network whose address map is consulted.
    pub network: String,
    /// Dotted prefix of allocatable addresses, e.g. `10.100.0.`.
    pub prefix: String,
    /// First host octet handed out.
    pub host_start: u8,
    /// Last host octet handed out.
    pub host_end: u8,
}

impl IpPoolConfig {
    /// Build the default user range (`.100..=.254`) from a CIDR subnet
    /// string such as `10.100.0.0/16`.
    pub fn from_subnet(network: &str, subnet: &str) -> Result<Self, IpPoolError> {
        let prefix = subnet_host_prefix(subnet)?;
        Ok(Self {
            network: network.to_string(),
            prefix,
            host_start: 100,
            host_end: 254,
        })
    }
}

/// Derive the dotted three-octet prefix from a CIDR subnet.
fn subnet_host_prefix(subnet: &str) -> Result<String, IpPoolError> {
    let address = subnet
        .split('/')
        .next()
        .ok_or_else(|| IpPoolError::InvalidSubnet(subnet.to_string()))?;

    let octets: Vec<&str> = address.split('.').collect();
    if octets.len() != 4 || octets.iter().any(|o| o.parse::<u8>().is_err()) {
        return Err(IpPoolError::InvalidSubnet(subnet.to_string()));
    }

    Ok(format!("{}.{}.{}.", octets[0], octets[1], octets[2]))
}

/// Serialized allocator over the bridge network's host range.
pub struct IpPool {
    runtime: Arc<dyn ContainerRuntimeApi>,
    config: IpPoolConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl IpPool {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, config: IpPoolConfig) -> Self {
        Self {
            runtime,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve the lowest unused address in the range. The returned address
    /// stays in the in-flight set until [`IpPool::forget`] is called.
    pub async fn allocate(&self) -> Result<String, IpPoolError> {
        // Holding the lock across the runtime query serializes concurrent
        // allocations.
        let mut in_flight = self.in_flight.lock().await;

        let used: HashSet<String> = self
            .runtime
            .network_container_ips(&self.config.network)
            .await
            .map_err(|e| IpPoolError::Runtime(e.to_string()))?
            .into_iter()
            .collect();

        for host in self.config.host_start..=self.config.host_end {
            let ip = format!("{}{}", self.config.prefix, host);
            if !used.contains(&ip) && !in_flight.contains(&ip) {
                in_flight.insert(ip.clone());
                debug!(%ip, "allocated container address");
                return Ok(ip);
            }
        }

        Err(IpPoolError::Exhausted {
            prefix: self.config.prefix.clone(),
            start: self.config.host_start,
            end: self.config.host_end,
        })
    }

    /// Drop an address from the in-flight set, either because the container
    /// now owns it or because the create rolled back. Idempotent.
    pub async fn forget(&self, ip: &str) {
        self.in_flight.lock().await.remove(ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_prefix_parses() {
        assert_eq!(subnet_host_prefix("10.100.0.0/16").unwrap(), "10.100.0.");
        assert_eq!(subnet_host_prefix("192.168.5.0/24").unwrap(), "192.168.5.");
        assert!(subnet_host_prefix("10.100.0/16").is_err());
        assert!(subnet_host_prefix("not-a-subnet").is_err());
        assert!(subnet_host_prefix("10.100.0.300/16").is_err());
    }

    #[test]
    fn config_from_subnet_uses_user_range() {
        let config = IpPoolConfig::from_subnet("sandman_worknet", "10.100.0.0/16").unwrap();
        assert_eq!(config.prefix, "10.100.0.");
        assert_eq!(config.host_start, 100);
        assert_eq!(config.host_end, 254);
    }
}
