//! Static MIG profile catalog.

use serde::{Deserialize, Serialize};

/// A MIG profile descriptor: compute/memory slice counts and memory size.
///
/// Profiles are vendor-defined; the orchestrator treats the name as an
/// opaque label plus this numeric descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigProfile {
    /// Profile name, e.g. `3g.20gb`.
    pub name: String,
    /// Memory size in gigabytes.
    pub memory_gb: u64,
    /// Number of compute slices.
    pub compute_slices: u32,
    /// Number of memory slices.
    pub memory_slices: u32,
}

impl MigProfile {
    fn new(name: &str, memory_gb: u64, compute_slices: u32, memory_slices: u32) -> Self {
        Self {
            name: name.to_string(),
            memory_gb,
            compute_slices,
            memory_slices,
        }
    }

    /// Memory size in bytes.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_gb * 1024 * 1024 * 1024
    }
}

/// An immutable MIG instance descriptor discovered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigSlice {
    /// Device UUID, e.g. `MIG-0042c8df-65bb-5d61-beb7-655f4b4318ea`.
    pub uuid: String,
    /// The partition's profile descriptor.
    pub profile: MigProfile,
}

/// The supported profile catalog, sorted by name.
pub fn catalog() -> Vec<MigProfile> {
    let mut profiles = vec![
        MigProfile::new("1g.5gb", 5, 1, 1),
        MigProfile::new("1g.10gb", 10, 1, 1),
        MigProfile::new("1g.20gb", 20, 1, 2),
        MigProfile::new("2g.10gb", 10, 2, 2),
        MigProfile::new("2g.20gb", 20, 2, 4),
        MigProfile::new("3g.20gb", 20, 3, 4),
        MigProfile::new("3g.40gb", 40, 3, 8),
        MigProfile::new("4g.20gb", 20, 4, 4),
        MigProfile::new("4g.40gb", 40, 4, 8),
        MigProfile::new("7g.40gb", 40, 7, 8),
        MigProfile::new("7g.80gb", 80, 7, 16),
    ];
    profiles.sort_by(|a, b| a.name.cmp(&b.name));
    profiles
}

/// Look up a profile descriptor in the catalog.
pub fn find_profile(name: &str) -> Option<MigProfile> {
    catalog().into_iter().find(|p| p.name == name)
}

/// Resolve a profile name to a descriptor, synthesizing one for names
/// absent from the catalog (`<N>g.<M>gb` is parsed for slice count and
/// memory; anything else yields a zeroed descriptor under that name).
pub fn profile_from_name(name: &str) -> MigProfile {
    if let Some(profile) = find_profile(name) {
        return profile;
    }

    let mut compute_slices = 0u32;
    let mut memory_gb = 0u64;
    if let Some((compute, memory)) = name.split_once("g.") {
        compute_slices = compute.parse().unwrap_or(0);
        memory_gb = memory.trim_end_matches("gb").parse().unwrap_or(0);
    }

    MigProfile {
        name: name.to_string(),
        memory_gb,
        compute_slices,
        memory_slices: 0,
    }
}
