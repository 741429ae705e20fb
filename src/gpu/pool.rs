//! MIG slice allocator.
//!
//! Every slice is discovered once at startup and lives for the process
//! lifetime; only its free/held state changes. All operations take the pool
//! mutex; critical sections are a map lookup plus a state flip.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use super::inventory::{GpuInventory, InventoryError};
use super::profiles::{MigProfile, MigSlice};

/// Errors from slice allocation.
#[derive(Debug, Error)]
pub enum GpuPoolError {
    #[error("no free MIG instance with profile {profile} available")]
    Exhausted { profile: String },

    #[error("unknown MIG instance {uuid}")]
    Unknown { uuid: String },

    #[error("MIG instance {uuid} is already in use by {holder}")]
    Busy { uuid: String, holder: String },
}

/// Allocation state of a single slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceState {
    Free,
    Held { user_id: String },
}

#[derive(Debug)]
struct SliceEntry {
    slice: MigSlice,
    state: SliceState,
}

/// Snapshot of a slice for the inventory read endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct GpuSliceInfo {
    pub uuid: String,
    pub profile: MigProfile,
    pub in_use: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_by: Option<String>,
}

/// Process-wide pool of MIG slices.
#[derive(Debug)]
pub struct GpuPool {
    // BTreeMap keeps scans deterministic: first free match by uuid order.
    slices: Mutex<BTreeMap<String, SliceEntry>>,
}

impl GpuPool {
    /// Build a pool from discovered slices, all initially free.
    pub fn new(slices: Vec<MigSlice>) -> Self {
        let map = slices
            .into_iter()
            .map(|slice| {
                (
                    slice.uuid.clone(),
                    SliceEntry {
                        slice,
                        state: SliceState::Free,
                    },
                )
            })
            .collect();
        Self {
            slices: Mutex::new(map),
        }
    }

    /// Discover slices through the inventory port and build the pool.
    pub async fn discover(inventory: &dyn GpuInventory) -> Result<Self, InventoryError> {
        let slices = inventory.list_slices().await?;
        info!(count = slices.len(), "discovered MIG instances");
        Ok(Self::new(slices))
    }

    /// Reserve the first free slice matching the profile.
    pub fn allocate_by_profile(
        &self,
        profile: &str,
        user_id: &str,
    ) -> Result<MigSlice, GpuPoolError> {
        let mut slices = self.slices.lock().expect("gpu pool mutex poisoned");

        let entry = slices
            .values_mut()
            .find(|e| e.state == SliceState::Free && e.slice.profile.name == profile)
            .ok_or_else(|| GpuPoolError::Exhausted {
                profile: profile.to_string(),
            })?;

        entry.state = SliceState::Held {
            user_id: user_id.to_string(),
        };
        info!(uuid = %entry.slice.uuid, profile, user_id, "allocated MIG instance");
        Ok(entry.slice.clone())
    }

    /// Reserve a specific slice by UUID.
    pub fn allocate_by_uuid(&self, uuid: &str, user_id: &str) -> Result<MigSlice, GpuPoolError> {
        let mut slices = self.slices.lock().expect("gpu pool mutex poisoned");

        let entry = slices.get_mut(uuid).ok_or_else(|| GpuPoolError::Unknown {
            uuid: uuid.to_string(),
        })?;

        if let SliceState::Held { user_id: holder } = &entry.state {
            return Err(GpuPoolError::Busy {
                uuid: uuid.to_string(),
                holder: holder.clone(),
            });
        }

        entry.state = SliceState::Held {
            user_id: user_id.to_string(),
        };
        info!(uuid, user_id, "allocated MIG instance by uuid");
        Ok(entry.slice.clone())
    }

    /// Release a slice. Idempotent: an already-free slice logs and returns;
    /// a slice held by a different user is released anyway (administrative
    /// teardown) with a warning.
    pub fn release(&self, uuid: &str, user_id: &str) {
        let mut slices = self.slices.lock().expect("gpu pool mutex poisoned");

        let entry = match slices.get_mut(uuid) {
            Some(entry) => entry,
            None => {
                warn!(uuid, "release of unknown MIG instance ignored");
                return;
            }
        };

        match &entry.state {
            SliceState::Free => {
                warn!(uuid, "MIG instance already released");
            }
            SliceState::Held { user_id: holder } => {
                if holder != user_id {
                    warn!(uuid, holder = %holder, user_id, "releasing MIG instance held by another user");
                }
                entry.state = SliceState::Free;
                info!(uuid, "released MIG instance");
            }
        }
    }

    /// Mark a slice as held during startup reconciliation.
    pub fn mark_held(&self, uuid: &str, user_id: &str) -> Result<(), GpuPoolError> {
        let mut slices = self.slices.lock().expect("gpu pool mutex poisoned");

        let entry = slices.get_mut(uuid).ok_or_else(|| GpuPoolError::Unknown {
            uuid: uuid.to_string(),
        })?;

        match &entry.state {
            SliceState::Held { user_id: holder } if holder == user_id => Ok(()),
            SliceState::Held { user_id: holder } => Err(GpuPoolError::Busy {
                uuid: uuid.to_string(),
                holder: holder.clone(),
            }),
            SliceState::Free => {
                entry.state = SliceState::Held {
                    user_id: user_id.to_string(),
                };
                Ok(())
            }
        }
    }

    /// Snapshot of every slice.
    pub fn snapshot(&self) -> Vec<GpuSliceInfo> {
        let slices = self.slices.lock().expect("gpu pool mutex poisoned");
        slices.values().map(slice_info).collect()
    }

    /// Snapshot of the free slices only.
    pub fn snapshot_free(&self) -> Vec<GpuSliceInfo> {
        let slices = self.slices.lock().expect("gpu pool mutex poisoned");
        slices
            .values()
            .filter(|e| e.state == SliceState::Free)
            .map(slice_info)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slices.lock().expect("gpu pool mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn slice_info(entry: &SliceEntry) -> GpuSliceInfo {
    let (in_use, held_by) = match &entry.state {
        SliceState::Free => (false, None),
        SliceState::Held { user_id } => (true, Some(user_id.clone())),
    };
    GpuSliceInfo {
        uuid: entry.slice.uuid.clone(),
        profile: entry.slice.profile.clone(),
        in_use,
        held_by,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::profiles::profile_from_name;

    fn slice(uuid: &str, profile: &str) -> MigSlice {
        MigSlice {
            uuid: uuid.to_string(),
            profile: profile_from_name(profile),
        }
    }

    fn pool() -> GpuPool {
        GpuPool::new(vec![
            slice("MIG-aaa", "3g.20gb"),
            slice("MIG-bbb", "3g.20gb"),
            slice("MIG-ccc", "1g.5gb"),
        ])
    }

    #[test]
    fn allocate_by_profile_takes_first_free_in_uuid_order() {
        let pool = pool();
        let first = pool.allocate_by_profile("3g.20gb", "u1").unwrap();
        assert_eq!(first.uuid, "MIG-aaa");
        let second = pool.allocate_by_profile("3g.20gb", "u2").unwrap();
        assert_eq!(second.uuid, "MIG-bbb");
        assert!(matches!(
            pool.allocate_by_profile("3g.20gb", "u3"),
            Err(GpuPoolError::Exhausted { .. })
        ));
    }

    #[test]
    fn allocate_by_uuid_unknown_and_busy() {
        let pool = pool();
        assert!(matches!(
            pool.allocate_by_uuid("MIG-zzz", "u1"),
            Err(GpuPoolError::Unknown { .. })
        ));

        pool.allocate_by_uuid("MIG-ccc", "u1").unwrap();
        let err = pool.allocate_by_uuid("MIG-ccc", "u2").unwrap_err();
        match err {
            GpuPoolError::Busy { holder, .. } => assert_eq!(holder, "u1"),
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[test]
    fn release_is_idempotent_and_forgiving() {
        let pool = pool();
        pool.allocate_by_uuid("MIG-aaa", "u1").unwrap();

        // Release by another user still frees (administrative teardown).
        pool.release("MIG-aaa", "someone-else");
        assert_eq!(pool.snapshot_free().len(), 3);

        // Double release and unknown release are no-ops.
        pool.release("MIG-aaa", "u1");
        pool.release("MIG-zzz", "u1");
        assert_eq!(pool.snapshot_free().len(), 3);
    }

    #[test]
    fn mark_held_for_reconciliation() {
        let pool = pool();
        pool.mark_held("MIG-bbb", "u1").unwrap();
        assert!(matches!(
            pool.allocate_by_uuid("MIG-bbb", "u2"),
            Err(GpuPoolError::Busy { .. })
        ));
        // Re-marking for the same user is fine.
        pool.mark_held("MIG-bbb", "u1").unwrap();
        // Marking for a different user is a conflict.
        assert!(matches!(
            pool.mark_held("MIG-bbb", "u2"),
            Err(GpuPoolError::Busy { .. })
        ));
        assert!(matches!(
            pool.mark_held("MIG-zzz", "u1"),
            Err(GpuPoolError::Unknown { .. })
        ));
    }

    #[test]
    fn snapshots_reflect_state() {
        let pool = pool();
        pool.allocate_by_profile("1g.5gb", "u9").unwrap();

        let all = pool.snapshot();
        assert_eq!(all.len(), 3);
        let held: Vec<_> = all.iter().filter(|s| s.in_use).collect();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].held_by.as_deref(), Some("u9"));

        assert_eq!(pool.snapshot_free().len(), 2);
    }
}
