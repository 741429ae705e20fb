//! GPU partition (MIG) discovery and allocation.
//!
//! The inventory port discovers MIG instances at startup by parsing the
//! device tool's listing; the pool guards them with free/held state for the
//! lifetime of the process.

mod inventory;
mod pool;
mod profiles;

pub use inventory::{GpuInventory, InventoryError, NvidiaSmiInventory, parse_mig_listing};
pub use pool::{GpuPool, GpuPoolError, GpuSliceInfo, SliceState};
pub use profiles::{MigProfile, MigSlice, catalog, find_profile, profile_from_name};
