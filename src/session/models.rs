//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use std::collections::HashMap;

/// A durable session row.
///
/// Records are written once at the end of a successful create and deleted
/// on teardown; they are never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    /// Unique session ID.
    pub id: String,
    /// Owning user; unique among active records.
    pub user_id: String,
    /// Container ID of the session sandbox.
    pub container_id: String,
    /// Static address on the private bridge network.
    pub container_ip: String,
    /// Host port forwarding to the container's SSH listener.
    pub host_ssh_port: i64,
    /// Reserved MIG instance UUID.
    pub gpu_uuid: String,
    /// Profile of the reserved slice.
    pub mig_profile: String,
    /// Session time-to-live in minutes.
    pub ttl_minutes: i64,
    pub created_at: DateTime<Utc>,
    /// `created_at + ttl_minutes`; eligible for reaping once in the past.
    pub expires_at: DateTime<Utc>,
    /// Opaque string map (image tag, workspace path, generated password).
    pub metadata: Json<HashMap<String, String>>,
}

impl SessionRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Request to create a new session.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSessionRequest {
    /// Owning user. Required.
    pub user_id: String,
    /// TTL in minutes; zero or negative falls back to the default.
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
    /// MIG profile to allocate from. Mutually exclusive with
    /// `mig_instance_uuid`; defaults to the engine's configured profile.
    #[serde(default)]
    pub mig_profile: Option<String>,
    /// Target a specific MIG instance instead of a profile.
    #[serde(default)]
    pub mig_instance_uuid: Option<String>,
    /// Image hint. The session image is always built per user with the key
    /// baked in, so this is accepted for compatibility and ignored.
    #[serde(default)]
    pub image: Option<String>,
}

/// Response from session creation. Contains the only copy of the private
/// key that will ever leave the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub container_id: String,
    pub ssh_user: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_private_key: String,
    pub gpu_uuid: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Counters for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub expired_sessions: usize,
}
