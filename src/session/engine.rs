//! Session engine: transactional assembly and disassembly of sandboxes.
//!
//! A session is (GPU slice + per-session image + container + workspace +
//! host port + SSH identity + durable record). Creation acquires resources
//! cheapest-first and commits the record last; every acquisition pushes a
//! compensation onto a rollback ladder that is unwound in reverse on any
//! failure. Teardown runs the same disassembly best-effort and removes the
//! record last, so a failed teardown is retried by the reaper.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::types::Json;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::container::{ContainerRuntimeApi, ImageBuildSpec, SessionContainerSpec};
use crate::gpu::{GpuPool, GpuSliceInfo, MigProfile, MigSlice, catalog};
use crate::identity::IdentityMinter;
use crate::net::{IpPool, PortPool};
use crate::workspace::WorkspaceManager;

use super::models::{
    CreateSessionRequest, CreateSessionResponse, SessionRecord, SessionStats,
};
use super::repository::SessionRepository;

/// Graceful container stop window before escalating to SIGKILL.
const STOP_GRACE_SECONDS: u32 = 10;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Profile allocated when the request names neither a profile nor a
    /// specific instance.
    pub default_profile: String,
    /// TTL applied when the request omits it or passes zero/negative.
    pub default_ttl_minutes: i64,
    /// Host advertised in create responses.
    pub ssh_host: String,
    /// Directory holding the session Dockerfile and its companion files.
    pub build_context: PathBuf,
    /// Private bridge network sessions attach to.
    pub network: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_profile: "3g.20gb".to_string(),
            default_ttl_minutes: 60,
            ssh_host: "localhost".to_string(),
            build_context: PathBuf::from("/app/source"),
            network: "sandman_worknet".to_string(),
        }
    }
}

/// A compensating action recorded during creation, executed in reverse
/// order when a later step fails. Commit drops the ladder without running
/// it.
enum Compensation {
    ReleaseGpu { uuid: String, user_id: String },
    ReleasePort { port: u16 },
    ForgetIp { ip: String },
    RemoveContainer { id: String },
}

/// Orchestrates session lifecycles over the resource pools, the container
/// runtime, and the durable store.
pub struct SessionEngine {
    repo: SessionRepository,
    runtime: Arc<dyn ContainerRuntimeApi>,
    gpus: Arc<GpuPool>,
    ports: Arc<PortPool>,
    ips: Arc<IpPool>,
    identity: Arc<dyn IdentityMinter>,
    workspaces: WorkspaceManager,
    config: EngineConfig,
    // Bulk teardown takes the write side so no create can interleave;
    // individual operations take the read side.
    admin_lock: RwLock<()>,
}

impl SessionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: SessionRepository,
        runtime: Arc<dyn ContainerRuntimeApi>,
        gpus: Arc<GpuPool>,
        ports: Arc<PortPool>,
        ips: Arc<IpPool>,
        identity: Arc<dyn IdentityMinter>,
        workspaces: WorkspaceManager,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            runtime,
            gpus,
            ports,
            ips,
            identity,
            workspaces,
            config,
            admin_lock: RwLock::new(()),
        }
    }

    /// Create a session for a user: reserve resources, build the image,
    /// start the container, persist the record. Rolls back on any failure.
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        let _gate = self.admin_lock.read().await;

        let user_id = request.user_id.trim().to_string();
        validate_user_id(&user_id)?;

        if request.mig_profile.is_some() && request.mig_instance_uuid.is_some() {
            bail!("invalid request: mig_profile and mig_instance_uuid are mutually exclusive");
        }

        let ttl_minutes = match request.ttl_minutes {
            Some(ttl) if ttl > 0 => ttl,
            _ => self.config.default_ttl_minutes,
        };

        if let Some(image) = &request.image {
            // The session image is always built per user so the public key
            // is baked in before first boot.
            debug!(user_id = %user_id, image = %image, "ignoring image hint");
        }

        if self.repo.get_by_user(&user_id).await?.is_some() {
            bail!("an active session for user {user_id} already exists");
        }

        let identity = self
            .identity
            .generate(&user_id)
            .await
            .context("minting ssh identity")?;

        let mut ladder: Vec<Compensation> = Vec::new();
        let outcome = self
            .provision(&request, &user_id, ttl_minutes, &identity.public_key_authorized, &mut ladder)
            .await;

        match outcome {
            Ok(mut response) => {
                response.ssh_private_key = identity.private_key_pem;
                info!(
                    session_id = %response.session_id,
                    user_id = %user_id,
                    gpu_uuid = %response.gpu_uuid,
                    ssh_port = response.ssh_port,
                    "session created"
                );
                Ok(response)
            }
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "session creation failed, rolling back");
                self.unwind(ladder).await;
                Err(err)
            }
        }
    }

    /// Steps 3-9 of creation. Every acquisition pushes its compensation
    /// before the next step can fail.
    async fn provision(
        &self,
        request: &CreateSessionRequest,
        user_id: &str,
        ttl_minutes: i64,
        public_key: &str,
        ladder: &mut Vec<Compensation>,
    ) -> Result<CreateSessionResponse> {
        // GPU slice: targeted by uuid, or first free of the profile.
        let slice: MigSlice = match &request.mig_instance_uuid {
            Some(uuid) => self
                .gpus
                .allocate_by_uuid(uuid, user_id)
                .context("allocating requested MIG instance")?,
            None => {
                let profile = request
                    .mig_profile
                    .as_deref()
                    .unwrap_or(&self.config.default_profile);
                self.gpus
                    .allocate_by_profile(profile, user_id)
                    .context("allocating MIG instance")?
            }
        };
        ladder.push(Compensation::ReleaseGpu {
            uuid: slice.uuid.clone(),
            user_id: user_id.to_string(),
        });

        let host_ssh_port = self.ports.allocate().context("allocating host SSH port")?;
        ladder.push(Compensation::ReleasePort {
            port: host_ssh_port,
        });

        let container_ip = self.ips.allocate().await.context("allocating container address")?;
        ladder.push(Compensation::ForgetIp {
            ip: container_ip.clone(),
        });

        let workspace_dir = self
            .workspaces
            .ensure(user_id)
            .context("preparing workspace")?;

        let image = self
            .runtime
            .build_session_image(&ImageBuildSpec {
                user_id: user_id.to_string(),
                public_key: public_key.to_string(),
                context_dir: self.config.build_context.clone(),
            })
            .await
            .context("building session image")?;

        let ssh_password = generate_password();
        let spec = SessionContainerSpec {
            name: format!("{user_id}-container"),
            image: image.clone(),
            network: self.config.network.clone(),
            ip: container_ip.clone(),
            host_ssh_port,
            workspace_dir: workspace_dir.display().to_string(),
            gpu_uuid: slice.uuid.clone(),
            env: HashMap::from([
                ("USER_ID".to_string(), user_id.to_string()),
                ("NVIDIA_VISIBLE_DEVICES".to_string(), slice.uuid.clone()),
                ("SSH_PASSWORD".to_string(), ssh_password.clone()),
            ]),
            label: user_id.to_string(),
        };

        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .context("creating container")?;
        ladder.push(Compensation::RemoveContainer {
            id: container_id.clone(),
        });

        self.runtime
            .start_container(&container_id)
            .await
            .context("starting container")?;

        let created_at = Utc::now();
        let expires_at = created_at + Duration::minutes(ttl_minutes);
        let record = SessionRecord {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            container_id: container_id.clone(),
            container_ip: container_ip.clone(),
            host_ssh_port: i64::from(host_ssh_port),
            gpu_uuid: slice.uuid.clone(),
            mig_profile: slice.profile.name.clone(),
            ttl_minutes,
            created_at,
            expires_at,
            metadata: Json(HashMap::from([
                ("image".to_string(), image),
                ("workspace".to_string(), workspace_dir.display().to_string()),
                ("ssh_password".to_string(), ssh_password),
                ("ssh_port".to_string(), host_ssh_port.to_string()),
            ])),
        };

        self.repo
            .create(&record)
            .await
            .context("persisting session record")?;

        // Committed: the container owns its address now.
        self.ips.forget(&container_ip).await;

        Ok(CreateSessionResponse {
            session_id: record.id,
            container_id,
            ssh_user: user_id.to_string(),
            ssh_host: self.config.ssh_host.clone(),
            ssh_port: host_ssh_port,
            // Filled in by the caller, which owns the minted identity.
            ssh_private_key: String::new(),
            gpu_uuid: slice.uuid,
            created_at,
            expires_at,
        })
    }

    /// Execute the rollback ladder in reverse acquisition order. Failures
    /// are logged, not propagated; the original error stays the caller's.
    async fn unwind(&self, mut ladder: Vec<Compensation>) {
        while let Some(step) = ladder.pop() {
            match step {
                Compensation::RemoveContainer { id } => {
                    if let Err(err) = self.runtime.remove_container(&id, true, true).await {
                        warn!(container_id = %id, error = %err, "rollback: removing container failed");
                    }
                }
                Compensation::ForgetIp { ip } => {
                    self.ips.forget(&ip).await;
                }
                Compensation::ReleasePort { port } => {
                    self.ports.release(port);
                }
                Compensation::ReleaseGpu { uuid, user_id } => {
                    self.gpus.release(&uuid, &user_id);
                }
            }
        }
    }

    /// Tear down a session by id. Unknown ids fail with "not found".
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let _gate = self.admin_lock.read().await;

        let record = self
            .repo
            .get(session_id)
            .await?
            .ok_or_else(|| anyhow!("session {session_id} not found"))?;

        self.teardown(&record).await
    }

    /// Disassemble one session: container first, then pool releases, then
    /// the record. Container and pool steps are best-effort; only a failed
    /// record delete fails the call so the reaper retries it.
    async fn teardown(&self, record: &SessionRecord) -> Result<()> {
        info!(session_id = %record.id, user_id = %record.user_id, "tearing down session");

        if !record.container_id.is_empty() {
            if let Err(err) = self
                .runtime
                .stop_container(&record.container_id, STOP_GRACE_SECONDS)
                .await
            {
                warn!(session_id = %record.id, error = %err, "stopping container failed");
            }
            if let Err(err) = self
                .runtime
                .remove_container(&record.container_id, true, true)
                .await
            {
                warn!(session_id = %record.id, error = %err, "removing container failed");
            }
        }

        if !record.gpu_uuid.is_empty() {
            self.gpus.release(&record.gpu_uuid, &record.user_id);
        }

        if record.host_ssh_port > 0 {
            self.ports.release(record.host_ssh_port as u16);
        }

        let removed = self
            .repo
            .delete(&record.id)
            .await
            .context("removing session record")?;
        if !removed {
            debug!(session_id = %record.id, "record already removed by a concurrent teardown");
        }

        info!(session_id = %record.id, "session torn down");
        Ok(())
    }

    /// Tear down every session. Holds the admin write lock so no create
    /// can interleave; failures are aggregated into a summary error.
    pub async fn delete_all_sessions(&self) -> Result<usize> {
        let _gate = self.admin_lock.write().await;

        let records = self.repo.list().await?;
        if records.is_empty() {
            return Ok(0);
        }

        let total = records.len();
        let mut failed = 0usize;
        for record in &records {
            if let Err(err) = self.teardown(record).await {
                warn!(session_id = %record.id, error = %err, "bulk teardown failed for session");
                failed += 1;
            }
        }

        if failed > 0 {
            bail!("failed to tear down {failed} of {total} sessions");
        }
        info!(count = total, "all sessions deleted");
        Ok(total)
    }

    /// Reap every session whose TTL elapsed before `now`. Per-session
    /// failures are logged and retried on the next sweep.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let _gate = self.admin_lock.read().await;

        let expired = self.repo.list_expired(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut reaped = 0usize;
        for record in &expired {
            info!(
                session_id = %record.id,
                user_id = %record.user_id,
                expires_at = %record.expires_at,
                "session expired"
            );
            match self.teardown(record).await {
                Ok(()) => reaped += 1,
                Err(err) => {
                    warn!(session_id = %record.id, error = %err, "reaping failed, will retry");
                }
            }
        }

        Ok(reaped)
    }

    /// Startup reconciliation. Rebuilds pool held-state from the store,
    /// tears down records whose container is gone, and removes labeled
    /// containers that no record references. Must run before traffic.
    pub async fn reconcile(&self) -> Result<()> {
        let records = self.repo.list().await?;
        info!(count = records.len(), "reconciling persisted sessions");

        let mut surviving: Vec<&SessionRecord> = Vec::new();
        for record in &records {
            if !record.gpu_uuid.is_empty() {
                if let Err(err) = self.gpus.mark_held(&record.gpu_uuid, &record.user_id) {
                    // The record is corrupt; leave it for an operator.
                    warn!(
                        session_id = %record.id,
                        gpu_uuid = %record.gpu_uuid,
                        error = %err,
                        "record references an unusable MIG instance"
                    );
                }
            }
            if record.host_ssh_port > 0 {
                if let Err(err) = self.ports.mark_held(record.host_ssh_port as u16) {
                    warn!(session_id = %record.id, error = %err, "record references an out-of-range port");
                }
            }

            let alive = self
                .runtime
                .inspect_container(&record.container_id)
                .await
                .context("inspecting session container")?
                .is_some();

            if alive {
                surviving.push(record);
            } else {
                warn!(
                    session_id = %record.id,
                    container_id = %record.container_id,
                    "container is gone, tearing down stale session"
                );
                if let Err(err) = self.teardown(record).await {
                    warn!(session_id = %record.id, error = %err, "stale session teardown failed");
                }
            }
        }

        // Orphans: labeled containers no surviving record references
        // (typically a crash between container start and record commit).
        let live = self.runtime.list_session_containers().await?;
        let referenced: HashSet<&str> = surviving
            .iter()
            .map(|r| r.container_id.as_str())
            .collect();

        for container in &live {
            let owned = referenced
                .iter()
                .any(|id| container.matches_id(id));
            if owned {
                continue;
            }

            warn!(
                container_id = %container.id,
                names = ?container.names,
                "removing orphan session container"
            );
            if let Err(err) = self
                .runtime
                .stop_container(&container.id, STOP_GRACE_SECONDS)
                .await
            {
                warn!(container_id = %container.id, error = %err, "stopping orphan failed");
            }
            if let Err(err) = self.runtime.remove_container(&container.id, true, true).await {
                warn!(container_id = %container.id, error = %err, "removing orphan failed");
            }
        }

        info!(
            surviving = surviving.len(),
            "startup reconciliation complete"
        );
        Ok(())
    }

    /// Fetch one session record.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.repo.get(session_id).await
    }

    /// List all session records, newest first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.repo.list().await
    }

    /// Session counters for the stats endpoint.
    pub async fn session_stats(&self) -> Result<SessionStats> {
        let records = self.repo.list().await?;
        let now = Utc::now();
        let expired = records.iter().filter(|r| r.is_expired(now)).count();
        Ok(SessionStats {
            total_sessions: records.len(),
            active_sessions: records.len() - expired,
            expired_sessions: expired,
        })
    }

    /// Snapshot of every MIG slice with its allocation state.
    pub fn gpu_snapshot(&self) -> Vec<GpuSliceInfo> {
        self.gpus.snapshot()
    }

    /// Snapshot of the free MIG slices.
    pub fn gpu_snapshot_free(&self) -> Vec<GpuSliceInfo> {
        self.gpus.snapshot_free()
    }

    /// The supported profile catalog.
    pub fn profiles(&self) -> Vec<MigProfile> {
        catalog()
    }
}

/// Validate a user id: it becomes a container name, an image tag suffix,
/// and an in-container username, so the charset is strict.
fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        bail!("user_id is required");
    }
    if user_id.len() > 63 {
        bail!("invalid user_id: exceeds 63 characters");
    }
    let first = user_id.chars().next().unwrap_or('-');
    if !first.is_ascii_alphanumeric() && first != '_' {
        bail!("invalid user_id '{user_id}': must start with an alphanumeric character");
    }
    if !user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("invalid user_id '{user_id}': only alphanumeric, '-' and '_' are allowed");
    }
    Ok(())
}

/// Random alphanumeric password injected as SSH_PASSWORD for the container
/// bootstrap. Password authentication stays disabled in the image.
fn generate_password() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::rng();
    (0..12)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_validation() {
        assert!(validate_user_id("u1").is_ok());
        assert!(validate_user_id("user-name_2").is_ok());
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("-leading").is_err());
        assert!(validate_user_id("has space").is_err());
        assert!(validate_user_id("semi;colon").is_err());
        assert!(validate_user_id(&"x".repeat(64)).is_err());
    }

    #[test]
    fn password_shape() {
        let password = generate_password();
        assert_eq!(password.len(), 12);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_password(), generate_password());
    }
}
