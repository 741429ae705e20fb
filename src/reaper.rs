//! TTL reaper.
//!
//! A ticker that periodically asks the engine to tear down every session
//! whose TTL has elapsed. Per-session failures are retried on the next
//! tick.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::session::SessionEngine;

/// Ticker-driven sweeper over expired session records.
pub struct Reaper {
    engine: Arc<SessionEngine>,
    interval: Duration,
}

impl Reaper {
    pub fn new(engine: Arc<SessionEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Spawn the sweep loop. The first sweep happens one interval after
    /// startup (reconciliation already ran by then).
    pub fn start(self) -> ReaperHandle {
        info!(interval_secs = self.interval.as_secs(), "reaper started");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match self.engine.sweep_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(reaped) => info!(reaped, "reaped expired sessions"),
                    Err(err) => warn!(error = %err, "expiry sweep failed"),
                }
            }
        });

        ReaperHandle { handle }
    }
}

/// Handle to a running reaper task.
pub struct ReaperHandle {
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the sweep loop.
    pub fn stop(self) {
        self.handle.abort();
        info!("reaper stopped");
    }
}
