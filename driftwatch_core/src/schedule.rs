//! Background scheduler driving periodic syncs.
//!
//! The engine itself only executes named units; this loop decides when
//! they are due. Schedules are fixed intervals per unit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::SyncEngine;
use crate::{Error, Result};

/// Fixed-interval schedule for one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSchedule {
    pub every: Duration,
    pub next_run_at: DateTime<Utc>,
}

impl UnitSchedule {
    /// Due immediately, then every `every`.
    pub fn every(every: Duration) -> Result<Self> {
        if every.is_zero() {
            return Err(Error::InvalidInput("schedule interval must be > 0".to_string()));
        }
        Ok(Self {
            every,
            next_run_at: Utc::now(),
        })
    }
}

pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    poll_interval: Duration,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, poll_interval: Duration) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll_interval must be > 0".to_string()));
        }
        Ok(Self {
            engine,
            poll_interval,
        })
    }

    /// Run the scheduler loop until the task is cancelled.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_loop(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;
            // Best-effort tick; errors are logged but do not stop scheduling.
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::warn!(error = %e, "scheduler tick failed");
            }
        }
    }

    /// Trigger every unit whose schedule is due. Returns the number of
    /// triggered units.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut triggered = 0u64;
        for (name, schedule) in self.engine.schedules().await {
            if now < schedule.next_run_at {
                continue;
            }

            let every = chrono::Duration::from_std(schedule.every)
                .map_err(|e| Error::backend("schedule interval out of range", e))?;
            // Advance next_run_at before triggering so a crash mid-run
            // cannot double-schedule the same slot.
            self.engine.set_next_run(&name, now + every).await?;

            if let Err(e) = self.engine.execute_unit(&name).await {
                tracing::warn!(unit = %name, error = %e, "scheduled sync failed");
            }
            triggered += 1;
        }
        Ok(triggered)
    }
}
