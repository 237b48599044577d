//! Change detector and the per-tick scheduler.
//!
//! A tick discovers workloads, fingerprints them and runs a full engine
//! cycle only when the fingerprint differs from the last committed one.
//! A fingerprint is committed only after a cycle whose snapshot reached
//! durable storage; anything else leaves the old fingerprint in place so
//! the next tick retries.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use k8gate_core::Snapshot;
use k8gate_sync::{Fingerprint, SnapshotPersistence, SyncEngine, SyncOutcome};

/// Last snapshot served to readers.
pub type SharedSnapshot = Arc<RwLock<Option<Snapshot>>>;
pub type SharedStatus = Arc<RwLock<SchedulerStatus>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorState {
    #[default]
    Idle,
    Syncing,
}

/// What the detector decided for a freshly computed fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A cycle is already in flight.
    Busy,
    Unchanged,
    Sync,
}

#[derive(Debug, Default)]
pub struct ChangeDetector {
    state: DetectorState,
    committed: Option<Fingerprint>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn committed(&self) -> Option<&Fingerprint> {
        self.committed.as_ref()
    }

    /// Decide on `current`. `Sync` moves the detector to `Syncing`; the
    /// caller must report back through [`ChangeDetector::finish`].
    pub fn begin(&mut self, current: &Fingerprint) -> Decision {
        if self.state == DetectorState::Syncing {
            return Decision::Busy;
        }
        if self.committed.as_ref() == Some(current) {
            return Decision::Unchanged;
        }
        self.state = DetectorState::Syncing;
        Decision::Sync
    }

    pub fn finish(&mut self, current: Fingerprint, commit: bool) {
        self.state = DetectorState::Idle;
        if commit {
            self.committed = Some(current);
        }
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub applications: usize,
    pub users: usize,
    pub written: usize,
    pub unchanged: usize,
    pub kept_previous: usize,
    pub failed: usize,
    pub persistence: String,
    pub duration_ms: u128,
}

impl CycleReport {
    fn from_outcome(outcome: &SyncOutcome, started: Instant) -> Self {
        let persistence = match &outcome.persistence {
            SnapshotPersistence::Primary => "primary".to_string(),
            SnapshotPersistence::Fallback { path } => format!("fallback:{}", path.display()),
            SnapshotPersistence::Skipped => "skipped".to_string(),
            SnapshotPersistence::Failed { reason } => format!("failed: {reason}"),
        };
        Self {
            applications: outcome.snapshot.applications.len(),
            users: outcome.snapshot.users.len(),
            written: outcome.written(),
            unchanged: outcome.unchanged(),
            kept_previous: outcome.kept_previous(),
            failed: outcome.failed(),
            persistence,
            duration_ms: started.elapsed().as_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped,
    Unchanged,
    Synced { report: CycleReport, committed: bool },
    Failed(String),
}

/// Scheduler state exposed through `status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub state: DetectorState,
    pub fingerprint: Option<Fingerprint>,
    pub cycles: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleReport>,
    pub last_error: Option<String>,
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    detector: ChangeDetector,
    status: SharedStatus,
    snapshot: SharedSnapshot,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, status: SharedStatus, snapshot: SharedSnapshot) -> Self {
        Self {
            engine,
            detector: ChangeDetector::new(),
            status,
            snapshot,
        }
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub async fn tick(&mut self) -> TickOutcome {
        let now = Utc::now();
        self.status.write().await.last_tick_at = Some(now);

        let units = match self.engine.discover().await {
            Ok(units) => units,
            Err(err) => {
                tracing::error!(error = %err, "workload discovery failed, keeping last fingerprint");
                self.status.write().await.last_error = Some(err.to_string());
                return TickOutcome::Failed(err.to_string());
            }
        };

        let current = Fingerprint::of(&units);
        match self.detector.begin(&current) {
            Decision::Busy => {
                tracing::debug!("cycle already in flight, skipping tick");
                return TickOutcome::Skipped;
            }
            Decision::Unchanged => {
                tracing::debug!(fingerprint = current.short(), "workloads unchanged");
                return TickOutcome::Unchanged;
            }
            Decision::Sync => {}
        }

        tracing::info!(
            fingerprint = current.short(),
            units = units.len(),
            "workloads changed, starting sync cycle"
        );
        self.status.write().await.state = DetectorState::Syncing;

        let started = Instant::now();
        let result = self.engine.sync_units(&units).await;

        let outcome = match result {
            Ok(outcome) => {
                let report = CycleReport::from_outcome(&outcome, started);
                let committed = outcome.is_durable() && report.failed == 0;
                if !outcome.is_durable() {
                    tracing::warn!(
                        persistence = %report.persistence,
                        "snapshot not persisted, cycle will be retried"
                    );
                }
                if report.failed > 0 {
                    tracing::warn!(
                        failed = report.failed,
                        "key files not written, cycle will be retried"
                    );
                }
                tracing::info!(
                    applications = report.applications,
                    users = report.users,
                    written = report.written,
                    unchanged = report.unchanged,
                    failed = report.failed,
                    duration_ms = report.duration_ms as u64,
                    "sync cycle completed"
                );
                *self.snapshot.write().await = Some(outcome.snapshot);
                TickOutcome::Synced { report, committed }
            }
            Err(err) => {
                tracing::error!(error = %err, "sync cycle failed");
                TickOutcome::Failed(err.to_string())
            }
        };

        let commit = matches!(outcome, TickOutcome::Synced { committed: true, .. });
        self.detector.finish(current, commit);

        let mut status = self.status.write().await;
        status.state = DetectorState::Idle;
        status.fingerprint = self.detector.committed().cloned();
        match &outcome {
            TickOutcome::Synced { report, .. } => {
                status.cycles += 1;
                status.last_sync_at = Some(Utc::now());
                status.last_cycle = Some(report.clone());
                status.last_error = None;
            }
            TickOutcome::Failed(message) => status.last_error = Some(message.clone()),
            TickOutcome::Skipped | TickOutcome::Unchanged => {}
        }
        outcome
    }
}
