//! Key Synchronization Engine.
//!
//! One cycle is `discover → resolve → fetch → compile/render → write →
//! persist`. Everything computed in a cycle is passed explicitly through a
//! [`SyncPlan`]; nothing is carried over from the previous cycle.
//!
//! Ordering guarantees:
//! - the account file is rendered before any artifact is written, so a bad
//!   template leaves every previous file untouched;
//! - the snapshot is persisted only after all artifacts are written.
//!
//! A key file that cannot be written fails alone and is reported in the
//! outcome. Only the account file write aborts the cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use k8gate_core::{Application, Config, Login, Snapshot, SshUser, WorkloadUnit};
use k8gate_renderer::{AccountRenderer, RenderError};

use crate::authorized_keys::{compile, write_key_files, KeyFileClaims};
use crate::collaborators::CollaboratorResolver;
use crate::diff::{diff_plan, FileDiff};
use crate::error::SyncError;
use crate::keys::KeyFetcher;
use crate::state_store::{StateStore, SNAPSHOT_KEY};
use crate::workload::{discover_applications, WorkloadDirectory};
use crate::writer::{atomic_write, read_existing, WriteResult};

/// Filesystem targets of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub keys_dir: PathBuf,
    pub account_file: PathBuf,
    pub account_template: String,
    pub template_dir: Option<PathBuf>,
    pub legacy_snapshot_path: Option<PathBuf>,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            keys_dir: config.keys_dir.clone(),
            account_file: config.account_file.clone(),
            account_template: config.account_template.clone(),
            template_dir: config.template_dir.clone(),
            legacy_snapshot_path: config.legacy_snapshot_path.clone(),
        }
    }
}

/// Everything one cycle computed, before any side effect.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub snapshot: Snapshot,
    /// Compiled authorized-keys lines per application.
    pub key_lines: BTreeMap<SshUser, Vec<String>>,
    pub account_content: String,
}

impl SyncPlan {
    pub fn applications(&self) -> impl Iterator<Item = &Application> {
        self.snapshot.applications.values()
    }
}

/// Where the cycle's snapshot ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotPersistence {
    /// Saved to the configured state store.
    Primary,
    /// The store failed; saved to the legacy snapshot file instead.
    Fallback { path: PathBuf },
    /// Dry-run: nothing persisted.
    Skipped,
    /// Neither the store nor a fallback accepted it. The snapshot is only
    /// held in memory.
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub snapshot: Snapshot,
    pub writes: Vec<WriteResult>,
    pub persistence: SnapshotPersistence,
}

impl SyncOutcome {
    fn count(&self, f: impl Fn(&WriteResult) -> bool) -> usize {
        self.writes.iter().filter(|w| f(w)).count()
    }

    pub fn written(&self) -> usize {
        self.count(|w| matches!(w, WriteResult::Written { .. } | WriteResult::WouldWrite { .. }))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|w| matches!(w, WriteResult::Unchanged { .. }))
    }

    pub fn kept_previous(&self) -> usize {
        self.count(|w| matches!(w, WriteResult::KeptPrevious { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|w| matches!(w, WriteResult::Failed { .. }))
    }

    pub fn is_durable(&self) -> bool {
        matches!(
            self.persistence,
            SnapshotPersistence::Primary | SnapshotPersistence::Fallback { .. }
        )
    }
}

pub struct SyncEngine {
    settings: EngineSettings,
    workloads: Arc<dyn WorkloadDirectory>,
    resolver: CollaboratorResolver,
    fetcher: KeyFetcher,
    store: Arc<dyn StateStore>,
}

impl SyncEngine {
    pub fn new(
        settings: EngineSettings,
        workloads: Arc<dyn WorkloadDirectory>,
        resolver: CollaboratorResolver,
        fetcher: KeyFetcher,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            settings,
            workloads,
            resolver,
            fetcher,
            store,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Prepare the state store.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        self.store.initialize().await?;
        Ok(())
    }

    /// Current workload units. An empty list is a valid answer.
    pub async fn discover(&self) -> Result<Vec<WorkloadUnit>, SyncError> {
        self.workloads.list().await
    }

    /// Compute a full cycle for `units` without touching the filesystem.
    pub async fn plan(&self, units: &[WorkloadUnit]) -> Result<SyncPlan, SyncError> {
        let mut applications = discover_applications(units);

        let mut authorized = self.resolver.resolve_all(&applications).await;
        for app in &mut applications {
            app.users = authorized.remove(&app.ssh_user).unwrap_or_default();
        }

        let logins: BTreeSet<Login> = applications
            .iter()
            .flat_map(|app| app.users.iter().map(|u| u.login.clone()))
            .collect();
        let keys = self.fetcher.fetch(&logins).await;

        let key_lines: BTreeMap<SshUser, Vec<String>> = applications
            .iter()
            .map(|app| (app.ssh_user.clone(), compile(app, &keys)))
            .collect();

        // Reloaded every cycle so an operator template fix applies on the next tick.
        let renderer = AccountRenderer::new(self.settings.template_dir.as_deref())?;
        let account_content = renderer.render(&self.settings.account_template, &applications)?;

        tracing::debug!(
            "planned {} applications, {} logins",
            applications.len(),
            logins.len()
        );
        Ok(SyncPlan {
            snapshot: Snapshot::new(applications, Utc::now()),
            key_lines,
            account_content,
        })
    }

    /// Write every artifact of `plan`: key files first, then the account file.
    pub fn apply(&self, plan: &SyncPlan, dry_run: bool) -> Result<Vec<WriteResult>, SyncError> {
        let mut writes = Vec::new();
        let mut claims = KeyFileClaims::new();
        for app in plan.applications() {
            let lines = plan
                .key_lines
                .get(&app.ssh_user)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let paths = claims.claim(&self.settings.keys_dir, app, !lines.is_empty());
            writes.extend(write_key_files(&paths, app, lines, dry_run));
        }

        let account = atomic_write(&self.settings.account_file, &plan.account_content, dry_run)
            .map_err(|err| match err {
                SyncError::Io { path, source } => {
                    SyncError::Template(RenderError::Io { path, source })
                }
                other => other,
            })?;
        writes.push(account);
        Ok(writes)
    }

    /// Save `snapshot`, falling back to the legacy snapshot file.
    pub async fn persist(&self, snapshot: &Snapshot) -> SnapshotPersistence {
        let value = match serde_json::to_value(snapshot) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("snapshot could not be serialized: {err}");
                return SnapshotPersistence::Failed {
                    reason: err.to_string(),
                };
            }
        };

        let primary_err = match self.store.save_state(SNAPSHOT_KEY, &value).await {
            Ok(()) => return SnapshotPersistence::Primary,
            Err(err) => err,
        };
        tracing::warn!(
            "saving snapshot to {} store failed: {primary_err}",
            self.store.name()
        );

        let Some(path) = &self.settings.legacy_snapshot_path else {
            return SnapshotPersistence::Failed {
                reason: primary_err.to_string(),
            };
        };
        let mut document = serde_json::Map::new();
        document.insert(SNAPSHOT_KEY.to_string(), value);
        let written = serde_json::to_string_pretty(&document)
            .map_err(SyncError::from)
            .and_then(|content| atomic_write(path, &content, false));
        match written {
            Ok(_) => {
                tracing::warn!("snapshot written to fallback {}", path.display());
                SnapshotPersistence::Fallback { path: path.clone() }
            }
            Err(err) => {
                tracing::error!("fallback snapshot write failed: {err}");
                SnapshotPersistence::Failed {
                    reason: format!("{primary_err}; fallback: {err}"),
                }
            }
        }
    }

    /// Run one cycle over already discovered `units`.
    pub async fn sync_units(&self, units: &[WorkloadUnit]) -> Result<SyncOutcome, SyncError> {
        let plan = self.plan(units).await?;
        let writes = match self.apply(&plan, false) {
            Ok(writes) => writes,
            Err(err) => {
                tracing::error!("sync cycle aborted: {err}");
                return Err(err);
            }
        };
        let persistence = self.persist(&plan.snapshot).await;
        let outcome = SyncOutcome {
            snapshot: plan.snapshot,
            writes,
            persistence,
        };
        tracing::info!(
            "sync complete: {} applications, {} users, {} written, {} unchanged, {} kept, {} failed",
            outcome.snapshot.applications.len(),
            outcome.snapshot.users.len(),
            outcome.written(),
            outcome.unchanged(),
            outcome.kept_previous(),
            outcome.failed()
        );
        Ok(outcome)
    }

    /// Discover and run one full cycle.
    pub async fn sync(&self) -> Result<SyncOutcome, SyncError> {
        let units = self.discover().await?;
        self.sync_units(&units).await
    }

    /// Compute a cycle and report what it would write. Nothing is persisted.
    pub async fn sync_dry_run(&self) -> Result<SyncOutcome, SyncError> {
        let units = self.discover().await?;
        let plan = self.plan(&units).await?;
        let writes = self.apply(&plan, true)?;
        Ok(SyncOutcome {
            snapshot: plan.snapshot,
            writes,
            persistence: SnapshotPersistence::Skipped,
        })
    }

    /// Unified diffs of every artifact the next cycle would change.
    pub async fn diff(&self) -> Result<Vec<FileDiff>, SyncError> {
        let units = self.discover().await?;
        let plan = self.plan(&units).await?;
        diff_plan(&self.settings, &plan)
    }

    /// Last persisted snapshot: the state store first, then the legacy file.
    pub async fn load_snapshot(&self) -> Result<Option<Snapshot>, SyncError> {
        match self.store.load_state(SNAPSHOT_KEY).await {
            Ok(Some(value)) => return Ok(Some(serde_json::from_value(value)?)),
            Ok(None) => {}
            Err(err) => tracing::warn!(
                "loading snapshot from {} store failed: {err}",
                self.store.name()
            ),
        }
        let Some(path) = &self.settings.legacy_snapshot_path else {
            return Ok(None);
        };
        let Some(contents) = read_existing(path)? else {
            return Ok(None);
        };
        let mut document: serde_json::Value = serde_json::from_str(&contents)?;
        match document.get_mut(SNAPSHOT_KEY).map(serde_json::Value::take) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
