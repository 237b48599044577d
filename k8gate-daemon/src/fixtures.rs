//! Engine wired to in-memory upstreams for scheduler and socket tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::RwLock;

use k8gate_core::AccessPolicy;
use k8gate_sync::collaborators::CollaboratorResolver;
use k8gate_sync::keys::KeyFetcher;
use k8gate_sync::testing::{
    collaborator, workload, FakeCollaborators, FakeKeys, FakeWorkloads, MemoryStateStore,
};
use k8gate_sync::{EngineSettings, SyncEngine};

use crate::scheduler::{Scheduler, SharedSnapshot, SharedStatus};

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub workloads: Arc<FakeWorkloads>,
    pub collaborators: Arc<FakeCollaborators>,
    pub keys: Arc<FakeKeys>,
    pub store: Arc<MemoryStateStore>,
    pub status: SharedStatus,
    pub snapshot: SharedSnapshot,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("keys")).unwrap();
        Self {
            dir,
            workloads: Arc::new(FakeWorkloads::default()),
            collaborators: Arc::new(FakeCollaborators::default()),
            keys: Arc::new(FakeKeys::default()),
            store: Arc::new(MemoryStateStore::default()),
            status: Arc::new(RwLock::new(Default::default())),
            snapshot: Arc::new(RwLock::new(None)),
        }
    }

    /// One `blog` application with a single admin key.
    pub fn blog(&self) {
        self.workloads
            .set_units(vec![workload("blog-1", "blog", "blog-ssh", "acme/blog")]);
        self.collaborators
            .set("acme/blog", vec![collaborator("alice", "admin")]);
        self.keys.set("alice", "ssh-ed25519 AAAA alice@laptop");
    }

    pub fn engine_with_template(&self, template: &str) -> Arc<SyncEngine> {
        Arc::new(SyncEngine::new(
            EngineSettings {
                keys_dir: self.dir.path().join("keys"),
                account_file: self.dir.path().join("passwd"),
                account_template: template.to_string(),
                template_dir: None,
                legacy_snapshot_path: None,
            },
            self.workloads.clone(),
            CollaboratorResolver::new(
                self.collaborators.clone(),
                AccessPolicy::default(),
                2,
                Duration::from_secs(5),
            ),
            KeyFetcher::new(self.keys.clone(), Duration::from_secs(5)),
            self.store.clone(),
        ))
    }

    pub fn engine(&self) -> Arc<SyncEngine> {
        self.engine_with_template("alpine.passwords")
    }

    pub fn scheduler_with_template(&self, template: &str) -> Scheduler {
        Scheduler::new(
            self.engine_with_template(template),
            self.status.clone(),
            self.snapshot.clone(),
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler_with_template("alpine.passwords")
    }

    pub fn key_file(&self, name: &str) -> PathBuf {
        self.dir.path().join("keys").join(name)
    }
}
