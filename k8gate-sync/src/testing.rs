//! In-memory fakes for every external collaborator of the engine.
//!
//! Each fake counts its calls so tests can assert on upstream traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use k8gate_core::{Collaborator, Login, Permissions, RepoId, WorkloadUnit};

use crate::collaborators::CollaboratorSource;
use crate::error::{upstream, SyncError};
use crate::keys::KeySource;
use crate::state_store::{StateStore, StoreError};
use crate::workload::WorkloadDirectory;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn collaborator(login: &str, role: &str) -> Collaborator {
    Collaborator {
        login: Login::from(login),
        role_name: role.to_string(),
        permissions: Permissions {
            admin: role == "admin",
            maintain: role == "maintain",
            push: matches!(role, "admin" | "maintain" | "write"),
            triage: role != "read",
            pull: true,
        },
    }
}

/// A labelled workload unit with a single `web` container.
pub fn workload(pod: &str, name: &str, ssh_user: &str, repo: &str) -> WorkloadUnit {
    let (owner, repo_name) = repo.split_once('/').unwrap_or(("", repo));
    let mut unit = WorkloadUnit {
        name: pod.to_string(),
        namespace: "apps".to_string(),
        containers: vec!["web".to_string()],
        ..Default::default()
    };
    for (k, v) in [
        ("name", name),
        ("ci.rabbit.ssh.user", ssh_user),
        ("git.owner", owner),
        ("git.name", repo_name),
    ] {
        unit.labels.insert(k.to_string(), v.to_string());
    }
    unit
}

// ---------------------------------------------------------------------------
// Workload directory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeWorkloads {
    units: Mutex<Vec<WorkloadUnit>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeWorkloads {
    pub fn new(units: Vec<WorkloadUnit>) -> Self {
        Self {
            units: Mutex::new(units),
            ..Default::default()
        }
    }

    pub fn set_units(&self, units: Vec<WorkloadUnit>) {
        *lock(&self.units) = units;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkloadDirectory for FakeWorkloads {
    async fn list(&self) -> Result<Vec<WorkloadUnit>, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(upstream("workload directory", "connection refused"));
        }
        Ok(lock(&self.units).clone())
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Reply<T> {
    Ok(T),
    Fail,
    RateLimited,
}

#[derive(Default)]
pub struct FakeCollaborators {
    repos: Mutex<HashMap<RepoId, Reply<Vec<Collaborator>>>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeCollaborators {
    pub fn set(&self, repo: &str, collaborators: Vec<Collaborator>) {
        lock(&self.repos).insert(RepoId::from(repo), Reply::Ok(collaborators));
    }

    pub fn fail(&self, repo: &str) {
        lock(&self.repos).insert(RepoId::from(repo), Reply::Fail);
    }

    pub fn rate_limit(&self, repo: &str) {
        lock(&self.repos).insert(RepoId::from(repo), Reply::RateLimited);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CollaboratorSource for FakeCollaborators {
    async fn collaborators(&self, repo: &RepoId) -> Result<Vec<Collaborator>, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = lock(&self.repos).get(repo).cloned();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match reply {
            Some(Reply::Ok(c)) => Ok(c),
            None => Ok(Vec::new()),
            Some(Reply::Fail) => Err(upstream("collaborators", format!("{repo}: HTTP 502"))),
            Some(Reply::RateLimited) => Err(SyncError::RateLimited {
                service: "collaborators",
                reset_at: None,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeKeys {
    keys: Mutex<HashMap<Login, Reply<String>>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<HashMap<Login, usize>>,
}

impl FakeKeys {
    pub fn set(&self, login: &str, text: &str) {
        lock(&self.keys).insert(Login::from(login), Reply::Ok(text.to_string()));
    }

    pub fn fail(&self, login: &str) {
        lock(&self.keys).insert(Login::from(login), Reply::Fail);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn calls_for(&self, login: &str) -> usize {
        lock(&self.calls).get(&Login::from(login)).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }
}

#[async_trait]
impl KeySource for FakeKeys {
    async fn keys(&self, login: &Login) -> Result<String, SyncError> {
        *lock(&self.calls).entry(login.clone()).or_default() += 1;
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = lock(&self.keys).get(login).cloned();
        match reply {
            Some(Reply::Ok(text)) => Ok(text),
            None => Ok(String::new()),
            Some(Reply::Fail) | Some(Reply::RateLimited) => {
                Err(upstream("public keys", format!("{login}: HTTP 500")))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// State store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, Value>>,
    failing: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: Value) {
        lock(&self.values).insert(key.to_string(), value);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn load_state(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get(key))
    }

    async fn save_state(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend {
                backend: "memory",
                message: "save rejected".to_string(),
            });
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.insert(key, value.clone());
        Ok(())
    }
}
