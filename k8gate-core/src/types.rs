//! Domain types for the k8gate synchronization model.
//!
//! An [`Application`] is recomputed from scratch on every cycle; nothing in
//! here is mutated across cycles. The [`Snapshot`] is the only value that
//! outlives a cycle.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Label vocabulary
// ---------------------------------------------------------------------------

/// Workload label carrying the application name.
pub const LABEL_NAME: &str = "name";
/// Workload label carrying the SSH-facing identity.
pub const LABEL_SSH_USER: &str = "ci.rabbit.ssh.user";
/// Repository owner labels, in lookup order.
pub const LABELS_GIT_OWNER: &[&str] = &["git.owner", "git_owner"];
/// Repository name labels, in lookup order.
pub const LABELS_GIT_NAME: &[&str] = &["git.name", "git_name"];

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// SSH-facing identity of an application. Unique per application.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SshUser(pub String);

impl fmt::Display for SshUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SshUser {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SshUser {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Canonical repository identifier, `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(pub String);

impl RepoId {
    pub fn new(owner: &str, name: &str) -> Self {
        Self(format!("{owner}/{name}"))
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for RepoId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A code-hosting login.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Login(pub String);

impl fmt::Display for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Login {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Login {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Public key lines per login, in fetch order.
pub type KeysByLogin = BTreeMap<Login, Vec<String>>;

// ---------------------------------------------------------------------------
// Workload directory records
// ---------------------------------------------------------------------------

/// One running workload unit as reported by the workload directory.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkloadUnit {
    /// Pod name. Empty when the directory did not report one.
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Container names in declaration order.
    #[serde(default)]
    pub containers: Vec<String>,
}

impl WorkloadUnit {
    fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn first_label(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.label(k))
    }

    /// Value of the application-name label.
    pub fn app_name(&self) -> Option<&str> {
        self.label(LABEL_NAME)
    }

    /// Value of the SSH-user label.
    pub fn ssh_user(&self) -> Option<SshUser> {
        self.label(LABEL_SSH_USER).map(SshUser::from)
    }

    /// `owner/name` from the git labels. Missing parts render as empty.
    pub fn repo_id(&self) -> RepoId {
        RepoId::new(
            self.first_label(LABELS_GIT_OWNER).unwrap_or_default(),
            self.first_label(LABELS_GIT_NAME).unwrap_or_default(),
        )
    }

    /// Pod name, falling back to the application-name label.
    pub fn pod_name(&self) -> String {
        if self.name.is_empty() {
            self.app_name().unwrap_or_default().to_string()
        } else {
            self.name.clone()
        }
    }

    /// Name of the first declared container.
    pub fn primary_container(&self) -> String {
        self.containers.first().cloned().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Repository permission object as reported by the code-hosting API.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub maintain: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub triage: bool,
    #[serde(default)]
    pub pull: bool,
}

/// A repository-scoped identity with a role, before policy is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub login: Login,
    #[serde(default)]
    pub role_name: String,
    #[serde(default)]
    pub permissions: Permissions,
}

/// A collaborator that passed the access policy for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedUser {
    pub login: Login,
    pub role: String,
    pub permissions: Permissions,
}

impl From<Collaborator> for AuthorizedUser {
    fn from(c: Collaborator) -> Self {
        Self {
            login: c.login,
            role: c.role_name,
            permissions: c.permissions,
        }
    }
}

// ---------------------------------------------------------------------------
// Applications
// ---------------------------------------------------------------------------

/// Placement record of one backing container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub pod_name: String,
    pub container_name: String,
}

/// One SSH-addressable synchronization unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Repository identifier, `owner/name`.
    pub id: RepoId,
    pub ssh_user: SshUser,
    pub namespace: String,
    /// Backing containers in discovery order.
    pub containers: Vec<Container>,
    /// Authorized users in resolution order. Order is significant: it drives
    /// the line order of the compiled authorized-keys file.
    #[serde(default)]
    pub users: Vec<AuthorizedUser>,
}

impl Application {
    pub fn first_container(&self) -> Option<&Container> {
        self.containers.first()
    }

    /// `<namespace> <pod> -c <container>` for the first container.
    pub fn connection_target(&self) -> String {
        let (pod, container) = self
            .first_container()
            .map(|c| (c.pod_name.as_str(), c.container_name.as_str()))
            .unwrap_or(("", ""));
        format!("{} {} -c {}", self.namespace, pod, container)
    }

    /// Whether `name` addresses this application, by SSH user or pod name.
    pub fn is_addressed_by(&self, name: &str) -> bool {
        self.ssh_user.0 == name || self.containers.iter().any(|c| c.pod_name == name)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Result of one successful cycle; the unit persisted and exposed to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub synced_at: DateTime<Utc>,
    pub applications: BTreeMap<SshUser, Application>,
    /// Login → repositories the login was authorized on this cycle.
    pub users: BTreeMap<Login, Vec<RepoId>>,
}

impl Snapshot {
    /// Build a snapshot from a resolved application set.
    pub fn new(applications: Vec<Application>, synced_at: DateTime<Utc>) -> Self {
        let mut users: BTreeMap<Login, Vec<RepoId>> = BTreeMap::new();
        let mut by_user = BTreeMap::new();
        for app in applications {
            for user in &app.users {
                let repos = users.entry(user.login.clone()).or_default();
                if !repos.contains(&app.id) {
                    repos.push(app.id.clone());
                }
            }
            by_user.insert(app.ssh_user.clone(), app);
        }
        Self {
            synced_at,
            applications: by_user,
            users,
        }
    }

    /// The application addressed by an SSH user or pod name.
    pub fn find_application(&self, name: &str) -> Option<&Application> {
        if let Some(app) = self.applications.get(&SshUser::from(name)) {
            return Some(app);
        }
        self.applications.values().find(|a| a.is_addressed_by(name))
    }

    /// `-n <namespace> exec <pod>` for the application addressed by `name`.
    ///
    /// A pod-name match targets that pod; an SSH-user match targets the
    /// application's first container.
    pub fn connection_string(&self, name: &str) -> Option<String> {
        let app = self.find_application(name)?;
        let pod = app
            .containers
            .iter()
            .find(|c| c.pod_name == name)
            .or_else(|| app.first_container())?;
        Some(format!("-n {} exec {}", app.namespace, pod.pod_name))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
