//! k8gate core library: domain types, access policy, configuration.
//!
//! - [`types`]: newtypes and the Application / Snapshot data model
//! - [`policy`]: role allow-lists and the production-tier rule
//! - [`config`]: layered YAML + environment configuration
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod policy;
pub mod types;

pub use config::{ClusterConfig, Config, StateProvider};
pub use error::ConfigError;
pub use policy::AccessPolicy;
pub use types::{
    Application, AuthorizedUser, Collaborator, Container, KeysByLogin, Login, Permissions,
    RepoId, Snapshot, SshUser, WorkloadUnit,
};
