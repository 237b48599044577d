//! # k8gate-sync
//!
//! The Key Synchronization Engine and its collaborators: workload
//! discovery, collaborator resolution, key fetching, authorized-keys
//! compilation, the hash-gated atomic writer and the pluggable state store.
//!
//! Build a production engine with [`pipeline::build_engine`] and call
//! [`SyncEngine::sync`] once per cycle.

pub mod authorized_keys;
pub mod collaborators;
pub mod diff;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod keys;
pub mod pipeline;
pub mod state_store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod workload;
pub mod writer;

pub use diff::FileDiff;
pub use engine::{EngineSettings, SnapshotPersistence, SyncEngine, SyncOutcome, SyncPlan};
pub use error::SyncError;
pub use fingerprint::Fingerprint;
pub use state_store::{StateStore, StateWatch, StoreError, SNAPSHOT_KEY};
pub use writer::WriteResult;
