//! Shared engine wiring used by the CLI and the daemon.

use std::sync::Arc;

use reqwest::Client;

use k8gate_core::Config;

use crate::collaborators::{CollaboratorResolver, GitHubCollaborators};
use crate::engine::{EngineSettings, SyncEngine};
use crate::error::{upstream, SyncError};
use crate::keys::{GitHubKeys, KeyFetcher};
use crate::state_store;
use crate::workload::KubernetesWorkloads;

/// Build an engine talking to the real cluster and code-hosting services.
///
/// `config` must already have passed [`Config::validate`].
pub fn build_engine(config: &Config) -> Result<SyncEngine, SyncError> {
    let client = Client::builder()
        .timeout(config.request_timeout())
        .user_agent(concat!("k8gate/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| upstream("http client", e))?;

    let workloads = KubernetesWorkloads::from_config(client.clone(), config)?;
    let collaborators = GitHubCollaborators::new(
        client.clone(),
        &config.github_api_url,
        config.access_token.expose(),
    );
    let keys = GitHubKeys::new(client.clone(), &config.github_keys_url);
    let store = state_store::from_config(client, config)?;

    tracing::debug!(
        "engine wired: state backend {}, concurrency {}",
        store.name(),
        config.collaborator_concurrency
    );

    Ok(SyncEngine::new(
        EngineSettings::from(config),
        Arc::new(workloads),
        CollaboratorResolver::new(
            Arc::new(collaborators),
            config.policy.clone(),
            config.collaborator_concurrency,
            config.request_timeout(),
        ),
        KeyFetcher::new(Arc::new(keys), config.request_timeout()),
        store,
    ))
}
