//! Key Fetcher: each login's published public keys.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;

use k8gate_core::{KeysByLogin, Login};

use crate::error::{upstream, SyncError};

const SERVICE: &str = "public keys";

#[async_trait]
pub trait KeySource: Send + Sync {
    /// Raw newline-delimited key text published for `login`.
    async fn keys(&self, login: &Login) -> Result<String, SyncError>;
}

/// Fetches `<keys_url>/<login>.keys`.
pub struct GitHubKeys {
    client: Client,
    keys_url: String,
}

impl GitHubKeys {
    pub fn new(client: Client, keys_url: impl Into<String>) -> Self {
        Self {
            client,
            keys_url: keys_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl KeySource for GitHubKeys {
    async fn keys(&self, login: &Login) -> Result<String, SyncError> {
        let url = format!("{}/{}.keys", self.keys_url, login);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| upstream(SERVICE, format!("{login}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(upstream(SERVICE, format!("{login}: HTTP {status}")));
        }
        resp.text()
            .await
            .map_err(|e| upstream(SERVICE, format!("{login}: {e}")))
    }
}

/// Split fetched key text into lines, dropping blanks and keeping order.
pub fn parse_key_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct KeyFetcher {
    source: Arc<dyn KeySource>,
    timeout: Duration,
}

impl KeyFetcher {
    pub fn new(source: Arc<dyn KeySource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Fetch every login concurrently, once each.
    ///
    /// Every requested login has an entry; a failed or timed out fetch
    /// leaves it empty.
    pub async fn fetch(&self, logins: &BTreeSet<Login>) -> KeysByLogin {
        let fetches = logins.iter().map(|login| async move {
            let result = tokio::time::timeout(self.timeout, self.source.keys(login))
                .await
                .map_err(|_| upstream(SERVICE, format!("{login}: timed out after {:?}", self.timeout)))
                .and_then(|r| r);
            let keys = match result {
                Ok(text) => parse_key_lines(&text),
                Err(err) => {
                    tracing::warn!("key fetch for {login} failed: {err}");
                    Vec::new()
                }
            };
            (login.clone(), keys)
        });
        join_all(fetches).await.into_iter().collect()
    }
}
