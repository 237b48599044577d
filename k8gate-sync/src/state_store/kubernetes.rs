//! Cluster-native state backend: values live as JSON strings in the `data`
//! map of one ConfigMap.
//!
//! `save_state` is a single JSON merge-patch of `data.<key>`; the API server
//! applies it atomically, so readers never see a half-written value.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::{json, Value};

use k8gate_core::Config;

use super::{StateStore, StoreError};

const BACKEND: &str = "kubernetes";

pub struct KubernetesStateStore {
    client: Client,
    endpoint: String,
    namespace: String,
    config_map: String,
    token: String,
}

impl KubernetesStateStore {
    pub fn new(
        client: Client,
        endpoint: impl Into<String>,
        namespace: impl Into<String>,
        config_map: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            config_map: config_map.into(),
            token: token.into(),
        }
    }

    /// Store on the configured cluster, sharing the engine's HTTP `client`.
    pub fn from_config(client: Client, config: &Config) -> Result<Self, StoreError> {
        let endpoint = config
            .cluster
            .endpoint
            .clone()
            .ok_or_else(|| StoreError::Backend {
                backend: BACKEND,
                message: "KUBERNETES_CLUSTER_ENDPOINT is not set".to_string(),
            })?;
        Ok(Self::new(
            client,
            endpoint,
            config.cluster.namespace.clone(),
            config.cluster.config_map.clone(),
            config.cluster.token.expose(),
        ))
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/configmaps",
            self.endpoint, self.namespace
        )
    }

    fn object_url(&self) -> String {
        format!("{}/{}", self.collection_url(), self.config_map)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.bearer_auth(&self.token)
        }
    }

    async fn fetch(&self) -> Result<Option<Value>, StoreError> {
        let resp = self
            .authorized(self.client.get(self.object_url()))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp, "read config map").await?;
        Ok(Some(resp.json().await?))
    }
}

async fn check_status(
    resp: reqwest::Response,
    action: &str,
) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Backend {
        backend: BACKEND,
        message: format!("{action}: HTTP {status}: {}", body.trim()),
    })
}

#[async_trait]
impl StateStore for KubernetesStateStore {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        if self.fetch().await?.is_some() {
            return Ok(());
        }
        tracing::info!(
            "creating config map {}/{}",
            self.namespace,
            self.config_map
        );
        let body = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": self.config_map, "namespace": self.namespace },
            "data": {},
        });
        let resp = self
            .authorized(self.client.post(self.collection_url()))
            .json(&body)
            .send()
            .await?;
        // Another replica may have created it in between.
        if resp.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        check_status(resp, "create config map").await?;
        Ok(())
    }

    async fn load_state(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let Some(object) = self.fetch().await? else {
            return Ok(None);
        };
        match object.pointer(&format!("/data/{key}")) {
            Some(Value::String(raw)) => Ok(Some(serde_json::from_str(raw)?)),
            Some(other) => Err(StoreError::Backend {
                backend: BACKEND,
                message: format!("data.{key} is not a string: {other}"),
            }),
            None => Ok(None),
        }
    }

    async fn save_state(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let mut data = serde_json::Map::new();
        data.insert(key.to_string(), Value::String(serde_json::to_string(value)?));
        let patch = json!({ "data": data });
        let resp = self
            .authorized(self.client.patch(self.object_url()))
            .header(header::CONTENT_TYPE, "application/merge-patch+json")
            .body(serde_json::to_vec(&patch)?)
            .send()
            .await?;
        check_status(resp, "patch config map").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const OBJECT: &str = "/api/v1/namespaces/infra/configmaps/k8gate-state";

    fn store(server: &MockServer) -> KubernetesStateStore {
        KubernetesStateStore::new(Client::new(), server.uri(), "infra", "k8gate-state", "kube-token")
    }

    #[tokio::test]
    async fn initialize_creates_missing_config_map() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(OBJECT))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/infra/configmaps"))
            .and(header("authorization", "Bearer kube-token"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        store(&server).initialize().await.unwrap();
    }

    #[tokio::test]
    async fn initialize_leaves_existing_config_map_alone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(OBJECT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        store(&server).initialize().await.unwrap();
    }

    #[tokio::test]
    async fn from_config_uses_the_given_client() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(OBJECT))
            .and(header("user-agent", "k8gate/shared"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let map: std::collections::HashMap<String, String> = [
            ("STATE_PROVIDER", "kubernetes".to_string()),
            ("KUBERNETES_CLUSTER_ENDPOINT", server.uri()),
            ("KUBERNETES_CLUSTER_NAMESPACE", "infra".to_string()),
            ("KUBERNETES_STATE_CONFIGMAP", "k8gate-state".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let config = Config::from_sources(None, move |k| map.get(k).cloned()).unwrap();
        let client = Client::builder().user_agent("k8gate/shared").build().unwrap();

        let s = KubernetesStateStore::from_config(client, &config).unwrap();
        assert_eq!(s.load_state("snapshot").await.unwrap(), None);
    }

    #[tokio::test]
    async fn load_decodes_json_string_entry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(OBJECT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "snapshot": "{\"applications\":{}}" }
            })))
            .mount(&server)
            .await;

        let s = store(&server);
        assert_eq!(
            s.load_state("snapshot").await.unwrap(),
            Some(json!({"applications": {}}))
        );
        assert!(s.load_state("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_sends_merge_patch() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(OBJECT))
            .and(header("content-type", "application/merge-patch+json"))
            .and(body_json(json!({ "data": { "snapshot": "{\"v\":1}" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .save_state("snapshot", &json!({"v": 1}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn save_failure_is_a_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let err = store(&server)
            .save_state("snapshot", &json!({}))
            .await
            .unwrap_err();
        match err {
            StoreError::Backend { message, .. } => assert!(message.contains("403")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
