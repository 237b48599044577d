//! Workload Directory client and application discovery.
//!
//! [`WorkloadDirectory::list`] returns every running unit; an empty vector is
//! a valid answer and distinct from an `Err`. [`discover_applications`] then
//! turns labelled units into [`Application`]s, grouped by SSH user.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use k8gate_core::{Application, Config, Container, SshUser, WorkloadUnit};

use crate::error::{upstream, SyncError};

const SERVICE: &str = "workload directory";

#[async_trait]
pub trait WorkloadDirectory: Send + Sync {
    async fn list(&self) -> Result<Vec<WorkloadUnit>, SyncError>;
}

// ---------------------------------------------------------------------------
// Cluster API client
// ---------------------------------------------------------------------------

/// Lists running pods through the cluster API.
pub struct KubernetesWorkloads {
    client: Client,
    endpoint: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: PodMetadata,
    #[serde(default)]
    spec: PodSpec,
}

#[derive(Debug, Default, Deserialize)]
struct PodMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<PodContainer>,
}

#[derive(Debug, Deserialize)]
struct PodContainer {
    name: String,
}

impl From<Pod> for WorkloadUnit {
    fn from(pod: Pod) -> Self {
        WorkloadUnit {
            name: pod.metadata.name,
            namespace: pod.metadata.namespace,
            labels: pod.metadata.labels,
            annotations: pod.metadata.annotations,
            containers: pod.spec.containers.into_iter().map(|c| c.name).collect(),
        }
    }
}

impl KubernetesWorkloads {
    pub fn new(client: Client, endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn from_config(client: Client, config: &Config) -> Result<Self, SyncError> {
        let endpoint = config.cluster.endpoint.clone().ok_or(SyncError::Config(
            k8gate_core::ConfigError::MissingSetting {
                key: "KUBERNETES_CLUSTER_ENDPOINT",
            },
        ))?;
        Ok(Self::new(client, endpoint, config.cluster.token.expose()))
    }
}

#[async_trait]
impl WorkloadDirectory for KubernetesWorkloads {
    async fn list(&self) -> Result<Vec<WorkloadUnit>, SyncError> {
        let url = format!("{}/api/v1/pods", self.endpoint);
        let mut req = self
            .client
            .get(&url)
            .query(&[("fieldSelector", "status.phase=Running")]);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let resp = req.send().await.map_err(|e| upstream(SERVICE, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(upstream(SERVICE, format!("HTTP {status}: {}", body.trim())));
        }
        let pods: PodList = resp.json().await.map_err(|e| upstream(SERVICE, e))?;
        tracing::debug!("workload directory returned {} units", pods.items.len());
        Ok(pods.items.into_iter().map(WorkloadUnit::from).collect())
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Whether `name` can be used as a file name inside the keys directory.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}

/// Group qualifying units into applications, ordered by SSH user.
///
/// A unit qualifies when it carries both the name and SSH-user labels.
/// Units whose SSH user or pod name is not a safe file name are skipped
/// with a warning. The first unit seen for an SSH user fixes the
/// application's repository and namespace.
pub fn discover_applications(units: &[WorkloadUnit]) -> Vec<Application> {
    let mut apps: BTreeMap<SshUser, Application> = BTreeMap::new();

    for unit in units {
        let (Some(_), Some(ssh_user)) = (unit.app_name(), unit.ssh_user()) else {
            continue;
        };
        let pod_name = unit.pod_name();
        if !is_safe_file_name(&ssh_user.0) || !is_safe_file_name(&pod_name) {
            tracing::warn!(
                "skipping workload {}/{}: ssh user {:?} or pod name {:?} is not a safe file name",
                unit.namespace,
                unit.name,
                ssh_user.0,
                pod_name
            );
            continue;
        }

        let app = apps.entry(ssh_user.clone()).or_insert_with(|| Application {
            id: unit.repo_id(),
            ssh_user,
            namespace: unit.namespace.clone(),
            containers: Vec::new(),
            users: Vec::new(),
        });
        if app.containers.iter().any(|c| c.pod_name == pod_name) {
            continue;
        }
        app.containers.push(Container {
            pod_name,
            container_name: unit.primary_container(),
        });
    }

    apps.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn unit(pod: &str, labels: &[(&str, &str)]) -> WorkloadUnit {
        WorkloadUnit {
            name: pod.to_string(),
            namespace: "apps".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: BTreeMap::new(),
            containers: vec!["web".to_string(), "sidecar".to_string()],
        }
    }

    fn blog(pod: &str) -> WorkloadUnit {
        unit(
            pod,
            &[
                ("name", "blog"),
                ("ci.rabbit.ssh.user", "blog-ssh"),
                ("git.owner", "acme"),
                ("git.name", "blog"),
            ],
        )
    }

    #[test]
    fn units_sharing_ssh_user_form_one_application() {
        let apps = discover_applications(&[blog("blog-1"), blog("blog-2")]);
        assert_eq!(apps.len(), 1);
        let app = &apps[0];
        assert_eq!(app.id.0, "acme/blog");
        assert_eq!(app.ssh_user.0, "blog-ssh");
        let pods: Vec<_> = app.containers.iter().map(|c| c.pod_name.as_str()).collect();
        assert_eq!(pods, ["blog-1", "blog-2"]);
        assert_eq!(app.containers[0].container_name, "web");
    }

    #[test]
    fn units_without_ssh_user_or_name_are_excluded() {
        let apps = discover_applications(&[
            unit("db-1", &[("name", "db")]),
            unit("x-1", &[("ci.rabbit.ssh.user", "x-ssh")]),
        ]);
        assert!(apps.is_empty());
    }

    #[test]
    fn unsafe_names_are_excluded() {
        let apps = discover_applications(&[
            unit("evil", &[("name", "e"), ("ci.rabbit.ssh.user", "../etc")]),
            unit("..", &[("name", "e"), ("ci.rabbit.ssh.user", "ok-ssh")]),
            blog("blog-1"),
        ]);
        let users: Vec<_> = apps.iter().map(|a| a.ssh_user.0.as_str()).collect();
        assert_eq!(users, ["blog-ssh"]);
    }

    #[test]
    fn applications_are_ordered_by_ssh_user() {
        let shop = unit("shop-1", &[("name", "shop"), ("ci.rabbit.ssh.user", "a-shop")]);
        let apps = discover_applications(&[blog("blog-1"), shop]);
        assert_eq!(apps[0].ssh_user.0, "a-shop");
        assert_eq!(apps[1].ssh_user.0, "blog-ssh");
    }

    #[tokio::test]
    async fn kubernetes_client_lists_running_pods() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/pods"))
            .and(query_param("fieldSelector", "status.phase=Running"))
            .and(header("authorization", "Bearer kube-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [{
                    "metadata": {
                        "name": "blog-1",
                        "namespace": "apps",
                        "labels": {"name": "blog", "ci.rabbit.ssh.user": "blog-ssh"}
                    },
                    "spec": {"containers": [{"name": "wordpress"}]}
                }]
            })))
            .mount(&server)
            .await;

        let client = KubernetesWorkloads::new(Client::new(), server.uri(), "kube-token");
        let units = client.list().await.unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].name, "blog-1");
        assert_eq!(units[0].containers, ["wordpress"]);
        assert_eq!(units[0].ssh_user().unwrap().0, "blog-ssh");
    }

    #[tokio::test]
    async fn empty_pod_list_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
            .mount(&server)
            .await;

        let client = KubernetesWorkloads::new(Client::new(), server.uri(), "");
        assert!(client.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn auth_failure_is_upstream_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let client = KubernetesWorkloads::new(Client::new(), server.uri(), "bad");
        let err = client.list().await.unwrap_err();
        assert!(matches!(err, SyncError::UpstreamUnavailable { .. }));
    }
}
