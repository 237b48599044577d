//! Collaborator Resolver: repository collaborators filtered through the
//! two-tier [`AccessPolicy`].
//!
//! Per-application resolution runs with bounded fan-out. A failure for one
//! application is logged and leaves that application with no authorized
//! users; it never aborts the others.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, ACCEPT, LINK};
use reqwest::{Client, StatusCode};

use k8gate_core::{AccessPolicy, Application, AuthorizedUser, Collaborator, RepoId, SshUser};

use crate::error::{upstream, SyncError};

const SERVICE: &str = "collaborators";
const PER_PAGE: u32 = 100;
const MAX_PAGES: usize = 50;

#[async_trait]
pub trait CollaboratorSource: Send + Sync {
    /// Every collaborator of `repo`, unfiltered.
    async fn collaborators(&self, repo: &RepoId) -> Result<Vec<Collaborator>, SyncError>;
}

// ---------------------------------------------------------------------------
// GitHub REST client
// ---------------------------------------------------------------------------

pub struct GitHubCollaborators {
    client: Client,
    api_url: String,
    token: String,
}

impl GitHubCollaborators {
    pub fn new(client: Client, api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Target of the `rel="next"` entry of a `Link` header.
pub(crate) fn next_link(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(LINK)?.to_str().ok()?;
    raw.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|p| p.trim().replace(' ', "") == "rel=\"next\"");
        if !is_next {
            return None;
        }
        let target = target.trim();
        Some(target.strip_prefix('<')?.strip_suffix('>')?.to_string())
    })
}

#[async_trait]
impl CollaboratorSource for GitHubCollaborators {
    async fn collaborators(&self, repo: &RepoId) -> Result<Vec<Collaborator>, SyncError> {
        let mut url = format!(
            "{}/repos/{}/collaborators?per_page={PER_PAGE}",
            self.api_url, repo
        );
        let mut all = Vec::new();

        for _ in 0..MAX_PAGES {
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .header(ACCEPT, "application/vnd.github+json")
                .send()
                .await
                .map_err(|e| upstream(SERVICE, e))?;

            let status = resp.status();
            let headers = resp.headers().clone();
            let remaining = header_u64(&headers, "x-ratelimit-remaining");
            let reset_at = header_u64(&headers, "x-ratelimit-reset");
            match remaining {
                Some(0) => tracing::warn!(
                    "code-hosting rate limit exhausted while reading {repo} (resets at {})",
                    reset_at.map(|t| t.to_string()).unwrap_or_else(|| "?".into())
                ),
                Some(n) => tracing::debug!("code-hosting rate limit remaining: {n}"),
                None => {}
            }

            if status == StatusCode::TOO_MANY_REQUESTS
                || (status == StatusCode::FORBIDDEN && remaining == Some(0))
            {
                return Err(SyncError::RateLimited {
                    service: SERVICE,
                    reset_at,
                });
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(upstream(
                    SERVICE,
                    format!("{repo}: HTTP {status}: {}", body.trim()),
                ));
            }

            let page: Vec<Collaborator> = resp
                .json()
                .await
                .map_err(|e| upstream(SERVICE, format!("{repo}: {e}")))?;
            all.extend(page);

            match next_link(&headers) {
                Some(next) => url = next,
                None => return Ok(all),
            }
        }

        tracing::warn!("{repo}: stopped following collaborator pages after {MAX_PAGES}");
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Whether `login` is safe to embed in an authorized-keys directive.
pub fn is_valid_login(login: &str) -> bool {
    !login.is_empty()
        && login
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

pub struct CollaboratorResolver {
    source: Arc<dyn CollaboratorSource>,
    policy: AccessPolicy,
    concurrency: usize,
    timeout: Duration,
}

impl CollaboratorResolver {
    pub fn new(
        source: Arc<dyn CollaboratorSource>,
        policy: AccessPolicy,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            policy,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Authorized users of `app`, in the order the source returned them.
    ///
    /// Collaborators whose role fails the policy, or whose login is not a
    /// plain identifier, are dropped. Duplicate logins keep the first entry.
    pub async fn resolve(&self, app: &Application) -> Result<Vec<AuthorizedUser>, SyncError> {
        let collaborators = tokio::time::timeout(self.timeout, self.source.collaborators(&app.id))
            .await
            .map_err(|_| {
                upstream(
                    SERVICE,
                    format!("{}: timed out after {:?}", app.id, self.timeout),
                )
            })??;

        let mut users: Vec<AuthorizedUser> = Vec::new();
        for collaborator in collaborators {
            if !is_valid_login(&collaborator.login.0) {
                tracing::warn!(
                    "{}: ignoring collaborator with unusable login {:?}",
                    app.id,
                    collaborator.login.0
                );
                continue;
            }
            if !self.policy.allows(&app.ssh_user, &collaborator.role_name) {
                tracing::debug!(
                    "{}: {} ({}) not allowed on {}",
                    app.id,
                    collaborator.login,
                    collaborator.role_name,
                    app.ssh_user
                );
                continue;
            }
            if users.iter().any(|u| u.login == collaborator.login) {
                continue;
            }
            users.push(AuthorizedUser::from(collaborator));
        }
        Ok(users)
    }

    /// Resolve every application with at most `concurrency` requests in
    /// flight. Every application gets an entry; failures yield an empty list.
    pub async fn resolve_all(&self, apps: &[Application]) -> BTreeMap<SshUser, Vec<AuthorizedUser>> {
        let lookups: Vec<_> = apps
            .iter()
            .map(|app| async move { (app.ssh_user.clone(), self.resolve(app).await) })
            .collect();
        let results: Vec<(SshUser, Result<Vec<AuthorizedUser>, SyncError>)> = stream::iter(lookups)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        results
            .into_iter()
            .map(|(ssh_user, result)| {
                let users = match result {
                    Ok(users) => users,
                    Err(err) if err.is_rate_limited() => {
                        tracing::warn!("{ssh_user}: collaborator lookup throttled: {err}");
                        Vec::new()
                    }
                    Err(err) => {
                        tracing::warn!("{ssh_user}: collaborator lookup failed: {err}");
                        Vec::new()
                    }
                };
                (ssh_user, users)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{collaborator, FakeCollaborators};
    use k8gate_core::Container;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app(ssh_user: &str, repo: &str) -> Application {
        Application {
            id: RepoId::from(repo),
            ssh_user: SshUser::from(ssh_user),
            namespace: "apps".into(),
            containers: vec![Container {
                pod_name: format!("{ssh_user}-pod"),
                container_name: "web".into(),
            }],
            users: vec![],
        }
    }

    fn resolver(source: Arc<FakeCollaborators>, concurrency: usize) -> CollaboratorResolver {
        CollaboratorResolver::new(
            source,
            AccessPolicy::default(),
            concurrency,
            Duration::from_secs(10),
        )
    }

    fn logins(users: &[AuthorizedUser]) -> Vec<&str> {
        users.iter().map(|u| u.login.0.as_str()).collect()
    }

    #[tokio::test]
    async fn production_tier_only_admits_production_roles() {
        let source = Arc::new(FakeCollaborators::default());
        source.set(
            "acme/blog",
            vec![collaborator("alice", "admin"), collaborator("bob", "write")],
        );
        let r = resolver(source, 3);

        let prod = r.resolve(&app("blog.production", "acme/blog")).await.unwrap();
        assert_eq!(logins(&prod), ["alice"]);

        let staging = r.resolve(&app("blog.staging", "acme/blog")).await.unwrap();
        assert_eq!(logins(&staging), ["alice", "bob"]);
    }

    #[tokio::test]
    async fn disallowed_roles_and_bad_logins_are_dropped() {
        let source = Arc::new(FakeCollaborators::default());
        source.set(
            "acme/blog",
            vec![
                collaborator("carol", "read"),
                collaborator("dave", "triage"),
                collaborator("eve\"x", "admin"),
                collaborator("zed", "maintain"),
                collaborator("zed", "admin"),
            ],
        );
        let users = resolver(source, 3)
            .resolve(&app("blog-ssh", "acme/blog"))
            .await
            .unwrap();
        assert_eq!(logins(&users), ["zed"]);
        assert_eq!(users[0].role, "maintain");
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_others() {
        let source = Arc::new(FakeCollaborators::default());
        source.fail("acme/a");
        source.rate_limit("acme/b");
        source.set("acme/c", vec![collaborator("alice", "admin")]);

        let all = resolver(source.clone(), 2)
            .resolve_all(&[app("a", "acme/a"), app("b", "acme/b"), app("c", "acme/c")])
            .await;
        assert_eq!(all.len(), 3);
        assert!(all[&SshUser::from("a")].is_empty());
        assert!(all[&SshUser::from("b")].is_empty());
        assert_eq!(logins(&all[&SshUser::from("c")]), ["alice"]);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn fan_out_respects_concurrency_limit() {
        let source = Arc::new(FakeCollaborators::default());
        source.set_delay(Duration::from_millis(20));
        let apps: Vec<_> = (0..8)
            .map(|i| app(&format!("app-{i}"), &format!("acme/app-{i}")))
            .collect();

        resolver(source.clone(), 3).resolve_all(&apps).await;
        assert_eq!(source.calls(), 8);
        assert!(source.max_in_flight() <= 3, "in flight: {}", source.max_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out_as_upstream_unavailable() {
        let source = Arc::new(FakeCollaborators::default());
        source.set_delay(Duration::from_secs(30));
        let r = CollaboratorResolver::new(
            source,
            AccessPolicy::default(),
            3,
            Duration::from_secs(1),
        );
        let err = r.resolve(&app("blog-ssh", "acme/blog")).await.unwrap_err();
        assert!(matches!(err, SyncError::UpstreamUnavailable { .. }));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn link_header_next_target() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            "<https://api.github.com/x?page=2>; rel=\"next\", <https://api.github.com/x?page=5>; rel=\"last\""
                .parse()
                .unwrap(),
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("https://api.github.com/x?page=2")
        );

        headers.insert(LINK, "<https://api.github.com/x?page=1>; rel=\"prev\"".parse().unwrap());
        assert!(next_link(&headers).is_none());
    }

    #[tokio::test]
    async fn github_client_follows_pagination() {
        let server = MockServer::start().await;
        let page2 = format!("{}/repos/acme/blog/collaborators?per_page=100&page=2", server.uri());
        Mock::given(method("GET"))
            .and(path("/repos/acme/blog/collaborators"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"login": "bob", "role_name": "write", "permissions": {"push": true}}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/blog/collaborators"))
            .and(query_param("per_page", "100"))
            .and(header("authorization", "Bearer ghp_test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("link", format!("<{page2}>; rel=\"next\"").as_str())
                    .insert_header("x-ratelimit-remaining", "4999")
                    .set_body_json(json!([
                        {"login": "alice", "role_name": "admin", "permissions": {"admin": true}}
                    ])),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let client = GitHubCollaborators::new(Client::new(), server.uri(), "ghp_test");
        let collaborators = client
            .collaborators(&RepoId::from("acme/blog"))
            .await
            .unwrap();
        let got: Vec<_> = collaborators.iter().map(|c| c.login.0.as_str()).collect();
        assert_eq!(got, ["alice", "bob"]);
        assert!(collaborators[0].permissions.admin);
    }

    #[tokio::test]
    async fn exhausted_quota_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-ratelimit-reset", "1700000000"),
            )
            .mount(&server)
            .await;

        let client = GitHubCollaborators::new(Client::new(), server.uri(), "t");
        let err = client
            .collaborators(&RepoId::from("acme/blog"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::RateLimited {
                reset_at: Some(1_700_000_000),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn forbidden_with_quota_left_is_upstream_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "10")
                    .set_body_string("Resource not accessible"),
            )
            .mount(&server)
            .await;

        let client = GitHubCollaborators::new(Client::new(), server.uri(), "t");
        let err = client
            .collaborators(&RepoId::from("acme/blog"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UpstreamUnavailable { .. }));
    }
}
