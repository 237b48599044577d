//! Authorized-Keys Compiler.
//!
//! Each line is `environment="ENV_VARS=<ns> <pod> -c <container>;<login>"`,
//! three spaces, then the raw key. The same content is written under the
//! application's SSH user and under every backing pod name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8gate_core::{Application, KeysByLogin, Login, SshUser};

use crate::writer::{atomic_write, WriteResult};

/// The `environment="..."` directive for `login` on `app`.
pub fn environment_prefix(app: &Application, login: &Login) -> String {
    format!(
        "environment=\"ENV_VARS={};{}\"",
        app.connection_target(),
        login
    )
}

/// One line per (authorized user × key), users in application order and
/// keys in fetch order.
pub fn compile(app: &Application, keys: &KeysByLogin) -> Vec<String> {
    app.users
        .iter()
        .flat_map(|user| {
            let prefix = environment_prefix(app, &user.login);
            keys.get(&user.login)
                .into_iter()
                .flatten()
                .map(move |key| format!("{prefix}   {key}"))
        })
        .collect()
}

/// File targets for `app`: the SSH user first, then each distinct pod name.
pub fn key_file_paths(keys_dir: &Path, app: &Application) -> Vec<PathBuf> {
    let mut names: Vec<&str> = vec![app.ssh_user.0.as_str()];
    for container in &app.containers {
        if !names.contains(&container.pod_name.as_str()) {
            names.push(&container.pod_name);
        }
    }
    names.into_iter().map(|n| keys_dir.join(n)).collect()
}

/// Owners of the key files written in one cycle.
///
/// Two applications can map to the same file: a pod name shared across
/// namespaces, or an SSH user equal to another application's pod. The first
/// application with keys to write keeps the file.
#[derive(Debug, Default)]
pub struct KeyFileClaims {
    owners: BTreeMap<PathBuf, SshUser>,
}

impl KeyFileClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key file paths of `app` that no earlier application owns.
    ///
    /// Paths are claimed only when `has_keys` is set; an application whose
    /// key set compiled empty writes nothing and so owns nothing.
    pub fn claim(&mut self, keys_dir: &Path, app: &Application, has_keys: bool) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for path in key_file_paths(keys_dir, app) {
            if let Some(owner) = self.owners.get(&path) {
                tracing::warn!(
                    "{} ({}): key file {} already written for {owner}, skipping",
                    app.ssh_user,
                    app.id,
                    path.display()
                );
                continue;
            }
            if has_keys {
                self.owners.insert(path.clone(), app.ssh_user.clone());
            }
            paths.push(path);
        }
        paths
    }
}

/// Write `lines` to each of `paths` on behalf of `app`.
///
/// An empty line set writes nothing: existing files are kept and reported
/// as [`WriteResult::KeptPrevious`]. A path that cannot be written is
/// reported as [`WriteResult::Failed`] and the remaining paths still go out.
pub fn write_key_files(
    paths: &[PathBuf],
    app: &Application,
    lines: &[String],
    dry_run: bool,
) -> Vec<WriteResult> {
    if lines.is_empty() {
        tracing::warn!(
            "{} ({}): no authorized keys compiled, keeping previous key files",
            app.ssh_user,
            app.id
        );
        return paths
            .iter()
            .map(|path| WriteResult::KeptPrevious { path: path.clone() })
            .collect();
    }

    let content = lines.join("\n");
    paths
        .iter()
        .map(|path| match atomic_write(path, &content, dry_run) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!("{} ({}): {err}", app.ssh_user, app.id);
                WriteResult::Failed {
                    path: path.clone(),
                    reason: err.to_string(),
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8gate_core::{AuthorizedUser, Container, Permissions, RepoId, SshUser};
    use tempfile::TempDir;

    fn user(login: &str) -> AuthorizedUser {
        AuthorizedUser {
            login: Login::from(login),
            role: "admin".into(),
            permissions: Permissions::default(),
        }
    }

    fn app(users: &[&str]) -> Application {
        Application {
            id: RepoId::new("acme", "blog"),
            ssh_user: SshUser::from("blog-ssh"),
            namespace: "apps".into(),
            containers: vec![
                Container {
                    pod_name: "blog-1".into(),
                    container_name: "wordpress".into(),
                },
                Container {
                    pod_name: "blog-2".into(),
                    container_name: "wordpress".into(),
                },
            ],
            users: users.iter().map(|l| user(l)).collect(),
        }
    }

    fn keys(entries: &[(&str, &[&str])]) -> KeysByLogin {
        entries
            .iter()
            .map(|(login, keys)| {
                (
                    Login::from(*login),
                    keys.iter().map(|k| k.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn lines_follow_user_order_then_key_order() {
        let lines = compile(
            &app(&["zed", "alice"]),
            &keys(&[("alice", &["ssh-rsa A1"]), ("zed", &["ssh-rsa Z1", "ssh-rsa Z2"])]),
        );
        assert_eq!(
            lines,
            [
                "environment=\"ENV_VARS=apps blog-1 -c wordpress;zed\"   ssh-rsa Z1",
                "environment=\"ENV_VARS=apps blog-1 -c wordpress;zed\"   ssh-rsa Z2",
                "environment=\"ENV_VARS=apps blog-1 -c wordpress;alice\"   ssh-rsa A1",
            ]
        );
    }

    #[test]
    fn users_without_keys_contribute_nothing() {
        let lines = compile(&app(&["alice", "bob"]), &keys(&[("alice", &["ssh-rsa A1"])]));
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn paths_cover_ssh_user_and_each_pod_once() {
        let mut a = app(&[]);
        a.containers.push(Container {
            pod_name: "blog-1".into(),
            container_name: "sidecar".into(),
        });
        let dir = Path::new("/keys");
        assert_eq!(
            key_file_paths(dir, &a),
            [dir.join("blog-ssh"), dir.join("blog-1"), dir.join("blog-2")]
        );
    }

    #[test]
    fn identical_content_lands_in_every_file() {
        let tmp = TempDir::new().unwrap();
        let lines = vec!["a   k1".to_string(), "a   k2".to_string()];
        let a = app(&["alice"]);
        let results = write_key_files(&key_file_paths(tmp.path(), &a), &a, &lines, false);
        assert_eq!(results.len(), 3);
        for name in ["blog-ssh", "blog-1", "blog-2"] {
            let content = std::fs::read_to_string(tmp.path().join(name)).unwrap();
            assert_eq!(content, "a   k1\na   k2");
        }
    }

    #[test]
    fn empty_lines_keep_previous_files() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("blog-ssh");
        std::fs::write(&target, "previous").unwrap();

        let a = app(&["alice"]);
        let results = write_key_files(&key_file_paths(tmp.path(), &a), &a, &[], false);
        assert!(results
            .iter()
            .all(|r| matches!(r, WriteResult::KeptPrevious { .. })));
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "previous");
        assert!(!tmp.path().join("blog-1").exists());
    }

    #[test]
    fn unwritable_path_fails_alone() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("blog-1")).unwrap();

        let a = app(&["alice"]);
        let lines = vec!["a   k1".to_string()];
        let results = write_key_files(&key_file_paths(tmp.path(), &a), &a, &lines, false);

        assert!(matches!(&results[1], WriteResult::Failed { path, .. } if path.ends_with("blog-1")));
        assert!(results[0].is_written());
        assert!(results[2].is_written());
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("blog-2")).unwrap(),
            "a   k1"
        );
    }

    #[test]
    fn shared_path_goes_to_first_application_with_keys() {
        let dir = Path::new("/keys");
        let first = app(&["alice"]);
        let mut second = app(&["bob"]);
        second.ssh_user = SshUser::from("shop-ssh");
        second.namespace = "staging".into();

        let mut claims = KeyFileClaims::new();
        assert_eq!(claims.claim(dir, &first, true).len(), 3);
        assert_eq!(claims.claim(dir, &second, true), [dir.join("shop-ssh")]);
    }

    #[test]
    fn empty_key_set_claims_nothing() {
        let dir = Path::new("/keys");
        let empty = app(&[]);
        let mut later = app(&["bob"]);
        later.ssh_user = SshUser::from("shop-ssh");

        let mut claims = KeyFileClaims::new();
        assert_eq!(claims.claim(dir, &empty, false).len(), 3);
        assert_eq!(
            claims.claim(dir, &later, true),
            [dir.join("shop-ssh"), dir.join("blog-1"), dir.join("blog-2")]
        );
    }
}
