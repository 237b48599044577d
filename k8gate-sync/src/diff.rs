//! Dry-run unified diff support for `k8gate diff`.

use std::path::PathBuf;

use similar::TextDiff;

use crate::authorized_keys::KeyFileClaims;
use crate::engine::{EngineSettings, SyncPlan};
use crate::error::SyncError;
use crate::writer::read_existing;

/// A single artifact diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: PathBuf,
    pub unified_diff: String,
}

/// Compare every artifact `plan` would write with what is on disk.
///
/// Key sets that compiled empty are never written, so they never diff. A
/// key file shared by several applications diffs against its first owner.
pub fn diff_plan(settings: &EngineSettings, plan: &SyncPlan) -> Result<Vec<FileDiff>, SyncError> {
    let mut targets: Vec<(PathBuf, String)> = Vec::new();
    let mut claims = KeyFileClaims::new();
    for app in plan.applications() {
        let Some(lines) = plan.key_lines.get(&app.ssh_user).filter(|l| !l.is_empty()) else {
            continue;
        };
        let content = lines.join("\n");
        for path in claims.claim(&settings.keys_dir, app, true) {
            targets.push((path, content.clone()));
        }
    }
    targets.push((settings.account_file.clone(), plan.account_content.clone()));

    let mut diffs = Vec::new();
    for (path, rendered) in targets {
        let rendered = rendered.replace("\r\n", "\n");
        let existing = read_existing(&path)?.unwrap_or_default();
        if existing == rendered {
            continue;
        }
        let old_header = format!("a/{}", path.display());
        let new_header = format!("b/{}", path.display());
        let unified = TextDiff::from_lines(&existing, &rendered)
            .unified_diff()
            .header(&old_header, &new_header)
            .context_radius(3)
            .to_string();
        diffs.push(FileDiff {
            path,
            unified_diff: unified,
        });
    }
    Ok(diffs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::Utc;
    use k8gate_core::{Application, Container, RepoId, Snapshot, SshUser};
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> EngineSettings {
        EngineSettings {
            keys_dir: dir.path().join("keys"),
            account_file: dir.path().join("passwd"),
            account_template: "alpine.passwords".into(),
            template_dir: None,
            legacy_snapshot_path: None,
        }
    }

    fn plan(lines: &[&str], account: &str) -> SyncPlan {
        let app = Application {
            id: RepoId::new("acme", "blog"),
            ssh_user: SshUser::from("blog-ssh"),
            namespace: "apps".into(),
            containers: vec![Container {
                pod_name: "blog-1".into(),
                container_name: "web".into(),
            }],
            users: vec![],
        };
        let mut key_lines = BTreeMap::new();
        key_lines.insert(
            app.ssh_user.clone(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
        SyncPlan {
            snapshot: Snapshot::new(vec![app], Utc::now()),
            key_lines,
            account_content: account.to_string(),
        }
    }

    #[test]
    fn missing_files_diff_against_empty() {
        let dir = TempDir::new().unwrap();
        let diffs = diff_plan(&settings(&dir), &plan(&["k1"], "root:x:0:0\n")).unwrap();
        assert_eq!(diffs.len(), 3);
        assert!(diffs[0].unified_diff.contains("+k1"));
        assert!(diffs[2].path.ends_with("passwd"));
    }

    #[test]
    fn up_to_date_files_produce_no_diff() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        std::fs::create_dir_all(&s.keys_dir).unwrap();
        std::fs::write(s.keys_dir.join("blog-ssh"), "k1").unwrap();
        std::fs::write(s.keys_dir.join("blog-1"), "k1").unwrap();
        std::fs::write(&s.account_file, "root:x:0:0\n").unwrap();

        let diffs = diff_plan(&s, &plan(&["k1"], "root:x:0:0\n")).unwrap();
        assert!(diffs.is_empty(), "{diffs:?}");
    }

    #[test]
    fn empty_key_sets_are_not_diffed() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        std::fs::write(&s.account_file, "root\n").unwrap();
        let diffs = diff_plan(&s, &plan(&[], "root\n")).unwrap();
        assert!(diffs.is_empty());
    }

    #[test]
    fn changed_key_shows_hunk() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        std::fs::create_dir_all(&s.keys_dir).unwrap();
        std::fs::write(s.keys_dir.join("blog-ssh"), "old").unwrap();

        let diffs = diff_plan(&s, &plan(&["new"], "")).unwrap();
        let d = diffs
            .iter()
            .find(|d| d.path.ends_with("blog-ssh"))
            .expect("blog-ssh diff");
        assert!(d.unified_diff.contains("@@"));
        assert!(d.unified_diff.contains("-old"));
        assert!(d.unified_diff.contains("+new"));
    }
}
