//! Local-file state backend: one JSON document mapping key → value.
//!
//! Saves go through `<path>.k8gate.tmp` + rename so a concurrent reader (or
//! the watcher) sees the old document or the new one, never a torn write.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use super::{io_err, StateStore, StateWatch, StoreError};
use crate::writer::tmp_path;

type Document = BTreeMap<String, Value>;

pub struct LocalStateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<Document, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => parse_document(&contents),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Document::new()),
            Err(err) => Err(io_err(&self.path, err)),
        }
    }

    async fn write_document(&self, doc: &Document) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        let json = serde_json::to_string_pretty(doc)?;
        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(&self.path, e));
        }
        Ok(())
    }
}

fn parse_document(contents: &str) -> Result<Document, StoreError> {
    if contents.trim().is_empty() {
        return Ok(Document::new());
    }
    Ok(serde_json::from_str(contents)?)
}

#[async_trait]
impl StateStore for LocalStateStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| io_err(&self.path, e))?
        {
            // Surface a corrupt document at startup rather than on first save.
            self.read_document().await?;
            return Ok(());
        }
        tracing::info!("creating state file {}", self.path.display());
        self.write_document(&Document::new()).await
    }

    async fn load_state(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut doc = self.read_document().await?;
        Ok(doc.remove(key))
    }

    async fn save_state(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;
        doc.insert(key.to_string(), value.clone());
        self.write_document(&doc).await
    }

    fn supports_realtime(&self) -> bool {
        true
    }

    async fn watch_state(&self, key: &str) -> Result<StateWatch, StoreError> {
        let Some(dir) = self.path.parent().map(Path::to_path_buf) else {
            return Err(StoreError::Backend {
                backend: "local",
                message: format!("{} has no parent directory", self.path.display()),
            });
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err(&dir, e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();
        let key = key.to_string();
        let mut last: Option<Value> = self.load_state(&key).await.ok().flatten();

        let mut watcher = recommended_watcher(move |event: notify::Result<Event>| {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!("state file watcher error: {err}");
                    return;
                }
            };
            if !is_relevant(&event, &path) {
                return;
            }
            let value = match std::fs::read_to_string(&path) {
                Ok(contents) => match parse_document(&contents) {
                    Ok(mut doc) => doc.remove(&key),
                    Err(err) => {
                        tracing::debug!("ignoring unreadable state document: {err}");
                        return;
                    }
                },
                Err(_) => return,
            };
            let Some(value) = value else { return };
            if last.as_ref() == Some(&value) {
                return;
            }
            last = Some(value.clone());
            let _ = tx.send(value);
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(StateWatch::new(rx, Some(Box::new(watcher))))
    }
}

fn is_relevant(event: &Event, path: &Path) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    let target = path.file_name();
    event.paths.iter().any(|p| p.file_name() == target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_loads_as_absent() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::new(dir.path().join("state.json"));
        assert!(store.load_state("snapshot").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn initialize_creates_empty_document_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let store = LocalStateStore::new(&path);
        store.initialize().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "{}");

        store.save_state("snapshot", &json!({"a": 1})).await.unwrap();
        store.initialize().await.unwrap();
        assert_eq!(
            store.load_state("snapshot").await.unwrap(),
            Some(json!({"a": 1}))
        );
    }

    #[tokio::test]
    async fn initialize_rejects_corrupt_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = LocalStateStore::new(&path).initialize().await.unwrap_err();
        assert!(matches!(err, StoreError::Json(_)));
    }

    #[tokio::test]
    async fn save_keeps_other_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::new(dir.path().join("state.json"));
        store.save_state("snapshot", &json!({"v": 1})).await.unwrap();
        store.save_state("other", &json!("x")).await.unwrap();
        store.save_state("snapshot", &json!({"v": 2})).await.unwrap();

        assert_eq!(
            store.load_state("snapshot").await.unwrap(),
            Some(json!({"v": 2}))
        );
        assert_eq!(store.load_state("other").await.unwrap(), Some(json!("x")));
        assert!(!tmp_path(store.path()).exists());
    }

    #[tokio::test]
    async fn watch_reports_saved_value() {
        let dir = TempDir::new().unwrap();
        let store = LocalStateStore::new(dir.path().join("state.json"));
        store.initialize().await.unwrap();

        let mut watch = store.watch_state("snapshot").await.unwrap();
        store.save_state("snapshot", &json!({"v": 7})).await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match watch.changed().await {
                    Some(value) if value == json!({"v": 7}) => return value,
                    Some(_) => continue,
                    None => panic!("watch closed"),
                }
            }
        })
        .await
        .expect("change notification");
        assert_eq!(seen, json!({"v": 7}));
    }
}
