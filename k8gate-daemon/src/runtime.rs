use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::MissedTickBehavior;

use k8gate_core::{Config, Snapshot};
use k8gate_sync::{pipeline, FileDiff, SyncEngine, SyncOutcome, SNAPSHOT_KEY};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::scheduler::{Scheduler, SchedulerStatus, SharedSnapshot, SharedStatus};

/// Environment variable selecting `json` log output.
pub const LOG_FORMAT_ENV: &str = "K8GATE_LOG_FORMAT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub run_dir: PathBuf,
    pub poll_interval: Duration,
    pub ssh_host: String,
}

impl From<&Config> for RuntimeOptions {
    fn from(config: &Config) -> Self {
        Self {
            run_dir: config.run_dir.clone(),
            poll_interval: config.poll_interval(),
            ssh_host: config.ssh_host.clone(),
        }
    }
}

/// Everything the socket server answers from. Never triggers a cycle.
#[derive(Clone)]
struct ReadModel {
    snapshot: SharedSnapshot,
    status: SharedStatus,
    ssh_host: String,
    socket: PathBuf,
    backend: &'static str,
    started_at: DateTime<Utc>,
}

/// Validate `config`, start the daemon runtime and block until it exits.
pub fn start_blocking(config: Config) -> Result<(), DaemonError> {
    init_tracing();
    config.validate()?;
    runtime()?.block_on(run(config))
}

/// One cycle outside the daemon, for `k8gate sync`.
pub fn sync_once_blocking(config: &Config, dry_run: bool) -> Result<SyncOutcome, DaemonError> {
    init_tracing();
    config.validate()?;
    let engine = pipeline::build_engine(config)?;
    runtime()?.block_on(async {
        let outcome = if dry_run {
            engine.sync_dry_run().await?
        } else {
            engine.initialize().await?;
            engine.sync().await?
        };
        Ok::<_, DaemonError>(outcome)
    })
}

/// Unified diffs of what the next cycle would write, for `k8gate diff`.
pub fn diff_blocking(config: &Config) -> Result<Vec<FileDiff>, DaemonError> {
    init_tracing();
    config.validate()?;
    let engine = pipeline::build_engine(config)?;
    Ok(runtime()?.block_on(engine.diff())?)
}

fn runtime() -> Result<tokio::runtime::Runtime, DaemonError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))
}

/// Run the daemon against the real cluster and code-hosting services.
pub async fn run(config: Config) -> Result<(), DaemonError> {
    let engine = Arc::new(pipeline::build_engine(&config)?);
    run_with_engine(engine, RuntimeOptions::from(&config)).await
}

/// Run the scheduler, the socket server, the state watcher and the signal
/// handler until any of them asks for shutdown.
pub async fn run_with_engine(
    engine: Arc<SyncEngine>,
    options: RuntimeOptions,
) -> Result<(), DaemonError> {
    if !options.run_dir.exists() {
        fs::create_dir_all(&options.run_dir).map_err(|e| io_err(&options.run_dir, e))?;
    }

    if let Err(err) = engine.initialize().await {
        tracing::warn!(
            backend = engine.store().name(),
            error = %err,
            "state store initialization failed, snapshots may fall back"
        );
    }
    let seeded = match engine.load_snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::warn!(error = %err, "could not load last snapshot");
            None
        }
    };
    if let Some(snapshot) = &seeded {
        tracing::info!(
            applications = snapshot.applications.len(),
            synced_at = %snapshot.synced_at,
            "serving last persisted snapshot"
        );
    }

    let snapshot: SharedSnapshot = Arc::new(RwLock::new(seeded));
    let status: SharedStatus = Arc::new(RwLock::new(SchedulerStatus::default()));
    let model = ReadModel {
        snapshot: snapshot.clone(),
        status: status.clone(),
        ssh_host: options.ssh_host.clone(),
        socket: socket_path(&options.run_dir),
        backend: engine.store().name(),
        started_at: Utc::now(),
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let scheduler = Scheduler::new(engine.clone(), status, snapshot.clone());
        let period = options.poll_interval;
        tokio::spawn(async move {
            let result = scheduler_task(scheduler, period, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(model, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watch_handle = {
        let shutdown = shutdown_tx.clone();
        let engine = engine.clone();
        tokio::spawn(async move { state_watch_task(engine, snapshot, shutdown.subscribe()).await })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move { signal_task(shutdown).await })
    };

    let (scheduler_result, socket_result, watch_result, signal_result) =
        tokio::join!(scheduler_handle, socket_handle, watch_handle, signal_handle);

    handle_join("scheduler", scheduler_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("state_watch", watch_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

async fn scheduler_task(
    mut scheduler: Scheduler,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    // Ticks that fire during a long cycle are dropped, not queued.
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                scheduler.tick().await;
            }
        }
    }
    Ok(())
}

async fn state_watch_task(
    engine: Arc<SyncEngine>,
    snapshot: SharedSnapshot,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let store = engine.store();
    if !store.supports_realtime() {
        return Ok(());
    }
    let mut watch = match store.watch_state(SNAPSHOT_KEY).await {
        Ok(watch) => watch,
        Err(err) => {
            tracing::warn!(backend = store.name(), error = %err, "state watch unavailable");
            return Ok(());
        }
    };
    tracing::debug!(backend = store.name(), "watching state store for snapshot changes");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            value = watch.changed() => {
                let Some(value) = value else { break };
                match serde_json::from_value::<Snapshot>(value) {
                    Ok(incoming) => {
                        if replace_if_newer(&snapshot, incoming).await {
                            tracing::info!("snapshot refreshed from state store");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "ignoring malformed snapshot from state store"),
                }
            }
        }
    }
    Ok(())
}

/// Install `incoming` unless the served snapshot is at least as recent.
async fn replace_if_newer(snapshot: &SharedSnapshot, incoming: Snapshot) -> bool {
    let mut guard = snapshot.write().await;
    if guard
        .as_ref()
        .is_some_and(|current| current.synced_at >= incoming.synced_at)
    {
        return false;
    }
    *guard = Some(incoming);
    true
}

async fn signal_task(shutdown: broadcast::Sender<()>) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut shutdown_rx = shutdown.subscribe();
    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down daemon");
            let _ = shutdown.send(());
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("received ctrl-c, shutting down daemon");
                    let _ = shutdown.send(());
                    Ok(())
                }
                Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
            }
        }
    }
}

async fn socket_server_task(
    model: ReadModel,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = model.socket.clone();
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "daemon socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let model = model.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, model, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    model: ReadModel,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = if request.cmd == "stop" {
            tracing::info!("stop requested over socket");
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        } else {
            handle_request(&model, &request).await
        };
        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }
    Ok(())
}

async fn handle_request(model: &ReadModel, request: &DaemonRequest) -> DaemonResponse {
    if request.cmd == "status" {
        return DaemonResponse::ok(build_status_payload(model).await);
    }

    let guard = model.snapshot.read().await;
    let Some(snapshot) = guard.as_ref() else {
        return DaemonResponse::error("no snapshot available yet");
    };

    match request.cmd.as_str() {
        "snapshot" => match serde_json::to_value(snapshot) {
            Ok(value) => DaemonResponse::ok(value),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        "users" => DaemonResponse::ok(json!(snapshot.users)),
        "apps" => DaemonResponse::ok(apps_payload(snapshot, &model.ssh_host)),
        "connection-string" => {
            let Some(user) = request.user.as_deref() else {
                return DaemonResponse::error("connection-string requires a user");
            };
            match snapshot.connection_string(user) {
                Some(connection) => DaemonResponse::ok(json!({
                    "user": user,
                    "connection_string": connection,
                })),
                None => DaemonResponse::error(format!("no application for '{user}'")),
            }
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

fn apps_payload(snapshot: &Snapshot, ssh_host: &str) -> Value {
    let apps: Vec<Value> = snapshot
        .applications
        .values()
        .map(|app| {
            json!({
                "ssh_user": app.ssh_user,
                "repository": app.id,
                "namespace": app.namespace,
                "ssh": format!("ssh {}@{}", app.ssh_user, ssh_host),
                "pods": app.containers.iter().map(|c| c.pod_name.as_str()).collect::<Vec<_>>(),
                "users": app.users.iter().map(|u| &u.login).collect::<Vec<_>>(),
            })
        })
        .collect();
    Value::Array(apps)
}

async fn build_status_payload(model: &ReadModel) -> Value {
    let scheduler = model.status.read().await.clone();
    let synced_at = model
        .snapshot
        .read()
        .await
        .as_ref()
        .map(|snapshot| snapshot.synced_at);
    json!({
        "running": true,
        "started_at": model.started_at,
        "socket": model.socket.display().to_string(),
        "state_backend": model.backend,
        "snapshot_synced_at": synced_at,
        "scheduler": scheduler,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }
    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }
    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Install the global subscriber: `RUST_LOG` filter (default `info`),
/// JSON lines when `K8GATE_LOG_FORMAT=json`. `log` records from the sync
/// layer are forwarded too.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let _ = if json {
        fmt().json().with_env_filter(filter).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::Fixture;
    use crate::protocol;
    use chrono::TimeZone;
    use k8gate_sync::testing::{collaborator, workload};
    use tempfile::TempDir;

    fn model(f: &Fixture) -> ReadModel {
        ReadModel {
            snapshot: f.snapshot.clone(),
            status: f.status.clone(),
            ssh_host: "ssh.example.test".to_string(),
            socket: f.dir.path().join("daemon.sock"),
            backend: "memory",
            started_at: Utc::now(),
        }
    }

    async fn synced(f: &Fixture) -> ReadModel {
        f.workloads.set_units(vec![
            workload("blog-1", "blog", "blog-ssh", "acme/blog"),
            workload("shop-1", "shop", "shop-ssh", "acme/shop"),
        ]);
        f.collaborators
            .set("acme/blog", vec![collaborator("alice", "admin")]);
        f.collaborators.set(
            "acme/shop",
            vec![collaborator("alice", "write"), collaborator("bob", "maintain")],
        );
        f.keys.set("alice", "ssh-ed25519 A");
        f.keys.set("bob", "ssh-ed25519 B");
        f.scheduler().tick().await;
        model(f)
    }

    #[tokio::test]
    async fn read_commands_fail_before_first_snapshot() {
        let f = Fixture::new();
        let response = handle_request(&model(&f), &DaemonRequest::new("apps")).await;
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("no snapshot available yet"));

        let status = handle_request(&model(&f), &DaemonRequest::new("status")).await;
        assert!(status.ok);
        assert_eq!(status.data.unwrap()["scheduler"]["state"], "idle");
    }

    #[tokio::test]
    async fn apps_lists_ssh_command_per_application() {
        let f = Fixture::new();
        let model = synced(&f).await;

        let data = handle_request(&model, &DaemonRequest::new("apps"))
            .await
            .data
            .unwrap();
        let apps = data.as_array().unwrap();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0]["ssh"], "ssh blog-ssh@ssh.example.test");
        assert_eq!(apps[1]["users"], json!(["alice", "bob"]));
    }

    #[tokio::test]
    async fn users_maps_logins_to_repositories() {
        let f = Fixture::new();
        let model = synced(&f).await;

        let data = handle_request(&model, &DaemonRequest::new("users"))
            .await
            .data
            .unwrap();
        assert_eq!(data["alice"], json!(["acme/blog", "acme/shop"]));
        assert_eq!(data["bob"], json!(["acme/shop"]));
    }

    #[tokio::test]
    async fn connection_string_by_ssh_user_and_pod() {
        let f = Fixture::new();
        let model = synced(&f).await;

        let response = handle_request(
            &model,
            &DaemonRequest::for_user("connection-string", "shop-ssh"),
        )
        .await;
        assert_eq!(
            response.data.unwrap()["connection_string"],
            "-n apps exec shop-1"
        );

        let by_pod =
            handle_request(&model, &DaemonRequest::for_user("connection-string", "blog-1")).await;
        assert!(by_pod.ok);

        let unknown =
            handle_request(&model, &DaemonRequest::for_user("connection-string", "nope")).await;
        assert!(!unknown.ok);

        let missing = handle_request(&model, &DaemonRequest::new("connection-string")).await;
        assert_eq!(
            missing.error.as_deref(),
            Some("connection-string requires a user")
        );
    }

    #[tokio::test]
    async fn status_reports_committed_fingerprint() {
        let f = Fixture::new();
        let model = synced(&f).await;

        let data = handle_request(&model, &DaemonRequest::new("status"))
            .await
            .data
            .unwrap();
        assert_eq!(data["state_backend"], "memory");
        assert_eq!(data["scheduler"]["cycles"], 1);
        assert!(data["scheduler"]["fingerprint"].is_string());
        assert_eq!(data["scheduler"]["last_cycle"]["applications"], 2);
        assert!(data["snapshot_synced_at"].is_string());
    }

    #[tokio::test]
    async fn unknown_command_is_an_error() {
        let f = Fixture::new();
        let model = synced(&f).await;
        let response = handle_request(&model, &DaemonRequest::new("sync")).await;
        assert_eq!(response.error.as_deref(), Some("unknown command 'sync'"));
    }

    #[tokio::test]
    async fn older_external_snapshot_is_ignored() {
        let shared: SharedSnapshot = Arc::new(RwLock::new(None));
        let newer = Snapshot::new(vec![], Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
        let older = Snapshot::new(vec![], Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());

        assert!(replace_if_newer(&shared, newer.clone()).await);
        assert!(!replace_if_newer(&shared, older).await);
        assert!(!replace_if_newer(&shared, newer.clone()).await);
        assert_eq!(shared.read().await.as_ref(), Some(&newer));
    }

    #[test]
    fn stale_socket_file_is_removed() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("daemon.sock");
        fs::write(&socket, "").unwrap();
        prepare_socket_for_bind(&socket).unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn daemon_serves_socket_and_stops_on_request() {
        let f = Fixture::new();
        f.blog();
        let run_dir = f.dir.path().join("run");
        let options = RuntimeOptions {
            run_dir: run_dir.clone(),
            poll_interval: Duration::from_secs(3600),
            ssh_host: "ssh.example.test".to_string(),
        };
        let daemon = tokio::spawn(run_with_engine(f.engine(), options));

        let mut apps = None;
        for _ in 0..100 {
            let dir = run_dir.clone();
            let result = tokio::task::spawn_blocking(move || protocol::request(&dir, "apps"))
                .await
                .unwrap();
            if let Ok(value) = result {
                apps = Some(value);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let apps = apps.expect("daemon never served apps");
        assert_eq!(apps[0]["ssh"], "ssh blog-ssh@ssh.example.test");

        let dir = run_dir.clone();
        let connection = tokio::task::spawn_blocking(move || {
            protocol::request_connection_string(&dir, "blog-ssh")
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(connection, "-n apps exec blog-1");

        let dir = run_dir.clone();
        tokio::task::spawn_blocking(move || protocol::request_stop(&dir))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), daemon)
            .await
            .expect("daemon did not stop")
            .unwrap()
            .unwrap();
        assert!(!socket_path(&run_dir).exists());
    }
}
