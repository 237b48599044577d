//! Commands answered by the running daemon over its Unix socket.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use k8gate_core::Config;
use k8gate_daemon::paths::socket_path;
use k8gate_daemon::{request, request_connection_string, request_status, request_stop, DaemonError};

/// Arguments for `k8gate status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `k8gate apps` and `k8gate users`.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `k8gate connection-string`.
#[derive(Args, Debug)]
pub struct ConnectionStringArgs {
    /// SSH user or pod name.
    pub user: String,
}

#[derive(Debug, Deserialize)]
struct StatusView {
    started_at: DateTime<Utc>,
    state_backend: String,
    snapshot_synced_at: Option<DateTime<Utc>>,
    scheduler: SchedulerView,
}

#[derive(Debug, Deserialize)]
struct SchedulerView {
    state: String,
    fingerprint: Option<String>,
    cycles: u64,
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AppView {
    ssh_user: String,
    repository: String,
    namespace: String,
    ssh: String,
    pods: Vec<String>,
    users: Vec<String>,
}

#[derive(Tabled)]
struct AppRow {
    #[tabled(rename = "SSH USER")]
    ssh_user: String,
    #[tabled(rename = "REPOSITORY")]
    repository: String,
    #[tabled(rename = "NAMESPACE")]
    namespace: String,
    #[tabled(rename = "PODS")]
    pods: usize,
    #[tabled(rename = "USERS")]
    users: usize,
    #[tabled(rename = "CONNECT")]
    ssh: String,
}

impl StatusArgs {
    pub fn run(self, config: &Config) -> Result<()> {
        let status = match request_status(&config.run_dir) {
            Ok(status) => status,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let payload = serde_json::json!({
                    "running": false,
                    "socket": socket_path(&config.run_dir).display().to_string(),
                });
                if self.json {
                    print_json(&payload)?;
                } else {
                    println!("{} daemon is not running", "■".bright_black().bold());
                }
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            return print_json(&status);
        }
        let view: StatusView =
            serde_json::from_value(status).context("unexpected daemon status payload")?;
        print_status(&view);
        Ok(())
    }
}

fn print_status(view: &StatusView) {
    let indicator = match (view.scheduler.state.as_str(), &view.scheduler.last_error) {
        ("syncing", _) => "■".yellow().bold(),
        (_, Some(_)) => "■".red().bold(),
        _ => "■".green().bold(),
    };
    println!(
        "{indicator} k8gate v{} | {} | {} backend | {} cycles",
        env!("CARGO_PKG_VERSION"),
        view.scheduler.state.to_uppercase(),
        view.state_backend,
        view.scheduler.cycles,
    );
    println!("  started      {}", format_age(Some(view.started_at)));
    println!("  last sync    {}", format_age(view.scheduler.last_sync_at));
    println!("  snapshot     {}", format_age(view.snapshot_synced_at));
    let fingerprint = view
        .scheduler
        .fingerprint
        .as_deref()
        .map(|f| f.get(..12).unwrap_or(f))
        .unwrap_or("none");
    println!("  fingerprint  {fingerprint}");
    if let Some(err) = &view.scheduler.last_error {
        println!("  last error   {}", err.red());
    }
}

fn format_age(at: Option<DateTime<Utc>>) -> String {
    let Some(at) = at else {
        return "never".to_string();
    };
    let secs = (Utc::now() - at).num_seconds().max(0);
    let age = match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        _ => format!("{}h ago", secs / 3600),
    };
    format!("{} ({age})", at.format("%Y-%m-%d %H:%M:%S UTC"))
}

pub fn apps(config: &Config, args: ListArgs) -> Result<()> {
    let data = request(&config.run_dir, "apps").context("failed to list applications")?;
    if args.json {
        return print_json(&data);
    }
    let apps: Vec<AppView> =
        serde_json::from_value(data).context("unexpected daemon apps payload")?;
    if apps.is_empty() {
        println!("No applications discovered.");
        return Ok(());
    }
    let rows: Vec<AppRow> = apps
        .into_iter()
        .map(|app| AppRow {
            ssh_user: app.ssh_user,
            repository: app.repository,
            namespace: app.namespace,
            pods: app.pods.len(),
            users: app.users.len(),
            ssh: app.ssh,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

pub fn users(config: &Config, args: ListArgs) -> Result<()> {
    let data = request(&config.run_dir, "users").context("failed to list users")?;
    if args.json {
        return print_json(&data);
    }
    let Value::Object(users) = data else {
        anyhow::bail!("unexpected daemon users payload");
    };
    if users.is_empty() {
        println!("No authorized users.");
        return Ok(());
    }
    for (login, repos) in users {
        let repos: Vec<&str> = repos
            .as_array()
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        println!("{}  {}", login.bold(), repos.join(", "));
    }
    Ok(())
}

impl ConnectionStringArgs {
    pub fn run(self, config: &Config) -> Result<()> {
        let connection = request_connection_string(&config.run_dir, &self.user)
            .with_context(|| format!("no connection string for '{}'", self.user))?;
        println!("{connection}");
        Ok(())
    }
}

pub fn stop(config: &Config) -> Result<()> {
    match request_stop(&config.run_dir) {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON")?
    );
    Ok(())
}
