use std::path::{Path, PathBuf};

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn socket_path(run_dir: &Path) -> PathBuf {
    run_dir.join(DAEMON_SOCKET)
}
