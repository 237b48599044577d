//! k8gate daemon: the change-detecting scheduler, the read-only socket
//! surface over the last snapshot, and signal handling.

mod error;
#[cfg(test)]
mod fixtures;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod scheduler;

pub use error::DaemonError;
pub use protocol::{
    request, request_connection_string, request_status, request_stop, send_request,
    DaemonRequest, DaemonResponse,
};
pub use runtime::{
    diff_blocking, init_tracing, run, run_with_engine, start_blocking, sync_once_blocking,
    RuntimeOptions, LOG_FORMAT_ENV,
};
pub use scheduler::{ChangeDetector, CycleReport, DetectorState, SchedulerStatus, TickOutcome};
