//! Workload fingerprint used by the change detector.
//!
//! Pure function of the discovered units: independent of listing order and
//! of anything but the fields that feed application discovery.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use k8gate_core::WorkloadUnit;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Fingerprint {
    pub fn of(units: &[WorkloadUnit]) -> Self {
        let mut lines: Vec<String> = units
            .iter()
            .map(|u| {
                format!(
                    "{}/{}|{}|{}|{}|{}",
                    u.namespace,
                    u.pod_name(),
                    u.app_name().unwrap_or_default(),
                    u.ssh_user().map(|s| s.0).unwrap_or_default(),
                    u.repo_id(),
                    u.containers.join(","),
                )
            })
            .collect();
        lines.sort();

        let mut h = Sha256::new();
        for line in &lines {
            h.update(line.as_bytes());
            h.update(b"\n");
        }
        Fingerprint(hex::encode(h.finalize()))
    }

    /// First 12 hex digits, for logs.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}
