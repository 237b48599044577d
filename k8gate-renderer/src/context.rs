//! Template context: serializable rendering payload built from the resolved
//! application set.

use serde::{Deserialize, Serialize};

use k8gate_core::Application;

use crate::error::RenderError;

/// Shared uid/gid of every gateway account.
pub const GATEWAY_UID: u32 = 500;

/// Rendering payload for account templates.
///
/// `applications` carries one entry per application; `accounts` is the
/// flattened list of system account names (each SSH user, then each of its
/// pod names), deduplicated in first-seen order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountContext {
    pub applications: Vec<ApplicationCtx>,
    pub accounts: Vec<AccountCtx>,
    pub uid: u32,
    pub gid: u32,
    pub meta: MetaCtx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationCtx {
    pub id: String,
    pub ssh_user: String,
    pub namespace: String,
    pub containers: Vec<ContainerCtx>,
    /// `<namespace> <pod> -c <container>` of the first container.
    pub connection_target: String,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerCtx {
    pub pod_name: String,
    pub container_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCtx {
    pub name: String,
    pub application: String,
    pub ssh_user: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaCtx {
    pub k8gate_version: String,
    pub application_count: usize,
}

impl AccountContext {
    pub fn from_applications(applications: &[Application]) -> Self {
        let mut accounts: Vec<AccountCtx> = Vec::new();
        let mut push_account = |name: &str, app: &Application| {
            if name.is_empty() || accounts.iter().any(|a| a.name == name) {
                return;
            }
            accounts.push(AccountCtx {
                name: name.to_string(),
                application: app.id.0.clone(),
                ssh_user: app.ssh_user.0.clone(),
                namespace: app.namespace.clone(),
            });
        };

        for app in applications {
            push_account(&app.ssh_user.0, app);
            for container in &app.containers {
                push_account(&container.pod_name, app);
            }
        }

        let applications: Vec<ApplicationCtx> = applications
            .iter()
            .map(|app| ApplicationCtx {
                id: app.id.0.clone(),
                ssh_user: app.ssh_user.0.clone(),
                namespace: app.namespace.clone(),
                containers: app
                    .containers
                    .iter()
                    .map(|c| ContainerCtx {
                        pod_name: c.pod_name.clone(),
                        container_name: c.container_name.clone(),
                    })
                    .collect(),
                connection_target: app.connection_target(),
                users: app.users.iter().map(|u| u.login.0.clone()).collect(),
            })
            .collect();

        AccountContext {
            meta: MetaCtx {
                k8gate_version: env!("CARGO_PKG_VERSION").to_string(),
                application_count: applications.len(),
            },
            applications,
            accounts,
            uid: GATEWAY_UID,
            gid: GATEWAY_UID,
        }
    }

    pub fn to_tera_context(&self) -> Result<tera::Context, RenderError> {
        let value = serde_json::to_value(self)?;
        Ok(tera::Context::from_value(value)?)
    }
}
