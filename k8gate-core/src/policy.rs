//! Two-tier collaborator access policy.
//!
//! An application whose SSH user contains `.<production_branch>` is a
//! production deployment and only admits `production_roles`. Every other
//! application admits `general_roles`.

use serde::{Deserialize, Serialize};

use crate::types::SshUser;

pub const DEFAULT_GENERAL_ROLES: &str = "admin,maintain,write";
pub const DEFAULT_PRODUCTION_ROLES: &str = "admin";
pub const DEFAULT_PRODUCTION_BRANCH: &str = "production";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub general_roles: Vec<String>,
    pub production_roles: Vec<String>,
    pub production_branch: String,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            general_roles: parse_roles(DEFAULT_GENERAL_ROLES),
            production_roles: parse_roles(DEFAULT_PRODUCTION_ROLES),
            production_branch: DEFAULT_PRODUCTION_BRANCH.to_string(),
        }
    }
}

impl AccessPolicy {
    /// Whether `ssh_user` names a production deployment.
    pub fn is_production(&self, ssh_user: &SshUser) -> bool {
        !self.production_branch.is_empty()
            && ssh_user.0.contains(&format!(".{}", self.production_branch))
    }

    /// Whether a collaborator holding `role` may reach `ssh_user`.
    pub fn allows(&self, ssh_user: &SshUser, role: &str) -> bool {
        let roles = if self.is_production(ssh_user) {
            &self.production_roles
        } else {
            &self.general_roles
        };
        roles.iter().any(|r| r == role)
    }
}

/// Split a comma-separated role list, trimming whitespace and dropping blanks.
pub fn parse_roles(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}
