//! Host model and transport contracts
//!
//! Hosts live in an index-addressed table owned by the cluster model; every
//! other component refers to a host through its [`HostId`]. This keeps a
//! single authoritative copy of each host record, so mutations such as
//! marking a host inactive are visible everywhere.

pub mod runner;
pub mod ssh;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::Error;

pub use runner::HostRunner;

#[cfg(test)]
pub use runner::MockHostRunner;

/// Index of a host in the cluster's host table
pub type HostId = usize;

/// Role a host plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Consensus store replica
    Etcd,
    /// Control plane services (API server, controller manager, scheduler)
    #[serde(rename = "controlplane")]
    ControlPlane,
    /// Workload node
    Worker,
}

/// A cluster node, classified at load time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// Public address used for SSH and as the host's identity
    pub address: String,
    /// Address used for intra-cluster traffic (defaults to `address`)
    #[serde(default)]
    pub internal_address: String,
    /// Kubernetes node name override (defaults to `address`)
    #[serde(default)]
    pub hostname_override: String,
    /// Path to the SSH key used to reach this host
    #[serde(default)]
    pub ssh_key_path: String,
    /// Roles this host fills
    #[serde(rename = "role")]
    pub roles: Vec<Role>,
}

impl Host {
    /// Whether this host fills the given role
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// SSH tunnel contract
///
/// The transport layer is a collaborator; the engine only needs to know
/// whether a host can be reached so it can be marked inactive.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Establish a tunnel to the host, returning an error if unreachable
    async fn dial(&self, host: &Host) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(address: &str, roles: Vec<Role>) -> Host {
        Host {
            address: address.to_string(),
            internal_address: address.to_string(),
            hostname_override: address.to_string(),
            ssh_key_path: String::new(),
            roles,
        }
    }

    #[test]
    fn test_role_membership() {
        let h = host("10.0.0.1", vec![Role::Etcd, Role::ControlPlane]);
        assert!(h.has_role(Role::Etcd));
        assert!(h.has_role(Role::ControlPlane));
        assert!(!h.has_role(Role::Worker));
    }

    /// Roles deserialize from the declarative config's lowercase names
    #[test]
    fn test_role_names_match_config_format() {
        let parsed: Vec<Role> =
            serde_yaml::from_str("[controlplane, worker, etcd]").unwrap();
        assert_eq!(parsed, vec![Role::ControlPlane, Role::Worker, Role::Etcd]);
    }
}
