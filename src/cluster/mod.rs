//! Cluster model
//!
//! In-memory representation of one cluster configuration plus classified
//! host roles. The host records live in an index-addressed table; the
//! per-role lists hold [`HostId`] entries into that table so every component
//! observes the same host record.

pub mod encryption;
pub mod reconcile;
pub mod snapshot;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::host::{Dialer, Host, HostId, Role};
use crate::pki::{local_kubeconfig_path, CertBundle};
use crate::state::Plan;
use crate::Error;

pub use encryption::{EncryptionKey, EncryptionManager, KeyDocument};
pub use reconcile::{reconcile, ReconcileDeps};
pub use snapshot::SnapshotManager;

/// Default SSH key used when a node does not carry its own
pub const DEFAULT_SSH_KEY_PATH: &str = "~/.ssh/id_rsa";

/// Default SSH user
pub const DEFAULT_SSH_USER: &str = "root";

/// Default helper image for file deploys, cleanup, and snapshot checksums
pub const DEFAULT_ALPINE_IMAGE: &str = "alpine:3.20";

/// Default consensus-store image
pub const DEFAULT_ETCD_IMAGE: &str = "quay.io/coreos/etcd:v3.5.16";

/// Default control plane proxy image
pub const DEFAULT_NGINX_PROXY_IMAGE: &str = "nginx:1.27-alpine";

/// Default image for the kubernetes service containers
pub const DEFAULT_KUBERNETES_IMAGE: &str = "registry.k8s.io/hyperkube:v1.31.4";

/// Default authentication strategy
pub const DEFAULT_AUTH_STRATEGY: &str = "x509";

/// Default network plugin
pub const DEFAULT_NETWORK_PLUGIN: &str = "flannel";

/// Declarative cluster configuration, as parsed from the cluster file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster name used in certificates and state
    pub cluster_name: String,
    /// All nodes with their roles
    pub nodes: Vec<Host>,
    /// Cluster-wide SSH key fallback
    pub ssh_key_path: String,
    /// SSH user for all hosts
    pub ssh_user: String,
    /// Per-role service configuration
    pub services: ServicesConfig,
    /// Network plugin choice and options
    pub network: NetworkConfig,
    /// Image reference overrides
    pub system_images: SystemImages,
    /// Authentication strategy
    pub authentication: AuthnConfig,
}

/// Per-role service configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Consensus store settings
    pub etcd: EtcdConfig,
    /// API server settings
    pub kube_api: KubeApiConfig,
}

/// Consensus store configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    /// Optional remote backup target for snapshots
    pub backup_backend: Option<BackupBackend>,
}

/// Snapshot backup target
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupBackend {
    /// Object-storage backend
    pub s3: Option<S3BackupBackend>,
}

/// Object-storage backup target settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3BackupBackend {
    /// Endpoint URL
    pub endpoint: String,
    /// Access key
    pub access_key: String,
    /// Secret key
    pub secret_key: String,
    /// Bucket name
    pub bucket_name: String,
    /// Region
    pub region: String,
}

/// API server configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeApiConfig {
    /// Virtual IP range for cluster services
    pub service_cluster_ip_range: String,
    /// Secrets-at-rest encryption settings
    pub secrets_encryption: Option<SecretsEncryptionConfig>,
}

/// Secrets-at-rest encryption settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsEncryptionConfig {
    /// Whether encryption at rest is enabled
    pub enabled: bool,
    /// User-supplied provider document, stored opaquely
    pub custom_config: Option<serde_yaml::Value>,
}

/// Network plugin choice and options
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Plugin name
    pub plugin: String,
    /// Free-form plugin options
    pub options: HashMap<String, String>,
}

/// Image reference overrides
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemImages {
    /// Lightweight helper image
    pub alpine: String,
    /// Consensus store image
    pub etcd: String,
    /// Control plane proxy image
    pub nginx_proxy: String,
    /// Image the kubernetes service containers run from
    pub kubernetes: String,
}

/// Authentication strategy
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthnConfig {
    /// Strategy name (x509 only)
    pub strategy: String,
}

impl ClusterConfig {
    /// Parse a declarative cluster file and apply defaults
    pub fn parse(cluster_file: &str) -> Result<Self, Error> {
        let mut config: ClusterConfig = serde_yaml::from_str(cluster_file)?;
        config.apply_defaults();
        Ok(config)
    }

    /// Fill unset fields with cluster-level or built-in defaults
    pub fn apply_defaults(&mut self) {
        set_default(&mut self.ssh_key_path, DEFAULT_SSH_KEY_PATH);
        set_default(&mut self.ssh_user, DEFAULT_SSH_USER);
        set_default(&mut self.system_images.alpine, DEFAULT_ALPINE_IMAGE);
        set_default(&mut self.system_images.etcd, DEFAULT_ETCD_IMAGE);
        set_default(&mut self.system_images.nginx_proxy, DEFAULT_NGINX_PROXY_IMAGE);
        set_default(&mut self.system_images.kubernetes, DEFAULT_KUBERNETES_IMAGE);
        set_default(&mut self.authentication.strategy, DEFAULT_AUTH_STRATEGY);
        set_default(&mut self.network.plugin, DEFAULT_NETWORK_PLUGIN);
        for node in &mut self.nodes {
            if node.internal_address.is_empty() {
                node.internal_address = node.address.clone();
            }
            if node.hostname_override.is_empty() {
                node.hostname_override = node.address.clone();
            }
            if node.ssh_key_path.is_empty() {
                node.ssh_key_path = self.ssh_key_path.clone();
            }
        }
    }

    /// Collapse the node list to the local machine carrying every role
    pub fn localize(&mut self) {
        self.nodes = vec![Host {
            address: "127.0.0.1".to_string(),
            internal_address: "127.0.0.1".to_string(),
            hostname_override: "localhost".to_string(),
            ssh_key_path: String::new(),
            roles: vec![Role::Etcd, Role::ControlPlane, Role::Worker],
        }];
    }
}

fn set_default(field: &mut String, value: &str) {
    if field.is_empty() {
        *field = value.to_string();
    }
}

/// Typed deferred-action marker attached to the in-memory plan
///
/// Set during reconciliation, consumed exactly once by the phase whose
/// precondition (a reachable API server) is satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingAction {
    /// Bulk secret rewrite after the control plane comes up
    RewriteSecrets,
}

/// One cluster: configuration snapshot plus classified host roles
#[derive(Clone, Debug)]
pub struct Cluster {
    /// The declarative configuration this model was built from
    pub config: ClusterConfig,
    /// Host table; all role lists index into this arena
    hosts: Vec<Host>,
    /// Consensus store hosts
    pub etcd_hosts: Vec<HostId>,
    /// Control plane hosts
    pub control_plane_hosts: Vec<HostId>,
    /// Worker hosts
    pub worker_hosts: Vec<HostId>,
    /// Hosts unreachable during the current run
    pub inactive_hosts: Vec<HostId>,
    /// Certificate bundle keyed by logical name
    pub certificates: CertBundle,
    /// Where the admin kubeconfig is written locally
    pub local_kubeconfig_path: PathBuf,
    /// Currently deployed encryption provider document, if any
    pub encryption_provider_file: Option<String>,
    /// Deferred action recorded during reconciliation
    pub pending_action: Option<PendingAction>,
}

impl Cluster {
    /// Build a cluster model from a parsed configuration
    pub fn new(config: ClusterConfig, config_path: &Path) -> Result<Self, Error> {
        let hosts = config.nodes.clone();
        let mut cluster = Self {
            config,
            hosts,
            etcd_hosts: Vec::new(),
            control_plane_hosts: Vec::new(),
            worker_hosts: Vec::new(),
            inactive_hosts: Vec::new(),
            certificates: CertBundle::new(),
            local_kubeconfig_path: local_kubeconfig_path(config_path),
            encryption_provider_file: None,
            pending_action: None,
        };
        cluster.invert_index_hosts();
        cluster.validate()?;
        Ok(cluster)
    }

    /// Rebuild a cluster model from a recorded plan
    pub fn from_plan(plan: &Plan, config_path: &Path) -> Result<Self, Error> {
        let mut cluster = Self::new(plan.cluster_config.clone(), config_path)?;
        cluster.certificates = plan.certificates_bundle.clone();
        cluster.encryption_provider_file = plan.encryption_provider_file.clone();
        Ok(cluster)
    }

    /// Snapshot this cluster into a plan for recording
    pub fn to_plan(&self) -> Plan {
        Plan {
            cluster_config: self.config.clone(),
            certificates_bundle: self.certificates.clone(),
            encryption_provider_file: self.encryption_provider_file.clone(),
        }
    }

    /// Build the per-role inverted index over the host table
    fn invert_index_hosts(&mut self) {
        self.etcd_hosts.clear();
        self.control_plane_hosts.clear();
        self.worker_hosts.clear();
        for (id, host) in self.hosts.iter().enumerate() {
            if host.has_role(Role::Etcd) {
                self.etcd_hosts.push(id);
            }
            if host.has_role(Role::ControlPlane) {
                self.control_plane_hosts.push(id);
            }
            if host.has_role(Role::Worker) {
                self.worker_hosts.push(id);
            }
        }
    }

    /// Enforce the model invariants from the configuration
    fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.address.is_empty() {
                return Err(Error::validation("node with empty address"));
            }
            if !seen.insert(host.address.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate node address [{}]",
                    host.address
                )));
            }
            if host.roles.is_empty() {
                return Err(Error::validation(format!(
                    "node [{}] has no role",
                    host.address
                )));
            }
        }
        if self.etcd_hosts.is_empty() {
            return Err(Error::validation("cluster must have at least one etcd node"));
        }
        if self.control_plane_hosts.is_empty() {
            return Err(Error::validation(
                "cluster must have at least one controlplane node",
            ));
        }
        Ok(())
    }

    /// Look up a host record by id
    pub fn host(&self, id: HostId) -> &Host {
        &self.hosts[id]
    }

    /// All hosts in the table
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Resolve a role list into host records
    pub fn resolve<'a>(&'a self, ids: &[HostId]) -> Vec<&'a Host> {
        ids.iter().map(|&id| &self.hosts[id]).collect()
    }

    /// Consensus store hosts
    pub fn etcd(&self) -> Vec<&Host> {
        self.resolve(&self.etcd_hosts)
    }

    /// Control plane hosts
    pub fn control_plane(&self) -> Vec<&Host> {
        self.resolve(&self.control_plane_hosts)
    }

    /// Worker hosts
    pub fn workers(&self) -> Vec<&Host> {
        self.resolve(&self.worker_hosts)
    }

    /// First control plane host, if any
    pub fn first_control_plane(&self) -> Option<&Host> {
        self.control_plane_hosts.first().map(|&id| &self.hosts[id])
    }

    /// Whether secrets-at-rest encryption is enabled in the configuration
    pub fn is_encryption_enabled(&self) -> bool {
        self.config
            .services
            .kube_api
            .secrets_encryption
            .as_ref()
            .is_some_and(|c| c.enabled)
    }

    /// Whether encryption is enabled with a user-supplied provider document
    pub fn is_encryption_custom_config(&self) -> bool {
        self.is_encryption_enabled()
            && self
                .config
                .services
                .kube_api
                .secrets_encryption
                .as_ref()
                .is_some_and(|c| c.custom_config.is_some())
    }

    /// Dial every host, removing unreachable ones from the role lists
    ///
    /// Unreachable hosts are recorded in `inactive_hosts`; convergence
    /// surfaces them as an error at the end of the run so partial progress
    /// on reachable hosts is not thrown away.
    pub async fn tunnel_hosts(&mut self, dialer: Arc<dyn Dialer>) -> Result<(), Error> {
        let mut inactive = Vec::new();
        for (id, host) in self.hosts.iter().enumerate() {
            if let Err(e) = dialer.dial(host).await {
                warn!(host = %host.address, error = %e, "host unreachable, skipping");
                inactive.push(id);
            }
        }
        if !inactive.is_empty() {
            info!(count = inactive.len(), "removing unreachable hosts from this run");
            self.etcd_hosts.retain(|id| !inactive.contains(id));
            self.control_plane_hosts.retain(|id| !inactive.contains(id));
            self.worker_hosts.retain(|id| !inactive.contains(id));
            self.inactive_hosts = inactive;
        }
        Ok(())
    }

    /// Consume the pending action marker, if set
    pub fn take_pending_action(&mut self) -> Option<PendingAction> {
        self.pending_action.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MockDialer;

    fn node(address: &str, roles: &[Role]) -> Host {
        Host {
            address: address.to_string(),
            internal_address: String::new(),
            hostname_override: String::new(),
            ssh_key_path: String::new(),
            roles: roles.to_vec(),
        }
    }

    fn three_node_config() -> ClusterConfig {
        let mut config = ClusterConfig {
            cluster_name: "test".to_string(),
            nodes: vec![
                node("10.0.0.1", &[Role::Etcd, Role::ControlPlane]),
                node("10.0.0.2", &[Role::ControlPlane, Role::Worker]),
                node("10.0.0.3", &[Role::Worker]),
            ],
            ..Default::default()
        };
        config.apply_defaults();
        config
    }

    /// Story: Parsing a minimal cluster file fills in sane defaults
    #[test]
    fn story_parse_applies_defaults() {
        let config = ClusterConfig::parse(
            r#"
cluster_name: west
nodes:
  - address: 10.0.0.1
    role: [etcd, controlplane]
  - address: 10.0.0.2
    internal_address: 172.16.0.2
    role: [worker]
"#,
        )
        .unwrap();

        assert_eq!(config.ssh_key_path, DEFAULT_SSH_KEY_PATH);
        assert_eq!(config.system_images.alpine, DEFAULT_ALPINE_IMAGE);
        assert_eq!(config.authentication.strategy, DEFAULT_AUTH_STRATEGY);
        // node-level fallbacks
        assert_eq!(config.nodes[0].internal_address, "10.0.0.1");
        assert_eq!(config.nodes[0].hostname_override, "10.0.0.1");
        assert_eq!(config.nodes[0].ssh_key_path, DEFAULT_SSH_KEY_PATH);
        // explicit values win
        assert_eq!(config.nodes[1].internal_address, "172.16.0.2");
    }

    /// Story: The inverted index classifies hosts by role
    ///
    /// Every entry in a role list must resolve to a host in the table;
    /// holding ids instead of copies makes that invariant structural.
    #[test]
    fn story_invert_index_classifies_hosts() {
        let cluster = Cluster::new(three_node_config(), Path::new("cluster.yml")).unwrap();

        let etcd: Vec<&str> = cluster.etcd().iter().map(|h| h.address.as_str()).collect();
        let cp: Vec<&str> = cluster
            .control_plane()
            .iter()
            .map(|h| h.address.as_str())
            .collect();
        let workers: Vec<&str> = cluster
            .workers()
            .iter()
            .map(|h| h.address.as_str())
            .collect();

        assert_eq!(etcd, vec!["10.0.0.1"]);
        assert_eq!(cp, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(workers, vec!["10.0.0.2", "10.0.0.3"]);
        assert_eq!(cluster.first_control_plane().unwrap().address, "10.0.0.1");
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut config = three_node_config();
        config.nodes.push(node("10.0.0.1", &[Role::Worker]));
        config.apply_defaults();
        let result = Cluster::new(config, Path::new("cluster.yml"));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_cluster_requires_etcd_and_control_plane() {
        let mut config = three_node_config();
        config.nodes = vec![node("10.0.0.9", &[Role::Worker])];
        config.apply_defaults();
        let result = Cluster::new(config, Path::new("cluster.yml"));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    /// Encryption predicates distinguish generated from user-supplied config
    #[test]
    fn test_encryption_predicates() {
        let mut config = three_node_config();
        let mut cluster = Cluster::new(config.clone(), Path::new("cluster.yml")).unwrap();
        assert!(!cluster.is_encryption_enabled());
        assert!(!cluster.is_encryption_custom_config());

        config.services.kube_api.secrets_encryption = Some(SecretsEncryptionConfig {
            enabled: true,
            custom_config: None,
        });
        cluster = Cluster::new(config.clone(), Path::new("cluster.yml")).unwrap();
        assert!(cluster.is_encryption_enabled());
        assert!(!cluster.is_encryption_custom_config());

        config.services.kube_api.secrets_encryption = Some(SecretsEncryptionConfig {
            enabled: true,
            custom_config: Some(serde_yaml::from_str("resources: []").unwrap()),
        });
        cluster = Cluster::new(config, Path::new("cluster.yml")).unwrap();
        assert!(cluster.is_encryption_custom_config());
    }

    /// Story: Unreachable hosts drop out of the role lists but stay recorded
    #[tokio::test]
    async fn story_tunnel_marks_unreachable_hosts_inactive() {
        let mut cluster = Cluster::new(three_node_config(), Path::new("cluster.yml")).unwrap();

        let mut dialer = MockDialer::new();
        dialer
            .expect_dial()
            .returning(|host| {
                if host.address == "10.0.0.3" {
                    Err(Error::host("connection refused"))
                } else {
                    Ok(())
                }
            });

        cluster.tunnel_hosts(Arc::new(dialer)).await.unwrap();

        assert_eq!(cluster.inactive_hosts.len(), 1);
        assert_eq!(cluster.host(cluster.inactive_hosts[0]).address, "10.0.0.3");
        let workers: Vec<&str> = cluster
            .workers()
            .iter()
            .map(|h| h.address.as_str())
            .collect();
        assert_eq!(workers, vec!["10.0.0.2"]);
    }
}
