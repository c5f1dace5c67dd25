//! End-to-end convergence of a cluster toward its declared configuration
//!
//! One `converge` run loads the recorded state, parses the cluster file,
//! reconciles membership and encryption against the previous run, deploys
//! the planes, and records the new state. The flow is resumable: state is
//! saved after the desired cluster is settled and again once the deployed
//! cluster matches it.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cluster::{
    encryption, reconcile, Cluster, ClusterConfig, EncryptionManager, PendingAction,
    ReconcileDeps,
};
use crate::host::{Dialer, HostRunner};
use crate::k8s::KubeApi;
use crate::pki::PkiProvider;
use crate::services::PlaneDeployer;
use crate::state::StateStore;
use crate::Error;

/// Flags that shape a convergence run
#[derive(Clone, Copy, Debug, Default)]
pub struct ConvergeOptions {
    /// Only refresh the worker plane, leaving etcd and the control plane
    /// containers untouched
    pub update_only: bool,
    /// Converge the local machine as a single all-role node
    pub local: bool,
    /// Skip the pre-flight host reachability probe
    pub disable_port_check: bool,
}

/// Collaborators a convergence run drives
pub struct ConvergeDeps {
    /// Remote command execution on cluster hosts
    pub runner: Arc<dyn HostRunner>,
    /// Reachability probing before any host is acted on
    pub dialer: Arc<dyn Dialer>,
    /// Cluster API access
    pub kube: Arc<dyn KubeApi>,
    /// Certificate and kubeconfig generation
    pub pki: Arc<dyn PkiProvider>,
    /// Plane deployment
    pub deployer: Arc<dyn PlaneDeployer>,
}

/// Converge the cluster described by the config file at `config_path`
pub async fn converge(
    config_path: &Path,
    options: ConvergeOptions,
    deps: &ConvergeDeps,
) -> Result<(), Error> {
    info!(config = %config_path.display(), "building cluster");
    let store = StateStore::for_config(config_path);
    let mut state = store.load()?;

    let cluster_file = std::fs::read_to_string(config_path)?;
    let mut config = ClusterConfig::parse(&cluster_file)?;
    if options.local {
        config.localize();
    }
    let mut desired = Cluster::new(config, config_path)?;

    // Certificates survive across runs; regenerating them would invalidate
    // every deployed component at once.
    if state.desired_state.certificates_bundle.is_empty() {
        desired.certificates = deps
            .pki
            .generate_certificates(&desired.config.cluster_name)?;
    } else {
        desired.certificates = state.desired_state.certificates_bundle.clone();
    }

    if desired.is_encryption_enabled() {
        desired.encryption_provider_file = if desired.is_encryption_custom_config() {
            encryption::render_custom_provider_file(&cluster_file)?
        } else {
            state.desired_state.encryption_provider_file.clone()
        };
    }

    let current = if state.current_state.is_empty() {
        None
    } else {
        Some(Cluster::from_plan(&state.current_state, config_path)?)
    };

    if !options.disable_port_check {
        desired.tunnel_hosts(Arc::clone(&deps.dialer)).await?;
    }

    let reconcile_deps = ReconcileDeps {
        runner: Arc::clone(&deps.runner),
        kube: Arc::clone(&deps.kube),
        pki: Arc::clone(&deps.pki),
    };
    reconcile::reconcile(&mut desired, current.as_ref(), &reconcile_deps).await?;

    let manager = EncryptionManager::new(Arc::clone(&deps.runner), Arc::clone(&deps.kube));
    manager.reconcile(&mut desired, current.as_ref()).await?;
    // Deploy the provider document (generated or user-supplied) before the
    // control plane starts with the provider flag pointing at it.
    if desired.is_encryption_enabled() {
        manager.ensure_provider_file(&mut desired).await?;
    }

    // Desired state is settled; record it before mutating the cluster so a
    // failed deploy can resume from the same plan.
    state.desired_state = desired.to_plan();
    store.save(&state)?;

    if options.update_only {
        info!("update-only run, skipping etcd and control plane");
    } else {
        deps.deployer.deploy_etcd_plane(&desired).await?;
        deps.deployer.deploy_control_plane(&desired).await?;
    }
    deps.deployer.deploy_worker_plane(&desired).await?;

    // Deferred from encryption reconciliation: the API had to come up first.
    if desired.take_pending_action() == Some(PendingAction::RewriteSecrets) {
        manager.rewrite_secrets().await?;
    }

    state.current_state = desired.to_plan();
    store.save(&state)?;

    if !desired.inactive_hosts.is_empty() {
        let failures: Vec<Error> = desired
            .inactive_hosts
            .iter()
            .map(|&id| Error::host(format!("host [{}] was unreachable", desired.host(id).address)))
            .collect();
        warn!(count = failures.len(), "converged with unreachable hosts");
        return Err(Error::aggregate("converging cluster", failures));
    }

    info!(
        kubeconfig = %desired.local_kubeconfig_path.display(),
        "cluster converged"
    );
    Ok(())
}
