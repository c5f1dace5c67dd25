//! Reconciliation between the recorded and the desired cluster
//!
//! Compares the current cluster state against the desired one and removes
//! hosts that left the configuration: their node objects are deleted from
//! the API, their plane containers are torn down, and the worker-side API
//! proxy is rebalanced when the control plane membership changed.
//!
//! Consensus-store membership is deliberately not handled here; removing an
//! etcd host requires a quorum-aware protocol and is out of scope for plain
//! host-delta reconciliation.

use std::sync::Arc;

use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::host::{Host, HostRunner};
use crate::k8s::KubeApi;
use crate::pki::PkiProvider;
use crate::services;
use crate::{Error, KUBE_API_PORT};

/// Collaborators the reconciler drives
pub struct ReconcileDeps {
    /// Remote command execution on cluster hosts
    pub runner: Arc<dyn HostRunner>,
    /// Cluster API access for node and secret objects
    pub kube: Arc<dyn KubeApi>,
    /// Certificate and kubeconfig generation
    pub pki: Arc<dyn PkiProvider>,
}

/// Hosts present in `current` but absent from `desired`, matched by address
fn hosts_to_delete(current: &[&Host], desired: &[&Host]) -> Vec<Host> {
    current
        .iter()
        .filter(|c| !desired.iter().any(|d| d.address == c.address))
        .map(|h| (*h).clone())
        .collect()
}

/// Reconcile the desired cluster against the recorded current one
///
/// A first run (no current cluster) is a no-op. Node-object deletion
/// failures are accumulated and reported together at the end; container
/// teardown on departing hosts is best-effort and only logged, since the
/// host may already be unreachable.
pub async fn reconcile(
    desired: &mut Cluster,
    current: Option<&Cluster>,
    deps: &ReconcileDeps,
) -> Result<(), Error> {
    let Some(current) = current else {
        info!("no current cluster state, skipping reconciliation");
        return Ok(());
    };
    info!("reconciling cluster membership");

    // The recorded admin config may point at a control plane host that is
    // gone. Rebuild it against a live host before any API call.
    let first = desired
        .first_control_plane()
        .ok_or_else(|| Error::validation("cluster has no control plane host"))?;
    let endpoint = format!("https://{}:{}", first.address, KUBE_API_PORT);
    let admin_config = deps.pki.rebuild_admin_config(&endpoint, &desired.certificates)?;
    deps.pki
        .write_admin_config(&admin_config, &desired.local_kubeconfig_path)?;

    let mut failures = Vec::new();
    let alpine = desired.config.system_images.alpine.clone();

    let cp_to_delete = hosts_to_delete(&current.control_plane(), &desired.control_plane());
    for host in &cp_to_delete {
        remove_host(deps, host, &alpine, &mut failures, true).await;
    }

    let wp_to_delete = hosts_to_delete(&current.workers(), &desired.workers());
    for host in &wp_to_delete {
        remove_host(deps, host, &alpine, &mut failures, false).await;
    }

    // Workers proxy API traffic through a local nginx whose backend list is
    // the control plane addresses, in order. Any membership or ordering
    // change invalidates every worker's proxy config.
    let current_cp: Vec<&str> = current.control_plane().iter().map(|h| h.address.as_str()).collect();
    let desired_cp: Vec<&str> = desired.control_plane().iter().map(|h| h.address.as_str()).collect();
    if current_cp != desired_cp {
        info!("control plane membership changed, updating worker API proxies");
        services::rolling_update_nginx_proxy(
            deps.runner.as_ref(),
            &desired.control_plane(),
            &desired.workers(),
            &desired.config.system_images.nginx_proxy,
        )
        .await?;
    }

    if failures.is_empty() {
        info!("cluster membership reconciled");
        Ok(())
    } else {
        Err(Error::aggregate("removing departed hosts", failures))
    }
}

/// Remove one departed host: node object first, then containers
async fn remove_host(
    deps: &ReconcileDeps,
    host: &Host,
    alpine_image: &str,
    failures: &mut Vec<Error>,
    control_plane: bool,
) {
    let plane = if control_plane { "controlplane" } else { "worker" };
    info!(host = %host.address, plane, "removing departed host");

    if let Err(e) = deps.kube.delete_node(&host.hostname_override).await {
        warn!(host = %host.address, error = %e, "failed to delete node object");
        failures.push(Error::host(format!(
            "failed to delete node [{}]: {}",
            host.hostname_override, e
        )));
    }

    // Best-effort teardown: the host may already be gone.
    let cleanup = async {
        if control_plane {
            services::remove_control_plane(deps.runner.as_ref(), host).await?;
        } else {
            services::remove_worker_plane(deps.runner.as_ref(), host).await?;
        }
        deps.runner.clean_host(&host.address, alpine_image).await
    };
    if let Err(e) = cleanup.await {
        warn!(host = %host.address, error = %e, "cleanup of departed host failed, continuing");
    }
}
