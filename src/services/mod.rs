//! Plane-level service helpers
//!
//! Thin operations over the [`HostRunner`] contract that the convergence
//! engine needs: health-checked API server restarts, rolling updates of the
//! control plane proxy, plane teardown during host cleanup, and the
//! consensus-store initial-cluster string. The per-service container spec
//! builders themselves are collaborators behind [`PlaneDeployer`].

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::cluster::Cluster;
use crate::host::{Host, HostRunner};
use crate::{Error, ETCD_PEER_PORT};

/// Consensus store service/container name
pub const ETCD_SERVICE: &str = "etcd";

/// API server service/container name
pub const KUBE_API_SERVICE: &str = "kube-api";

/// Controller manager service/container name
pub const KUBE_CONTROLLER_SERVICE: &str = "kube-controller";

/// Scheduler service/container name
pub const SCHEDULER_SERVICE: &str = "scheduler";

/// Kubelet service/container name
pub const KUBELET_SERVICE: &str = "kubelet";

/// Kube-proxy service/container name
pub const KUBE_PROXY_SERVICE: &str = "kube-proxy";

/// Control plane proxy container name
pub const NGINX_PROXY_SERVICE: &str = "nginx-proxy";

/// Environment variable the proxy reads its backend list from
pub const NGINX_PROXY_ENV_NAME: &str = "CP_HOSTS";

/// Services that make up the control plane on a host
pub const CONTROL_PLANE_SERVICES: [&str; 3] =
    [KUBE_API_SERVICE, KUBE_CONTROLLER_SERVICE, SCHEDULER_SERVICE];

/// Services that make up the worker plane on a host
pub const WORKER_PLANE_SERVICES: [&str; 3] =
    [KUBELET_SERVICE, KUBE_PROXY_SERVICE, NGINX_PROXY_SERVICE];

/// Plane deployer collaborator contract
///
/// Brings service planes up or refreshes them in place. Implementations own
/// the per-service container command assembly, which the engine never
/// inspects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlaneDeployer: Send + Sync {
    /// Bring up or refresh the consensus store plane
    async fn deploy_etcd_plane(&self, cluster: &Cluster) -> Result<(), Error>;

    /// Bring up or refresh the control plane
    async fn deploy_control_plane(&self, cluster: &Cluster) -> Result<(), Error>;

    /// Bring up or refresh the worker plane
    async fn deploy_worker_plane(&self, cluster: &Cluster) -> Result<(), Error>;
}

/// Restart the API server on every control plane host, blocking on health
pub async fn restart_kube_api_with_healthcheck(
    runner: &dyn HostRunner,
    control_plane_hosts: &[&Host],
) -> Result<(), Error> {
    for host in control_plane_hosts {
        info!(host = %host.address, "restarting API server");
        runner
            .healthcheck_restart(&host.address, KUBE_API_SERVICE)
            .await?;
    }
    Ok(())
}

/// Roll the control plane proxy on every worker host
///
/// Runs after node deletions so the proxy never points at a host that was
/// just removed. The full control plane list is passed through the proxy's
/// environment.
pub async fn rolling_update_nginx_proxy(
    runner: &dyn HostRunner,
    control_plane_hosts: &[&Host],
    worker_hosts: &[&Host],
    proxy_image: &str,
) -> Result<(), Error> {
    let backends: Vec<String> = control_plane_hosts
        .iter()
        .map(|h| h.internal_address.clone())
        .collect();
    let env = vec![format!("{}={}", NGINX_PROXY_ENV_NAME, backends.join(","))];
    for host in worker_hosts {
        info!(host = %host.address, "rolling control plane proxy");
        runner
            .run_container(&host.address, NGINX_PROXY_SERVICE, proxy_image, &[], &env)
            .await?;
    }
    Ok(())
}

/// Stop the control plane services on one host
pub async fn remove_control_plane(runner: &dyn HostRunner, host: &Host) -> Result<(), Error> {
    for service in CONTROL_PLANE_SERVICES {
        runner.remove_container(&host.address, service).await?;
    }
    Ok(())
}

/// Stop the worker plane services on one host
pub async fn remove_worker_plane(runner: &dyn HostRunner, host: &Host) -> Result<(), Error> {
    for service in WORKER_PLANE_SERVICES {
        runner.remove_container(&host.address, service).await?;
    }
    Ok(())
}

/// Build the consensus store initial-cluster string from the current host set
///
/// Restores intentionally use the *current* membership, not whatever hosts
/// the snapshot was originally taken on.
pub fn etcd_initial_cluster(etcd_hosts: &[&Host]) -> String {
    etcd_hosts
        .iter()
        .map(|h| {
            format!(
                "etcd-{}=https://{}:{}",
                h.hostname_override, h.internal_address, ETCD_PEER_PORT
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Default deployer that runs every service as a host-local container
pub struct ContainerDeployer {
    runner: Arc<dyn HostRunner>,
}

impl ContainerDeployer {
    /// Create a deployer over the given host runner
    pub fn new(runner: Arc<dyn HostRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl PlaneDeployer for ContainerDeployer {
    async fn deploy_etcd_plane(&self, cluster: &Cluster) -> Result<(), Error> {
        let hosts = cluster.etcd();
        let initial_cluster = etcd_initial_cluster(&hosts);
        for host in &hosts {
            info!(host = %host.address, "deploying consensus store");
            let command = vec![
                "/usr/local/bin/etcd".to_string(),
                format!("--name=etcd-{}", host.hostname_override),
                format!(
                    "--listen-peer-urls=https://{}:{}",
                    host.internal_address, ETCD_PEER_PORT
                ),
                format!(
                    "--initial-advertise-peer-urls=https://{}:{}",
                    host.internal_address, ETCD_PEER_PORT
                ),
                format!("--initial-cluster={}", initial_cluster),
                "--data-dir=/var/lib/etcd".to_string(),
            ];
            self.runner
                .run_container(
                    &host.address,
                    ETCD_SERVICE,
                    &cluster.config.system_images.etcd,
                    &command,
                    &[],
                )
                .await?;
        }
        Ok(())
    }

    async fn deploy_control_plane(&self, cluster: &Cluster) -> Result<(), Error> {
        let image = &cluster.config.system_images.kubernetes;
        for host in cluster.control_plane() {
            info!(host = %host.address, "deploying control plane");
            let mut api_command = vec![
                "kube-apiserver".to_string(),
                format!("--advertise-address={}", host.internal_address),
                format!("--secure-port={}", crate::KUBE_API_PORT),
            ];
            let ip_range = &cluster.config.services.kube_api.service_cluster_ip_range;
            if !ip_range.is_empty() {
                api_command.push(format!("--service-cluster-ip-range={}", ip_range));
            }
            if cluster.encryption_provider_file.is_some() {
                api_command.push(format!(
                    "--encryption-provider-config={}",
                    crate::ENCRYPTION_PROVIDER_FILE_PATH
                ));
            }
            self.runner
                .run_container(&host.address, KUBE_API_SERVICE, image, &api_command, &[])
                .await?;
            self.runner
                .run_container(
                    &host.address,
                    KUBE_CONTROLLER_SERVICE,
                    image,
                    &["kube-controller-manager".to_string()],
                    &[],
                )
                .await?;
            self.runner
                .run_container(
                    &host.address,
                    SCHEDULER_SERVICE,
                    image,
                    &["kube-scheduler".to_string()],
                    &[],
                )
                .await?;
        }
        Ok(())
    }

    async fn deploy_worker_plane(&self, cluster: &Cluster) -> Result<(), Error> {
        let image = &cluster.config.system_images.kubernetes;
        let control_plane_hosts = cluster.control_plane();
        for host in cluster.workers() {
            info!(host = %host.address, "deploying worker plane");
            // workers reach the API through their local proxy
            if !host.has_role(crate::host::Role::ControlPlane) {
                rolling_update_nginx_proxy(
                    self.runner.as_ref(),
                    &control_plane_hosts,
                    &[host],
                    &cluster.config.system_images.nginx_proxy,
                )
                .await?;
            }
            let kubelet_command = vec![
                "kubelet".to_string(),
                format!("--hostname-override={}", host.hostname_override),
                format!("--node-ip={}", host.internal_address),
            ];
            self.runner
                .run_container(&host.address, KUBELET_SERVICE, image, &kubelet_command, &[])
                .await?;
            self.runner
                .run_container(
                    &host.address,
                    KUBE_PROXY_SERVICE,
                    image,
                    &["kube-proxy".to_string()],
                    &[],
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MockHostRunner, Role};
    use mockall::predicate::*;

    fn host(address: &str, internal: &str) -> Host {
        Host {
            address: address.to_string(),
            internal_address: internal.to_string(),
            hostname_override: address.to_string(),
            ssh_key_path: String::new(),
            roles: vec![Role::Etcd],
        }
    }

    /// The initial-cluster string is derived from current membership
    #[test]
    fn test_etcd_initial_cluster_format() {
        let a = host("10.0.0.1", "172.16.0.1");
        let b = host("10.0.0.2", "172.16.0.2");
        let s = etcd_initial_cluster(&[&a, &b]);
        assert_eq!(
            s,
            "etcd-10.0.0.1=https://172.16.0.1:2380,etcd-10.0.0.2=https://172.16.0.2:2380"
        );
    }

    #[test]
    fn test_etcd_initial_cluster_single_host() {
        let a = host("10.0.0.1", "10.0.0.1");
        assert_eq!(
            etcd_initial_cluster(&[&a]),
            "etcd-10.0.0.1=https://10.0.0.1:2380"
        );
    }

    /// Story: A proxy roll touches every worker host with the full backend list
    #[tokio::test]
    async fn story_proxy_roll_targets_all_workers() {
        let cp = host("10.0.0.1", "172.16.0.1");
        let w1 = host("10.0.0.5", "172.16.0.5");
        let w2 = host("10.0.0.6", "172.16.0.6");

        let mut runner = MockHostRunner::new();
        runner
            .expect_run_container()
            .withf(|_, name, image, _, env| {
                name == NGINX_PROXY_SERVICE
                    && image == "nginx:test"
                    && env.len() == 1
                    && env[0] == "CP_HOSTS=172.16.0.1"
            })
            .times(2)
            .returning(|_, _, _, _, _| Ok(()));

        rolling_update_nginx_proxy(&runner, &[&cp], &[&w1, &w2], "nginx:test")
            .await
            .unwrap();
    }

    /// A restart failure on any control plane host aborts the pass
    #[tokio::test]
    async fn test_restart_stops_on_first_failure() {
        let a = host("10.0.0.1", "10.0.0.1");
        let b = host("10.0.0.2", "10.0.0.2");

        let mut runner = MockHostRunner::new();
        runner
            .expect_healthcheck_restart()
            .with(eq("10.0.0.1"), eq(KUBE_API_SERVICE))
            .times(1)
            .returning(|_, _| Err(Error::host("restart timed out")));
        // 10.0.0.2 must never be touched

        let result = restart_kube_api_with_healthcheck(&runner, &[&a, &b]).await;
        assert!(matches!(result, Err(Error::Host(_))));
    }
}
