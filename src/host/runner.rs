//! Container/host runner contract
//!
//! Every host-scoped operation the engine performs - deploying files,
//! restarting services, driving consensus-store snapshots - is a synchronous
//! remote call through this trait. The real implementation tunnels Docker
//! commands over SSH ([`super::ssh::SshDockerRunner`]); tests use the
//! generated mock.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::cluster::S3BackupBackend;
use crate::Error;

/// Host-scoped container runtime operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostRunner: Send + Sync {
    /// Run a named container on the host, replacing any existing one
    async fn run_container(
        &self,
        address: &str,
        name: &str,
        image: &str,
        command: &[String],
        env: &[String],
    ) -> Result<(), Error>;

    /// Remove a named container from the host if present
    async fn remove_container(&self, address: &str, name: &str) -> Result<(), Error>;

    /// Write `contents` to `path` on the host using a lightweight helper container
    async fn deploy_file(
        &self,
        address: &str,
        image: &str,
        path: &str,
        contents: &str,
    ) -> Result<(), Error>;

    /// Restart a service container and block until its healthcheck passes
    async fn healthcheck_restart(&self, address: &str, service: &str) -> Result<(), Error>;

    /// Run the cleanup container to strip kevel state from the host
    async fn clean_host(&self, address: &str, image: &str) -> Result<(), Error>;

    /// Take a local consensus-store snapshot on the host
    async fn etcd_snapshot_save(
        &self,
        address: &str,
        image: &str,
        name: &str,
    ) -> Result<(), Error>;

    /// Download a named snapshot from the backup target onto the host
    async fn etcd_snapshot_download(
        &self,
        address: &str,
        image: &str,
        name: &str,
        backend: &S3BackupBackend,
    ) -> Result<(), Error>;

    /// Compute the checksum of a snapshot file on the host
    async fn etcd_snapshot_checksum(
        &self,
        address: &str,
        image: &str,
        path: &str,
    ) -> Result<String, Error>;

    /// Restore the consensus store on the host from a validated snapshot
    async fn etcd_snapshot_restore(
        &self,
        address: &str,
        image: &str,
        path: &str,
        initial_cluster: &str,
    ) -> Result<(), Error>;
}
