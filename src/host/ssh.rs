//! SSH-tunneled Docker runner
//!
//! The production [`HostRunner`] implementation. Every operation shells out
//! to `ssh` and drives the Docker CLI on the remote host; file deploys and
//! snapshot commands run inside short-lived helper containers so nothing but
//! Docker and an SSH daemon is required on the node.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cluster::S3BackupBackend;
use crate::host::{Dialer, Host, HostRunner};
use crate::Error;

/// Directory snapshots are written to on each consensus-store host
pub const SNAPSHOT_DIR: &str = "/opt/kevel/etcd-snapshots";

/// Number of healthcheck polls before a restart is considered failed
const HEALTHCHECK_ATTEMPTS: u32 = 30;

/// Delay between healthcheck polls
const HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Runs Docker commands on cluster hosts over SSH
pub struct SshDockerRunner {
    /// SSH user for all hosts
    user: String,
    /// Per-host SSH key paths, keyed by address
    keys: HashMap<String, String>,
    /// Run commands directly instead of through SSH
    local: bool,
}

impl SshDockerRunner {
    /// Build a runner for the given hosts
    pub fn new(hosts: &[Host], user: impl Into<String>) -> Self {
        let keys = hosts
            .iter()
            .map(|h| (h.address.clone(), h.ssh_key_path.clone()))
            .collect();
        Self {
            user: user.into(),
            keys,
            local: false,
        }
    }

    /// Build a runner driving the local Docker daemon, bypassing SSH
    pub fn local() -> Self {
        Self {
            user: String::new(),
            keys: HashMap::new(),
            local: true,
        }
    }

    fn ssh_base(&self, address: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new");
        if let Some(key) = self.keys.get(address) {
            if !key.is_empty() {
                cmd.arg("-i").arg(key);
            }
        }
        cmd.arg(format!("{}@{}", self.user, address));
        cmd
    }

    /// Run a remote command, optionally feeding stdin, and return stdout
    async fn exec(
        &self,
        address: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<String, Error> {
        debug!(host = address, command = ?args, "running remote command");
        let mut cmd = if self.local {
            let (program, rest) = args
                .split_first()
                .ok_or_else(|| Error::host("empty command"))?;
            let mut c = Command::new(program);
            c.args(rest);
            c
        } else {
            let mut c = self.ssh_base(address);
            c.args(args);
            c
        };
        cmd.stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::host(format!("failed to reach host [{}]: {}", address, e)))?;

        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| Error::host(format!("no stdin pipe for host [{}]", address)))?;
            pipe.write_all(input.as_bytes()).await?;
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::host(format!("command failed on host [{}]: {}", address, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::host(format!(
                "remote command on [{}] exited with {}: {}",
                address, output.status, stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn docker(&self, address: &str, args: &[&str]) -> Result<String, Error> {
        let mut full: Vec<String> = vec!["docker".to_string()];
        full.extend(args.iter().map(|s| s.to_string()));
        self.exec(address, &full, None).await
    }
}

#[async_trait]
impl HostRunner for SshDockerRunner {
    async fn run_container(
        &self,
        address: &str,
        name: &str,
        image: &str,
        command: &[String],
        env: &[String],
    ) -> Result<(), Error> {
        // A stale container with the same name blocks the new one
        if let Err(e) = self.docker(address, &["rm", "-f", name]).await {
            debug!(host = address, container = name, error = %e, "no container to replace");
        }
        let mut args = vec!["run", "-d", "--restart=always", "--name", name];
        let env_flags: Vec<String> = env.iter().map(|e| format!("-e={}", e)).collect();
        for flag in &env_flags {
            args.push(flag.as_str());
        }
        args.push(image);
        for part in command {
            args.push(part.as_str());
        }
        self.docker(address, &args).await?;
        Ok(())
    }

    async fn remove_container(&self, address: &str, name: &str) -> Result<(), Error> {
        self.docker(address, &["rm", "-f", name]).await?;
        Ok(())
    }

    async fn deploy_file(
        &self,
        address: &str,
        image: &str,
        path: &str,
        contents: &str,
    ) -> Result<(), Error> {
        let mut args: Vec<String> = [
            "docker",
            "run",
            "--rm",
            "-i",
            "-v",
            "/etc/kubernetes:/etc/kubernetes",
            image,
            "sh",
            "-c",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(format!("cat > {}", path));
        self.exec(address, &args, Some(contents)).await?;
        Ok(())
    }

    async fn healthcheck_restart(&self, address: &str, service: &str) -> Result<(), Error> {
        self.docker(address, &["restart", service]).await?;
        for attempt in 1..=HEALTHCHECK_ATTEMPTS {
            let state = self
                .docker(address, &["inspect", "-f", "{{.State.Running}}", service])
                .await?;
            if state.trim() == "true" {
                return Ok(());
            }
            warn!(
                host = address,
                service, attempt, "service not healthy yet, waiting"
            );
            tokio::time::sleep(HEALTHCHECK_INTERVAL).await;
        }
        Err(Error::host(format!(
            "service [{}] on host [{}] failed to become healthy after restart",
            service, address
        )))
    }

    async fn clean_host(&self, address: &str, image: &str) -> Result<(), Error> {
        let cleanup = [
            "run",
            "--rm",
            "--name",
            "kevel-cleaner",
            "-v",
            "/etc/kubernetes:/etc/kubernetes",
            "-v",
            "/var/lib/etcd:/var/lib/etcd",
            image,
            "sh",
            "-c",
            "rm -rf /etc/kubernetes/* /var/lib/etcd/*",
        ];
        self.docker(address, &cleanup).await?;
        Ok(())
    }

    async fn etcd_snapshot_save(
        &self,
        address: &str,
        image: &str,
        name: &str,
    ) -> Result<(), Error> {
        let save = format!(
            "etcdctl snapshot save {}/{}",
            SNAPSHOT_DIR, name
        );
        let args = [
            "run",
            "--rm",
            "--name",
            "etcd-snapshot-save",
            "--network=host",
            "-v",
            "/opt/kevel:/opt/kevel",
            image,
            "sh",
            "-c",
            save.as_str(),
        ];
        self.docker(address, &args).await?;
        Ok(())
    }

    async fn etcd_snapshot_download(
        &self,
        address: &str,
        image: &str,
        name: &str,
        backend: &S3BackupBackend,
    ) -> Result<(), Error> {
        let mut args: Vec<String> = [
            "docker",
            "run",
            "--rm",
            "--name",
            "etcd-snapshot-download",
            "-v",
            "/opt/kevel:/opt/kevel",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        for env in [
            format!("S3_ENDPOINT={}", backend.endpoint),
            format!("S3_ACCESS_KEY={}", backend.access_key),
            format!("S3_SECRET_KEY={}", backend.secret_key),
            format!("S3_BUCKET_NAME={}", backend.bucket_name),
            format!("S3_REGION={}", backend.region),
        ] {
            args.push("-e".to_string());
            args.push(env);
        }
        for tail in [image, "etcd-backup", "download", "--name", name, "--dir", SNAPSHOT_DIR] {
            args.push(tail.to_string());
        }
        self.exec(address, &args, None).await?;
        Ok(())
    }

    async fn etcd_snapshot_checksum(
        &self,
        address: &str,
        image: &str,
        path: &str,
    ) -> Result<String, Error> {
        let sum = format!("md5sum {}", path);
        let args = [
            "run",
            "--rm",
            "--name",
            "etcd-snapshot-checksum",
            "-v",
            "/opt/kevel:/opt/kevel",
            image,
            "sh",
            "-c",
            sum.as_str(),
        ];
        let output = self.docker(address, &args).await?;
        output
            .split_whitespace()
            .next()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                Error::host(format!(
                    "empty checksum output for [{}] on host [{}]",
                    path, address
                ))
            })
    }

    async fn etcd_snapshot_restore(
        &self,
        address: &str,
        image: &str,
        path: &str,
        initial_cluster: &str,
    ) -> Result<(), Error> {
        let restore = format!(
            "etcdctl snapshot restore {} --initial-cluster {} --data-dir /var/lib/etcd",
            path, initial_cluster
        );
        let args = [
            "run",
            "--rm",
            "--name",
            "etcd-snapshot-restore",
            "-v",
            "/opt/kevel:/opt/kevel",
            "-v",
            "/var/lib/etcd:/var/lib/etcd",
            image,
            "sh",
            "-c",
            restore.as_str(),
        ];
        self.docker(address, &args).await?;
        Ok(())
    }
}

#[async_trait]
impl Dialer for SshDockerRunner {
    async fn dial(&self, host: &Host) -> Result<(), Error> {
        self.exec(
            &host.address,
            &["true".to_string()],
            None,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Role;

    fn host(address: &str, key: &str) -> Host {
        Host {
            address: address.to_string(),
            internal_address: address.to_string(),
            hostname_override: address.to_string(),
            ssh_key_path: key.to_string(),
            roles: vec![Role::Worker],
        }
    }

    #[test]
    fn test_keys_are_indexed_by_address() {
        let runner = SshDockerRunner::new(
            &[host("10.0.0.1", "/keys/a"), host("10.0.0.2", "/keys/b")],
            "root",
        );
        assert_eq!(runner.keys["10.0.0.1"], "/keys/a");
        assert_eq!(runner.keys["10.0.0.2"], "/keys/b");
    }

    /// Unreachable hosts produce a host error, not a panic
    #[tokio::test]
    async fn test_unreachable_host_is_host_error() {
        let runner = SshDockerRunner::new(&[], "root");
        // ssh to an invalid address fails fast with BatchMode
        let result = runner
            .exec("256.256.256.256", &["true".to_string()], None)
            .await;
        assert!(matches!(result, Err(Error::Host(_))));
    }
}
