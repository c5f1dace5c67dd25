//! Kevel - SSH-driven Kubernetes cluster provisioning and convergence

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kevel::cluster::{Cluster, ClusterConfig, EncryptionManager, SnapshotManager};
use kevel::converge::{converge, ConvergeDeps, ConvergeOptions};
use kevel::host::ssh::SshDockerRunner;
use kevel::host::HostRunner;
use kevel::k8s::ApiClient;
use kevel::pki::LocalPki;
use kevel::services::ContainerDeployer;
use kevel::state::StateStore;

/// Kevel - bring clusters to their declared configuration over SSH
#[derive(Parser, Debug)]
#[command(name = "kevel", version, about, long_about = None)]
struct Cli {
    /// Path to the cluster configuration file
    #[arg(short = 'f', long = "config", default_value = "cluster.yml", global = true)]
    config_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Converge the cluster to the configuration file
    Up(UpArgs),

    /// Consensus store snapshot operations
    Etcd {
        #[command(subcommand)]
        command: EtcdCommands,
    },

    /// Rotate the secrets encryption key with zero downtime
    RotateEncryptionKey,
}

/// Arguments for `up`
#[derive(Parser, Debug)]
struct UpArgs {
    /// Only refresh the worker plane
    #[arg(long)]
    update_only: bool,

    /// Converge the local machine as a single all-role node, without SSH
    #[arg(long)]
    local: bool,

    /// Skip the pre-flight host reachability probe
    #[arg(long)]
    disable_port_check: bool,
}

#[derive(Subcommand, Debug)]
enum EtcdCommands {
    /// Take a named snapshot on every consensus host
    SnapshotSave {
        /// Snapshot name
        name: String,
    },

    /// Restore a named snapshot across the cluster
    ///
    /// Checksums are compared across every consensus host first; a
    /// divergent snapshot is never restored anywhere.
    SnapshotRestore {
        /// Snapshot name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let cluster_file = std::fs::read_to_string(&cli.config_file)?;
    let config = ClusterConfig::parse(&cluster_file)?;

    match cli.command {
        Commands::Up(args) => {
            let runner: Arc<dyn HostRunner> = if args.local {
                Arc::new(SshDockerRunner::local())
            } else {
                Arc::new(SshDockerRunner::new(&config.nodes, config.ssh_user.as_str()))
            };
            let dialer = if args.local {
                SshDockerRunner::local()
            } else {
                SshDockerRunner::new(&config.nodes, config.ssh_user.as_str())
            };
            let kubeconfig = kevel::pki::local_kubeconfig_path(&cli.config_file);
            let deps = ConvergeDeps {
                runner: Arc::clone(&runner),
                dialer: Arc::new(dialer),
                kube: Arc::new(ApiClient::new(kubeconfig)),
                pki: Arc::new(LocalPki),
                deployer: Arc::new(ContainerDeployer::new(Arc::clone(&runner))),
            };
            let options = ConvergeOptions {
                update_only: args.update_only,
                local: args.local,
                disable_port_check: args.disable_port_check,
            };
            converge(&cli.config_file, options, &deps).await?;
        }
        Commands::Etcd { command } => {
            let runner: Arc<dyn HostRunner> =
                Arc::new(SshDockerRunner::new(&config.nodes, config.ssh_user.as_str()));
            let cluster = Cluster::new(config, &cli.config_file)?;
            let manager = SnapshotManager::new(runner);
            match command {
                EtcdCommands::SnapshotSave { name } => manager.snapshot(&cluster, &name).await?,
                EtcdCommands::SnapshotRestore { name } => manager.restore(&cluster, &name).await?,
            }
        }
        Commands::RotateEncryptionKey => {
            let store = StateStore::for_config(&cli.config_file);
            let mut state = store.load()?;
            if state.desired_state.is_empty() {
                anyhow::bail!("no recorded cluster state; run `kevel up` first");
            }
            let mut cluster = Cluster::from_plan(&state.desired_state, &cli.config_file)?;
            let runner: Arc<dyn HostRunner> =
                Arc::new(SshDockerRunner::new(&config.nodes, config.ssh_user.as_str()));
            let kubeconfig = kevel::pki::local_kubeconfig_path(&cli.config_file);
            let kube = Arc::new(ApiClient::new(kubeconfig));
            let manager = EncryptionManager::new(runner, kube);
            manager.rotate_key(&mut cluster, &mut state, &store).await?;
        }
    }

    Ok(())
}
