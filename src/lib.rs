//! Kevel - SSH-driven Kubernetes cluster provisioning and convergence engine
//!
//! Kevel builds and continuously converges multi-node Kubernetes clusters from
//! a declarative node/service specification. It operates purely over
//! SSH-tunneled container-runtime calls and the Kubernetes API - no cloud
//! provider APIs and no in-cluster agents.
//!
//! # Architecture
//!
//! A convergence run loads the previously recorded state, builds the desired
//! cluster model, reconciles the recorded host topology against the desired
//! one, brings the service planes up, and persists the new state. Re-running
//! against an already converged cluster produces the same end state.
//!
//! # Modules
//!
//! - [`cluster`] - Cluster model, reconciler, encryption manager, snapshot manager
//! - [`state`] - Durable desired/current state store
//! - [`host`] - Host model, SSH tunnel and container runner contracts
//! - [`k8s`] - Kubernetes API client wrapper
//! - [`pki`] - Certificate bundle and admin kubeconfig handling
//! - [`services`] - Plane-level service helpers (restarts, proxy updates)
//! - [`converge`] - The end-to-end convergence pass
//! - [`error`] - Error types for the engine

#![deny(missing_docs)]

pub mod cluster;
pub mod converge;
pub mod error;
pub mod host;
pub mod k8s;
pub mod pki;
pub mod services;
pub mod state;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Path the encryption provider document is deployed to on control plane hosts
pub const ENCRYPTION_PROVIDER_FILE_PATH: &str = "/etc/kubernetes/ssl/encryption.yaml";

/// Default number of workers for bulk secret rewriting
pub const DEFAULT_SYNC_WORKERS: usize = 10;

/// Port the Kubernetes API server listens on
pub const KUBE_API_PORT: u16 = 6443;

/// Peer port for the consensus store
pub const ETCD_PEER_PORT: u16 = 2380;
