//! Durable desired/current state store
//!
//! The single source of truth across convergence runs. A state file holds
//! two plans: `desiredState` (rewritten at the end of every successful
//! pass) and `currentState` (rewritten only after the reconciliation
//! decisions derived from the previous current state have been applied).
//! Every write is a full-document replace; there are no partial updates.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cluster::ClusterConfig;
use crate::pki::CertBundle;
use crate::Error;

/// Suffix of the state file written next to the cluster config
pub const STATE_FILE_SUFFIX: &str = ".kevelstate";

/// One recorded plan: cluster config snapshot plus certificate bundle
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Plan {
    /// The cluster configuration this plan was derived from
    pub cluster_config: ClusterConfig,
    /// Certificate bundle keyed by logical certificate name
    pub certificates_bundle: CertBundle,
    /// Deployed encryption provider document, if encryption is active
    pub encryption_provider_file: Option<String>,
}

impl Plan {
    /// Whether this plan has ever been recorded
    pub fn is_empty(&self) -> bool {
        self.cluster_config.nodes.is_empty()
    }
}

/// The desired/current plan pair persisted between runs
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FullState {
    /// The plan this run is converging towards
    pub desired_state: Plan,
    /// The last plan known to be applied
    pub current_state: Plan,
}

/// Derive the state file path from the cluster config path
pub fn state_file_path(config_path: &Path) -> PathBuf {
    let mut path = config_path.to_path_buf();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cluster".to_string());
    path.set_file_name(format!("{}{}", stem, STATE_FILE_SUFFIX));
    path
}

/// Owns the state file; all reads and writes go through here
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store over the given state file path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create a store for the state file next to a cluster config
    pub fn for_config(config_path: &Path) -> Self {
        Self::new(state_file_path(config_path))
    }

    /// Path of the underlying state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the recorded state; a missing file yields the empty state
    pub fn load(&self) -> Result<FullState, Error> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                debug!(path = %self.path.display(), "loaded state file");
                serde_json::from_str(&contents)
                    .map_err(|e| Error::state(format!("corrupt state file: {}", e)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no state file, starting fresh");
                Ok(FullState::default())
            }
            Err(e) => Err(Error::state(format!(
                "failed to read state file [{}]: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Persist the state as a full-document replace
    pub fn save(&self, state: &FullState) -> Result<(), Error> {
        let contents = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, contents).map_err(|e| {
            Error::state(format!(
                "failed to write state file [{}]: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!(path = %self.path.display(), "state file written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{Host, Role};
    use tempfile::TempDir;

    fn sample_state() -> FullState {
        let mut state = FullState::default();
        state.desired_state.cluster_config.cluster_name = "west".to_string();
        state.desired_state.cluster_config.nodes.push(Host {
            address: "10.0.0.1".to_string(),
            internal_address: "10.0.0.1".to_string(),
            hostname_override: "10.0.0.1".to_string(),
            ssh_key_path: String::new(),
            roles: vec![Role::Etcd, Role::ControlPlane],
        });
        state.desired_state.encryption_provider_file = Some("doc".to_string());
        state
    }

    /// Story: State survives a round trip through the file
    ///
    /// Everything a later run needs - config snapshot, certificate bundle,
    /// encryption document - must come back exactly as recorded.
    #[test]
    fn story_state_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("west.kevelstate"));

        let state = sample_state();
        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
    }

    /// Story: The first run sees an empty state, not an error
    #[test]
    fn story_missing_file_is_fresh_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("absent.kevelstate"));
        let state = store.load().unwrap();
        assert!(state.desired_state.is_empty());
        assert!(state.current_state.is_empty());
    }

    /// A corrupt state file must fail loudly, not silently reset
    #[test]
    fn test_corrupt_state_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.kevelstate");
        std::fs::write(&path, "{not json").unwrap();
        let store = StateStore::new(path);
        assert!(matches!(store.load(), Err(Error::State(_))));
    }

    #[test]
    fn test_state_file_path_derivation() {
        assert_eq!(
            state_file_path(Path::new("/deploy/cluster.yml")),
            Path::new("/deploy/cluster.kevelstate")
        );
    }

    /// The state file uses the documented top-level plan names
    #[test]
    fn test_state_file_schema_names() {
        let rendered = serde_json::to_string(&sample_state()).unwrap();
        assert!(rendered.contains("\"desiredState\""));
        assert!(rendered.contains("\"currentState\""));
        assert!(rendered.contains("\"certificatesBundle\""));
    }
}
