//! Secrets-at-rest encryption manager
//!
//! Owns the lifecycle of the encryption provider document deployed to
//! control plane hosts: enable, disable, and zero-downtime key rotation,
//! plus the bulk secret rewrite that forces every stored object through the
//! active key.
//!
//! # Readability invariant
//!
//! At every observable instant, every previously written secret must be
//! decryptable by at least one key in the currently deployed document. Key
//! rotation therefore passes through a two-key intermediate document
//! `[new, old]` and only collapses to `[new]` after every secret has been
//! rewritten. The intermediate document is checkpointed to the state store
//! before any API server restart, so a crash mid-rotation is recoverable.

use std::collections::VecDeque;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE, Engine};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, PendingAction};
use crate::host::HostRunner;
use crate::k8s::{secret_id, KubeApi};
use crate::services;
use crate::state::{FullState, StateStore};
use crate::{Error, DEFAULT_SYNC_WORKERS, ENCRYPTION_PROVIDER_FILE_PATH};

use k8s_openapi::api::core::v1::Secret;

/// API version of the provider document schema
pub const PROVIDER_DOC_API_VERSION: &str = "apiserver.config.k8s.io/v1";

/// Kind of the provider document schema
pub const PROVIDER_DOC_KIND: &str = "EncryptionConfiguration";

/// One named symmetric key in the provider document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    /// Key name, unique within the document
    pub name: String,
    /// Base64-url encoded key material
    pub secret: String,
}

impl EncryptionKey {
    /// Generate a fresh key: 16 random bytes, hex-expanded, base64-url encoded
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut buf = [0u8; 16];
        rng.fill(&mut buf);
        let suffix: String = (&mut rng)
            .sample_iter(Alphanumeric)
            .take(5)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();
        let hex: String = buf.iter().map(|b| format!("{:02X}", b)).collect();
        Self {
            name: format!("key-{}", suffix),
            secret: URL_SAFE.encode(hex),
        }
    }
}

// Serde shape of the platform's native encryption configuration resource.

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderDocument {
    api_version: String,
    kind: String,
    resources: Vec<ResourceConfiguration>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct ResourceConfiguration {
    resources: Vec<String>,
    providers: Vec<ProviderEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct ProviderEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    aescbc: Option<AesCbcConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    identity: Option<IdentityConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct AesCbcConfig {
    keys: Vec<EncryptionKey>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct IdentityConfig {}

/// The generated key list with its ordering invariant made explicit
///
/// The provider document accepts every listed key for decryption but only
/// writes with the first one. Rather than a raw ordered list, the active
/// (write) key and the still-readable keys are separate fields; rendering
/// always emits `[active, readable...]`.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyDocument {
    /// Key used for new encryption operations
    pub active: EncryptionKey,
    /// Older keys still accepted for decryption
    pub readable: Vec<EncryptionKey>,
}

impl KeyDocument {
    /// Document with a single key
    pub fn single(active: EncryptionKey) -> Self {
        Self {
            active,
            readable: Vec::new(),
        }
    }

    /// Render the enabled provider document (aescbc first, identity fallback)
    pub fn provider_file(&self) -> Result<String, Error> {
        let mut keys = vec![self.active.clone()];
        keys.extend(self.readable.iter().cloned());
        let doc = ProviderDocument {
            api_version: PROVIDER_DOC_API_VERSION.to_string(),
            kind: PROVIDER_DOC_KIND.to_string(),
            resources: vec![ResourceConfiguration {
                resources: vec!["secrets".to_string()],
                providers: vec![
                    ProviderEntry {
                        aescbc: Some(AesCbcConfig { keys }),
                        identity: None,
                    },
                    ProviderEntry {
                        aescbc: None,
                        identity: Some(IdentityConfig {}),
                    },
                ],
            }],
        };
        Ok(serde_yaml::to_string(&doc)?)
    }

    /// Render the disabled variant: identity first so new writes are
    /// plaintext, with the active key kept readable for existing data
    pub fn disabled_provider_file(&self) -> Result<String, Error> {
        let doc = ProviderDocument {
            api_version: PROVIDER_DOC_API_VERSION.to_string(),
            kind: PROVIDER_DOC_KIND.to_string(),
            resources: vec![ResourceConfiguration {
                resources: vec!["secrets".to_string()],
                providers: vec![
                    ProviderEntry {
                        aescbc: None,
                        identity: Some(IdentityConfig {}),
                    },
                    ProviderEntry {
                        aescbc: Some(AesCbcConfig {
                            keys: vec![self.active.clone()],
                        }),
                        identity: None,
                    },
                ],
            }],
        };
        Ok(serde_yaml::to_string(&doc)?)
    }

    /// Recover the key list from a deployed provider document
    pub fn from_provider_file(contents: &str) -> Result<Self, Error> {
        let doc: ProviderDocument = serde_yaml::from_str(contents)?;
        let keys = doc
            .resources
            .iter()
            .flat_map(|r| r.providers.iter())
            .find_map(|p| p.aescbc.as_ref())
            .map(|aes| aes.keys.clone())
            .unwrap_or_default();
        let mut keys = VecDeque::from(keys);
        let active = keys.pop_front().ok_or_else(|| {
            Error::protocol("provider document has no aescbc keys to rotate from")
        })?;
        Ok(Self {
            active,
            readable: keys.into(),
        })
    }
}

/// Extract a user-supplied provider fragment from the raw cluster file
///
/// The surrounding document is only partially structured, so this walks it
/// map by map and re-marshals the fragment as the provider document schema.
/// The result is stored opaquely; rotation and disable never look inside it.
pub fn render_custom_provider_file(cluster_file: &str) -> Result<Option<String>, Error> {
    let root: serde_yaml::Value = serde_yaml::from_str(cluster_file)?;
    let fragment = root
        .get("services")
        .and_then(|v| v.get("kube_api"))
        .and_then(|v| v.get("secrets_encryption"))
        .and_then(|v| v.get("custom_config"));
    let Some(fragment) = fragment else {
        return Ok(None);
    };
    let resources: Vec<ResourceConfiguration> = fragment
        .get("resources")
        .map(|r| serde_yaml::from_value(r.clone()))
        .transpose()
        .map_err(|e| Error::validation(format!("invalid custom encryption config: {}", e)))?
        .unwrap_or_default();
    let doc = ProviderDocument {
        api_version: PROVIDER_DOC_API_VERSION.to_string(),
        kind: PROVIDER_DOC_KIND.to_string(),
        resources,
    };
    Ok(Some(serde_yaml::to_string(&doc)?))
}

/// Drives the encryption lifecycle against a cluster
pub struct EncryptionManager {
    runner: Arc<dyn HostRunner>,
    kube: Arc<dyn KubeApi>,
    sync_workers: usize,
}

impl EncryptionManager {
    /// Create a manager over the given collaborators
    pub fn new(runner: Arc<dyn HostRunner>, kube: Arc<dyn KubeApi>) -> Self {
        Self {
            runner,
            kube,
            sync_workers: DEFAULT_SYNC_WORKERS,
        }
    }

    /// Override the rewrite worker count
    pub fn with_sync_workers(mut self, workers: usize) -> Self {
        self.sync_workers = workers.max(1);
        self
    }

    /// Reconcile the encryption state between two cluster snapshots
    ///
    /// First-time enable only records a deferred rewrite marker; key
    /// generation and secret rewriting happen once the control plane is up.
    pub async fn reconcile(
        &self,
        desired: &mut Cluster,
        current: Option<&Cluster>,
    ) -> Result<(), Error> {
        info!("[controlplane] reconciling encryption provider configuration");
        if desired.control_plane_hosts.is_empty() {
            return Ok(());
        }
        let currently_enabled = current.is_some_and(|c| c.is_encryption_enabled());
        if desired.is_encryption_enabled() {
            if !currently_enabled {
                // Secrets cannot be rewritten before the API is reachable
                desired.pending_action = Some(PendingAction::RewriteSecrets);
                return Ok(());
            }
            // steady state: carry the active document forward
            if desired.encryption_provider_file.is_none() {
                desired.encryption_provider_file =
                    current.and_then(|c| c.encryption_provider_file.clone());
            }
            return Ok(());
        }
        if let Some(current) = current {
            if current.is_encryption_enabled() {
                if current.is_encryption_custom_config() {
                    // A user-owned document is never rewritten; the next
                    // control plane redeploy picks up the empty file.
                    info!("[controlplane] disabling custom encryption configuration");
                    return self.deploy_provider_file(desired, "").await;
                }
                return self.disable(desired, current).await;
            }
        }
        Ok(())
    }

    /// Disable generated secrets encryption without losing readability
    ///
    /// The intermediate identity-first document keeps the old key readable
    /// while every secret is rewritten as plaintext; only then is the
    /// document removed entirely.
    pub async fn disable(&self, desired: &mut Cluster, current: &Cluster) -> Result<(), Error> {
        info!("[controlplane] disabling secrets encryption");
        if desired.control_plane_hosts.is_empty() {
            return Ok(());
        }
        let provider = current.encryption_provider_file.as_deref().ok_or_else(|| {
            Error::protocol("encryption is enabled but no provider document is recorded")
        })?;
        let document = KeyDocument::from_provider_file(provider)?;
        let identity_first = document.disabled_provider_file()?;

        debug!("[controlplane] deploying identity-first provider document");
        self.deploy_provider_file(desired, &identity_first).await?;
        services::restart_kube_api_with_healthcheck(
            self.runner.as_ref(),
            &desired.control_plane(),
        )
        .await?;
        self.rewrite_secrets().await?;

        // Every secret is now stored under the identity transform; the
        // document can be removed without making anything unreadable.
        self.deploy_provider_file(desired, "").await?;
        services::restart_kube_api_with_healthcheck(
            self.runner.as_ref(),
            &desired.control_plane(),
        )
        .await?;
        info!("[controlplane] secrets encryption disabled");
        Ok(())
    }

    /// Zero-downtime replacement of the active encryption key
    pub async fn rotate_key(
        &self,
        cluster: &mut Cluster,
        state: &mut FullState,
        store: &StateStore,
    ) -> Result<(), Error> {
        info!("[controlplane] rotating secrets encryption key");
        if cluster.is_encryption_custom_config() {
            return Err(Error::protocol(
                "cannot rotate keys in a user-supplied provider document",
            ));
        }
        let provider = cluster.encryption_provider_file.clone().ok_or_else(|| {
            Error::protocol("cannot rotate: no active encryption provider document")
        })?;
        let previous = KeyDocument::from_provider_file(&provider)?;
        let new_key = EncryptionKey::generate();

        // Two-key document: new key active for writes, old key readable.
        let two_key = KeyDocument {
            active: new_key.clone(),
            readable: vec![previous.active.clone()],
        };
        let two_key_doc = two_key.provider_file()?;
        self.deploy_provider_file(cluster, &two_key_doc).await?;

        // Durable checkpoint before any restart; a crash from here on can
        // resume with both keys still deployed and recorded.
        state.desired_state.encryption_provider_file = Some(two_key_doc.clone());
        store.save(state)?;

        services::restart_kube_api_with_healthcheck(
            self.runner.as_ref(),
            &cluster.control_plane(),
        )
        .await?;

        // Every rewrite now lands under the new key.
        self.rewrite_secrets().await?;

        let recorded = store.load()?;
        if recorded.desired_state.encryption_provider_file.as_deref() != Some(two_key_doc.as_str())
        {
            return Err(Error::protocol(
                "two-key rotation document is not the recorded desired state; \
                 refusing to finalize",
            ));
        }

        let final_doc = KeyDocument::single(new_key).provider_file()?;
        self.deploy_provider_file(cluster, &final_doc).await?;
        state.desired_state.encryption_provider_file = Some(final_doc);
        store.save(state)?;

        services::restart_kube_api_with_healthcheck(
            self.runner.as_ref(),
            &cluster.control_plane(),
        )
        .await?;
        info!("[controlplane] encryption key rotated");
        Ok(())
    }

    /// Deploy a provider document to every control plane host
    ///
    /// An empty document disables the provider file; the cluster model's
    /// record of the deployed document is updated either way.
    pub async fn deploy_provider_file(
        &self,
        cluster: &mut Cluster,
        contents: &str,
    ) -> Result<(), Error> {
        let addresses: Vec<String> = cluster
            .control_plane()
            .iter()
            .map(|h| h.address.clone())
            .collect();
        let image = cluster.config.system_images.alpine.clone();
        for address in &addresses {
            debug!(host = %address, "deploying encryption provider file");
            self.runner
                .deploy_file(address, &image, ENCRYPTION_PROVIDER_FILE_PATH, contents)
                .await?;
        }
        cluster.encryption_provider_file = if contents.is_empty() {
            None
        } else {
            Some(contents.to_string())
        };
        Ok(())
    }

    /// Produce the provider document for a cluster with encryption enabled
    /// and deploy it to every control plane host
    ///
    /// A recorded document (generated on a prior run, or user-supplied) is
    /// redeployed as-is so hosts added since the last run receive it before
    /// their API server starts with the provider flag. On first enable a
    /// fresh single-key document is generated.
    pub async fn ensure_provider_file(&self, cluster: &mut Cluster) -> Result<String, Error> {
        let doc = match &cluster.encryption_provider_file {
            Some(doc) => doc.clone(),
            None => KeyDocument::single(EncryptionKey::generate()).provider_file()?,
        };
        self.deploy_provider_file(cluster, &doc).await?;
        Ok(doc)
    }

    /// Record the cluster's provider document into the desired state
    pub fn reconcile_desired_state(
        &self,
        cluster: &Cluster,
        state: &mut FullState,
        store: &StateStore,
    ) -> Result<(), Error> {
        state.desired_state.encryption_provider_file = cluster.encryption_provider_file.clone();
        store.save(state)
    }

    /// Rewrite every secret in the cluster through a fixed-size worker pool
    ///
    /// All workers join before this returns; the caller must never finalize
    /// a key document while rewrites are in flight. Individual failures are
    /// collected and reported as one aggregate at the end.
    pub async fn rewrite_secrets(&self) -> Result<(), Error> {
        info!("rewriting cluster secrets");
        let secrets = self.kube.list_secrets().await?;
        let total = secrets.len();
        let queue = Arc::new(Mutex::new(VecDeque::from(secrets)));

        let mut handles = Vec::with_capacity(self.sync_workers);
        for _ in 0..self.sync_workers {
            let queue = Arc::clone(&queue);
            let kube = Arc::clone(&self.kube);
            handles.push(tokio::spawn(async move {
                let mut errors = Vec::new();
                loop {
                    let next = queue.lock().await.pop_front();
                    let Some(secret) = next else { break };
                    if let Err(e) = rewrite_secret(kube.as_ref(), secret).await {
                        errors.push(e);
                    }
                }
                errors
            }));
        }

        let mut errors = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(worker_errors) => errors.extend(worker_errors),
                Err(e) => errors.push(Error::host(format!("rewrite worker panicked: {}", e))),
            }
        }
        if errors.is_empty() {
            info!(total, "cluster secrets rewritten");
            Ok(())
        } else {
            warn!(
                failed = errors.len(),
                total, "secret rewrite completed with failures"
            );
            Err(Error::aggregate("rewriting cluster secrets", errors))
        }
    }
}

/// Rewrite one secret, retrying exactly once on a version conflict
async fn rewrite_secret(kube: &dyn KubeApi, secret: Secret) -> Result<(), Error> {
    let (name, namespace) = secret_id(&secret);
    match kube.update_secret(&secret).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_conflict() => {
            debug!(secret = %name, namespace = %namespace, "conflict, refetching once");
            let fresh = kube.get_secret(&name, &namespace).await?;
            kube.update_secret(&fresh).await
        }
        Err(e) => Err(e),
    }
}
