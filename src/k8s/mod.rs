//! Kubernetes API client wrapper
//!
//! The engine's narrow API-client contract: node deletion and the secret
//! read/update pair used by bulk rewriting. The real implementation builds a
//! `kube` client from the locally written admin kubeconfig on every call, so
//! it always follows the most recently rebuilt admin config.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::Error;

/// Kubernetes API operations the engine depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeApi: Send + Sync {
    /// Delete a node object by name
    async fn delete_node(&self, name: &str) -> Result<(), Error>;

    /// List secrets across all namespaces
    async fn list_secrets(&self) -> Result<Vec<Secret>, Error>;

    /// Fetch one secret
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Secret, Error>;

    /// Replace a secret; returns [`Error::Conflict`] on a version conflict
    async fn update_secret(&self, secret: &Secret) -> Result<(), Error>;
}

/// Name and namespace of a secret, for logging and conflict reporting
pub fn secret_id(secret: &Secret) -> (String, String) {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let namespace = secret
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    (name, namespace)
}

/// Map a kube error, surfacing 409s as detectable conflicts
fn map_update_error(err: kube::Error, what: &str) -> Error {
    match err {
        kube::Error::Api(ref response) if response.code == 409 => {
            Error::Conflict(what.to_string())
        }
        other => Error::Kube(other),
    }
}

/// `kube`-backed implementation reading the admin kubeconfig per call
pub struct ApiClient {
    kubeconfig_path: PathBuf,
}

impl ApiClient {
    /// Create a client over the admin kubeconfig at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig_path: path.into(),
        }
    }

    /// Path of the kubeconfig this client reads
    pub fn kubeconfig_path(&self) -> &Path {
        &self.kubeconfig_path
    }

    async fn client(&self) -> Result<Client, Error> {
        let kubeconfig = Kubeconfig::read_from(&self.kubeconfig_path)
            .map_err(|e| Error::state(format!("failed to read admin kubeconfig: {}", e)))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::state(format!("invalid admin kubeconfig: {}", e)))?;
        Ok(Client::try_from(config)?)
    }
}

#[async_trait]
impl KubeApi for ApiClient {
    async fn delete_node(&self, name: &str) -> Result<(), Error> {
        let nodes: Api<Node> = Api::all(self.client().await?);
        debug!(node = name, "deleting node object");
        nodes.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_secrets(&self) -> Result<Vec<Secret>, Error> {
        let secrets: Api<Secret> = Api::all(self.client().await?);
        let list = secrets.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Secret, Error> {
        let secrets: Api<Secret> = Api::namespaced(self.client().await?, namespace);
        Ok(secrets.get(name).await?)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<(), Error> {
        let (name, namespace) = secret_id(secret);
        let secrets: Api<Secret> = Api::namespaced(self.client().await?, &namespace);
        secrets
            .replace(&name, &PostParams::default(), secret)
            .await
            .map_err(|e| map_update_error(e, &format!("{}/{}", namespace, name)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code,
        })
    }

    /// 409s become detectable conflicts; everything else stays a kube error
    #[test]
    fn test_conflict_mapping() {
        let conflict = map_update_error(api_error(409), "app/token");
        assert!(conflict.is_conflict());
        assert!(conflict.to_string().contains("app/token"));

        let other = map_update_error(api_error(500), "app/token");
        assert!(!other.is_conflict());
        assert!(matches!(other, Error::Kube(_)));
    }

    #[test]
    fn test_secret_id_defaults_namespace() {
        let mut secret = Secret::default();
        secret.metadata.name = Some("token".to_string());
        let (name, namespace) = secret_id(&secret);
        assert_eq!(name, "token");
        assert_eq!(namespace, "default");
    }
}
