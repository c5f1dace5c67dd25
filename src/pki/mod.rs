//! Certificate bundle and admin kubeconfig handling
//!
//! The engine treats certificate generation as a narrow collaborator
//! contract: it needs a bundle of PEM-encoded certificates keyed by logical
//! name, and the ability to rebuild the local admin kubeconfig whenever the
//! first reachable control plane address changes. The default implementation
//! generates a self-signed CA and an x509 admin identity with `rcgen`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
#[cfg(test)]
use mockall::automock;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Error;

/// Logical name of the cluster CA entry in the bundle
pub const CA_CERT_NAME: &str = "kube-ca";

/// Logical name of the admin kubeconfig identity in the bundle
pub const KUBE_ADMIN_CERT_NAME: &str = "kube-admin";

/// Prefix for the locally written admin kubeconfig file
pub const KUBE_ADMIN_CONFIG_PREFIX: &str = "kube_config_";

/// One entry in the certificate bundle
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificatePki {
    /// Logical certificate name
    pub name: String,
    /// PEM-encoded certificate
    pub certificate: String,
    /// PEM-encoded private key
    pub key: String,
    /// Free-form config document (kubeconfig for identities)
    #[serde(default)]
    pub config: String,
}

/// Certificate bundle keyed by logical certificate name
pub type CertBundle = HashMap<String, CertificatePki>;

/// Path of the admin kubeconfig written next to the cluster config file
pub fn local_kubeconfig_path(config_path: &Path) -> PathBuf {
    let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let file = config_path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cluster.yml".to_string());
    dir.join(format!("{}{}", KUBE_ADMIN_CONFIG_PREFIX, file))
}

/// PKI collaborator contract
#[cfg_attr(test, automock)]
pub trait PkiProvider: Send + Sync {
    /// Generate a fresh CA and admin identity for the cluster
    fn generate_certificates(&self, cluster_name: &str) -> Result<CertBundle, Error>;

    /// Render an admin kubeconfig pointed at the given API endpoint
    fn rebuild_admin_config(&self, api_endpoint: &str, bundle: &CertBundle)
        -> Result<String, Error>;

    /// Write the admin kubeconfig to the local path
    fn write_admin_config(&self, config: &str, path: &Path) -> Result<(), Error>;
}

/// Default `rcgen`-backed PKI implementation
#[derive(Default)]
pub struct LocalPki;

impl LocalPki {
    fn ca_params(cluster_name: &str) -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(format!("{}-ca", cluster_name)),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params
    }

    fn admin_params() -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(KUBE_ADMIN_CERT_NAME.to_string()),
        );
        // system:masters grants cluster-admin through x509 group mapping
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("system:masters".to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params
    }
}

impl PkiProvider for LocalPki {
    fn generate_certificates(&self, cluster_name: &str) -> Result<CertBundle, Error> {
        info!(cluster = cluster_name, "generating cluster certificates");
        let ca_key = KeyPair::generate()
            .map_err(|e| Error::pki(format!("failed to generate CA key: {}", e)))?;
        let ca_cert = Self::ca_params(cluster_name)
            .self_signed(&ca_key)
            .map_err(|e| Error::pki(format!("failed to self-sign CA: {}", e)))?;
        let ca_cert_pem = ca_cert.pem();
        let ca_key_pem = ca_key.serialize_pem();

        let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key)
            .map_err(|e| Error::pki(format!("failed to build issuer: {}", e)))?;

        let admin_key = KeyPair::generate()
            .map_err(|e| Error::pki(format!("failed to generate admin key: {}", e)))?;
        let admin_cert = Self::admin_params()
            .signed_by(&admin_key, &issuer)
            .map_err(|e| Error::pki(format!("failed to sign admin cert: {}", e)))?;

        let mut bundle = CertBundle::new();
        bundle.insert(
            CA_CERT_NAME.to_string(),
            CertificatePki {
                name: CA_CERT_NAME.to_string(),
                certificate: ca_cert_pem.clone(),
                key: ca_key_pem,
                config: String::new(),
            },
        );
        bundle.insert(
            KUBE_ADMIN_CERT_NAME.to_string(),
            CertificatePki {
                name: KUBE_ADMIN_CERT_NAME.to_string(),
                certificate: admin_cert.pem(),
                key: admin_key.serialize_pem(),
                config: String::new(),
            },
        );
        Ok(bundle)
    }

    fn rebuild_admin_config(
        &self,
        api_endpoint: &str,
        bundle: &CertBundle,
    ) -> Result<String, Error> {
        let ca = bundle
            .get(CA_CERT_NAME)
            .ok_or_else(|| Error::pki("certificate bundle has no CA entry"))?;
        let admin = bundle
            .get(KUBE_ADMIN_CERT_NAME)
            .ok_or_else(|| Error::pki("certificate bundle has no admin entry"))?;
        render_x509_kubeconfig(
            api_endpoint,
            KUBE_ADMIN_CERT_NAME,
            &ca.certificate,
            &admin.certificate,
            &admin.key,
        )
    }

    fn write_admin_config(&self, config: &str, path: &Path) -> Result<(), Error> {
        std::fs::write(path, config)
            .map_err(|e| Error::pki(format!("failed to write admin config: {}", e)))
    }
}

// Minimal kubeconfig document; only the fields the API client reads.

#[derive(Serialize, Deserialize)]
struct KubeConfigDoc {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    clusters: Vec<NamedCluster>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: String,
    users: Vec<NamedUser>,
}

#[derive(Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEndpoint,
}

#[derive(Serialize, Deserialize)]
struct ClusterEndpoint {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: String,
}

#[derive(Serialize, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextRef,
}

#[derive(Serialize, Deserialize)]
struct ContextRef {
    cluster: String,
    user: String,
}

#[derive(Serialize, Deserialize)]
struct NamedUser {
    name: String,
    user: UserKeys,
}

#[derive(Serialize, Deserialize)]
struct UserKeys {
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: String,
    #[serde(rename = "client-key-data")]
    client_key_data: String,
}

/// Render an x509 kubeconfig with inline certificate data
pub fn render_x509_kubeconfig(
    api_endpoint: &str,
    user: &str,
    ca_pem: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<String, Error> {
    let doc = KubeConfigDoc {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: "local".to_string(),
            cluster: ClusterEndpoint {
                server: api_endpoint.to_string(),
                certificate_authority_data: STANDARD.encode(ca_pem),
            },
        }],
        contexts: vec![NamedContext {
            name: format!("{}@local", user),
            context: ContextRef {
                cluster: "local".to_string(),
                user: user.to_string(),
            },
        }],
        current_context: format!("{}@local", user),
        users: vec![NamedUser {
            name: user.to_string(),
            user: UserKeys {
                client_certificate_data: STANDARD.encode(cert_pem),
                client_key_data: STANDARD.encode(key_pem),
            },
        }],
    };
    Ok(serde_yaml::to_string(&doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: Generated bundles drive a working admin kubeconfig
    ///
    /// A fresh bundle carries CA and admin entries, and the rendered
    /// kubeconfig targets the requested endpoint with inline x509 data.
    #[test]
    fn story_generate_and_render_admin_config() {
        let pki = LocalPki;
        let bundle = pki.generate_certificates("west-prod").unwrap();

        let ca = &bundle[CA_CERT_NAME];
        assert!(ca.certificate.contains("BEGIN CERTIFICATE"));
        assert!(ca.key.contains("PRIVATE KEY"));

        let admin = &bundle[KUBE_ADMIN_CERT_NAME];
        assert!(admin.certificate.contains("BEGIN CERTIFICATE"));

        let config = pki
            .rebuild_admin_config("https://10.0.0.1:6443", &bundle)
            .unwrap();
        assert!(config.contains("https://10.0.0.1:6443"));
        assert!(config.contains("client-certificate-data"));

        // the document round-trips as a kubeconfig
        let parsed: KubeConfigDoc = serde_yaml::from_str(&config).unwrap();
        assert_eq!(parsed.current_context, "kube-admin@local");
        assert_eq!(parsed.clusters[0].cluster.server, "https://10.0.0.1:6443");
    }

    /// Rebuilding against a bundle with no CA is an error, not a panic
    #[test]
    fn test_missing_ca_entry_is_error() {
        let pki = LocalPki;
        let result = pki.rebuild_admin_config("https://10.0.0.1:6443", &CertBundle::new());
        assert!(matches!(result, Err(Error::Pki(_))));
    }

    /// The local kubeconfig lands next to the cluster config file
    #[test]
    fn test_local_kubeconfig_path_derivation() {
        let path = local_kubeconfig_path(Path::new("/deploy/cluster.yml"));
        assert_eq!(path, Path::new("/deploy/kube_config_cluster.yml"));

        let bare = local_kubeconfig_path(Path::new("cluster.yml"));
        assert_eq!(bare, Path::new("kube_config_cluster.yml"));
    }
}
