//! Mutual TLS setup for node-to-node sessions.
//!
//! Both directions present the device certificate and require the peer's
//! certificate to chain to one of the configured trust anchors (`ca.cert`
//! plus every `*.pem`/`*.crt` in `ca.dir`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use zeroize::Zeroizing;

use rvi_core::config::NodeConfig;
use rvi_core::RviError;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("private key error: {0}")]
    PrivateKey(String),
    #[error("TLS configuration error: {0}")]
    Config(String),
}

impl From<TlsError> for RviError {
    fn from(e: TlsError) -> Self {
        RviError::InvalidArgument(e.to_string())
    }
}

/// Client and server halves sharing one identity and trust store.
#[derive(Clone)]
pub struct TlsConfig {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl TlsConfig {
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Read certificate, key and trust anchors from the paths in `config`.
    pub fn from_config(config: &NodeConfig) -> Result<Self, TlsError> {
        let mut builder = Self::builder()
            .node_cert_pem(read(&config.device.cert)?)
            .node_key_pem(Zeroizing::new(read(&config.device.key)?));
        if let Some(path) = &config.ca.cert {
            builder = builder.ca_cert_pem(read(path)?);
        }
        if let Some(dir) = &config.ca.dir {
            builder = builder.ca_dir(dir)?;
        }
        builder.build()
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client.clone())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server.clone())
    }
}

#[derive(Default)]
pub struct TlsConfigBuilder {
    ca_pems: Vec<Vec<u8>>,
    node_cert_pem: Option<Vec<u8>>,
    node_key_pem: Option<Zeroizing<Vec<u8>>>,
}

impl TlsConfigBuilder {
    /// Add one or more PEM trust anchors. May be called repeatedly.
    pub fn ca_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_pems.push(pem.into());
        self
    }

    /// Add every `*.pem` and `*.crt` file in `dir` as a trust anchor.
    pub fn ca_dir(mut self, dir: &Path) -> Result<Self, TlsError> {
        let entries = std::fs::read_dir(dir).map_err(|e| TlsError::Read(dir.to_path_buf(), e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .is_some_and(|ext| ext == "pem" || ext == "crt")
            })
            .collect();
        paths.sort();
        for path in paths {
            tracing::debug!(path = %path.display(), "loading trust anchor");
            self.ca_pems.push(read(&path)?);
        }
        Ok(self)
    }

    pub fn node_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.node_cert_pem = Some(pem.into());
        self
    }

    pub fn node_key_pem(mut self, pem: Zeroizing<Vec<u8>>) -> Self {
        self.node_key_pem = Some(pem);
        self
    }

    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let cert_pem = self
            .node_cert_pem
            .ok_or_else(|| TlsError::Config("device certificate required".into()))?;
        let key_pem = self
            .node_key_pem
            .ok_or_else(|| TlsError::Config("device key required".into()))?;

        let mut roots = RootCertStore::empty();
        for pem in &self.ca_pems {
            for cert in parse_certificates(pem)? {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::Certificate(format!("bad trust anchor: {e}")))?;
            }
        }
        if roots.is_empty() {
            return Err(TlsError::Certificate("no trust anchors configured".into()));
        }

        let chain = parse_certificates(&cert_pem)?;
        if chain.is_empty() {
            return Err(TlsError::Certificate("device certificate file is empty".into()));
        }
        let key = PrivateKeyDer::from_pem_slice(&key_pem)
            .map_err(|e| TlsError::PrivateKey(e.to_string()))?;

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let roots = Arc::new(roots);

        let client = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(chain.clone(), key.clone_key())
            .map_err(|e| TlsError::Config(format!("client config: {e}")))?;

        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
            .build()
            .map_err(|e| TlsError::Config(format!("client verifier: {e}")))?;
        let server = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .map_err(|e| TlsError::Config(format!("server config: {e}")))?;

        Ok(TlsConfig {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }
}

/// Short identity of a peer certificate, for logs and snapshots.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(&blake3::hash(cert.as_ref()).as_bytes()[..16])
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificates: {e}")))
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|e| TlsError::Read(path.to_path_buf(), e))
}

/// Throw-away CA and device certificates for tests.
#[cfg(test)]
pub(crate) mod test_utils {
    use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};

    pub struct TestCa {
        pub pem: String,
        cert: Certificate,
        key: KeyPair,
    }

    impl TestCa {
        pub fn new(name: &str) -> Self {
            let mut params = CertificateParams::default();
            params.distinguished_name.push(DnType::CommonName, name);
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            let key = KeyPair::generate().unwrap();
            let cert = params.self_signed(&key).unwrap();
            Self {
                pem: cert.pem(),
                cert,
                key,
            }
        }

        /// Issue a `localhost` device certificate. Returns (cert PEM, key PEM).
        pub fn issue(&self, name: &str) -> (String, String) {
            let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
            params.distinguished_name.push(DnType::CommonName, name);
            let key = KeyPair::generate().unwrap();
            let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
            (cert.pem(), key.serialize_pem())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::TestCa;
    use super::*;

    #[test]
    fn builds_from_generated_material() {
        let ca = TestCa::new("RVI Test CA");
        let (cert, key) = ca.issue("node-a");
        let tls = TlsConfig::builder()
            .ca_cert_pem(ca.pem.clone())
            .node_cert_pem(cert)
            .node_key_pem(Zeroizing::new(key.into_bytes()))
            .build();
        assert!(tls.is_ok());
    }

    #[test]
    fn missing_trust_anchor_rejected() {
        let ca = TestCa::new("RVI Test CA");
        let (cert, key) = ca.issue("node-a");
        let err = TlsConfig::builder()
            .node_cert_pem(cert)
            .node_key_pem(Zeroizing::new(key.into_bytes()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TlsError::Certificate(_)));
    }

    #[test]
    fn missing_key_rejected() {
        let ca = TestCa::new("RVI Test CA");
        let (cert, _) = ca.issue("node-a");
        let err = TlsConfig::builder()
            .ca_cert_pem(ca.pem.clone())
            .node_cert_pem(cert)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, TlsError::Config(_)));
    }

    #[test]
    fn trust_anchors_loaded_from_directory() {
        let dir = std::env::temp_dir().join(format!("rvi-tls-ca-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let ca = TestCa::new("RVI Dir CA");
        std::fs::write(dir.join("root.pem"), &ca.pem).unwrap();
        std::fs::write(dir.join("README"), "not a cert").unwrap();

        let (cert, key) = ca.issue("node-a");
        let cert_path = dir.join("device.cert");
        let key_path = dir.join("device.key");
        std::fs::write(&cert_path, cert).unwrap();
        std::fs::write(&key_path, key).unwrap();

        let mut config = NodeConfig::default();
        config.device.cert = cert_path;
        config.device.key = key_path;
        config.ca.dir = Some(dir.clone());
        assert!(TlsConfig::from_config(&config).is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let ca = TestCa::new("RVI Test CA");
        let der = CertificateDer::from_pem_slice(ca.pem.as_bytes()).unwrap();
        let a = fingerprint(&der);
        assert_eq!(a.len(), 32);
        assert_eq!(a, fingerprint(&der));
    }
}
