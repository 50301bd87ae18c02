//! RVI integration test harness.
//!
//! Every test runs real nodes in-process over mutual TLS on loopback. Each
//! node is started the way the daemon starts one: a flat config file on
//! disk naming a device certificate, a CA, a credential directory of JWTs
//! and the shared verification secret.
//!
//!   cargo test --test integration

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use jsonwebtoken::{encode, EncodingKey, Header};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};

use rvi_core::config::NodeConfig;
use rvi_node::Node;

mod churn;
mod config_init;
mod relay;
mod scenarios;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Secret every test node uses to sign and verify credentials.
pub const SECRET: &str = "rvi-integration-secret";

/// How long a test waits for state to propagate between nodes.
pub const WAIT: Duration = Duration::from_secs(5);

/// Rights written into a node's credential.
pub struct Rights<'a> {
    pub register: &'a [&'a str],
    pub invoke: &'a [&'a str],
}

/// A throw-away CA plus a scratch directory for node files.
pub struct Fixture {
    dir: PathBuf,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl Fixture {
    pub fn new(tag: &str) -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("rvi-it-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "RVI Integration CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate()?;
        let ca_cert = params.self_signed(&ca_key)?;
        std::fs::write(dir.join("ca.pem"), ca_cert.pem())?;

        Ok(Self {
            dir,
            ca_cert,
            ca_key,
        })
    }

    /// Write certificate, key, credential and config for `name`, signing the
    /// credential with `signing_secret`. Returns the config path.
    pub fn write_node(&self, name: &str, rights: &Rights<'_>, signing_secret: &str) -> Result<PathBuf> {
        let node_dir = self.dir.join(name);
        let cred_dir = node_dir.join("credentials");
        std::fs::create_dir_all(&cred_dir)?;

        let mut params = CertificateParams::new(vec!["localhost".to_string()])?;
        params.distinguished_name.push(DnType::CommonName, name);
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;
        std::fs::write(node_dir.join("device.pem"), cert.pem())?;
        std::fs::write(node_dir.join("device.key"), key.serialize_pem())?;

        let token = credential(name, rights, signing_secret)?;
        std::fs::write(cred_dir.join("00-rights.jwt"), format!("{token}\n"))?;

        let config = format!(
            "# {name}\n\
             device.cert = {cert}\n\
             device.key  = {key}\n\
             ca.cert     = {ca}\n\
             cred.dir    = {creds}\n\
             cred.secret = {SECRET}\n\
             node.listen = 127.0.0.1:0\n\
             node.handshake_timeout_secs = 5\n\
             node.ping_interval_secs = 0\n",
            cert = node_dir.join("device.pem").display(),
            key = node_dir.join("device.key").display(),
            ca = self.dir.join("ca.pem").display(),
            creds = cred_dir.display(),
        );
        let path = node_dir.join("rvi.config");
        std::fs::write(&path, config)?;
        Ok(path)
    }

    /// Start a listening node. Returns the node and its port.
    pub async fn start(&self, name: &str, rights: Rights<'_>) -> Result<(Node, u16)> {
        let path = self.write_node(name, &rights, SECRET)?;
        start_from(&path).await
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

/// Load a config file, init the node and listen on the configured address.
pub async fn start_from(path: &Path) -> Result<(Node, u16)> {
    let config = NodeConfig::load(path)?;
    let listen = config.node.listen.context("config has no node.listen")?;
    let node = Node::init(config).await?;
    let port = node.listen(listen).await?.port();
    Ok((node, port))
}

/// An HS256 credential granting `rights`, valid for an hour.
pub fn credential(name: &str, rights: &Rights<'_>, secret: &str) -> Result<String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let claims = serde_json::json!({
        "id": format!("{name}-credential"),
        "iss": "rvi-integration",
        "right_to_register": rights.register,
        "right_to_invoke": rights.invoke,
        "exp": now + 3600,
    });
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Poll `node` until its service list satisfies `check`.
pub async fn wait_services<F>(node: &Node, check: F) -> bool
where
    F: Fn(&[String]) -> bool,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check(&node.list_services().await) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Poll `node` until it holds exactly `n` connections.
pub async fn wait_connections(node: &Node, n: usize) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if node.list_connections().await.len() == n {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
