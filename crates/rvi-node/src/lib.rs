//! rvi-node: TLS sessions, the session lifecycle and the local API.
//!
//! ```no_run
//! # async fn run() -> Result<(), rvi_core::RviError> {
//! use rvi_core::config::NodeConfig;
//! use rvi_node::Node;
//!
//! let config = NodeConfig::load("rvi.config".as_ref())?;
//! let node = Node::init(config).await?;
//! node.register_service("diag.ping", |_name, params| params.clone()).await?;
//! let peer = node.connect("backend.example.com", 8807).await?;
//! println!("services: {:?}", node.list_services().await);
//! node.disconnect(peer).await?;
//! # Ok(())
//! # }
//! ```

pub mod node;
pub mod tls;
pub mod transport;

pub use node::{Node, NodeBuilder};
pub use rvi_services::{ConnectionSnapshot, ConnectionState, InvokeOutcome};
pub use tls::{TlsConfig, TlsConfigBuilder, TlsError};
