//! Starting nodes from config files and rejecting bad credentials.

use rvi_core::config::NodeConfig;
use rvi_core::RviError;
use rvi_node::Node;

use crate::*;

#[tokio::test]
async fn init_requires_a_verifier() -> Result<()> {
    let fx = Fixture::new("noverifier")?;
    let path = fx.write_node("lonely", &Rights { register: &[], invoke: &[] }, SECRET)?;
    let mut config = NodeConfig::load(&path)?;
    config.cred.secret = None;

    let err = Node::init(config).await.err().context("init should fail")?;
    assert!(matches!(err, RviError::InvalidArgument(_)));
    Ok(())
}

#[tokio::test]
async fn init_reports_missing_certificate() -> Result<()> {
    let fx = Fixture::new("nocert")?;
    let path = fx.write_node("broken", &Rights { register: &[], invoke: &[] }, SECRET)?;
    let mut config = NodeConfig::load(&path)?;
    config.device.cert = config.device.cert.with_file_name("missing.pem");

    let err = Node::init(config).await.err().context("init should fail")?;
    assert!(matches!(err, RviError::InvalidArgument(_)));
    Ok(())
}

#[tokio::test]
async fn forged_credential_is_refused() -> Result<()> {
    let fx = Fixture::new("forged")?;
    let (host, port) = fx
        .start("host", Rights { register: &["**"], invoke: &["**"] })
        .await?;
    // Signed with the wrong secret: the host cannot verify it.
    let path = fx.write_node(
        "intruder",
        &Rights { register: &["**"], invoke: &["**"] },
        "not-the-shared-secret",
    )?;
    let (intruder, _) = start_from(&path).await?;

    assert!(intruder.connect("localhost", port).await.is_err());
    assert!(wait_connections(&host, 0).await);
    assert!(intruder.list_connections().await.is_empty());

    intruder.shutdown().await;
    host.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn connections_are_listed_with_detail() -> Result<()> {
    let fx = Fixture::new("detail")?;
    let (host, port) = fx
        .start("host", Rights { register: &["diag.*"], invoke: &[] })
        .await?;
    let (peer, _) = fx
        .start("peer", Rights { register: &[], invoke: &["diag.*"] })
        .await?;
    let id = peer.connect("localhost", port).await?;

    let snapshots = peer.connection_snapshots().await;
    assert_eq!(snapshots.len(), 1);
    let snap = &snapshots[0];
    assert_eq!(snap.id, id);
    assert_eq!(snap.state, rvi_node::ConnectionState::Operational);
    assert!(snap.register_patterns.matches("diag.ping"));
    assert!(!snap.register_patterns.matches("fleet.status"));
    assert_eq!(snap.peer_addr.map(|a| a.port()), Some(port));

    peer.shutdown().await;
    host.shutdown().await;
    Ok(())
}
