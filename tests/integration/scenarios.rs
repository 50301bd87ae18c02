//! The four end-to-end scenarios: announce, invoke, disconnect, unknown name.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use rvi_core::RviError;
use rvi_node::InvokeOutcome;

use crate::*;

/// A vehicle granted `fleet.*` announces `fleet.status`; the backend ends up
/// with exactly that service, registered by the vehicle's connection.
#[tokio::test]
async fn announced_service_lands_in_registry() -> Result<()> {
    let fx = Fixture::new("announce")?;
    let (vehicle, port) = fx
        .start("vehicle", Rights { register: &["fleet.*"], invoke: &[] })
        .await?;
    vehicle
        .register_service("fleet.status", |_, _| json!({"speed": 0}))
        .await?;
    let (backend, _) = fx
        .start("backend", Rights { register: &[], invoke: &["fleet.*"] })
        .await?;

    let c1 = backend.connect("localhost", port).await?;
    assert_eq!(backend.list_services().await, vec!["fleet.status"]);

    // Invoking it goes to C1.
    let outcome = backend.invoke_service("fleet.status", json!({})).await?;
    assert_eq!(outcome, InvokeOutcome::Pending { registrant: c1 });

    backend.shutdown().await;
    vehicle.shutdown().await;
    Ok(())
}

/// A local `diag.ping` is invoked by a peer granted `diag.*`; the callback
/// runs with the peer's parameters.
#[tokio::test]
async fn remote_invoke_runs_local_callback() -> Result<()> {
    let fx = Fixture::new("invoke")?;
    let (host, port) = fx
        .start("host", Rights { register: &["diag.*"], invoke: &[] })
        .await?;
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    host.register_service("diag.ping", move |_, params| {
        let _ = tx.send(params.clone());
        json!({"pong": params["seq"]})
    })
    .await?;

    let (c2, _) = fx
        .start("c2", Rights { register: &[], invoke: &["diag.*"] })
        .await?;
    c2.connect("localhost", port).await?;
    c2.invoke_service("diag.ping", json!({"seq": 42})).await?;

    let seen = timeout(WAIT, rx.recv())
        .await
        .context("callback never ran")?
        .context("callback channel closed")?;
    assert_eq!(seen, json!({"seq": 42}));

    c2.shutdown().await;
    host.shutdown().await;
    Ok(())
}

/// After C1 disconnects, its services are gone from the backend.
#[tokio::test]
async fn disconnect_forgets_announced_services() -> Result<()> {
    let fx = Fixture::new("disconnect")?;
    let (vehicle, port) = fx
        .start("vehicle", Rights { register: &["fleet.*"], invoke: &[] })
        .await?;
    vehicle
        .register_service("fleet.status", |_, _| Value::Null)
        .await?;
    let (backend, _) = fx
        .start("backend", Rights { register: &[], invoke: &["fleet.*"] })
        .await?;

    let c1 = backend.connect("localhost", port).await?;
    assert_eq!(backend.list_services().await, vec!["fleet.status"]);

    backend.disconnect(c1).await?;
    assert!(backend.list_services().await.is_empty());
    assert!(matches!(
        backend.invoke_service("fleet.status", json!({})).await,
        Err(RviError::NotFound(_))
    ));
    assert!(wait_connections(&vehicle, 0).await);

    backend.shutdown().await;
    vehicle.shutdown().await;
    Ok(())
}

/// An invoke for a name nobody registered fails locally with `NotFound`.
#[tokio::test]
async fn unknown_service_is_not_found() -> Result<()> {
    let fx = Fixture::new("unknown")?;
    let (host, port) = fx
        .start("host", Rights { register: &["**"], invoke: &["**"] })
        .await?;
    let (peer, _) = fx
        .start("peer", Rights { register: &["**"], invoke: &["**"] })
        .await?;
    peer.connect("localhost", port).await?;

    let err = peer
        .invoke_service("nope.foo", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, RviError::NotFound(_)));
    assert!(host.list_services().await.is_empty());

    peer.shutdown().await;
    host.shutdown().await;
    Ok(())
}
