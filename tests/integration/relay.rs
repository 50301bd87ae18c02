//! A backend relaying between two vehicles.
//!
//!   v1 ──▶ hub ◀── v2
//!
//! v1 offers `fleet.v1.status`; the hub learns it and re-announces it to
//! v2, whose invoke travels v2 → hub → v1.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::*;

#[tokio::test]
async fn invoke_is_relayed_through_hub() -> Result<()> {
    let fx = Fixture::new("relay")?;
    let (hub, hub_port) = fx
        .start("hub", Rights { register: &["fleet.**"], invoke: &["fleet.**"] })
        .await?;
    let (v1, _) = fx
        .start("v1", Rights { register: &["fleet.v1.*"], invoke: &[] })
        .await?;
    let (v2, _) = fx
        .start("v2", Rights { register: &[], invoke: &["fleet.**"] })
        .await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    v1.register_service("fleet.v1.status", move |_, params| {
        let _ = tx.send(params.clone());
        json!({"ok": true})
    })
    .await?;

    v1.connect("localhost", hub_port).await?;
    assert!(wait_services(&hub, |s| s == ["fleet.v1.status"]).await);

    v2.connect("localhost", hub_port).await?;
    assert!(wait_services(&v2, |s| s == ["fleet.v1.status"]).await);

    v2.invoke_service("fleet.v1.status", json!({"from": "v2"}))
        .await?;
    let seen = timeout(WAIT, rx.recv())
        .await
        .context("relayed invoke never arrived")?
        .context("callback channel closed")?;
    assert_eq!(seen, json!({"from": "v2"}));

    // v1 leaving withdraws the service all the way to v2.
    v1.shutdown().await;
    assert!(wait_services(&hub, |s| s.is_empty()).await);
    assert!(wait_services(&v2, |s| s.is_empty()).await);

    v2.shutdown().await;
    hub.shutdown().await;
    Ok(())
}
