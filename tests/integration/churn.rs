//! Services registered, withdrawn and hidden while sessions are up.

use serde_json::{json, Value};

use rvi_core::RviError;

use crate::*;

#[tokio::test]
async fn late_registration_and_withdrawal_propagate() -> Result<()> {
    let fx = Fixture::new("late")?;
    let (vehicle, port) = fx
        .start("vehicle", Rights { register: &["fleet.*"], invoke: &[] })
        .await?;
    let (backend, _) = fx
        .start("backend", Rights { register: &[], invoke: &["fleet.*"] })
        .await?;
    backend.connect("localhost", port).await?;
    assert!(backend.list_services().await.is_empty());

    vehicle
        .register_service("fleet.speed", |_, _| json!(88))
        .await?;
    assert!(wait_services(&backend, |s| s == ["fleet.speed"]).await);

    vehicle.unregister_service("fleet.speed").await?;
    assert!(wait_services(&backend, |s| s.is_empty()).await);

    // Unregistering twice is an error, not a silent no-op.
    assert!(matches!(
        vehicle.unregister_service("fleet.speed").await,
        Err(RviError::NotFound(_))
    ));

    backend.shutdown().await;
    vehicle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn services_outside_invoke_rights_stay_hidden() -> Result<()> {
    let fx = Fixture::new("hidden")?;
    let (vehicle, port) = fx
        .start("vehicle", Rights { register: &["fleet.*", "admin.*"], invoke: &[] })
        .await?;
    vehicle
        .register_service("admin.reboot", |_, _| Value::Null)
        .await?;
    vehicle
        .register_service("fleet.status", |_, _| Value::Null)
        .await?;
    let (backend, _) = fx
        .start("backend", Rights { register: &[], invoke: &["fleet.*"] })
        .await?;

    backend.connect("localhost", port).await?;
    assert_eq!(backend.list_services().await, vec!["fleet.status"]);
    assert!(matches!(
        backend.invoke_service("admin.reboot", json!({})).await,
        Err(RviError::NotFound(_))
    ));

    backend.shutdown().await;
    vehicle.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn announce_beyond_register_rights_is_ignored() -> Result<()> {
    let fx = Fixture::new("overreach")?;
    // The vehicle may only register `fleet.*` but offers a deeper name too.
    let (vehicle, port) = fx
        .start("vehicle", Rights { register: &["fleet.*"], invoke: &[] })
        .await?;
    vehicle
        .register_service("fleet.status", |_, _| Value::Null)
        .await?;
    vehicle
        .register_service("fleet.status.detail", |_, _| Value::Null)
        .await?;
    let (backend, _) = fx
        .start("backend", Rights { register: &[], invoke: &["fleet.**"] })
        .await?;

    backend.connect("localhost", port).await?;
    assert_eq!(backend.list_services().await, vec!["fleet.status"]);
    assert_eq!(backend.list_connections().await.len(), 1);

    backend.shutdown().await;
    vehicle.shutdown().await;
    Ok(())
}
