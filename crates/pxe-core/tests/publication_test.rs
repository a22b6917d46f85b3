//! Integration tests for package publication between two instances.

mod common;

use common::{WIDGET_HANDLER, config, widget_catalog, widgets_bundle};
use pxe_core::{InstanceId, OnUpdate, PackageEngine, PackageId, PublicationService, RegisterOutcome, UpdateEvent};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn engine(dir: &TempDir, name: &str, policy: OnUpdate) -> PackageEngine {
    let mut config = config(&dir.path().join(name), name);
    config.updates.on_update = policy;
    let (catalog, _log) = widget_catalog();
    PackageEngine::start(config, catalog).await.unwrap()
}

/// Links `a` and `b` both ways.
async fn link(a: &PackageEngine, b: &PackageEngine) {
    let a_service: Arc<dyn PublicationService> = a.publication().clone();
    let b_service: Arc<dyn PublicationService> = b.publication().clone();
    a.monitor().instance_linked(b.publication().instance().clone(), b_service).await.unwrap();
    b.monitor().instance_linked(a.publication().instance().clone(), a_service).await.unwrap();
}

#[tokio::test]
async fn test_published_update_is_offered_and_installed() {
    let dir = TempDir::new().unwrap();
    let alpha = engine(&dir, "alpha", OnUpdate::Notify).await;
    let beta = engine(&dir, "beta", OnUpdate::Notify).await;

    widgets_bundle(&alpha.config().install_dir, "1.2.0");
    widgets_bundle(&beta.config().install_dir, "1.0.0");
    alpha.refresh().await;
    beta.refresh().await;
    beta.enable(WIDGET_HANDLER).await.unwrap();

    let id = PackageId::new("acme", "widgets");
    alpha.publish(&id).await.unwrap();
    link(&alpha, &beta).await;

    let updates = beta.monitor().available_updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].advertisement.to_string(), "acme/widgets-1.2.0");
    assert!(updates[0].is_update());
    assert!(updates[0].advertisement.instances.contains(&InstanceId::from("alpha")));

    let outcome = beta.monitor().install(&updates[0].advertisement, &CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, RegisterOutcome::Replaced { .. }));

    let handler = beta.handler(WIDGET_HANDLER).await.unwrap();
    assert_eq!(handler.version().to_string(), "1.2.0");
    assert!(handler.is_loaded());
    assert!(beta.monitor().available_updates().await.is_empty());

    // Beta had the package before and never published it.
    assert!(!beta.publication().is_published(&id));
}

#[tokio::test]
async fn test_new_package_from_peer_is_published_again() {
    let dir = TempDir::new().unwrap();
    let alpha = engine(&dir, "alpha", OnUpdate::Notify).await;
    let beta = engine(&dir, "beta", OnUpdate::Notify).await;

    widgets_bundle(&alpha.config().install_dir, "1.0.0");
    alpha.refresh().await;
    let id = PackageId::new("acme", "widgets");
    alpha.publish(&id).await.unwrap();
    link(&alpha, &beta).await;

    let candidate = beta.monitor().available_updates().await.remove(0);
    assert!(candidate.installed.is_none());
    beta.monitor().install(&candidate.advertisement, &CancellationToken::new()).await.unwrap();

    assert!(beta.publication().is_published(&id));
    let offered = beta.publication().published_packages("en").await.unwrap();
    assert_eq!(offered.len(), 1);
    assert_eq!(offered[0].instances.iter().collect::<Vec<_>>(), vec![&InstanceId::from("beta")]);

    // Alpha runs the same version, so beta's announcement is no update there.
    assert!(alpha.monitor().available_updates().await.is_empty());
}

#[tokio::test]
async fn test_install_policy_updates_automatically() {
    let dir = TempDir::new().unwrap();
    let alpha = engine(&dir, "alpha", OnUpdate::Notify).await;
    let beta = engine(&dir, "beta", OnUpdate::Install).await;

    widgets_bundle(&alpha.config().install_dir, "1.0.0");
    widgets_bundle(&beta.config().install_dir, "1.0.0");
    alpha.refresh().await;
    beta.refresh().await;
    link(&alpha, &beta).await;

    let mut events = beta.monitor().subscribe();
    let staged = widgets_bundle(&dir.path().join("staging"), "1.1.0");
    let id = PackageId::new("acme", "widgets");
    alpha.install_file(&staged).await.unwrap();
    alpha.publish(&id).await.unwrap();

    let installed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(UpdateEvent::Installed { package }) => break package,
                Ok(UpdateEvent::InstallFailed { reason, .. }) => panic!("install failed: {}", reason),
                Ok(_) => {}
                Err(e) => panic!("event channel closed: {}", e),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(installed, "acme/widgets-1.1.0");
    assert_eq!(beta.loader().get(&id).await.unwrap().version().to_string(), "1.1.0");
}

#[tokio::test]
async fn test_unpublish_withdraws_offer() {
    let dir = TempDir::new().unwrap();
    let alpha = engine(&dir, "alpha", OnUpdate::Notify).await;
    let beta = engine(&dir, "beta", OnUpdate::Notify).await;

    widgets_bundle(&alpha.config().install_dir, "1.0.0");
    alpha.refresh().await;
    let id = PackageId::new("acme", "widgets");
    link(&alpha, &beta).await;

    alpha.publish(&id).await.unwrap();
    assert_eq!(beta.monitor().available_updates().await.len(), 1);

    alpha.unpublish(&id).await.unwrap();
    assert!(beta.monitor().available_updates().await.is_empty());
}
