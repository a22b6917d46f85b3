//! End-to-end tests: installing and replacing packages through the engine.

mod common;

use common::{
    WIDGET_HANDLER, config, mock_assets, mock_search_page, mock_status, registry_config, search_item,
    widget_catalog, widgets_bundle,
};
use pxe_core::packages::download::DownloadError;
use pxe_core::{PackageEngine, PackageId, PxeError, RegisterOutcome, Version};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_registry_update_replaces_installed_version() {
    let dir = TempDir::new().unwrap();
    let mut server = mockito::Server::new_async().await;
    let _status = mock_status(&mut server, 200);
    let body = serde_json::json!({ "items": [search_item(&server, "1.2.0")] });
    let _page = mock_search_page(&mut server, None, &body.to_string());
    let staged = widgets_bundle(&dir.path().join("staging"), "1.2.0");
    let _assets = mock_assets(&mut server, "1.2.0", &staged, "1.0");

    let mut config = config(dir.path(), "alpha");
    config.registries.push(registry_config(&server));
    let old_file = widgets_bundle(&config.install_dir, "1.0.0");

    let (catalog, log) = widget_catalog();
    let engine = PackageEngine::start(config, catalog).await.unwrap();
    engine.enable(WIDGET_HANDLER).await.unwrap();

    let id = PackageId::new("acme", "widgets");
    let entries = engine.refresh().await;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].update_available());

    let outcome = engine.install_update(&id, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RegisterOutcome::Replaced { previous: Version::parse("1.0.0").unwrap() });

    assert!(!old_file.exists());
    let new_file = engine.config().install_dir.join("acme-widgets-1.2.0.bundle");
    assert_eq!(std::fs::read(&new_file).unwrap(), std::fs::read(&staged).unwrap());

    let handler = engine.handler(WIDGET_HANDLER).await.unwrap();
    assert_eq!(handler.version().to_string(), "1.2.0");
    assert!(handler.is_enabled());
    assert!(handler.is_loaded());
    assert_eq!(*log.lock().unwrap(), vec!["load 1.0.0", "unload 1.0.0", "load 1.2.0"]);

    let entry = engine.provider().entry(&id).await.unwrap();
    assert!(!entry.update_available());
    assert_eq!(entry.local().unwrap().version().to_string(), "1.2.0");
}

#[tokio::test]
async fn test_corrupt_download_leaves_installed_version() {
    let dir = TempDir::new().unwrap();
    let mut server = mockito::Server::new_async().await;
    let _status = mock_status(&mut server, 200);
    let body = serde_json::json!({ "items": [search_item(&server, "1.2.0")] });
    let _page = mock_search_page(&mut server, None, &body.to_string());

    // The catalog lists the checksum of a different build.
    let staged = widgets_bundle(&dir.path().join("staging"), "1.2.0");
    let other = pxe_core::BundleBuilder::new("acme", "widgets", "1.2.0")
        .author("Someone Else")
        .write_into(&dir.path().join("other"))
        .unwrap();
    let base = "/repo/acme/widgets/1.2.0/widgets-1.2.0";
    let _bundle = server
        .mock("GET", format!("{}.bundle", base).as_str())
        .with_status(200)
        .with_body(std::fs::read(&staged).unwrap())
        .create();
    let _md5 = server
        .mock("GET", format!("{}.bundle.md5", base).as_str())
        .with_status(200)
        .with_body(pxe_core::packages::checksum::file_checksum(&other).unwrap())
        .create();
    let _properties = server
        .mock("GET", format!("{}.properties", base).as_str())
        .with_status(200)
        .with_body("compatible=1.0\n")
        .create();

    let mut config = config(dir.path(), "alpha");
    config.registries.push(registry_config(&server));
    let old_file = widgets_bundle(&config.install_dir, "1.0.0");

    let (catalog, _log) = widget_catalog();
    let engine = PackageEngine::start(config, catalog).await.unwrap();
    engine.refresh().await;

    let id = PackageId::new("acme", "widgets");
    let result = engine.install_update(&id, &CancellationToken::new()).await;
    assert!(matches!(result, Err(PxeError::Download(DownloadError::ChecksumMismatch { .. }))));

    assert!(old_file.exists());
    assert!(!engine.config().install_dir.join("acme-widgets-1.2.0.bundle").exists());
    assert_eq!(engine.loader().get(&id).await.unwrap().version().to_string(), "1.0.0");
}

#[tokio::test]
async fn test_install_of_installed_version_is_refused() {
    let dir = TempDir::new().unwrap();
    let mut server = mockito::Server::new_async().await;
    let _status = mock_status(&mut server, 200);
    let body = serde_json::json!({ "items": [search_item(&server, "1.0.0")] });
    let _page = mock_search_page(&mut server, None, &body.to_string());
    let staged = widgets_bundle(&dir.path().join("staging"), "1.0.0");
    let _assets = mock_assets(&mut server, "1.0.0", &staged, "1.0");

    let mut config = config(dir.path(), "alpha");
    config.registries.push(registry_config(&server));
    widgets_bundle(&config.install_dir, "1.0.0");

    let (catalog, _log) = widget_catalog();
    let engine = PackageEngine::start(config, catalog).await.unwrap();
    let entries = engine.refresh().await;
    assert!(!entries[0].update_available());

    let result = engine.install_update(&PackageId::new("acme", "widgets"), &CancellationToken::new()).await;
    assert!(matches!(result, Err(PxeError::Download(DownloadError::AlreadyInstalled { .. }))));
}

#[tokio::test]
async fn test_refresh_removes_deleted_bundles() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), "alpha");
    let file = widgets_bundle(&config.install_dir, "1.0.0");

    let (catalog, _log) = widget_catalog();
    let engine = PackageEngine::start(config, catalog).await.unwrap();
    assert_eq!(engine.provider().packages().await.len(), 1);

    std::fs::remove_file(&file).unwrap();
    assert!(engine.refresh().await.is_empty());
    assert!(engine.loader().packages().await.is_empty());
}
