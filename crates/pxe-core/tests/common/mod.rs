//! Shared fixtures for pxe-core integration tests.
//!
//! Builds bundles on disk, a catalog of recording extensions, and a mocked
//! remote artifact catalog.

#![allow(dead_code)]

use async_trait::async_trait;
use mockito::{Matcher, Mock, ServerGuard};
use pxe_core::config::{Config, RemoteRegistryConfig};
use pxe_core::packages::checksum;
use pxe_core::{BundleBuilder, Extension, ExtensionCatalog, ExtensionContext, ExtensionError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Extension type every fixture bundle declares.
pub const WIDGET_TYPE: &str = "acme.Widget";

/// Handler id of the widget extension of `acme/widgets`.
pub const WIDGET_HANDLER: &str = "acme/widgets/acme.Widget";

/// Extension that records which package versions were activated.
#[derive(Debug)]
pub struct RecordingExtension {
    version: String,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Extension for RecordingExtension {
    async fn load(&self) -> Result<(), ExtensionError> {
        self.log.lock().unwrap().push(format!("load {}", self.version));
        Ok(())
    }

    async fn unload(&self) -> Result<bool, ExtensionError> {
        self.log.lock().unwrap().push(format!("unload {}", self.version));
        Ok(true)
    }
}

/// Catalog knowing [`WIDGET_TYPE`], plus the shared activation log.
pub fn widget_catalog() -> (ExtensionCatalog, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&log);

    let catalog = ExtensionCatalog::new();
    catalog.register(
        WIDGET_TYPE,
        Arc::new(move |context: &ExtensionContext| -> Result<Arc<dyn Extension>, ExtensionError> {
            Ok(Arc::new(RecordingExtension {
                version: context.version.to_string(),
                log: Arc::clone(&shared),
            }))
        }),
    );
    (catalog, log)
}

/// Engine configuration rooted in `dir`.
pub fn config(dir: &Path, instance_id: &str) -> Config {
    Config {
        install_dir: dir.join("plugins"),
        host_version: "2.0".to_string(),
        instance_id: instance_id.to_string(),
        ..Config::default()
    }
}

/// Writes an `acme/widgets` bundle into `dir`.
pub fn widgets_bundle(dir: &Path, version: &str) -> PathBuf {
    BundleBuilder::new("acme", "widgets", version)
        .author("Acme Corp")
        .compatible_with("1.0")
        .extension(WIDGET_TYPE, "Widget")
        .write_into(dir)
        .unwrap()
}

/// A registry entry pointing at the mock catalog, searching group `acme`.
pub fn registry_config(server: &ServerGuard) -> RemoteRegistryConfig {
    let mut registry = RemoteRegistryConfig::new("central", &server.url());
    registry.group_id = "acme".to_string();
    registry
}

/// Mock of the catalog status endpoint.
pub fn mock_status(server: &mut ServerGuard, status: usize) -> Mock {
    server.mock("GET", "/service/rest/v1/status").with_status(status).create()
}

/// Mock of one search page for group `acme`.
pub fn mock_search_page(server: &mut ServerGuard, token: Option<&str>, body: &str) -> Mock {
    let query = match token {
        Some(token) => format!("continuationToken={}&maven.groupId=acme", token),
        None => "maven.groupId=acme".to_string(),
    };
    server
        .mock("GET", "/service/rest/v1/search")
        .match_query(Matcher::Exact(query))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .create()
}

/// Search item for `acme/widgets` at `version`, with bundle, checksum and
/// metadata assets under `/repo`.
pub fn search_item(server: &ServerGuard, version: &str) -> serde_json::Value {
    let base = format!("{}/repo/acme/widgets/{}/widgets-{}", server.url(), version, version);
    serde_json::json!({
        "group": "acme",
        "name": "widgets",
        "version": version,
        "assets": [
            { "downloadUrl": format!("{}.bundle", base), "maven2": { "extension": "bundle" } },
            { "downloadUrl": format!("{}.bundle.md5", base), "maven2": { "extension": "bundle.md5" } },
            { "downloadUrl": format!("{}.properties", base), "maven2": { "extension": "properties" } }
        ]
    })
}

/// Serves the assets of a bundle file as listed by [`search_item`].
pub fn mock_assets(server: &mut ServerGuard, version: &str, bundle: &Path, compatible: &str) -> Vec<Mock> {
    let base = format!("/repo/acme/widgets/{}/widgets-{}", version, version);
    let bytes = std::fs::read(bundle).unwrap();
    let md5 = checksum::file_checksum(bundle).unwrap().to_ascii_lowercase();

    vec![
        server.mock("GET", format!("{}.bundle", base).as_str()).with_status(200).with_body(bytes).create(),
        server
            .mock("GET", format!("{}.bundle.md5", base).as_str())
            .with_status(200)
            .with_body(format!("{}  widgets-{}.bundle\n", md5, version))
            .create(),
        server
            .mock("GET", format!("{}.properties", base).as_str())
            .with_status(200)
            .with_body(format!("compatible={}\n", compatible))
            .create(),
    ]
}
