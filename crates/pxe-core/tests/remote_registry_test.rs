//! Integration tests for the remote catalog registry.

mod common;

use common::{mock_assets, mock_search_page, mock_status, registry_config, search_item, widgets_bundle};
use pxe_core::packages::PackageRegistry;
use pxe_core::packages::registry::RemoteRegistry;
use pxe_core::{PackageId, SourceKey, Version};
use tempfile::TempDir;

fn registry(server: &mockito::ServerGuard, host_version: &str) -> RemoteRegistry {
    RemoteRegistry::new(&registry_config(server), Version::parse(host_version).unwrap()).unwrap()
}

#[tokio::test]
async fn test_follows_continuation_tokens() {
    let mut server = mockito::Server::new_async().await;
    let _status = mock_status(&mut server, 200);

    let first = serde_json::json!({
        "continuationToken": "page-2",
        "items": [search_item(&server, "1.0.0")]
    });
    let second = serde_json::json!({
        "continuationToken": null,
        "items": [search_item(&server, "1.2.0")]
    });
    let page_one = mock_search_page(&mut server, None, &first.to_string());
    let page_two = mock_search_page(&mut server, Some("page-2"), &second.to_string());

    let registry = registry(&server, "2.0");
    let raw = registry.read_packages().await;
    page_one.assert_async().await;
    page_two.assert_async().await;

    let versions: Vec<String> = raw.iter().map(|d| d.version().to_string()).collect();
    assert_eq!(versions, vec!["1.0.0", "1.2.0"]);
    assert_eq!(registry.source(), SourceKey::Remote("central".to_string()));
}

#[tokio::test]
async fn test_unavailable_server_lists_nothing() {
    let mut server = mockito::Server::new_async().await;
    let _status = mock_status(&mut server, 503);
    let search = server.mock("GET", "/service/rest/v1/search").expect(0).create_async().await;

    let registry = registry(&server, "2.0");
    assert!(!registry.is_available().await);
    assert!(registry.packages().await.is_empty());
    search.assert_async().await;
}

#[tokio::test]
async fn test_keeps_newest_compatible_version() {
    let dir = TempDir::new().unwrap();
    let mut server = mockito::Server::new_async().await;
    let _status = mock_status(&mut server, 200);

    let body = serde_json::json!({
        "items": [search_item(&server, "1.0.0"), search_item(&server, "1.2.0"), search_item(&server, "1.1.0")]
    });
    let _page = mock_search_page(&mut server, None, &body.to_string());

    // 1.2.0 needs a newer host than the one running.
    let _old = mock_assets(&mut server, "1.0.0", &widgets_bundle(&dir.path().join("a"), "1.0.0"), "1.0");
    let _mid = mock_assets(&mut server, "1.1.0", &widgets_bundle(&dir.path().join("b"), "1.1.0"), "2.0");
    let _new = mock_assets(&mut server, "1.2.0", &widgets_bundle(&dir.path().join("c"), "1.2.0"), "3.0");

    let packages = registry(&server, "2.0").packages().await;
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].id(), &PackageId::new("acme", "widgets"));
    assert_eq!(packages[0].version().to_string(), "1.1.0");
}

#[tokio::test]
async fn test_remote_checksum_is_normalized() {
    let dir = TempDir::new().unwrap();
    let mut server = mockito::Server::new_async().await;
    let _status = mock_status(&mut server, 200);
    let body = serde_json::json!({ "items": [search_item(&server, "1.2.0")] });
    let _page = mock_search_page(&mut server, None, &body.to_string());

    let bundle = widgets_bundle(dir.path(), "1.2.0");
    let _assets = mock_assets(&mut server, "1.2.0", &bundle, "1.0");

    let packages = registry(&server, "2.0").packages().await;
    let checksum = packages[0].checksum().await.unwrap();
    assert_eq!(checksum, pxe_core::packages::checksum::file_checksum(&bundle).unwrap());
    assert!(checksum.chars().all(|c| !c.is_ascii_lowercase()));
}
