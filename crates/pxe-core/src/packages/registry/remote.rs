//! Registry over a paginated HTTP artifact catalog.
//!
//! The catalog speaks the repository manager search API:
//!
//! - `GET {base}/service/rest/v1/status` must answer 200 before searching
//! - `GET {base}/service/rest/v1/search?maven.groupId=G[&continuationToken=T]`
//!   returns `{ continuationToken, items: [{ group, name, version, assets }] }`
//!
//! Each item's assets are classified by their `maven2.extension`: the bundle
//! itself, its `.md5` integrity file and a metadata file (`pom` or
//! `properties`) carrying the `compatible` host version. Integrity and
//! metadata files are only fetched when a descriptor asks for them.

use super::{PackageRegistry, RegistryError, Result, SourceKey, keep_latest};
use crate::config::RemoteRegistryConfig;
use crate::packages::bundle::{self, COMPATIBLE_PROPERTY};
use crate::packages::descriptor::{
    self, ByteStream, DescriptorError, PackageDescriptor, PackageId, RemoteMetadata, RemoteParts,
};
use crate::packages::version::Version;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const STATUS_PATH: [&str; 4] = ["service", "rest", "v1", "status"];
const SEARCH_PATH: [&str; 4] = ["service", "rest", "v1", "search"];

/// Asset classification by `maven2.extension`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum AssetKind {
    Bundle,
    Checksum,
    Metadata,
}

impl AssetKind {
    fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "bundle" => Some(Self::Bundle),
            "bundle.md5" => Some(Self::Checksum),
            "pom" | "properties" => Some(Self::Metadata),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(rename = "continuationToken", default)]
    continuation_token: Option<String>,
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    group: String,
    name: String,
    version: String,
    #[serde(default)]
    assets: Vec<AssetItem>,
}

#[derive(Debug, Deserialize)]
struct AssetItem {
    #[serde(rename = "downloadUrl")]
    download_url: String,
    #[serde(default)]
    maven2: Option<Maven2>,
}

#[derive(Debug, Deserialize)]
struct Maven2 {
    #[serde(default)]
    extension: Option<String>,
}

/// HTTP client for one catalog, carrying its proxy and credentials.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    auth: Option<(String, String)>,
}

impl CatalogClient {
    /// Builds a client from the catalog configuration.
    ///
    /// # Errors
    /// Returns error if the proxy URL is invalid or the client cannot be built
    pub fn new(config: &RemoteRegistryConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let mut builder = reqwest::Client::builder().connect_timeout(timeout).read_timeout(timeout);

        if let Some(proxy_config) = &config.proxy {
            let mut proxy = reqwest::Proxy::all(&proxy_config.url)?;
            if let Some(credentials) = &proxy_config.auth {
                proxy = proxy.basic_auth(&credentials.user, &credentials.password);
            }
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            http: builder.build()?,
            auth: config.auth.as_ref().map(|c| (c.user.clone(), c.password.clone())),
        })
    }

    /// Sends an authenticated GET.
    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        let mut request = self.http.get(url);
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }
        Ok(request.send().await?)
    }

    /// Fetches a small text asset.
    async fn get_text(&self, url: &Url) -> Result<String> {
        let response = self.get(url.clone()).await?;
        if response.status() != StatusCode::OK {
            return Err(RegistryError::Status(response.status().as_u16()));
        }
        Ok(response.text().await?)
    }

    /// Streams a bundle.
    ///
    /// # Errors
    /// Returns error if the request fails or the server does not answer 200
    pub async fn download(&self, url: &Url) -> Result<ByteStream> {
        let response = self.get(url.clone()).await?;
        if response.status() != StatusCode::OK {
            return Err(RegistryError::Status(response.status().as_u16()));
        }
        Ok(response.bytes_stream().map_err(std::io::Error::other).boxed())
    }
}

/// Lazily fetched assets of one remote package.
#[derive(Debug)]
struct RemoteAssets {
    client: CatalogClient,
    checksum: Option<Url>,
    metadata: Option<Url>,
}

#[async_trait]
impl RemoteMetadata for RemoteAssets {
    async fn fetch_checksum(&self) -> descriptor::Result<Option<String>> {
        let Some(url) = &self.checksum else { return Ok(None) };
        let text = self.client.get_text(url).await.map_err(remote_error)?;
        Ok(text
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().next())
            .map(str::to_ascii_uppercase))
    }

    async fn fetch_compatible_with(&self) -> descriptor::Result<Option<Version>> {
        let Some(url) = &self.metadata else { return Ok(None) };
        let text = self.client.get_text(url).await.map_err(remote_error)?;
        parse_compatible(&text).map(|raw| Version::parse(&raw)).transpose().map_err(Into::into)
    }

    async fn open_bundle(&self, location: &Url) -> descriptor::Result<ByteStream> {
        self.client.download(location).await.map_err(remote_error)
    }
}

fn remote_error(e: RegistryError) -> DescriptorError {
    DescriptorError::Remote(e.to_string())
}

/// Extracts the compatible host version from a pom or properties document.
fn parse_compatible(text: &str) -> Option<String> {
    let open = format!("<{}>", COMPATIBLE_PROPERTY);
    let close = format!("</{}>", COMPATIBLE_PROPERTY);
    if let Some(start) = text.find(&open) {
        let rest = &text[start + open.len()..];
        return rest.find(&close).map(|end| rest[..end].trim().to_string()).filter(|v| !v.is_empty());
    }
    bundle::parse_properties(text).remove(COMPATIBLE_PROPERTY).filter(|v| !v.is_empty())
}

/// Registry backed by a remote catalog.
#[derive(Debug, Clone)]
pub struct RemoteRegistry {
    name: String,
    base_url: Url,
    group_id: String,
    host_version: Version,
    client: CatalogClient,
}

impl RemoteRegistry {
    /// Creates a registry from its configuration.
    ///
    /// # Arguments
    /// * `config` - Catalog configuration
    /// * `host_version` - Host version used to drop incompatible packages
    ///
    /// # Errors
    /// Returns error if the URL or the proxy settings are invalid
    pub fn new(config: &RemoteRegistryConfig, host_version: Version) -> Result<Self> {
        let base_url =
            Url::parse(&config.url).map_err(|e| RegistryError::InvalidUrl(format!("{}: {}", config.url, e)))?;
        Ok(Self {
            name: config.name.clone(),
            base_url,
            group_id: config.group_id.clone(),
            host_version,
            client: CatalogClient::new(config)?,
        })
    }

    /// HTTP client of the catalog.
    pub fn client(&self) -> &CatalogClient {
        &self.client
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RegistryError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn search_url(&self, token: Option<&str>) -> Result<Url> {
        let mut url = self.endpoint(&SEARCH_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = token {
                query.append_pair("continuationToken", token);
            }
            query.append_pair("maven.groupId", &self.group_id);
        }
        Ok(url)
    }

    /// Whether the catalog server reports itself available.
    pub async fn is_available(&self) -> bool {
        let url = match self.endpoint(&STATUS_PATH) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(registry = %self.name, error = %e, "Remote registry URL invalid");
                return false;
            }
        };

        match self.client.get(url).await {
            Ok(response) if response.status() == StatusCode::OK => true,
            Ok(response) => {
                tracing::warn!(
                    registry = %self.name,
                    status = response.status().as_u16(),
                    "Remote registry server not available"
                );
                false
            }
            Err(e) => {
                tracing::warn!(registry = %self.name, error = %e, "Remote registry server not available");
                false
            }
        }
    }

    async fn fetch_page(&self, token: Option<&str>) -> Result<SearchPage> {
        let response = self.client.get(self.search_url(token)?).await?;
        if response.status() != StatusCode::OK {
            return Err(RegistryError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    fn descriptor_for(&self, item: SearchItem) -> Option<Arc<PackageDescriptor>> {
        let version = match Version::parse(&item.version) {
            Ok(version) => version,
            Err(e) => {
                tracing::warn!(
                    registry = %self.name,
                    artifact = %format!("{}/{}", item.group, item.name),
                    error = %e,
                    "Skipping artifact with invalid version"
                );
                return None;
            }
        };

        let mut assets: BTreeMap<AssetKind, Url> = BTreeMap::new();
        for asset in item.assets {
            let Some(kind) = asset
                .maven2
                .and_then(|m| m.extension)
                .and_then(|extension| AssetKind::from_extension(&extension))
            else {
                continue;
            };
            match Url::parse(&asset.download_url) {
                Ok(url) => {
                    assets.insert(kind, url);
                }
                Err(e) => tracing::debug!(url = %asset.download_url, error = %e, "Ignoring asset with invalid URL"),
            }
        }

        let Some(location) = assets.remove(&AssetKind::Bundle) else {
            tracing::debug!(
                registry = %self.name,
                artifact = %format!("{}/{}-{}", item.group, item.name, version),
                "Skipping artifact without bundle asset"
            );
            return None;
        };

        Some(Arc::new(PackageDescriptor::remote(RemoteParts {
            id: PackageId::new(item.group, item.name),
            version,
            location,
            metadata: Arc::new(RemoteAssets {
                client: self.client.clone(),
                checksum: assets.remove(&AssetKind::Checksum),
                metadata: assets.remove(&AssetKind::Metadata),
            }),
        })))
    }
}

#[async_trait]
impl PackageRegistry for RemoteRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> SourceKey {
        SourceKey::Remote(self.name.clone())
    }

    async fn read_packages(&self) -> Vec<Arc<PackageDescriptor>> {
        tracing::debug!(registry = %self.name, url = %self.base_url, "Loading remote registry");
        if !self.is_available().await {
            return Vec::new();
        }

        let mut packages = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = match self.fetch_page(token.as_deref()).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(registry = %self.name, error = %e, "Remote registry not available");
                    break;
                }
            };

            packages.extend(page.items.into_iter().filter_map(|item| self.descriptor_for(item)));

            match page.continuation_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }

        if packages.is_empty() {
            tracing::warn!(registry = %self.name, "Remote registry does not contain packages");
        }
        packages
    }

    /// Drops versions the host cannot run, then keeps the highest remaining
    /// version per package. Compatibility is only fetched until a compatible
    /// version is found.
    async fn filter_packages(
        &self,
        packages: Vec<Arc<PackageDescriptor>>,
    ) -> Vec<Arc<PackageDescriptor>> {
        let mut by_id: BTreeMap<PackageId, Vec<Arc<PackageDescriptor>>> = BTreeMap::new();
        for descriptor in packages {
            by_id.entry(descriptor.id().clone()).or_default().push(descriptor);
        }

        let mut selected = Vec::with_capacity(by_id.len());
        for (_, mut candidates) in by_id {
            candidates.sort_by(|a, b| b.version().cmp(a.version()));
            for candidate in candidates {
                match candidate.is_compatible_with(&self.host_version).await {
                    Ok(true) => {
                        selected.push(candidate);
                        break;
                    }
                    Ok(false) => tracing::debug!(
                        registry = %self.name,
                        package = %candidate,
                        host_version = %self.host_version,
                        "Skipping incompatible package"
                    ),
                    Err(e) => tracing::warn!(
                        registry = %self.name,
                        package = %candidate,
                        error = %e,
                        "Skipping package with unreadable metadata"
                    ),
                }
            }
        }
        keep_latest(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(url: &str) -> RemoteRegistry {
        RemoteRegistry::new(&RemoteRegistryConfig::new("central", url), Version::parse("5.0").unwrap())
            .unwrap()
    }

    #[test]
    fn test_search_url() {
        let registry = registry("http://repo.example.com/nexus/");
        let first = registry.search_url(None).unwrap();
        assert_eq!(
            first.as_str(),
            "http://repo.example.com/nexus/service/rest/v1/search?maven.groupId=com.pxe"
        );
        let next = registry.search_url(Some("abc=")).unwrap();
        assert_eq!(
            next.as_str(),
            "http://repo.example.com/nexus/service/rest/v1/search?continuationToken=abc%3D&maven.groupId=com.pxe"
        );
    }

    #[test]
    fn test_parse_compatible() {
        let pom = "<project><properties><compatible> 5.1 </compatible></properties></project>";
        assert_eq!(parse_compatible(pom), Some("5.1".to_string()));
        assert_eq!(parse_compatible("compatible=4.2\n"), Some("4.2".to_string()));
        assert_eq!(parse_compatible("<project/>"), None);
    }

    #[test]
    fn test_descriptor_requires_bundle_asset() {
        let registry = registry("http://repo.example.com");
        let item: SearchItem = serde_json::from_str(
            r#"{"group": "acme", "name": "widgets", "version": "1.0",
                "assets": [{"downloadUrl": "http://repo.example.com/w.pom", "maven2": {"extension": "pom"}}]}"#,
        )
        .unwrap();
        assert!(registry.descriptor_for(item).is_none());

        let item: SearchItem = serde_json::from_str(
            r#"{"group": "acme", "name": "widgets", "version": "1.0",
                "assets": [{"downloadUrl": "http://repo.example.com/w.bundle", "maven2": {"extension": "bundle"}}]}"#,
        )
        .unwrap();
        let descriptor = registry.descriptor_for(item).unwrap();
        assert_eq!(descriptor.to_string(), "acme/widgets-1.0");
    }
}
