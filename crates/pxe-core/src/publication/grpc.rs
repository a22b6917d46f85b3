//! gRPC transport for the publication protocol.
//!
//! [`PublicationGrpcServer`] exposes any [`PublicationService`] to peers and
//! [`GrpcPublicationClient`] is the peer-side view of a remote instance.

use super::{
    AdvertisedExtension, Advertisement, InstanceId, PackageByteStream, PublicationError, PublicationService,
    Result,
};
use crate::packages::bundle::{ChangeEntry, VersionEntry};
use crate::packages::descriptor::PackageId;
use crate::packages::handler::{PropertyAccess, PropertySummary};
use crate::packages::version::Version;
use crate::proto;
use crate::proto::publication_client::PublicationClient;
use crate::proto::publication_server::Publication;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, warn};

/// Metadata key carrying the unknown extension type of a rejected advertisement.
const EXTENSION_TYPE_METADATA: &str = "x-extension-type";
const REQUESTED_VERSION_METADATA: &str = "x-requested-version";
const INSTALLED_VERSION_METADATA: &str = "x-installed-version";

/// Connect timeout for peer channels.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn optional(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

impl From<&Advertisement> for proto::Advertisement {
    fn from(advertisement: &Advertisement) -> Self {
        Self {
            vendor: advertisement.vendor.clone(),
            title: advertisement.title.clone(),
            version: advertisement.version.to_string(),
            author: advertisement.author.clone().unwrap_or_default(),
            history: advertisement
                .history
                .iter()
                .map(|entry| proto::VersionEntry {
                    version: entry.version.clone(),
                    date: entry.date.clone().unwrap_or_default(),
                    changes: entry
                        .changes
                        .iter()
                        .map(|change| proto::ChangeEntry {
                            scope: change.scope.clone(),
                            kind: change.kind.clone(),
                            description: change.description.clone(),
                        })
                        .collect(),
                })
                .collect(),
            extensions: advertisement
                .extensions
                .iter()
                .map(|extension| proto::AdvertisedExtension {
                    extension_id: extension.extension_id.clone(),
                    type_name: extension.type_name.clone(),
                    display_name: extension.display_name.clone(),
                    description: extension.description.clone().unwrap_or_default(),
                    icon: extension.icon.clone().unwrap_or_default(),
                    properties: extension
                        .properties
                        .iter()
                        .map(|property| proto::PropertySummary {
                            name: property.name.clone(),
                            value: property.value.clone(),
                            icon: property.icon.clone().unwrap_or_default(),
                            access: property.access.as_str().to_string(),
                        })
                        .collect(),
                })
                .collect(),
            instances: advertisement.instances.iter().map(ToString::to_string).collect(),
        }
    }
}

impl TryFrom<proto::Advertisement> for Advertisement {
    type Error = PublicationError;

    fn try_from(message: proto::Advertisement) -> Result<Self> {
        let version = Version::parse(&message.version)
            .map_err(|e| PublicationError::Transport(format!("invalid advertised version: {}", e)))?;

        Ok(Self {
            vendor: message.vendor,
            title: message.title,
            version,
            author: optional(message.author),
            history: message
                .history
                .into_iter()
                .map(|entry| VersionEntry {
                    version: entry.version,
                    date: optional(entry.date),
                    changes: entry
                        .changes
                        .into_iter()
                        .map(|change| ChangeEntry {
                            scope: change.scope,
                            kind: change.kind,
                            description: change.description,
                        })
                        .collect(),
                })
                .collect(),
            extensions: message
                .extensions
                .into_iter()
                .map(|extension| AdvertisedExtension {
                    extension_id: extension.extension_id,
                    type_name: extension.type_name,
                    display_name: extension.display_name,
                    description: optional(extension.description),
                    icon: optional(extension.icon),
                    properties: extension
                        .properties
                        .into_iter()
                        .map(|property| PropertySummary {
                            name: property.name,
                            value: property.value,
                            icon: optional(property.icon),
                            access: PropertyAccess::from_name(&property.access),
                        })
                        .collect(),
                })
                .collect(),
            instances: message.instances.into_iter().map(InstanceId).collect(),
        })
    }
}

/// Converts a service error into a gRPC status.
fn to_status(error: PublicationError) -> Status {
    match error {
        PublicationError::PackageNotFound(package) => Status::not_found(package),
        PublicationError::VersionMismatch { package, requested, installed } => {
            let mut status = Status::failed_precondition(package);
            for (key, version) in [(REQUESTED_VERSION_METADATA, requested), (INSTALLED_VERSION_METADATA, installed)] {
                if let Ok(value) = MetadataValue::try_from(version.as_str()) {
                    status.metadata_mut().insert(key, value);
                }
            }
            status
        }
        PublicationError::UnknownExtensionType { package, type_name } => {
            let mut status = Status::unimplemented(package);
            if let Ok(value) = MetadataValue::try_from(type_name.as_str()) {
                status.metadata_mut().insert(EXTENSION_TYPE_METADATA, value);
            }
            status
        }
        PublicationError::Transport(message) => Status::unavailable(message),
        other => Status::internal(other.to_string()),
    }
}

/// Converts a gRPC status back into a service error.
fn from_status(status: &Status) -> PublicationError {
    let metadata = |key: &str| {
        status.metadata().get(key).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string()
    };
    match status.code() {
        Code::NotFound => PublicationError::PackageNotFound(status.message().to_string()),
        Code::FailedPrecondition => PublicationError::VersionMismatch {
            package: status.message().to_string(),
            requested: metadata(REQUESTED_VERSION_METADATA),
            installed: metadata(INSTALLED_VERSION_METADATA),
        },
        Code::Unimplemented => PublicationError::UnknownExtensionType {
            package: status.message().to_string(),
            type_name: metadata(EXTENSION_TYPE_METADATA),
        },
        _ => PublicationError::Transport(format!("{:?}: {}", status.code(), status.message())),
    }
}

fn parse_file_request(request: &proto::PackageFileRequest) -> std::result::Result<(PackageId, Version), Status> {
    let id: PackageId = request
        .package_id
        .parse()
        .map_err(|e| Status::invalid_argument(format!("Invalid package id: {}", e)))?;
    let version = Version::parse(&request.version)
        .map_err(|e| Status::invalid_argument(format!("Invalid version: {}", e)))?;
    Ok((id, version))
}

/// Serves a [`PublicationService`] over gRPC.
#[derive(Clone)]
pub struct PublicationGrpcServer {
    service: Arc<dyn PublicationService>,
}

impl PublicationGrpcServer {
    /// Wraps a service.
    pub fn new(service: Arc<dyn PublicationService>) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl Publication for PublicationGrpcServer {
    type GetPackageFileStreamStream =
        Pin<Box<dyn Stream<Item = std::result::Result<proto::PackageFileChunk, Status>> + Send>>;

    async fn get_published_packages(
        &self,
        request: Request<proto::PublishedPackagesRequest>,
    ) -> std::result::Result<Response<proto::PublishedPackagesResponse>, Status> {
        let locale = request.into_inner().locale;
        let packages = self.service.published_packages(&locale).await.map_err(to_status)?;
        debug!(locale = %locale, count = packages.len(), "Serving published packages");
        Ok(Response::new(proto::PublishedPackagesResponse {
            packages: packages.iter().map(proto::Advertisement::from).collect(),
        }))
    }

    async fn package_publication_changed(
        &self,
        request: Request<proto::PublicationChangedRequest>,
    ) -> std::result::Result<Response<proto::PublicationChangedResponse>, Status> {
        let request = request.into_inner();
        let message = request.package.ok_or_else(|| Status::invalid_argument("package is required"))?;
        let advertisement =
            Advertisement::try_from(message).map_err(|e| Status::invalid_argument(e.to_string()))?;

        self.service
            .package_publication_changed(advertisement, request.published)
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::PublicationChangedResponse {}))
    }

    async fn get_package_file_checksum(
        &self,
        request: Request<proto::PackageFileRequest>,
    ) -> std::result::Result<Response<proto::PackageFileChecksumResponse>, Status> {
        let (id, version) = parse_file_request(request.get_ref())?;
        let checksum = self.service.package_file_checksum(&id, &version).await.map_err(to_status)?;
        Ok(Response::new(proto::PackageFileChecksumResponse { checksum }))
    }

    async fn get_package_file_stream(
        &self,
        request: Request<proto::PackageFileRequest>,
    ) -> std::result::Result<Response<Self::GetPackageFileStreamStream>, Status> {
        let (id, version) = parse_file_request(request.get_ref())?;
        let stream = self.service.package_file_stream(&id, &version).await.map_err(to_status)?;
        debug!(package = %id, version = %version, "Streaming package file");

        let chunks = stream.map(|chunk| {
            chunk.map(|data| proto::PackageFileChunk { data: data.to_vec() }).map_err(|e| {
                warn!(error = %e, "Package file stream failed");
                to_status(e)
            })
        });
        Ok(Response::new(Box::pin(chunks)))
    }
}

/// A remote instance reached over gRPC.
#[derive(Debug, Clone)]
pub struct GrpcPublicationClient {
    endpoint: String,
    client: PublicationClient<Channel>,
}

impl GrpcPublicationClient {
    /// Connects to a peer.
    ///
    /// # Errors
    /// Returns error if the endpoint is invalid or unreachable
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let channel = Self::endpoint(endpoint)?
            .connect()
            .await
            .map_err(|e| PublicationError::Transport(format!("{}: {}", endpoint, e)))?;
        Ok(Self { endpoint: endpoint.to_string(), client: PublicationClient::new(channel) })
    }

    /// Creates a client that connects on first use, for peers that may not
    /// be up yet.
    ///
    /// # Errors
    /// Returns error if the endpoint is invalid
    pub fn lazy(endpoint: &str) -> Result<Self> {
        let channel = Self::endpoint(endpoint)?.connect_lazy();
        Ok(Self { endpoint: endpoint.to_string(), client: PublicationClient::new(channel) })
    }

    fn endpoint(endpoint: &str) -> Result<Endpoint> {
        Ok(Endpoint::from_shared(endpoint.to_string())
            .map_err(|e| PublicationError::Transport(format!("invalid endpoint {}: {}", endpoint, e)))?
            .connect_timeout(CONNECT_TIMEOUT))
    }

    /// Peer endpoint.
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint
    }

    fn file_request(id: &PackageId, version: &Version) -> proto::PackageFileRequest {
        proto::PackageFileRequest { package_id: id.to_string(), version: version.to_string() }
    }
}

#[async_trait]
impl PublicationService for GrpcPublicationClient {
    async fn published_packages(&self, locale: &str) -> Result<Vec<Advertisement>> {
        let response = self
            .client
            .clone()
            .get_published_packages(proto::PublishedPackagesRequest { locale: locale.to_string() })
            .await
            .map_err(|s| from_status(&s))?;
        response.into_inner().packages.into_iter().map(Advertisement::try_from).collect()
    }

    async fn package_publication_changed(&self, advertisement: Advertisement, published: bool) -> Result<()> {
        self.client
            .clone()
            .package_publication_changed(proto::PublicationChangedRequest {
                package: Some(proto::Advertisement::from(&advertisement)),
                published,
            })
            .await
            .map_err(|s| from_status(&s))?;
        Ok(())
    }

    async fn package_file_checksum(&self, id: &PackageId, version: &Version) -> Result<String> {
        let response = self
            .client
            .clone()
            .get_package_file_checksum(Self::file_request(id, version))
            .await
            .map_err(|s| from_status(&s))?;
        Ok(response.into_inner().checksum)
    }

    async fn package_file_stream(&self, id: &PackageId, version: &Version) -> Result<PackageByteStream> {
        let response = self
            .client
            .clone()
            .get_package_file_stream(Self::file_request(id, version))
            .await
            .map_err(|s| from_status(&s))?;

        Ok(response
            .into_inner()
            .map(|chunk| chunk.map(|c| Bytes::from(c.data)).map_err(|s| from_status(&s)))
            .boxed())
    }
}
