//! What an instance tells its peers about a published package.

use crate::packages::bundle::VersionEntry;
use crate::packages::descriptor::PackageId;
use crate::packages::handler::PropertySummary;
use crate::packages::loader::InstalledPackage;
use crate::packages::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of an instance towards its peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Creates an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// An extension of a published package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedExtension {
    /// Handler id on the publishing instance.
    pub extension_id: String,
    /// Extension type name.
    pub type_name: String,
    /// Localized title.
    pub display_name: String,
    /// Localized description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Icon resource name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Property summaries.
    #[serde(default)]
    pub properties: Vec<PropertySummary>,
}

/// A package version published by one or more instances.
///
/// Two advertisements are equal when vendor, title and version match; the
/// instance set and display strings are not part of the identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    /// Vendor name.
    pub vendor: String,
    /// Package title.
    pub title: String,
    /// Package version.
    pub version: Version,
    /// Package author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Version history.
    #[serde(default)]
    pub history: Vec<VersionEntry>,
    /// Extensions of the package.
    #[serde(default)]
    pub extensions: Vec<AdvertisedExtension>,
    /// Instances publishing this version.
    #[serde(default)]
    pub instances: BTreeSet<InstanceId>,
}

impl Advertisement {
    /// Describes an installed package as published by `instance`.
    pub fn from_installed(package: &InstalledPackage, locale: &str, instance: &InstanceId) -> Self {
        let descriptor = package.descriptor();
        let extensions = package
            .handlers()
            .iter()
            .map(|handler| AdvertisedExtension {
                extension_id: handler.id().to_string(),
                type_name: handler.type_name().to_string(),
                display_name: handler.title(locale),
                description: handler.description(locale),
                icon: handler.icon().map(str::to_string),
                properties: handler.properties(locale),
            })
            .collect();

        Self {
            vendor: descriptor.vendor().to_string(),
            title: descriptor.title().to_string(),
            version: descriptor.version().clone(),
            author: descriptor.author().map(str::to_string),
            history: descriptor.history().to_vec(),
            extensions,
            instances: BTreeSet::from([instance.clone()]),
        }
    }

    /// Package id.
    pub fn id(&self) -> PackageId {
        PackageId::new(self.vendor.clone(), self.title.clone())
    }

    /// Whether this advertises a version of `id`.
    pub fn is_for(&self, id: &PackageId) -> bool {
        self.vendor == id.vendor && self.title == id.title
    }

    /// Extension types the package needs.
    pub fn extension_types(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(|e| e.type_name.as_str())
    }
}

impl PartialEq for Advertisement {
    fn eq(&self, other: &Self) -> bool {
        self.vendor == other.vendor && self.title == other.title && self.version == other.version
    }
}

impl Eq for Advertisement {}

impl Hash for Advertisement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.vendor.hash(state);
        self.title.hash(state);
        self.version.hash(state);
    }
}

impl fmt::Display for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}-{}", self.vendor, self.title, self.version)
    }
}
