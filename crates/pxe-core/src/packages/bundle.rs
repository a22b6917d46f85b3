//! Bundle archive format.
//!
//! A bundle is a zip archive with the `.bundle` extension containing:
//! - `bundle.json`: package metadata and the list of extension types
//! - `versions.json` (optional): version history
//! - `build.properties` (optional): build properties, `compatible` being the
//!   minimum host version
//!
//! Every other entry is a resource available to the package's extensions.

use crate::packages::version::{Version, VersionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::ZipArchive;
use zip::result::ZipError;
use zip::write::FileOptions;

/// File extension of bundle archives.
pub const BUNDLE_EXTENSION: &str = "bundle";

/// Archive entry holding the package manifest.
pub const MANIFEST_ENTRY: &str = "bundle.json";

/// Archive entry holding the version history.
pub const HISTORY_ENTRY: &str = "versions.json";

/// Archive entry holding build properties.
pub const BUILD_PROPERTIES_ENTRY: &str = "build.properties";

/// Build property naming the minimum host version.
pub const COMPATIBLE_PROPERTY: &str = "compatible";

/// Bundle errors.
#[derive(Debug, Error)]
pub enum BundleError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive error.
    #[error("archive error: {0}")]
    Archive(#[from] ZipError),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bundle has no manifest entry.
    #[error("bundle has no {MANIFEST_ENTRY}: {0}")]
    MissingManifest(PathBuf),

    /// Manifest content is invalid.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Version field is invalid.
    #[error("invalid version: {0}")]
    Version(#[from] VersionError),
}

/// Result type for bundle operations.
pub type Result<T> = std::result::Result<T, BundleError>;

/// Contents of `bundle.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleManifest {
    /// Vendor name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,

    /// Vendor id, used when `vendor` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,

    /// Package title.
    pub title: String,

    /// Package version.
    pub version: String,

    /// "true" for development builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,

    /// Package author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Extension types contributed by the package.
    #[serde(default)]
    pub extensions: Vec<ExtensionEntry>,
}

impl BundleManifest {
    /// Vendor name, falling back to the vendor id.
    pub fn vendor(&self) -> Option<&str> {
        self.vendor
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.vendor_id.as_deref().filter(|v| !v.trim().is_empty()))
            .map(str::trim)
    }

    /// Whether the build flag is set.
    pub fn is_development_build(&self) -> bool {
        self.build.as_deref().is_some_and(|b| b.trim().eq_ignore_ascii_case("true"))
    }
}

/// One extension type declared by a bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtensionEntry {
    /// Type name, resolved against the host's extension catalog.
    #[serde(rename = "type")]
    pub type_name: String,

    /// Display title per locale.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub title: BTreeMap<String, String>,

    /// Description per locale.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub description: BTreeMap<String, String>,

    /// Icon resource inside the bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl ExtensionEntry {
    /// Creates an entry with no localized strings.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            title: BTreeMap::new(),
            description: BTreeMap::new(),
            icon: None,
        }
    }

    /// Display title for `locale`, defaulting to the last segment of the type name.
    pub fn title(&self, locale: &str) -> String {
        localized(&self.title, locale).map_or_else(
            || self.type_name.rsplit(['.', ':']).next().unwrap_or(&self.type_name).to_string(),
            ToString::to_string,
        )
    }

    /// Description for `locale`.
    pub fn description(&self, locale: &str) -> Option<String> {
        localized(&self.description, locale).map(ToString::to_string)
    }
}

/// Picks a localized string: exact tag, then language, then "en", then anything.
pub(crate) fn localized<'a>(values: &'a BTreeMap<String, String>, locale: &str) -> Option<&'a str> {
    let language = locale.split(['-', '_']).next().unwrap_or(locale);
    values
        .get(locale)
        .or_else(|| values.get(language))
        .or_else(|| values.get("en"))
        .or_else(|| values.values().next())
        .map(String::as_str)
}

/// One entry of the version history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionEntry {
    /// Version the changes belong to.
    pub version: String,

    /// Release date, free form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    /// Changes made in this version.
    #[serde(default)]
    pub changes: Vec<ChangeEntry>,
}

/// A single change in a version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Affected area.
    #[serde(default)]
    pub scope: String,

    /// Change kind, e.g. "fix" or "feature".
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Human readable description.
    pub description: String,
}

/// Everything discovery needs from a bundle.
#[derive(Debug, Clone)]
pub struct BundleContents {
    /// Parsed manifest.
    pub manifest: BundleManifest,
    /// Parsed package version.
    pub version: Version,
    /// Version history, newest first as written by the author.
    pub history: Vec<VersionEntry>,
    /// Minimum host version, if declared.
    pub compatible_with: Option<Version>,
}

/// Returns true if `path` has the bundle file extension.
pub fn is_bundle_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == BUNDLE_EXTENSION)
}

/// File name used for an installed bundle.
pub fn bundle_file_name(vendor: &str, title: &str, version: &Version) -> String {
    format!("{}-{}-{}.{}", vendor, title, version, BUNDLE_EXTENSION)
}

/// Reads and validates a bundle's metadata.
///
/// # Arguments
/// * `path` - Path of the bundle file
///
/// # Errors
/// Returns error if the file is not a readable archive or its metadata is invalid
pub fn read_bundle(path: &Path) -> Result<BundleContents> {
    let file = File::open(path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    read_contents(&mut archive)
        .map_err(|e| match e {
            BundleError::MissingManifest(_) => BundleError::MissingManifest(path.to_path_buf()),
            other => other,
        })
}

/// Reads bundle metadata from an open archive.
pub(crate) fn read_contents<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<BundleContents> {
    let raw = read_entry(archive, MANIFEST_ENTRY)?
        .ok_or_else(|| BundleError::MissingManifest(PathBuf::from(MANIFEST_ENTRY)))?;
    let manifest: BundleManifest = serde_json::from_slice(&raw)?;

    if manifest.vendor().is_none() {
        return Err(BundleError::InvalidManifest("vendor is missing".to_string()));
    }
    if manifest.title.trim().is_empty() || manifest.title.contains('/') {
        return Err(BundleError::InvalidManifest(format!("invalid title '{}'", manifest.title)));
    }
    let version = Version::parse(&manifest.version)?;

    let history = match read_entry(archive, HISTORY_ENTRY)? {
        Some(raw) => match serde_json::from_slice(&raw) {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(title = %manifest.title, error = %e, "Ignoring unreadable version history");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    let compatible_with = match read_entry(archive, BUILD_PROPERTIES_ENTRY)? {
        Some(raw) => parse_properties(&String::from_utf8_lossy(&raw))
            .get(COMPATIBLE_PROPERTY)
            .map(|value| Version::parse(value))
            .transpose()?,
        None => None,
    };

    Ok(BundleContents { manifest, version, history, compatible_with })
}

/// Reads a whole entry, `None` if the archive does not contain it.
pub(crate) fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut buffer = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buffer)?;
            Ok(Some(buffer))
        }
        Err(ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parses `key=value` property text. Blank lines and `#`/`!` comments are skipped.
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
        .filter_map(|line| {
            let split = line.find(['=', ':'])?;
            Some((line[..split].trim().to_string(), line[split + 1..].trim().to_string()))
        })
        .collect()
}

/// Writes bundle archives.
#[derive(Debug, Clone)]
pub struct BundleBuilder {
    manifest: BundleManifest,
    history: Vec<VersionEntry>,
    properties: BTreeMap<String, String>,
    resources: Vec<(String, Vec<u8>)>,
}

impl BundleBuilder {
    /// Starts a bundle for `vendor/title` at `version`.
    pub fn new(vendor: &str, title: &str, version: &str) -> Self {
        Self {
            manifest: BundleManifest {
                vendor: Some(vendor.to_string()),
                vendor_id: None,
                title: title.to_string(),
                version: version.to_string(),
                build: None,
                author: None,
                extensions: Vec::new(),
            },
            history: Vec::new(),
            properties: BTreeMap::new(),
            resources: Vec::new(),
        }
    }

    /// Starts a bundle from an existing manifest.
    pub fn from_manifest(manifest: BundleManifest) -> Self {
        Self { manifest, history: Vec::new(), properties: BTreeMap::new(), resources: Vec::new() }
    }

    /// Collects a bundle from a directory holding `bundle.json` and optional
    /// `versions.json`, `build.properties` and resource files.
    ///
    /// # Errors
    /// Returns error if the manifest is missing or a file cannot be read
    pub fn from_directory(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST_ENTRY);
        if !manifest_path.is_file() {
            return Err(BundleError::MissingManifest(manifest_path));
        }
        let manifest: BundleManifest = serde_json::from_slice(&std::fs::read(&manifest_path)?)?;
        let mut builder = Self::from_manifest(manifest);

        let history_path = dir.join(HISTORY_ENTRY);
        if history_path.is_file() {
            builder.history = serde_json::from_slice(&std::fs::read(&history_path)?)?;
        }
        let properties_path = dir.join(BUILD_PROPERTIES_ENTRY);
        if properties_path.is_file() {
            builder.properties = parse_properties(&std::fs::read_to_string(&properties_path)?);
        }

        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in std::fs::read_dir(&current)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(dir) else { continue };
                let name = relative.to_string_lossy().replace('\\', "/");
                if [MANIFEST_ENTRY, HISTORY_ENTRY, BUILD_PROPERTIES_ENTRY].contains(&name.as_str()) {
                    continue;
                }
                builder.resources.push((name, std::fs::read(&path)?));
            }
        }
        builder.resources.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(builder)
    }

    /// Sets the author.
    #[must_use]
    pub fn author(mut self, author: &str) -> Self {
        self.manifest.author = Some(author.to_string());
        self
    }

    /// Marks the bundle as a development build.
    #[must_use]
    pub fn development_build(mut self, development: bool) -> Self {
        self.manifest.build = Some(development.to_string());
        self
    }

    /// Sets the minimum host version.
    #[must_use]
    pub fn compatible_with(mut self, host_version: &str) -> Self {
        self.properties.insert(COMPATIBLE_PROPERTY.to_string(), host_version.to_string());
        self
    }

    /// Adds an extension type with an English title.
    #[must_use]
    pub fn extension(mut self, type_name: &str, title: &str) -> Self {
        let mut entry = ExtensionEntry::new(type_name);
        entry.title.insert("en".to_string(), title.to_string());
        self.manifest.extensions.push(entry);
        self
    }

    /// Adds a fully specified extension entry.
    #[must_use]
    pub fn extension_entry(mut self, entry: ExtensionEntry) -> Self {
        self.manifest.extensions.push(entry);
        self
    }

    /// Appends a version history entry.
    #[must_use]
    pub fn history_entry(mut self, entry: VersionEntry) -> Self {
        self.history.push(entry);
        self
    }

    /// Adds a resource entry.
    #[must_use]
    pub fn resource(mut self, name: &str, content: impl Into<Vec<u8>>) -> Self {
        self.resources.push((name.to_string(), content.into()));
        self
    }

    /// The manifest written so far.
    pub fn manifest(&self) -> &BundleManifest {
        &self.manifest
    }

    /// Writes the archive to `path`, creating missing parent directories.
    ///
    /// # Errors
    /// Returns error if the file cannot be created or written
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = zip::ZipWriter::new(File::create(path)?);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        writer.start_file(MANIFEST_ENTRY, options)?;
        writer.write_all(&serde_json::to_vec_pretty(&self.manifest)?)?;

        if !self.history.is_empty() {
            writer.start_file(HISTORY_ENTRY, options)?;
            writer.write_all(&serde_json::to_vec_pretty(&self.history)?)?;
        }

        if !self.properties.is_empty() {
            writer.start_file(BUILD_PROPERTIES_ENTRY, options)?;
            for (key, value) in &self.properties {
                writeln!(writer, "{}={}", key, value)?;
            }
        }

        for (name, content) in &self.resources {
            writer.start_file(name.as_str(), options)?;
            writer.write_all(content)?;
        }

        writer.finish()?;
        Ok(())
    }

    /// Writes the archive into `dir` under its installed file name.
    ///
    /// # Errors
    /// Returns error if the version is invalid or the file cannot be written
    pub fn write_into(&self, dir: &Path) -> Result<PathBuf> {
        let version = Version::parse(&self.manifest.version)?;
        let vendor = self
            .manifest
            .vendor()
            .ok_or_else(|| BundleError::InvalidManifest("vendor is missing".to_string()))?;
        let path = dir.join(bundle_file_name(vendor, &self.manifest.title, &version));
        self.write_to(&path)?;
        Ok(path)
    }
}
