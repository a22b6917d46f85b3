//! Bundle packing.

use colored::Colorize;
use pxe_core::BundleBuilder;
use std::path::Path;

/// Build a bundle from `dir`.
///
/// An `output` naming an existing directory receives the bundle under its
/// installed file name; any other `output` is used as the file path.
pub fn execute(dir: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let builder = BundleBuilder::from_directory(dir)?;
    let manifest = builder.manifest();
    if manifest.title.trim().is_empty() {
        anyhow::bail!("bundle.json has no title");
    }

    let path = match output {
        Some(path) if !path.is_dir() => {
            builder.write_to(path)?;
            path.to_path_buf()
        }
        Some(dir) => builder.write_into(dir)?,
        None => builder.write_into(Path::new("."))?,
    };

    println!(
        "{}",
        format!("✓ Packed {} {} into {}", manifest.title, manifest.version, path.display()).green()
    );
    Ok(())
}
