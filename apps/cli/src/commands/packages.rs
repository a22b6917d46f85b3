//! Package commands: listing, activation, removal and installation.

use colored::Colorize;
use pxe_core::packages::PackageEntry;
use pxe_core::{PackageEngine, PackageId, RegisterOutcome};
use serde_json::json;
use std::path::Path;
use tabled::{Table, Tabled, settings::Style};
use tokio_util::sync::CancellationToken;

#[derive(Tabled)]
struct ExtensionRow {
    #[tabled(rename = "Package")]
    package: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Handler")]
    handler: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Loaded")]
    loaded: String,
}

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Package")]
    package: String,
    #[tabled(rename = "Installed")]
    installed: String,
    #[tabled(rename = "Available")]
    available: String,
    #[tabled(rename = "Source")]
    source: String,
}

fn mark(flag: bool) -> String {
    if flag { "yes".to_string() } else { "no".to_string() }
}

fn parse_id(raw: &str) -> anyhow::Result<PackageId> {
    raw.parse().map_err(|e| anyhow::anyhow!("{} (expected vendor/title)", e))
}

/// List installed packages with their handlers.
pub async fn list(engine: &PackageEngine, json_output: bool) -> anyhow::Result<()> {
    let packages = engine.loader().packages().await;

    if json_output {
        let list: Vec<_> = packages
            .iter()
            .map(|package| {
                json!({
                    "id": package.id().to_string(),
                    "version": package.version().to_string(),
                    "published": engine.publication().is_published(package.id()),
                    "extensions": package.handlers().iter().map(|handler| json!({
                        "id": handler.id(),
                        "type": handler.type_name(),
                        "enabled": handler.is_enabled(),
                        "loaded": handler.is_loaded(),
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if packages.is_empty() {
        println!("{}", "No packages installed.".yellow());
        println!();
        println!("{}", "Install one with:".bright_black());
        println!("  $ pxe install ./my-package-1.0.bundle");
        return Ok(());
    }

    println!("{}", format!("Installed packages ({})", packages.len()).bold().green());
    let rows: Vec<ExtensionRow> = packages
        .iter()
        .flat_map(|package| {
            package.handlers().iter().map(move |handler| ExtensionRow {
                package: package.id().to_string(),
                version: package.version().to_string(),
                handler: handler.id().to_string(),
                enabled: mark(handler.is_enabled()),
                loaded: mark(handler.is_loaded()),
            })
        })
        .collect();
    if !rows.is_empty() {
        println!("{}", Table::new(rows).with(Style::modern()));
    }
    Ok(())
}

fn entry_rows(entries: &[PackageEntry]) -> Vec<EntryRow> {
    entries
        .iter()
        .map(|entry| {
            let (source, available) = entry
                .latest_remote()
                .map_or((String::new(), String::new()), |(source, d)| (source.to_string(), d.version().to_string()));
            EntryRow {
                package: entry.id().to_string(),
                installed: entry.local().map(|d| d.version().to_string()).unwrap_or_default(),
                available,
                source,
            }
        })
        .collect()
}

fn entries_json(entries: &[PackageEntry]) -> serde_json::Value {
    json!(
        entries
            .iter()
            .map(|entry| json!({
                "id": entry.id().to_string(),
                "installed": entry.local().map(|d| d.version().to_string()),
                "available": entry.latest_remote().map(|(_, d)| d.version().to_string()),
                "source": entry.latest_remote().map(|(source, _)| source.to_string()),
                "update_available": entry.update_available(),
            }))
            .collect::<Vec<_>>()
    )
}

/// Query every registry and print the merged list.
pub async fn refresh(engine: &PackageEngine, json_output: bool) -> anyhow::Result<()> {
    let entries = engine.refresh().await;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&entries_json(&entries))?);
    } else if entries.is_empty() {
        println!("{}", "No packages found.".yellow());
    } else {
        println!("{}", Table::new(entry_rows(&entries)).with(Style::modern()));
    }
    Ok(())
}

/// Print packages a registry offers a newer version of.
pub async fn updates(engine: &PackageEngine, json_output: bool) -> anyhow::Result<()> {
    engine.refresh().await;
    let updates = engine.provider().updates().await;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&entries_json(&updates))?);
    } else if updates.is_empty() {
        println!("{}", "All packages are up to date.".green());
    } else {
        println!("{}", format!("Updates available ({})", updates.len()).bold().yellow());
        println!("{}", Table::new(entry_rows(&updates)).with(Style::modern()));
    }
    Ok(())
}

/// Enable an extension.
pub async fn enable(engine: &PackageEngine, handler_id: &str) -> anyhow::Result<()> {
    engine.enable(handler_id).await?;
    println!("{}", format!("✓ Enabled {}", handler_id).green());
    Ok(())
}

/// Disable an extension.
pub async fn disable(engine: &PackageEngine, handler_id: &str) -> anyhow::Result<()> {
    engine.disable(handler_id).await?;
    println!("{}", format!("✓ Disabled {}", handler_id).green());
    Ok(())
}

/// Uninstall a package.
pub async fn remove(engine: &PackageEngine, package_id: &str) -> anyhow::Result<()> {
    let id = parse_id(package_id)?;
    if engine.loader().get(&id).await.is_none() {
        anyhow::bail!("Package not installed: {}", id);
    }
    engine.remove(&id).await?;
    println!("{}", format!("✓ Removed {}", id).green());
    Ok(())
}

/// Install a bundle file, or the newest registry version of a package.
///
/// Ctrl-C cancels a running download; the partial file is removed.
pub async fn install(engine: &PackageEngine, target: &str) -> anyhow::Result<()> {
    let path = Path::new(target);
    let outcome = if path.is_file() {
        println!("{}", format!("Installing {}", path.display()).yellow());
        engine.install_file(path).await?
    } else {
        let id = parse_id(target)?;
        engine.refresh().await;

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_interrupt.cancel();
            }
        });

        println!("{}", format!("Installing {}", id).yellow());
        let result = engine.install_update(&id, &cancel).await;
        watcher.abort();
        result?
    };

    match outcome {
        RegisterOutcome::Installed => println!("{}", "✓ Package installed".green()),
        RegisterOutcome::Replaced { previous } => {
            println!("{}", format!("✓ Package replaced (was {})", previous).green());
        }
        RegisterOutcome::Unchanged => println!("{}", "Package already active".bright_black()),
    }
    Ok(())
}
