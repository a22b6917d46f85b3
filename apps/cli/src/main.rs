//! PXE CLI - administration of the pluggable extensions engine
//!
//! This CLI provides a `pxe` command for listing, installing, replacing and
//! publishing extension bundles of a host installation.

mod commands;
mod host;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use pxe_core::Config;

/// PXE - pluggable extensions engine
#[derive(Parser, Debug)]
#[command(
    name = "pxe",
    author,
    version,
    about = "PXE - pluggable extensions engine",
    long_about = "PXE (pxe) manages extension bundles of a host application: discovery in local and remote\nregistries, verified installation, hot replacement, and publication to peer instances."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Configuration file (overrides PXE_CONFIG and ./pxe.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List installed packages and their extensions
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Query every registry and list the merged packages
    Refresh {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Enable an extension
    ///
    /// The handler id has the form `vendor/title/type`.
    Enable {
        /// Handler id
        handler_id: String,
    },

    /// Disable an extension
    Disable {
        /// Handler id
        handler_id: String,
    },

    /// Uninstall a package and delete its bundle
    Remove {
        /// Package id (`vendor/title`)
        package_id: String,
    },

    /// List packages with a newer version in a registry
    Updates {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Install a package
    ///
    /// # Examples
    ///
    /// Install the newest registry version:
    ///   $ pxe install acme/widgets
    ///
    /// Install a bundle file:
    ///   $ pxe install ./acme-widgets-1.2.0.bundle
    Install {
        /// Package id (`vendor/title`) or path of a bundle file
        target: String,
    },

    /// Publish an installed package to linked peers
    Publish {
        /// Package id (`vendor/title`)
        package_id: String,
    },

    /// Withdraw a published package
    Unpublish {
        /// Package id (`vendor/title`)
        package_id: String,
    },

    /// Build a bundle from a directory
    ///
    /// The directory must contain `bundle.json`; `versions.json`,
    /// `build.properties` and every other file are added as found.
    Pack {
        /// Source directory
        dir: PathBuf,

        /// Output file or directory (defaults to the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Serve the publication protocol and link configured peers
    #[cfg(feature = "grpc")]
    Serve,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_file(path)?,
        None => Config::discover_and_load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    #[cfg(feature = "grpc")]
    let serving = matches!(args.command, Command::Serve);
    #[cfg(not(feature = "grpc"))]
    let serving = false;

    if serving {
        commands::publication::init_server_tracing()?;
    } else {
        // Initialize tracing
        let level = match args.log_level.as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "error" => Level::ERROR,
            _ => Level::WARN,
        };

        let subscriber =
            FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    match args.command {
        Command::Pack { dir, output } => commands::pack::execute(&dir, output.as_deref()),
        command => {
            let config = load_config(args.config.as_ref())?;
            let engine = host::start_engine(config).await?;
            run(&engine, command).await
        }
    }
}

async fn run(engine: &pxe_core::PackageEngine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::List { json } => commands::packages::list(engine, json).await,
        Command::Refresh { json } => commands::packages::refresh(engine, json).await,
        Command::Enable { handler_id } => commands::packages::enable(engine, &handler_id).await,
        Command::Disable { handler_id } => commands::packages::disable(engine, &handler_id).await,
        Command::Remove { package_id } => commands::packages::remove(engine, &package_id).await,
        Command::Updates { json } => commands::packages::updates(engine, json).await,
        Command::Install { target } => commands::packages::install(engine, &target).await,
        Command::Publish { package_id } => commands::publication::publish(engine, &package_id).await,
        Command::Unpublish { package_id } => commands::publication::unpublish(engine, &package_id).await,
        Command::Pack { dir, output } => commands::pack::execute(&dir, output.as_deref()),
        #[cfg(feature = "grpc")]
        Command::Serve => commands::publication::serve(engine).await,
    }
}
