//! CLI command definitions and dispatch.

pub mod inspect;
pub mod logs;
pub mod ps;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use harbord_common::config::DaemonConfig;
use harbord_runtime::reload::load_containers;
use harbord_runtime::store::Store;
use harbord_runtime::view::ViewDb;

/// harbord — container lifecycle daemon tools.
#[derive(Parser, Debug)]
#[command(name = "harbord", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Data directory holding the container records.
    #[arg(long, global = true, env = "HARBORD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Daemon configuration file (JSON).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit diagnostics as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List containers.
    Ps(ps::PsArgs),
    /// Print the full record of a container as JSON.
    Inspect(inspect::InspectArgs),
    /// Print the logs of a container.
    Logs(logs::LogsArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command
/// fails.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = daemon_config(&cli)?;
    match cli.command {
        Command::Ps(args) => ps::execute(&args, &config),
        Command::Inspect(args) => inspect::execute(&args, &config),
        Command::Logs(args) => logs::execute(&args, &config).await,
    }
}

fn daemon_config(cli: &Cli) -> anyhow::Result<DaemonConfig> {
    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir.clone_from(dir);
    }
    Ok(config)
}

/// Containers reloaded from a data directory, without touching any runtime.
pub struct DataDir {
    /// Containers by ID and name.
    pub store: Store,
    /// Their snapshots.
    pub views: ViewDb,
}

impl DataDir {
    /// Loads every readable container record under the configured root.
    ///
    /// # Errors
    ///
    /// Returns an error if the containers directory does not exist or cannot
    /// be read.
    pub fn load(config: &DaemonConfig) -> anyhow::Result<Self> {
        let root = config.containers_root();
        anyhow::ensure!(
            root.is_dir(),
            "no containers directory at {}",
            root.display()
        );
        let store = Store::new();
        let views = ViewDb::new();
        let loaded = load_containers(&root, &store, &views, config.restart_backoff)?;
        tracing::debug!(root = %root.display(), count = loaded.len(), "containers loaded");
        Ok(Self { store, views })
    }
}
