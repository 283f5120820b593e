//! `harbord ps` — List containers.

use chrono::Utc;
use clap::Args;
use harbord_common::config::DaemonConfig;

use super::DataDir;
use crate::output::{format_age, format_command, truncate};

/// Arguments for the ps command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Show all containers, not only running ones.
    #[arg(short, long)]
    pub all: bool,
}

/// Executes the ps command.
///
/// # Errors
///
/// Returns an error if the data directory cannot be read.
pub fn execute(args: &PsArgs, config: &DaemonConfig) -> anyhow::Result<()> {
    let data = DataDir::load(config)?;
    let mut snapshots: Vec<_> = data
        .views
        .list()
        .into_iter()
        .filter(|s| args.all || s.doc.state.is_active())
        .collect();
    snapshots.sort_by(|a, b| b.doc.created.cmp(&a.doc.created));

    if snapshots.is_empty() {
        println!("No containers found.");
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<14} {:<20} {:<24} {:<16} {:<20} {:<8} NAME",
        "CONTAINER ID", "IMAGE", "COMMAND", "CREATED", "STATUS", "RESTARTS"
    );
    for s in &snapshots {
        println!(
            "{:<14} {:<20} {:<24} {:<16} {:<20} {:<8} {}",
            s.doc.id.short(),
            truncate(&s.doc.config.image, 20),
            truncate(&format_command(&s.doc.path, &s.doc.args), 24),
            format_age(now - s.doc.created),
            s.doc.state.summary(),
            s.doc.restart_count,
            s.doc.name,
        );
    }
    Ok(())
}
