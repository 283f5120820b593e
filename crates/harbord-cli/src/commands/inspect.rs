//! `harbord inspect` — Print a container record.

use clap::Args;
use harbord_common::config::DaemonConfig;

use super::DataDir;

/// Arguments for the inspect command.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Container ID, unique ID prefix or name.
    pub container: String,
}

/// Executes the inspect command.
///
/// # Errors
///
/// Returns an error if the reference matches no container or several.
pub fn execute(args: &InspectArgs, config: &DaemonConfig) -> anyhow::Result<()> {
    let data = DataDir::load(config)?;
    let container = data.store.resolve(&args.container)?;
    let snapshot = data.views.get(container.id())?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
