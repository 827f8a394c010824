//! Command dispatch and handlers.

pub mod assets;
pub mod config;
pub mod maintenance;
pub mod serve;

use crate::cli::{Cli, Command, ConfigCommand};
use crate::config::ProxySettings;

/// Dispatch a parsed command to its handler.
///
/// Settings are loaded once, from `--config` if given and then the
/// environment; handlers apply their own flags on top.
///
/// # Errors
///
/// Returns an error string if settings cannot be loaded or the selected
/// command handler fails.
pub fn dispatch(cli: &Cli) -> Result<(), String> {
    let settings = ProxySettings::load(cli.config.as_deref()).map_err(|err| err.to_string())?;
    match &cli.command {
        Command::Serve(args) => serve::run(settings, args),
        Command::Config(ConfigCommand::Show) => config::show(&settings),
        Command::Config(ConfigCommand::Locate(args)) => config::locate(args),
        Command::Restore(args) => assets::restore(&settings, args),
        Command::Push(args) => assets::push(&settings, args),
        Command::Reset(args) => assets::reset(&settings, args),
        Command::Maintenance(command) => maintenance::run(&settings, command),
    }
}
