//! Core library entry for `vcrproxy`: an HTTP record/playback proxy for
//! tests, plus the git-backed store its recordings live in.

pub mod adapters;
pub mod assets;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod matcher;
pub mod ports;
pub mod proxy;
pub mod recording;
pub mod sanitize;
pub mod session;
pub mod telemetry;
pub mod transform;

use clap::error::ErrorKind;
use clap::Parser;

/// Run the CLI with the provided arguments.
///
/// # Errors
///
/// Returns an error string when argument parsing fails or command execution fails.
pub fn run<I, T>(args: I) -> Result<(), String>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = match cli::Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{err}");
            return Ok(());
        }
        Err(err) => return Err(err.to_string()),
    };
    commands::dispatch(&cli)
}

#[cfg(test)]
mod tests {
    use super::run;

    #[test]
    fn run_shows_config() {
        let result = run(["vcrproxy", "config", "show"]);
        assert!(result.is_ok());
    }

    #[test]
    fn run_errors_on_unknown_subcommand() {
        let result = run(["vcrproxy", "unknown"]);
        assert!(result.is_err());
    }

    #[test]
    fn run_errors_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().into_owned();
        let result = run(["vcrproxy", "config", "locate", "--assets-json", path.as_str()]);
        assert!(result.is_err());
    }
}
