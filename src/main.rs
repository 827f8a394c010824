//! Binary entrypoint for `vcrproxy`.

use std::process::ExitCode;

fn main() -> ExitCode {
    vcrproxy::telemetry::init();
    match vcrproxy::run(std::env::args()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
