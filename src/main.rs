use std::env;
use std::process::ExitCode;

use weaver_bus::{Config, Engine};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = env::args();
    let program = args.next().unwrap_or_else(|| "weaver-bus".into());
    let Some(config_path) = args.next() else {
        eprintln!("usage: {program} <config-path>");
        return ExitCode::FAILURE;
    };

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            log::error!(target: "main", "{err}");
            return ExitCode::FAILURE;
        }
    };

    let mut engine = match Engine::build(&config) {
        Ok(engine) => engine,
        Err(err) => {
            log::error!(target: "main", "{err}");
            return ExitCode::FAILURE;
        }
    };

    match engine.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!(target: "main", "{err}");
            ExitCode::FAILURE
        }
    }
}
