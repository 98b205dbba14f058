use std::path::Path;
use std::process::ExitCode;

use sas_agent::sink::LoggingStore;
use sas_agent::{Agent, Config, Error};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "settings.json".into());

    let config = match Config::load(Path::new(&config_path)) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::from(2);
        }
    };

    // The database writer is an integration point; until one is plugged in,
    // committed rows land in the log.
    let store = Box::new(LoggingStore::new(&config.table_name));

    let agent = match Agent::start(config, store) {
        Ok(agent) => agent,
        Err(err) if err.is_fatal() => {
            log::error!("{err}");
            return ExitCode::from(2);
        }
        Err(err) => {
            log::error!("cannot reach the machine: {err}");
            return ExitCode::from(3);
        }
    };

    // The process supervisor stops us by signal; in-process, the agent runs
    // until its poll thread dies, which never happens without a fault.
    agent.wait();

    match agent.shutdown() {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Timeout(_)) => ExitCode::from(3),
        Err(err) => {
            log::error!("shutdown failed: {err}");
            ExitCode::from(3)
        }
    }
}
