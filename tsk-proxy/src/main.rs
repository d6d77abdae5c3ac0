//! `tsk-proxy CONFIG_FILE` — bridges a TSK-framed Kafka topic to a downstream
//! time-series backend. CLI parsing mirrors the authenticator service's own
//! `App::new`/`Arg::with_name` shape; config and logging follow the same
//! load-then-init-logger ordering so a config error never needs a logger to report.

use clap::{crate_authors, crate_version, Arg, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use tsk_proxy::config::Config;
use tsk_proxy::proxy::Proxy;
use tsk_proxy::shutdown::ShutdownToken;
use tskfanout::backend::ascii::AsciiBackend;
use tskfanout::backend::dbats::DbatsBackend;
use tskfanout::backend::kafka::KafkaBackend;
use tskfanout::logging::{self, error, info};
use tskfanout::Registry;

fn main() -> ExitCode {
    let matches = Command::new("tsk-proxy")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Bridges a TSK-framed Kafka topic to a downstream time-series backend.")
        .arg(Arg::new("CONFIG_FILE").help("Path to the proxy's YAML config file").required(true))
        .get_matches();

    let config_path = PathBuf::from(matches.get_one::<String>("CONFIG_FILE").unwrap());

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tsk-proxy: {e}");
            return ExitCode::from(255);
        }
    };

    let log = logging::init(config.log_level);
    info!(log, "starting tsk-proxy"; "config" => config_path.display().to_string());

    match run(config, log.clone()) {
        Ok(()) => {
            info!(log, "shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(log, "fatal error"; "error" => %e);
            ExitCode::from(255)
        }
    }
}

fn run(config: Config, log: logging::Logger) -> tskfanout::Result<()> {
    let mut registry = Registry::new();
    registry.install(Box::new(AsciiBackend::new(log.new(logging::o!("backend" => "ascii")))))?;
    registry.install(Box::new(KafkaBackend::new(log.new(logging::o!("backend" => "kafka")))))?;
    registry.install(Box::new(DbatsBackend::new(log.new(logging::o!("backend" => "dbats")))))?;

    let shutdown = ShutdownToken::install()?;

    let mut proxy = Proxy::new(config, registry, shutdown, log)?;
    proxy.run()
}
