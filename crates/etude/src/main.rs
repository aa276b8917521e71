// src/main.rs
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use etude::{Cli, Config, Server, init_logging};

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging(cli.log_format);
    let config = Config::from(cli);

    let mut server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = server.install_signal_handlers() {
        error!(error = %e, "failed to install signal handlers");
        return ExitCode::FAILURE;
    }

    match server.serve() {
        Ok(()) => {
            info!("etude shut down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server stopped");
            ExitCode::FAILURE
        }
    }
}
