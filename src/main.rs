//! # Carafe
//!
//! Runs a program (or Xwayland and a program) against a nested display
//! that relays to the host compositor. See the library docs for the
//! module layout.

use carafe::config::cli::Cli;
use carafe::server::{self, master, Launch};
use carafe::{logging, Result};
use clap::Parser;
use log::{error, info};

fn run(cli: Cli) -> Result<i32> {
    let config = cli.resolve()?;
    if cli.master {
        return master::run(&config, cli.peer_args(&config));
    }
    server::run(
        &config,
        Launch {
            program: cli.program,
            client_fd: cli.client_fd,
            peer_pid: cli.peer_pid,
        },
    )
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.debug, cli.trace_protocol);
    info!("🍷 carafe {}", carafe::VERSION);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("❌ {}", e);
            for cause in e.chain().skip(1) {
                error!("   caused by: {}", cause);
            }
            std::process::exit(1);
        }
    }
}
