// SPDX-License-Identifier: MIT OR Apache-2.0
//! The redcat entry point.
//!
//! Resolves the connection string, brings up a manager, establishes (or
//! reconnects) the first session and drops into the interactive loop.
//!
//! Exit codes: 0 on a normal run, 1 on connection failure, 2 on usage
//! errors (including malformed connection strings and broken config
//! files).

use std::process::ExitCode;
use std::str::FromStr;

use clap::Parser;
use redcat::config::Config;
use redcat::manager::Manager;
use redcat::platform::PlatformKind;

mod cli;

use cli::{resolve_target, Cli, TargetKind};

fn main() -> ExitCode {
    let args = Cli::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    if let Err(err) = simple_logger::SimpleLogger::new()
        .with_level(level)
        .without_timestamps()
        .init()
    {
        eprintln!("error: logger setup failed: {}", err);
    }

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(2);
        }
    };

    if args.download_plugins {
        return match redcat::platform::windows::download_plugins(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("error: {}", err);
                ExitCode::from(1)
            }
        };
    }

    // platform is pre-validated by clap's value parser
    let platform = PlatformKind::from_str(&args.platform).unwrap_or(PlatformKind::Linux);

    let mut manager = match Manager::new(config) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(1);
        }
    };

    if args.list {
        let targets = manager.known_targets();
        if targets.is_empty() {
            println!("no known targets");
        }
        for (host_id, address, implants) in targets {
            println!(
                "{}  {}  ({} implant{})",
                host_id,
                address.unwrap_or_else(|| "-".to_string()),
                implants,
                if implants == 1 { "" } else { "s" }
            );
        }
        return ExitCode::SUCCESS;
    }

    if args.target.is_none() && args.port.is_none() {
        eprintln!("error: no target specified (try --help)");
        return ExitCode::from(2);
    }

    let target = match resolve_target(&args) {
        Ok(target) => target,
        Err(message) => {
            eprintln!("error: {}", message);
            return ExitCode::from(2);
        }
    };

    // Ctrl-C aborts the running command instead of killing the manager;
    // in raw mode the byte is forwarded to the remote shell.
    redcat::manager::install_interrupt_handler();

    let established = match target {
        TargetKind::Reconnect(host_id) => manager.reconnect(&host_id),
        TargetKind::Spec(spec) => manager.create_session(platform, &spec),
    };

    match established {
        Ok(id) => log::info!("session {} established", id),
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(1);
        }
    }

    manager.interactive();
    ExitCode::SUCCESS
}
