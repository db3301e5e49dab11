/*
 * guerrilla - SMTP mail receiving daemon
 * Copyright (C) 2024 The guerrilla developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

use anyhow::Context;
use clap::Parser;
use guerrilla_core::{Args, Commands};
use guerrilla_server::Daemon;

const DEFAULT_PID_FILE: &str = "/var/run/guerrillad.pid";

fn main() {
    let args = Args::parse();
    match args.command {
        Commands::Version => {
            println!("guerrillad {}", guerrilla_server::VERSION);
        }
        Commands::Serve {
            config,
            pid_file,
            verbose,
        } => {
            if let Err(error) = serve(&config, pid_file, verbose) {
                eprintln!("guerrillad: {error:#}");
                std::process::exit(1);
            }
        }
    }
}

fn serve(
    config_path: &std::path::Path,
    pid_file: Option<std::path::PathBuf>,
    verbose: bool,
) -> anyhow::Result<()> {
    let mut config = guerrilla_config::load_file(config_path)?;

    // flags override the file
    if let Some(pid_file) = pid_file {
        config.pid_file = pid_file.to_string_lossy().into_owned();
    } else if config.pid_file.is_empty() {
        config.pid_file = DEFAULT_PID_FILE.to_owned();
    }
    if verbose {
        config.log_level = "debug".to_owned();
    }

    let _log_guard = guerrilla_core::init_logs(&config.log_file, &config.log_level, verbose)?;

    std::fs::write(&config.pid_file, format!("{}\n", std::process::id()))
        .with_context(|| format!("could not write pid file {}", config.pid_file))?;

    let runtime = tokio::runtime::Runtime::new().context("could not start the runtime")?;
    runtime.block_on(run(config_path, config))
}

async fn run(config_path: &std::path::Path, config: guerrilla_config::AppConfig) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tracing::info!(version = guerrilla_server::VERSION, "guerrillad starting");
    let daemon = Daemon::start(config).await?;

    let mut hangup = signal(SignalKind::hangup()).context("signal handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("signal handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("signal handler")?;
    let mut quit = signal(SignalKind::quit()).context("signal handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received, reloading configuration");
                match guerrilla_config::load_file(config_path) {
                    Ok(new_config) => {
                        if let Err(error) = daemon.reload(new_config).await {
                            tracing::error!(%error, "Config reload failed, keeping the previous configuration");
                        }
                    }
                    Err(error) => {
                        tracing::error!(%error, "Could not re-read the config file, keeping the previous configuration");
                    }
                }
            }
            _ = terminate.recv() => break,
            _ = interrupt.recv() => break,
            _ = quit.recv() => break,
        }
    }

    tracing::info!("Shutdown signal received");
    daemon.shutdown().await;
    Ok(())
}
