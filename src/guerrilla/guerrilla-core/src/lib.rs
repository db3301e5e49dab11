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

//! guerrillad executable support: argument parsing and log setup.

#![doc(html_no_source)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod args;

pub use args::{Args, Commands};

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the tracing subsystem from the main log settings.
///
/// `log_file` selects the sink: `stderr`, `stdout`, `off`, or a path
/// (appended to, never rotated). `verbose` forces the debug level.
///
/// Returns a guard that must stay alive for the duration of the
/// process when a file sink is used.
///
/// # Errors
///
/// * an unusable log file path
/// * a second initialization
pub fn init_logs(
    log_file: &str,
    log_level: &str,
    verbose: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = if verbose { "debug" } else { log_level };
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .with_context(|| format!("invalid log level {level:?}"))?;

    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        "off" => {
            registry.try_init().context("logging already initialized")?;
            Ok(None)
        }
        "" | "stderr" => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .context("logging already initialized")?;
            Ok(None)
        }
        "stdout" => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
                .try_init()
                .context("logging already initialized")?;
            Ok(None)
        }
        path => {
            let path = std::path::Path::new(path);
            let (directory, file_name) = match (path.parent(), path.file_name()) {
                (Some(directory), Some(file_name)) if !directory.as_os_str().is_empty() => {
                    (directory.to_path_buf(), file_name.to_owned())
                }
                (_, Some(file_name)) => (std::path::PathBuf::from("."), file_name.to_owned()),
                _ => anyhow::bail!("log_file {:?} is not a file path", path.display()),
            };
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .try_init()
                .context("logging already initialized")?;
            Ok(Some(guard))
        }
    }
}
