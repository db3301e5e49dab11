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

/// guerrillad, an SMTP receiving daemon
#[derive(Debug, clap::Parser)]
#[command(name = "guerrillad", version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, clap::Subcommand)]
pub enum Commands {
    /// Start the daemon and all enabled servers
    Serve {
        /// Path to the configuration file
        #[arg(short, long, default_value = "guerrillad.conf.json")]
        config: std::path::PathBuf,
        /// Path to the pid file, overrides the config
        #[arg(short, long = "pidFile")]
        pid_file: Option<std::path::PathBuf>,
        /// Log at debug level regardless of the config
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print the version and exit
    Version,
}

#[cfg(test)]
mod tests {
    use super::Args;
    use clap::Parser;

    #[test]
    fn serve_flags_parse() {
        let args = Args::parse_from([
            "guerrillad",
            "serve",
            "--config",
            "/etc/guerrillad.conf.json",
            "--pidFile",
            "/run/guerrillad.pid",
            "-v",
        ]);
        match args.command {
            super::Commands::Serve {
                config,
                pid_file,
                verbose,
            } => {
                assert_eq!(config.to_str(), Some("/etc/guerrillad.conf.json"));
                assert_eq!(pid_file.unwrap().to_str(), Some("/run/guerrillad.pid"));
                assert!(verbose);
            }
            super::Commands::Version => panic!("parsed the wrong command"),
        }
    }

    #[test]
    fn version_parses() {
        let args = Args::parse_from(["guerrillad", "version"]);
        assert!(matches!(args.command, super::Commands::Version));
    }
}
