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

use crate::AppConfig;
use anyhow::Context;

/// Read and validate a configuration file.
///
/// # Errors
///
/// * unreadable file, invalid JSON, or a configuration that could never
///   start (no servers, duplicate interfaces, TLS without key material)
pub fn load_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<AppConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("could not read config file {}", path.display()))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .with_context(|| format!("could not parse config file {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> anyhow::Result<()> {
    anyhow::ensure!(
        !config.servers.is_empty(),
        "config declares no servers, nothing to do"
    );

    let mut seen = std::collections::HashSet::new();
    for server in &config.servers {
        anyhow::ensure!(
            seen.insert(server.listen_interface.as_str()),
            "listen_interface {:?} is declared twice",
            server.listen_interface
        );
        server
            .listen_interface
            .parse::<std::net::SocketAddr>()
            .with_context(|| {
                format!(
                    "listen_interface {:?} is not an address:port",
                    server.listen_interface
                )
            })?;
        if server.is_enabled && server.tls_required() {
            anyhow::ensure!(
                !server.tls.public_key_file.is_empty() && !server.tls.private_key_file.is_empty(),
                "server {:?} requires TLS but names no key material",
                server.listen_interface
            );
        }
    }
    Ok(())
}
