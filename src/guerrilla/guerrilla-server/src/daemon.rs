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

use crate::Server;
use anyhow::Context;
use guerrilla_backend::Gateway;
use guerrilla_config::{AppConfig, ServerConfig};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

struct ServerHandle {
    listen_interface: String,
    local_addr: std::net::SocketAddr,
    server: Arc<Server>,
    config_tx: watch::Sender<Arc<ServerConfig>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// The running daemon: one backend gateway shared by every enabled
/// server. Servers and gateway come up in [`Daemon::start`] and go away
/// in [`Daemon::shutdown`]; SIGHUP-style reloads go through
/// [`Daemon::reload`].
pub struct Daemon {
    config: Mutex<AppConfig>,
    backend_tx: watch::Sender<Arc<Gateway>>,
    servers: Vec<ServerHandle>,
}

impl Daemon {
    /// Bring the backend and every enabled server up. Listeners are
    /// bound eagerly; any bind, TLS or backend failure aborts startup.
    ///
    /// # Errors
    ///
    /// * backend initialization failure
    /// * TLS key material failure
    /// * bind failure
    pub async fn start(config: AppConfig) -> anyhow::Result<Self> {
        if let Some((needed, limit)) = file_limit_shortfall(&config) {
            tracing::warn!(
                max_clients = needed,
                file_limit = limit,
                "Combined max clients exceeds the open file limit, expect accept errors under load."
            );
        }

        let gateway = Gateway::new(config.backend_config.clone())
            .context("backend config rejected")?;
        gateway.initialize().context("backend initialization failed")?;
        gateway.start().context("backend start failed")?;
        let (backend_tx, backend_rx) = watch::channel(Arc::new(gateway));

        let mut servers = Vec::new();
        for server_config in config.servers.iter().filter(|sc| sc.is_enabled).cloned() {
            let listen_interface = server_config.listen_interface.clone();
            if server_config.log_file.is_empty() {
                tracing::info!(
                    interface = %listen_interface,
                    "server did not configure a separate log file, so using the main log"
                );
            } else {
                tracing::info!(
                    interface = %listen_interface,
                    log_file = %server_config.log_file,
                    "separate server log requested; events stay on the main log, filter by interface"
                );
            }
            let listener = tokio::net::TcpListener::bind(&listen_interface)
                .await
                .with_context(|| format!("cannot listen on {listen_interface}"))?;
            let local_addr = listener
                .local_addr()
                .context("listener has no local address")?;

            let (server, config_tx) =
                Server::new(server_config, &config.allowed_hosts, backend_rx.clone())?;
            let task = tokio::spawn(server.clone().serve(listener));
            servers.push(ServerHandle {
                listen_interface,
                local_addr,
                server,
                config_tx,
                task,
            });
        }

        Ok(Self {
            config: Mutex::new(config),
            backend_tx,
            servers,
        })
    }

    /// Where each enabled server actually listens, in config order.
    /// With a `:0` interface this is the resolved port.
    #[must_use]
    pub fn local_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.servers.iter().map(|handle| handle.local_addr).collect()
    }

    /// Apply a reloaded configuration: servers get the new snapshot and
    /// host table, the backend is rebuilt only when its config changed.
    /// Live connections are not interrupted.
    ///
    /// # Errors
    ///
    /// * a rebuilt backend failed to come up, or new TLS material is
    ///   unusable; the previous state stays in effect
    pub async fn reload(&self, new_config: AppConfig) -> anyhow::Result<()> {
        let backend_changed = {
            let current = self.config.lock().expect("daemon config lock");
            current.backend_config != new_config.backend_config
        };

        if backend_changed {
            let gateway =
                Gateway::new(new_config.backend_config.clone()).context("backend config rejected")?;
            gateway.initialize().context("backend initialization failed")?;
            gateway.start().context("backend start failed")?;

            let previous = self.backend_tx.borrow().clone();
            self.backend_tx
                .send(Arc::new(gateway))
                .ok()
                .context("no server is watching the backend")?;
            previous.shutdown().await;
            tracing::info!("Backend rebuilt after config reload.");
        }

        for handle in &self.servers {
            let Some(server_config) = new_config
                .servers
                .iter()
                .find(|sc| sc.listen_interface == handle.listen_interface)
                .cloned()
            else {
                tracing::warn!(
                    interface = %handle.listen_interface,
                    "Reloaded config no longer declares this server, keeping the old settings."
                );
                continue;
            };
            handle.server.set_allowed_hosts(&new_config.allowed_hosts);
            handle
                .server
                .configure_tls(&server_config)
                .with_context(|| format!("TLS reload failed for {}", handle.listen_interface))?;
            handle.config_tx.send(Arc::new(server_config)).ok();
        }

        *self.config.lock().expect("daemon config lock") = new_config;
        tracing::info!("Configuration reloaded.");
        Ok(())
    }

    /// Graceful shutdown: stop accepting, drain connections, then take
    /// the backend down.
    pub async fn shutdown(self) {
        for handle in &self.servers {
            handle.server.shutdown();
        }
        for handle in self.servers {
            if let Err(error) = handle.task.await {
                tracing::warn!(%error, "Server task ended abnormally.");
            }
        }
        let backend = self.backend_tx.borrow().clone();
        backend.shutdown().await;
        tracing::info!("Daemon shut down.");
    }
}

// Sum of max_clients against the soft open-file limit, read the
// Linux way. None when the limit is unknown or comfortable.
fn file_limit_shortfall(config: &AppConfig) -> Option<(usize, u64)> {
    let needed: usize = config
        .servers
        .iter()
        .filter(|sc| sc.is_enabled)
        .map(|sc| sc.max_clients)
        .sum();
    let limits = std::fs::read_to_string("/proc/self/limits").ok()?;
    let line = limits.lines().find(|line| line.starts_with("Max open files"))?;
    let soft = line.split_whitespace().nth(3)?.parse::<u64>().ok()?;
    (needed as u64 > soft).then_some((needed, soft))
}
