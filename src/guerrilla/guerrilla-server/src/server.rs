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

use crate::client::{Client, ClientState};
use crate::hosts::AllowedHosts;
use crate::pool::ClientPool;
use crate::VERSION;
use futures_util::FutureExt;
use guerrilla_backend::{Gateway, Task};
use guerrilla_common::{canned, Address, Reply};
use guerrilla_config::ServerConfig;
use guerrilla_mail::{rfc5321, Pool as EnvelopePool};
use guerrilla_protocol::{
    parse_verb, proxy, Error, Verb, COMMAND_LINE_MAX_LENGTH, MAX_UNRECOGNIZED_COMMANDS,
};
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, Notify};
use tokio_stream::StreamExt;

// Go a little over the configured maximum before erroring out, so a
// client slightly past the limit gets the proper size reply instead of
// a read failure.
const DATA_HARD_LIMIT_SLACK: usize = 1024 * 1000;

/// One SMTP listener with its pools and its protocol state machine.
///
/// The live [`ServerConfig`] is a watch snapshot, re-read once per
/// state-machine iteration; reloads replace the snapshot without
/// touching established connections.
pub struct Server {
    listen_interface: String,
    config: watch::Receiver<Arc<ServerConfig>>,
    backend: watch::Receiver<Arc<Gateway>>,
    tls: RwLock<Option<tokio_rustls::TlsAcceptor>>,
    hosts: RwLock<AllowedHosts>,
    clients: ClientPool,
    envelopes: EnvelopePool,
    shutdown_signal: Notify,
}

impl Server {
    /// Build a server from its config. TLS material is loaded here;
    /// failure to do so is fatal at startup. The returned sender feeds
    /// config reloads.
    ///
    /// # Errors
    ///
    /// * TLS key material cannot be loaded or is rejected
    pub fn new(
        config: ServerConfig,
        allowed_hosts: &[String],
        backend: watch::Receiver<Arc<Gateway>>,
    ) -> anyhow::Result<(Arc<Self>, watch::Sender<Arc<ServerConfig>>)> {
        let (config_tx, config_rx) = watch::channel(Arc::new(config.clone()));
        let server = Arc::new(Self {
            listen_interface: config.listen_interface.clone(),
            config: config_rx,
            backend,
            tls: RwLock::new(None),
            hosts: RwLock::new(AllowedHosts::new(allowed_hosts)),
            clients: ClientPool::new(config.max_clients),
            envelopes: EnvelopePool::new(config.max_clients),
            shutdown_signal: Notify::new(),
        });
        server.configure_tls(&config)?;
        Ok((server, config_tx))
    }

    /// (Re)build the TLS acceptor from the config's `tls` section.
    ///
    /// # Errors
    ///
    /// * unreadable or rejected key material
    pub fn configure_tls(&self, config: &ServerConfig) -> anyhow::Result<()> {
        let acceptor = if config.tls_required() {
            let rustls_config = guerrilla_config::build_tls_config(&config.tls)?;
            Some(tokio_rustls::TlsAcceptor::from(Arc::new(rustls_config)))
        } else {
            None
        };
        *self.tls.write().expect("tls config lock") = acceptor;
        Ok(())
    }

    /// Swap the recipient authorization table.
    pub fn set_allowed_hosts(&self, entries: &[String]) {
        *self.hosts.write().expect("allowed hosts lock") = AllowedHosts::new(entries);
    }

    /// Connections currently being served.
    #[must_use]
    pub fn active_clients(&self) -> usize {
        self.clients.active_count()
    }

    /// Stop accepting, fail waiting borrowers; [`Server::serve`] then
    /// drains and returns.
    pub fn shutdown(&self) {
        self.clients.shutdown_state();
        self.shutdown_signal.notify_waiters();
    }

    /// Accept clients until shutdown, then drain the pool.
    ///
    /// # Errors
    ///
    /// * none at present; the listener is bound by the caller so bind
    ///   failures surface there
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        tracing::info!(interface = %self.listen_interface, "Listening on TCP");
        let mut client_id: u64 = 0;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            client_id += 1;
                            tracing::debug!(
                                interface = %self.listen_interface,
                                client = client_id,
                                %peer,
                                "Waiting for a new client"
                            );
                            let server = self.clone();
                            tokio::spawn(server.handle_connection(stream, peer, client_id));
                        }
                        Err(error) => {
                            tracing::info!(%error, "Temporary error accepting client");
                        }
                    }
                }
                () = self.shutdown_signal.notified() => break,
            }
        }

        tracing::info!(interface = %self.listen_interface, "Server has stopped accepting new clients");
        self.clients.shutdown_state();
        self.clients.shutdown_wait().await;
        tracing::info!(interface = %self.listen_interface, "Shutdown completed, exiting");
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        peer: std::net::SocketAddr,
        client_id: u64,
    ) {
        let mut client = match self.clients.borrow(stream, client_id).await {
            Ok(client) => client,
            Err(error) => {
                tracing::info!(%error, "couldn't borrow a new client");
                return;
            }
        };
        client.envelope = Some(self.envelopes.borrow(peer.ip().to_string(), client_id).await);

        // a panic must never escape the connection task
        let outcome = std::panic::AssertUnwindSafe(self.handle_client(&mut client))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            tracing::error!(client = client_id, "Connection task recovered from a panic");
        }

        client.close().await;
        match client.envelope.take() {
            Some(envelope) => self.envelopes.give_back(envelope),
            None => self.envelopes.forfeit(),
        }
        self.clients.give_back(client);
    }

    #[allow(clippy::too_many_lines)]
    async fn handle_client(&self, client: &mut Client) {
        let start_config = self.config_snapshot();
        tracing::info!(
            client = client.id,
            remote = %self.remote_ip(client),
            "Handle client"
        );

        let mut advertise_tls = start_config.tls.start_tls_on;
        if start_config.tls.always_on {
            match self.tls_acceptor() {
                Some(acceptor) => {
                    match client
                        .upgrade_tls(&acceptor, start_config.timeout_duration())
                        .await
                    {
                        Ok(()) => advertise_tls = false,
                        Err(error) => {
                            tracing::warn!(%error, remote = %self.remote_ip(client), "Failed TLS handshake");
                            client.kill();
                        }
                    }
                }
                None => {
                    tracing::error!("TLS is required but no TLS configuration is loaded");
                    client.kill();
                }
            }
        }

        while client.is_alive() {
            let sc = self.config_snapshot();
            let deadline = sc.timeout_duration();

            match client.state {
                ClientState::Connected => {
                    client.state = if sc.proxy_on {
                        ClientState::Proxy
                    } else {
                        ClientState::Greeting
                    };
                }

                ClientState::Proxy => {
                    if !self.handle_proxy(client, deadline).await {
                        return;
                    }
                }

                ClientState::Greeting => {
                    let now = time::OffsetDateTime::now_utc()
                        .format(&time::format_description::well_known::Rfc3339)
                        .unwrap_or_default();
                    client.send_raw(&format!(
                        "220 {} SMTP Guerrilla({}) #{} ({}) {}\r\n",
                        sc.hostname,
                        VERSION,
                        client.id,
                        self.clients.active_count(),
                        now,
                    ));
                    client.state = ClientState::Cmd;
                }

                ClientState::Cmd => {
                    if !self
                        .handle_command(client, sc.as_ref(), &mut advertise_tls, deadline)
                        .await
                    {
                        return;
                    }
                }

                ClientState::Data => {
                    if !self.handle_data(client, sc.as_ref(), deadline).await {
                        return;
                    }
                }

                ClientState::StartTls => {
                    let already_tls = client.envelope.as_ref().is_some_and(|e| e.tls);
                    if !already_tls && sc.tls.start_tls_on {
                        match self.tls_acceptor() {
                            Some(acceptor) => match client.upgrade_tls(&acceptor, deadline).await {
                                Ok(()) => {
                                    advertise_tls = false;
                                    client.reset_transaction();
                                }
                                Err(error) => {
                                    // the handshake consumed the
                                    // transport, nothing left to retry on
                                    tracing::warn!(%error, remote = %self.remote_ip(client), "Failed TLS handshake");
                                    client.kill();
                                }
                            },
                            None => {
                                tracing::error!("STARTTLS accepted but no TLS configuration is loaded");
                                client.kill();
                            }
                        }
                    }
                    client.state = ClientState::Cmd;
                }

                ClientState::Shutdown => {
                    client.send_reply(&canned().error_shutdown);
                    client.kill();
                }
            }

            if client.has_pending_replies() {
                if let Err(error) = client.flush(sc.timeout_duration()).await {
                    tracing::debug!(%error, "error writing response");
                    return;
                }
            }
        }
    }

    // false: the connection is beyond use, the caller returns without
    // flushing
    async fn handle_proxy(&self, client: &mut Client, deadline: std::time::Duration) -> bool {
        let sniffed_v2 = match client
            .peek_preamble(proxy::PROXY_V2_MAGIC.len(), deadline)
            .await
        {
            Ok(window) => proxy::is_v2_preamble(window),
            Err(error) => {
                tracing::warn!(
                    %error,
                    remote = %self.remote_ip(client),
                    "Error reading PROXY header. Disable \"proxyon\" in your configuration file if you're not using a reverse proxy."
                );
                client.kill();
                return false;
            }
        };
        if sniffed_v2 {
            tracing::warn!(
                remote = %self.remote_ip(client),
                "Received a connection with a PROXY v2 binary header, but we only support v1"
            );
            client.kill();
            return false;
        }

        let line = match client.read_line(proxy::PROXY_V1_MAX_LINE, deadline).await {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(%error, "Error reading PROXY header");
                client.kill();
                return false;
            }
        };
        tracing::debug!(header = %String::from_utf8_lossy(&line), "Received PROXY header");

        match proxy::parse_v1(&line) {
            Ok(proxy::ProxyInfo::Unknown) => {
                if let Some(envelope) = client.envelope.as_mut() {
                    envelope.remote_ip.clear();
                }
                tracing::info!("Proxying from UNKNOWN");
            }
            Ok(proxy::ProxyInfo::Tcp {
                source,
                family_mismatch,
            }) => {
                if family_mismatch {
                    tracing::error!(
                        %source,
                        "PROXY header protocol does not match the offered address family"
                    );
                }
                let label = if source.is_ipv4() { "TCP4" } else { "TCP6" };
                if let Some(envelope) = client.envelope.as_mut() {
                    envelope.remote_ip = source.to_string();
                }
                tracing::info!(%source, "Proxying from {label} {source}");
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    "Initial command wasn't a valid PROXY header. Disable \"proxyon\" in your configuration file if you're not using a reverse proxy."
                );
                client.kill();
                return false;
            }
        }
        client.state = ClientState::Greeting;
        true
    }

    // false: terminate the connection without flushing
    #[allow(clippy::too_many_lines)]
    async fn handle_command(
        &self,
        client: &mut Client,
        sc: &ServerConfig,
        advertise_tls: &mut bool,
        deadline: std::time::Duration,
    ) -> bool {
        let input = match client.read_line(COMMAND_LINE_MAX_LENGTH, deadline).await {
            Ok(line) => line,
            Err(Error::LineLimitExceeded { .. }) => {
                client.send_reply(&canned().fail_line_too_long);
                client.kill();
                return true;
            }
            Err(Error::Eof) => {
                tracing::warn!(remote = %self.remote_ip(client), "Client closed the connection");
                return false;
            }
            Err(error) => {
                tracing::warn!(%error, remote = %self.remote_ip(client), "Read error");
                return false;
            }
        };
        if self.clients.is_shutting_down() {
            client.state = ClientState::Shutdown;
            return true;
        }

        let mut input = input.as_slice();
        if let Some(stripped) = input.strip_suffix(b"\r\n") {
            input = stripped;
        } else if let Some(stripped) = input.strip_suffix(b"\n") {
            input = stripped;
        }
        tracing::debug!(input = %String::from_utf8_lossy(input), "Client sent");

        match parse_verb(input) {
            Some((Verb::Helo, args)) => match rfc5321::parse_helo(args) {
                Ok(name) => {
                    if let Some(envelope) = client.envelope.as_mut() {
                        envelope.helo = name;
                    }
                    client.reset_transaction();
                    client.send_reply(&Reply::new(250, format!("{} Hello", sc.hostname)));
                }
                Err(error) => {
                    tracing::warn!(%error, client = client.id, "invalid helo");
                    client.send_reply(&canned().fail_syntax_error);
                }
            },

            Some((Verb::Ehlo, args)) => match rfc5321::parse_helo(args) {
                Ok(name) => {
                    if let Some(envelope) = client.envelope.as_mut() {
                        envelope.helo = name;
                        envelope.esmtp = true;
                    }
                    client.reset_transaction();

                    let hello = format!("{} Hello", sc.hostname);
                    let size = format!("SIZE {}", sc.max_size);
                    let mut lines = vec![hello.as_str(), size.as_str(), "PIPELINING"];
                    let tls_now = client.envelope.as_ref().is_some_and(|e| e.tls);
                    if *advertise_tls && !tls_now {
                        lines.push("STARTTLS");
                    }
                    lines.push("ENHANCEDSTATUSCODES");
                    lines.push("HELP");
                    client.send_raw(&Reply::multiline(250, &lines));
                }
                Err(error) => {
                    tracing::warn!(%error, client = client.id, "invalid ehlo");
                    client.send_reply(&canned().fail_syntax_error);
                }
            },

            Some((Verb::Help, _)) => {
                client.send_raw(&format!("214-OK\r\n214 {}\r\n", guerrilla_common::canned::quote()));
            }

            Some((Verb::Xclient, args)) if sc.xclient_on => {
                self.apply_xclient(client, args);
                client.send_reply(&canned().success_mail_cmd);
            }

            Some((Verb::MailFrom, args)) => {
                if client.is_in_transaction() {
                    client.send_reply(&canned().fail_nested_mail_cmd);
                } else {
                    match rfc5321::parse_path(args) {
                        Ok(path) => {
                            if let Some(envelope) = client.envelope.as_mut() {
                                // the null path still opens the transaction
                                envelope.mail_from = Some(path.address);
                            }
                            client.send_reply(&canned().success_mail_cmd);
                        }
                        Err(error) => {
                            tracing::error!(
                                %error,
                                input = %String::from_utf8_lossy(args),
                                "MAIL parse error"
                            );
                            client.send_reply(&canned().fail_syntax_error);
                        }
                    }
                }
            }

            Some((Verb::RcptTo, args)) => {
                self.handle_rcpt(client, sc, args).await;
            }

            Some((Verb::Rset, _)) => {
                client.reset_transaction();
                client.send_reply(&canned().success_reset_cmd);
            }

            Some((Verb::Vrfy, _)) => client.send_reply(&canned().success_verify_cmd),

            Some((Verb::Noop, _)) => client.send_reply(&canned().success_noop_cmd),

            Some((Verb::Quit, _)) => {
                client.send_reply(&canned().success_quit_cmd);
                client.kill();
            }

            Some((Verb::Data, _)) => {
                let has_recipients = client
                    .envelope
                    .as_ref()
                    .is_some_and(|envelope| !envelope.rcpt_to.is_empty());
                if has_recipients {
                    client.send_reply(&canned().success_data_cmd);
                    client.state = ClientState::Data;
                } else {
                    client.send_reply(&canned().fail_no_recipients_data_cmd);
                }
            }

            Some((Verb::StartTls, _)) if sc.tls.start_tls_on => {
                client.send_reply(&canned().success_start_tls_cmd);
                client.state = ClientState::StartTls;
            }

            // disabled extensions fall through to unrecognized
            Some((Verb::Xclient | Verb::StartTls, _)) | None => {
                client.errors += 1;
                if client.errors >= MAX_UNRECOGNIZED_COMMANDS {
                    client.send_reply(&canned().fail_max_unrecognized_cmd);
                    client.kill();
                } else {
                    client.send_reply(&canned().fail_unrecognized_cmd);
                }
            }
        }
        true
    }

    async fn handle_rcpt(&self, client: &mut Client, sc: &ServerConfig, args: &[u8]) {
        let recipients = client
            .envelope
            .as_ref()
            .map_or(0, |envelope| envelope.rcpt_to.len());
        if recipients >= rfc5321::LIMIT_RECIPIENTS {
            client.send_reply(&canned().error_too_many_recipients);
            return;
        }

        let mut to = match rfc5321::parse_path(args) {
            Ok(path) => path.address,
            Err(error) => {
                tracing::error!(%error, input = %String::from_utf8_lossy(args), "RCPT parse error");
                client.send_reply(&canned().fail_syntax_error);
                return;
            }
        };
        self.default_host(&mut to, sc);

        let allowed = {
            let hosts = self.hosts.read().expect("allowed hosts lock");
            match to.ip {
                Some(ip) => hosts.allows_ip(ip),
                None => hosts.allows_host(&to.host),
            }
        };
        if !allowed {
            client.send_reply(&canned().error_relay_denied.with_detail(&to.host));
            return;
        }

        let Some(mut envelope) = client.envelope.take() else {
            client.kill();
            return;
        };
        envelope.rcpt_to.push(to);

        let backend = self.backend_snapshot();
        let (envelope_back, rejection) = backend.validate_rcpt(envelope).await;
        let Some(mut envelope) = envelope_back else {
            tracing::error!("Envelope was lost to the backend, closing connection");
            client.kill();
            return;
        };
        match rejection {
            Some(reply) => {
                envelope.rcpt_to.pop();
                client.envelope = Some(envelope);
                client.send_reply(&reply);
            }
            None => {
                client.envelope = Some(envelope);
                client.send_reply(&canned().success_rcpt_cmd);
            }
        }
    }

    // false: terminate the connection without flushing
    async fn handle_data(
        &self,
        client: &mut Client,
        sc: &ServerConfig,
        deadline: std::time::Duration,
    ) -> bool {
        let hard_limit = sc.max_size + DATA_HARD_LIMIT_SLACK;
        let mut read_failure: Option<Error> = None;
        {
            let (reader, envelope) = client.reader_and_envelope();
            let Some(envelope) = envelope else {
                return false;
            };
            let stream = reader.as_message_stream(sc.max_size, hard_limit);
            tokio::pin!(stream);
            loop {
                match tokio::time::timeout(deadline, stream.next()).await {
                    Ok(Some(Ok(line))) => envelope.data.extend_from_slice(&line),
                    Ok(None) => break,
                    Ok(Some(Err(error))) => {
                        read_failure = Some(error);
                        break;
                    }
                    Err(_elapsed) => {
                        read_failure = Some(Error::Io(std::io::ErrorKind::TimedOut.into()));
                        break;
                    }
                }
            }
        }

        if let Some(error) = read_failure {
            let reply = match &error {
                Error::LineLimitExceeded { .. } => canned()
                    .fail_read_limit_exceeded_data_cmd
                    .with_detail(&error.to_string()),
                Error::MessageSizeExceeded { .. } => canned()
                    .fail_message_size_exceeded
                    .with_detail(&error.to_string()),
                _ => canned().fail_read_error_data_cmd.with_detail(&error.to_string()),
            };
            tracing::warn!(%error, "Error reading data");
            client.send_reply(&reply);
            client.kill();
            client.reset_transaction();
            return true;
        }

        let Some(envelope) = client.envelope.take() else {
            client.kill();
            return true;
        };
        let backend = self.backend_snapshot();
        let (envelope_back, reply) = backend.process(envelope, Task::SaveMail).await;
        if reply.is_positive() {
            client.messages_sent += 1;
        }
        client.send_reply(&reply);
        match envelope_back {
            Some(envelope) => client.envelope = Some(envelope),
            None => {
                tracing::error!("Envelope was lost to the backend, closing connection");
                client.kill();
            }
        }

        client.state = if self.clients.is_shutting_down() {
            ClientState::Shutdown
        } else {
            ClientState::Cmd
        };
        client.reset_transaction();
        true
    }

    fn apply_xclient(&self, client: &mut Client, args: &[u8]) {
        let Some(envelope) = client.envelope.as_mut() else {
            return;
        };
        for token in args.split(|&b| b == b' ') {
            let mut parts = token.splitn(2, |&b| b == b'=');
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            if value == b"[UNAVAILABLE]" {
                continue;
            }
            if key == b"ADDR" {
                envelope.remote_ip = String::from_utf8_lossy(value).into_owned();
            }
            if key == b"HELO" {
                envelope.helo = String::from_utf8_lossy(value).into_owned();
            }
        }
    }

    // completes a bare postmaster with our hostname
    fn default_host(&self, address: &mut Address, sc: &ServerConfig) {
        if address.host.is_empty() && address.is_postmaster() {
            address.host = sc.hostname.to_lowercase();
            let known = self
                .hosts
                .read()
                .expect("allowed hosts lock")
                .allows_host(&address.host);
            if !known {
                tracing::warn!(
                    hostname = %sc.hostname,
                    "the hostname is not present in AllowedHosts config setting"
                );
            }
        }
    }

    fn config_snapshot(&self) -> Arc<ServerConfig> {
        self.config.borrow().clone()
    }

    fn backend_snapshot(&self) -> Arc<Gateway> {
        self.backend.borrow().clone()
    }

    fn tls_acceptor(&self) -> Option<tokio_rustls::TlsAcceptor> {
        self.tls.read().expect("tls config lock").clone()
    }

    fn remote_ip(&self, client: &Client) -> String {
        client
            .envelope
            .as_ref()
            .map(|envelope| envelope.remote_ip.clone())
            .unwrap_or_default()
    }
}
