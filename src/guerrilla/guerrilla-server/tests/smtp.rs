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

//! End-to-end tests driving raw SMTP against a live listener.

use guerrilla_config::AppConfig;
use guerrilla_server::Daemon;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

async fn start(config: serde_json::Value) -> (Daemon, std::net::SocketAddr) {
    let config: AppConfig = serde_json::from_value(config).unwrap();
    let daemon = Daemon::start(config).await.unwrap();
    let addr = daemon.local_addrs()[0];
    (daemon, addr)
}

fn base_config() -> serde_json::Value {
    serde_json::json!({
        "allowed_hosts": ["example.com", "grr.la"],
        "primary_mail_host": "test.example.com",
        "servers": [{
            "listen_interface": "127.0.0.1:0",
            "hostname": "test.example.com",
            "timeout": 5
        }]
    })
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Session {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    /// Read one (possibly multi-line) reply. Empty string means the
    /// server closed the connection.
    async fn reply(&mut self) -> String {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(
                std::time::Duration::from_secs(10),
                self.reader.read_line(&mut line),
            )
            .await
            .expect("reply timed out")
            .unwrap_or(0);
            if n == 0 {
                return text;
            }
            text.push_str(&line);
            if line.len() >= 4 && line.as_bytes()[3] == b' ' {
                return text;
            }
        }
    }

    // writes are tolerant: probing a connection the server already
    // closed is part of several tests
    async fn send(&mut self, line: &str) {
        let _ = self.writer.write_all(line.as_bytes()).await;
        let _ = self.writer.write_all(b"\r\n").await;
    }

    async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.reply().await
    }
}

#[tokio::test]
async fn happy_path_with_extension_advertisements() {
    let (daemon, addr) = start(base_config()).await;
    let mut session = Session::connect(addr).await;

    let greeting = session.reply().await;
    assert!(greeting.starts_with("220 test.example.com SMTP Guerrilla("), "{greeting}");

    let ehlo = session.cmd("EHLO client.example").await;
    assert!(ehlo.starts_with("250-test.example.com Hello\r\n"), "{ehlo}");
    assert!(ehlo.contains("250-SIZE 10485760\r\n"));
    assert!(ehlo.contains("250-PIPELINING\r\n"));
    assert!(ehlo.contains("250-ENHANCEDSTATUSCODES\r\n"));
    assert!(ehlo.ends_with("250 HELP\r\n"));
    // no TLS configured, none advertised
    assert!(!ehlo.contains("STARTTLS"));

    assert!(session.cmd("MAIL FROM:<sender@example.com>").await.starts_with("250 "));
    assert!(session.cmd("RCPT TO:<rcpt@grr.la>").await.starts_with("250 "));
    assert!(session.cmd("DATA").await.starts_with("354 "));

    session.send("Subject: e2e").await;
    session.send("").await;
    session.send("Hello there.").await;
    let queued = session.cmd(".").await;
    assert!(queued.starts_with("250 2.0.0 OK: queued as "), "{queued}");

    let bye = session.cmd("QUIT").await;
    assert!(bye.starts_with("221 "), "{bye}");

    daemon.shutdown().await;
}

#[tokio::test]
async fn nested_mail_from_is_rejected() {
    let (_daemon, addr) = start(base_config()).await;
    let mut session = Session::connect(addr).await;
    session.reply().await;
    session.cmd("HELO client.example").await;

    assert!(session.cmd("MAIL FROM:<a@example.com>").await.starts_with("250 "));
    let nested = session.cmd("MAIL FROM:<b@example.com>").await;
    assert!(nested.starts_with("503 "), "{nested}");
}

#[tokio::test]
async fn bounce_path_opens_a_transaction_too() {
    let (_daemon, addr) = start(base_config()).await;
    let mut session = Session::connect(addr).await;
    session.reply().await;
    session.cmd("HELO client.example").await;

    assert!(session.cmd("MAIL FROM:<>").await.starts_with("250 "));
    assert!(session.cmd("MAIL FROM:<a@example.com>").await.starts_with("503 "));
}

#[tokio::test]
async fn relaying_is_denied_for_foreign_domains() {
    let (_daemon, addr) = start(base_config()).await;
    let mut session = Session::connect(addr).await;
    session.reply().await;
    session.cmd("EHLO client.example").await;
    session.cmd("MAIL FROM:<a@example.com>").await;

    let denied = session.cmd("RCPT TO:<x@notallowed.example>").await;
    assert!(denied.starts_with("550 "), "{denied}");
    assert!(denied.contains("notallowed.example"));

    // the recipient was not kept, DATA still sees none
    assert!(session.cmd("DATA").await.starts_with("503 "));
}

#[tokio::test]
async fn rset_clears_the_transaction() {
    let (_daemon, addr) = start(base_config()).await;
    let mut session = Session::connect(addr).await;
    session.reply().await;
    session.cmd("HELO client.example").await;

    session.cmd("MAIL FROM:<a@example.com>").await;
    assert!(session.cmd("RSET").await.starts_with("250 "));
    assert!(session.cmd("MAIL FROM:<b@example.com>").await.starts_with("250 "));
}

#[tokio::test]
async fn five_unrecognized_commands_kill_the_connection() {
    let (_daemon, addr) = start(base_config()).await;
    let mut session = Session::connect(addr).await;
    session.reply().await;

    for _ in 0..4 {
        let reply = session.cmd("NOTACOMMAND").await;
        assert!(reply.starts_with("500 "), "{reply}");
    }
    let last = session.cmd("NOTACOMMAND").await;
    assert!(last.starts_with("554 "), "{last}");

    // nothing more comes back
    let after = session.cmd("NOOP").await;
    assert!(after.is_empty(), "{after}");
}

#[tokio::test]
async fn oversized_data_gets_the_size_reply_and_the_boot() {
    let mut config = base_config();
    config["servers"][0]["max_size"] = serde_json::json!(1000);
    let (_daemon, addr) = start(config).await;

    let mut session = Session::connect(addr).await;
    session.reply().await;
    session.cmd("EHLO client.example").await;
    session.cmd("MAIL FROM:<a@example.com>").await;
    session.cmd("RCPT TO:<b@grr.la>").await;
    assert!(session.cmd("DATA").await.starts_with("354 "));

    let big = "X".repeat(600);
    session.send(&big).await;
    session.send(&big).await;
    let refused = session.cmd(".").await;
    assert!(refused.starts_with("552 "), "{refused}");

    let after = session.cmd("NOOP").await;
    assert!(after.is_empty(), "{after}");
}

#[tokio::test]
async fn proxy_v1_preamble_sets_the_remote_ip() {
    let mut config = base_config();
    config["servers"][0]["proxyon"] = serde_json::json!(true);
    let (_daemon, addr) = start(config).await;

    let mut session = Session::connect(addr).await;
    // no greeting before the preamble
    session.send("PROXY TCP4 10.0.0.1 10.0.0.2 54321 25").await;
    let greeting = session.reply().await;
    assert!(greeting.starts_with("220 "), "{greeting}");

    // and the conversation proceeds normally
    assert!(session.cmd("EHLO client.example").await.contains("250 HELP"));
    assert!(session.cmd("MAIL FROM:<a@example.com>").await.starts_with("250 "));
}

#[tokio::test]
async fn proxy_v2_preamble_is_rejected() {
    let mut config = base_config();
    config["servers"][0]["proxyon"] = serde_json::json!(true);
    let (_daemon, addr) = start(config).await;

    let mut session = Session::connect(addr).await;
    session
        .writer
        .write_all(b"\x0D\x0A\x0D\x0A\x00\x0D\x0AQUIT\x0A\x21\x11\x00\x0C")
        .await
        .unwrap();
    let nothing = session.reply().await;
    assert!(nothing.is_empty(), "{nothing}");
}

#[tokio::test]
async fn malformed_proxy_preamble_kills_the_connection() {
    let mut config = base_config();
    config["servers"][0]["proxyon"] = serde_json::json!(true);
    let (_daemon, addr) = start(config).await;

    let mut session = Session::connect(addr).await;
    session.send("EHLO not-a-proxy-header").await;
    let nothing = session.reply().await;
    assert!(nothing.is_empty(), "{nothing}");
}

#[tokio::test]
async fn xclient_overrides_the_connection_attributes() {
    let mut config = base_config();
    config["servers"][0]["xclient_on"] = serde_json::json!(true);
    let (_daemon, addr) = start(config).await;

    let mut session = Session::connect(addr).await;
    session.reply().await;
    session.cmd("EHLO front.proxy").await;
    let reply = session
        .cmd("XCLIENT ADDR=198.51.100.4 HELO=real.client NAME=[UNAVAILABLE]")
        .await;
    assert!(reply.starts_with("250 "), "{reply}");
}

#[tokio::test]
async fn xclient_is_unrecognized_when_disabled() {
    let (_daemon, addr) = start(base_config()).await;
    let mut session = Session::connect(addr).await;
    session.reply().await;
    let reply = session.cmd("XCLIENT ADDR=198.51.100.4").await;
    assert!(reply.starts_with("500 "), "{reply}");
}

#[tokio::test]
async fn starttls_is_unrecognized_without_tls_config() {
    let (_daemon, addr) = start(base_config()).await;
    let mut session = Session::connect(addr).await;
    session.reply().await;
    let reply = session.cmd("STARTTLS").await;
    assert!(reply.starts_with("500 "), "{reply}");
}

#[tokio::test]
async fn bare_postmaster_is_completed_with_the_hostname() {
    let mut config = base_config();
    config["allowed_hosts"] = serde_json::json!(["test.example.com"]);
    let (_daemon, addr) = start(config).await;

    let mut session = Session::connect(addr).await;
    session.reply().await;
    session.cmd("HELO client.example").await;
    session.cmd("MAIL FROM:<a@b.example>").await;
    let reply = session.cmd("RCPT TO:<postmaster>").await;
    assert!(reply.starts_with("250 "), "{reply}");
}

#[tokio::test]
async fn the_client_pool_blocks_past_capacity() {
    let mut config = base_config();
    config["servers"][0]["max_clients"] = serde_json::json!(1);
    let (_daemon, addr) = start(config).await;

    let mut first = Session::connect(addr).await;
    assert!(first.reply().await.starts_with("220 "));

    // the second connection is accepted at the TCP level but waits for
    // a client slot
    let mut second = Session::connect(addr).await;
    let starved = tokio::time::timeout(
        std::time::Duration::from_millis(200),
        second.reader.fill_buf(),
    )
    .await;
    assert!(starved.is_err() || starved.unwrap().unwrap().is_empty());

    first.cmd("QUIT").await;
    let greeting = second.reply().await;
    assert!(greeting.starts_with("220 "), "{greeting}");
}

#[tokio::test]
async fn backend_failures_surface_verbatim() {
    // sleep_seconds == 1 makes the debugger panic on purpose; the
    // gateway answers for the dead processor
    let mut config = base_config();
    config["backend_config"] = serde_json::json!({
        "save_process": "Debugger",
        "sleep_seconds": 1
    });
    let (_daemon, addr) = start(config).await;

    let mut session = Session::connect(addr).await;
    session.reply().await;
    session.cmd("EHLO client.example").await;
    session.cmd("MAIL FROM:<a@example.com>").await;
    session.cmd("RCPT TO:<b@grr.la>").await;
    session.cmd("DATA").await;
    session.send("Subject: doomed").await;
    session.send("").await;
    let refused = session.cmd(".").await;
    assert!(refused.starts_with("554 "), "{refused}");
}

#[tokio::test]
async fn too_many_recipients_is_refused() {
    let (_daemon, addr) = start(base_config()).await;
    let mut session = Session::connect(addr).await;
    session.reply().await;
    session.cmd("EHLO client.example").await;
    session.cmd("MAIL FROM:<a@example.com>").await;

    for i in 0..100 {
        let reply = session.cmd(&format!("RCPT TO:<rcpt{i}@grr.la>")).await;
        assert!(reply.starts_with("250 "), "recipient {i}: {reply}");
    }
    let overflow = session.cmd("RCPT TO:<last@grr.la>").await;
    assert!(overflow.starts_with("452 "), "{overflow}");
}

#[tokio::test]
async fn shutdown_answers_421_between_commands() {
    let (daemon, addr) = start(base_config()).await;
    let mut session = Session::connect(addr).await;
    session.reply().await;

    let shutdown = tokio::spawn(async move { daemon.shutdown().await });
    // give the signal a moment to land
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let reply = session.cmd("NOOP").await;
    assert!(reply.starts_with("421 "), "{reply}");
    shutdown.await.unwrap();
}
