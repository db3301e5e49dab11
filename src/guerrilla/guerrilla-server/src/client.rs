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

use guerrilla_common::Reply;
use guerrilla_mail::Envelope;
use guerrilla_protocol::{Error, Reader, ReplyWriter};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// The connection transport, plaintext or upgraded.
pub(crate) enum Stream {
    Plain(tokio::net::TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<tokio::net::TcpStream>>),
    /// Placeholder while idle in the pool or after teardown.
    Closed,
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            Self::Closed => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            Self::Closed => Poll::Ready(Err(std::io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            Self::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            Self::Closed => Poll::Ready(Ok(())),
        }
    }
}

/// Where the state machine stands for this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    Connected,
    Proxy,
    Greeting,
    Cmd,
    Data,
    StartTls,
    Shutdown,
}

/// One accepted connection: buffered I/O, limits, the reply queue and
/// the borrowed envelope. Lifetime is one connection; the instance is
/// recycled through the pool.
pub struct Client {
    /// Numeric connection id, for the greeting and the logs.
    pub id: u64,
    pub(crate) state: ClientState,
    /// Unrecognized commands seen so far.
    pub(crate) errors: u64,
    /// Messages accepted (backend reply < 300) on this connection.
    pub(crate) messages_sent: u64,
    /// The borrowed envelope; `None` while a backend worker owns it,
    /// or when it was lost to a dying worker.
    pub(crate) envelope: Option<Envelope>,
    reader: Reader<Stream>,
    replies: ReplyWriter,
    alive: bool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("alive", &self.alive)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// An unconnected slot for the pool.
    #[must_use]
    pub(crate) fn idle() -> Self {
        Self {
            id: 0,
            state: ClientState::Connected,
            errors: 0,
            messages_sent: 0,
            envelope: None,
            reader: Reader::new(Stream::Closed),
            replies: ReplyWriter::new(),
            alive: false,
        }
    }

    /// Seed a recycled slot with a fresh connection. The envelope is
    /// attached by the caller once borrowed from its own pool.
    pub(crate) fn reseed(&mut self, stream: tokio::net::TcpStream, id: u64) {
        self.id = id;
        self.state = ClientState::Connected;
        self.errors = 0;
        self.messages_sent = 0;
        self.envelope = None;
        self.reader = Reader::new(Stream::Plain(stream));
        self.replies.discard();
        self.alive = true;
    }

    pub(crate) const fn is_alive(&self) -> bool {
        self.alive
    }

    /// Mark the connection for teardown; the state machine loop exits
    /// after the pending flush.
    pub(crate) fn kill(&mut self) {
        self.alive = false;
    }

    pub(crate) fn is_in_transaction(&self) -> bool {
        self.envelope
            .as_ref()
            .is_some_and(|envelope| envelope.mail_from.is_some())
    }

    pub(crate) fn reset_transaction(&mut self) {
        if let Some(envelope) = self.envelope.as_mut() {
            envelope.reset_transaction();
        }
    }

    /// Read one command line within `limit`, under the configured
    /// deadline.
    pub(crate) async fn read_line(
        &mut self,
        limit: usize,
        deadline: std::time::Duration,
    ) -> Result<Vec<u8>, Error> {
        match tokio::time::timeout(deadline, self.reader.read_line(limit)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Io(std::io::ErrorKind::TimedOut.into())),
        }
    }

    /// Buffer input until the PROXY preamble is classifiable.
    pub(crate) async fn peek_preamble(
        &mut self,
        n: usize,
        deadline: std::time::Duration,
    ) -> Result<&[u8], Error> {
        match tokio::time::timeout(deadline, self.reader.peek_preamble(n)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Io(std::io::ErrorKind::TimedOut.into())),
        }
    }

    /// Split borrow for the DATA state: the message stream reads from
    /// the reader while the body accumulates on the envelope.
    pub(crate) fn reader_and_envelope(&mut self) -> (&mut Reader<Stream>, Option<&mut Envelope>) {
        (&mut self.reader, self.envelope.as_mut())
    }

    pub(crate) fn send_reply(&mut self, reply: &Reply) {
        self.replies.enqueue(reply);
    }

    pub(crate) fn send_raw(&mut self, raw: &str) {
        self.replies.enqueue_raw(raw);
    }

    pub(crate) fn has_pending_replies(&self) -> bool {
        self.replies.has_pending()
    }

    /// Write the queued replies out, under the configured deadline.
    pub(crate) async fn flush(&mut self, deadline: std::time::Duration) -> std::io::Result<()> {
        match tokio::time::timeout(deadline, self.replies.flush_to(self.reader.inner_mut())).await {
            Ok(result) => result,
            Err(_elapsed) => Err(std::io::ErrorKind::TimedOut.into()),
        }
    }

    /// Perform the TLS handshake over the plaintext transport.
    ///
    /// Plaintext buffered ahead of the handshake is discarded, in both
    /// directions (RFC 3207 §4.2). On failure the transport is gone and
    /// the caller must kill the connection.
    ///
    /// # Errors
    ///
    /// * handshake failure, handshake timeout, or an already-upgraded
    ///   connection
    pub(crate) async fn upgrade_tls(
        &mut self,
        acceptor: &tokio_rustls::TlsAcceptor,
        deadline: std::time::Duration,
    ) -> std::io::Result<()> {
        self.reader.discard_buffered();
        self.replies.discard();

        let stream =
            std::mem::replace(&mut self.reader, Reader::new(Stream::Closed)).into_inner();
        let Stream::Plain(plain) = stream else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "connection is not plaintext",
            ));
        };

        match tokio::time::timeout(deadline, acceptor.accept(plain)).await {
            Ok(Ok(tls_stream)) => {
                self.reader = Reader::new(Stream::Tls(Box::new(tls_stream)));
                if let Some(envelope) = self.envelope.as_mut() {
                    envelope.tls = true;
                }
                Ok(())
            }
            Ok(Err(error)) => Err(error),
            Err(_elapsed) => Err(std::io::ErrorKind::TimedOut.into()),
        }
    }

    /// Flush what can be flushed and shut the transport down.
    pub(crate) async fn close(&mut self) {
        if self.replies.has_pending() {
            let _ = self.flush(std::time::Duration::from_secs(5)).await;
        }
        let _ = self.reader.inner_mut().shutdown().await;
        self.reader = Reader::new(Stream::Closed);
        self.alive = false;
    }
}

#[cfg(test)]
mod tests {
    use super::{Client, ClientState};
    use guerrilla_common::Address;
    use guerrilla_mail::Envelope;

    #[test]
    fn idle_clients_are_dead() {
        let client = Client::idle();
        assert!(!client.is_alive());
        assert_eq!(client.state, ClientState::Connected);
        assert!(client.envelope.is_none());
    }

    #[tokio::test]
    async fn reseed_resets_counters_and_state() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let (accepted, _local) = tokio::join!(listener.accept(), connect);

        let mut client = Client::idle();
        client.errors = 4;
        client.messages_sent = 2;
        client.state = ClientState::Shutdown;

        client.reseed(accepted.unwrap().0, 7);
        client.envelope = Some(Envelope::new("192.0.2.1", 7));

        assert!(client.is_alive());
        assert_eq!(client.id, 7);
        assert_eq!(client.errors, 0);
        assert_eq!(client.messages_sent, 0);
        assert_eq!(client.state, ClientState::Connected);
        assert!(!client.is_in_transaction());

        client.envelope.as_mut().unwrap().mail_from = Some(Address::null());
        assert!(client.is_in_transaction());
        client.reset_transaction();
        assert!(!client.is_in_transaction());
    }
}
