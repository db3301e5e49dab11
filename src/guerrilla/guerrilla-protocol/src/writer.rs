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
use tokio::io::AsyncWriteExt;

/// The buffered reply queue.
///
/// Replies accumulate here and go out in one write when the state
/// machine flushes, once per iteration. With pipelining this batches the
/// answers of a whole command window. The transport is borrowed at flush
/// time; reads and writes on a connection are strictly serialized, so
/// the queue itself never holds it.
#[derive(Debug, Default)]
pub struct ReplyWriter {
    buffer: Vec<u8>,
}

impl ReplyWriter {
    /// An empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Queue a reply.
    pub fn enqueue(&mut self, reply: &Reply) {
        self.buffer.extend_from_slice(reply.to_string().as_bytes());
    }

    /// Queue pre-rendered reply text (greeting, multi-line EHLO, HELP).
    /// The caller supplies the CRLF framing.
    pub fn enqueue_raw(&mut self, raw: &str) {
        self.buffer.extend_from_slice(raw.as_bytes());
    }

    /// Anything waiting to go out?
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Drop whatever is queued (TLS upgrade, connection teardown).
    pub fn discard(&mut self) {
        self.buffer.clear();
    }

    /// Write the queue out through `transport` and clear it.
    ///
    /// # Errors
    ///
    /// * [`std::io::Error`] from the transport; the pending replies are
    ///   dropped either way, the connection is done for
    pub async fn flush_to<W: tokio::io::AsyncWrite + Unpin + Send>(
        &mut self,
        transport: &mut W,
    ) -> std::io::Result<()> {
        let pending = std::mem::take(&mut self.buffer);
        tracing::trace!(">> {:?}", String::from_utf8_lossy(&pending));
        transport.write_all(&pending).await?;
        transport.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::ReplyWriter;
    use guerrilla_common::Reply;

    #[tokio::test]
    async fn batches_replies_until_flush() {
        let mut writer = ReplyWriter::new();
        let mut out = Vec::new();
        writer.enqueue(&Reply::new(250, "2.1.0 OK"));
        writer.enqueue(&Reply::new(250, "2.1.5 OK"));
        assert!(writer.has_pending());

        writer.flush_to(&mut out).await.unwrap();
        assert!(!writer.has_pending());
        assert_eq!(out, b"250 2.1.0 OK\r\n250 2.1.5 OK\r\n".to_vec());
    }

    #[tokio::test]
    async fn raw_text_is_passed_through() {
        let mut writer = ReplyWriter::new();
        let mut out = Vec::new();
        writer.enqueue_raw("250-host Hello\r\n250 HELP\r\n");
        writer.flush_to(&mut out).await.unwrap();
        assert_eq!(out, b"250-host Hello\r\n250 HELP\r\n".to_vec());
    }

    #[test]
    fn discard_drops_the_queue() {
        let mut writer = ReplyWriter::new();
        writer.enqueue(&Reply::new(220, "2.0.0 Ready to start TLS"));
        writer.discard();
        assert!(!writer.has_pending());
    }
}
