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

use crate::Error;
use tokio::io::AsyncReadExt;

fn find(bytes: &[u8], search: u8) -> Option<usize> {
    bytes.iter().position(|&b| b == search)
}

/// Buffered reader over the client connection.
///
/// Lines are extracted from an internal [`bytes::BytesMut`] window that
/// is refilled from the transport on demand. Every read path takes an
/// explicit limit; the limit applies to a single line, not to the whole
/// buffered window, so pipelined commands behind the current line do not
/// count against it.
#[derive(Debug)]
pub struct Reader<R> {
    inner: R,
    buffer: bytes::BytesMut,
    additional_reserve: usize,
}

impl<R: tokio::io::AsyncRead + Unpin + Send> Reader<R> {
    /// Wrap a transport.
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: bytes::BytesMut::with_capacity(1024),
            additional_reserve: 1024,
        }
    }

    /// Consume the reader, returning the transport.
    #[must_use]
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Borrow the transport, for the write side of the connection.
    /// Reads and writes are strictly serialized per connection.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Drop whatever is buffered. Required after a TLS upgrade: plaintext
    /// sent ahead of the handshake must not leak into the secure session
    /// (RFC 3207 §4.2).
    pub fn discard_buffered(&mut self) {
        self.buffer.clear();
    }

    /// Read one `\n`-terminated line, terminator included.
    ///
    /// # Errors
    ///
    /// * [`Error::LineLimitExceeded`] when `limit` bytes pass without a
    ///   terminator
    /// * [`Error::Eof`] on a closed or half-line connection
    /// * [`Error::Io`] on transport failure
    pub async fn read_line(&mut self, limit: usize) -> Result<Vec<u8>, Error> {
        loop {
            if let Some(pos) = find(&self.buffer, b'\n') {
                if pos >= limit {
                    return Err(Error::LineLimitExceeded { limit });
                }
                return Ok(self.buffer.split_to(pos + 1).to_vec());
            }
            if self.buffer.len() >= limit {
                return Err(Error::LineLimitExceeded { limit });
            }
            self.buffer.reserve(self.additional_reserve);
            let read = self.inner.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(Error::Eof);
            }
        }
    }

    /// Buffer input until a line terminator shows up or at least `n`
    /// bytes are available, and return a view of the window. Used to
    /// sniff the binary PROXY v2 magic, which contains no usable line.
    ///
    /// # Errors
    ///
    /// * [`Error::Eof`] / [`Error::Io`] from the transport
    pub async fn peek_preamble(&mut self, n: usize) -> Result<&[u8], Error> {
        while self.buffer.len() < n && find(&self.buffer, b'\n').is_none() {
            self.buffer.reserve(self.additional_reserve);
            let read = self.inner.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Err(Error::Eof);
                }
                break;
            }
        }
        Ok(&self.buffer)
    }

    /// Stream the DATA payload: `\r\n.\r\n`-terminated, dot-unstuffed
    /// line by line.
    ///
    /// Two limits apply, as in the original server: the unstuffed
    /// payload must stay within `size_limit`, and the raw wire bytes
    /// within `hard_limit` (the absolute cap that also bounds any single
    /// line). The terminating dot line is not yielded.
    pub fn as_message_stream(
        &mut self,
        size_limit: usize,
        hard_limit: usize,
    ) -> impl tokio_stream::Stream<Item = Result<Vec<u8>, Error>> + '_ {
        async_stream::stream! {
            let mut size: usize = 0;
            let mut raw: usize = 0;

            loop {
                let line = match self.read_line(hard_limit).await {
                    Ok(line) => line,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                raw += line.len();
                if raw > hard_limit {
                    yield Err(Error::LineLimitExceeded { limit: hard_limit });
                    return;
                }

                if line == b".\r\n" || line == b".\n" {
                    return;
                }
                let line = if line.first() == Some(&b'.') {
                    line[1..].to_vec()
                } else {
                    line
                };

                size += line.len();
                if size > size_limit {
                    yield Err(Error::MessageSizeExceeded { limit: size_limit });
                    return;
                }
                yield Ok(line);
            }
        }
    }
}
