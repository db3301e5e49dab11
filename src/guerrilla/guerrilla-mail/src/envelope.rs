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

use crate::content::Content;
use crate::headers;
use guerrilla_common::Address;
use std::collections::HashMap;

/// The per-message accumulator handed through the backend pipeline.
///
/// A `None` `mail_from` means no transaction is open; `Some` with the
/// empty [`Address`] is the null reverse-path of a bounce.
///
/// An envelope is owned by exactly one task at any instant: the
/// connection task while the SMTP conversation runs, a backend worker
/// for the duration of a `process` call.
#[derive(Debug, Default)]
pub struct Envelope {
    /// Peer address as seen by the server, possibly overridden by the
    /// PROXY preamble or XCLIENT.
    pub remote_ip: String,
    /// HELO/EHLO name the client identified with.
    pub helo: String,
    /// The client used EHLO.
    pub esmtp: bool,
    /// The connection is TLS (implicit or upgraded).
    pub tls: bool,
    /// Reverse path. See the type-level note.
    pub mail_from: Option<Address>,
    /// Forward paths, in the order they were accepted.
    pub rcpt_to: Vec<Address>,
    /// Raw DATA payload after dot-unstuffing.
    pub data: Vec<u8>,
    /// Canonicalized header name to value, filled by `parse_headers`.
    pub header: HashMap<String, String>,
    /// `Subject:` value, filled by `parse_headers`.
    pub subject: String,
    /// One entry per recipient, filled by the hasher processor.
    pub hashes: Vec<String>,
    /// Delivery headers prepended by the header processor.
    pub delivery_header: String,
    /// Decoded MIME content, filled by `parse_content`.
    pub content: Option<Content>,
    /// Flattened text body, filled by `parse_content`.
    pub body: String,
    /// Paths written by the local-files processor.
    pub local_files_paths: Vec<std::path::PathBuf>,
    /// Opaque identifier assigned when the envelope is (re)seeded.
    pub queued_id: String,
    client_id: u64,
}

impl Envelope {
    /// A fresh envelope, seeded for `remote_ip` and `client_id`.
    #[must_use]
    pub fn new(remote_ip: impl Into<String>, client_id: u64) -> Self {
        let mut envelope = Self::default();
        envelope.reseed(remote_ip, client_id);
        envelope
    }

    /// Prepare a recycled envelope for a new connection. Volatile fields
    /// are zeroed, allocated buffers are kept.
    pub fn reseed(&mut self, remote_ip: impl Into<String>, client_id: u64) {
        self.reset_transaction();
        self.remote_ip = remote_ip.into();
        self.helo.clear();
        self.esmtp = false;
        self.tls = false;
        self.client_id = client_id;
        self.queued_id = uuid::Uuid::new_v4().simple().to_string();
    }

    /// Abort the current mail transaction, keeping the connection state
    /// (`helo`, `remote_ip`, TLS flags) intact.
    pub fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.data.clear();
        self.header.clear();
        self.subject.clear();
        self.hashes.clear();
        self.delivery_header.clear();
        self.content = None;
        self.body.clear();
        self.local_files_paths.clear();
    }

    /// Numeric id of the connection this envelope is seeded for.
    #[must_use]
    pub const fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Parse the header section of `data` into `header` and derive
    /// `subject`.
    ///
    /// # Errors
    ///
    /// * the data holds no header section
    pub fn parse_headers(&mut self) -> Result<(), headers::HeaderParseError> {
        self.header = headers::parse(&self.data)?;
        self.subject = self.header.get("Subject").cloned().unwrap_or_default();
        Ok(())
    }

    /// Decode the MIME structure of `data` into `content` and `body`.
    ///
    /// # Errors
    ///
    /// * the message could not be parsed at all
    pub fn parse_content(&mut self) -> Result<(), crate::ContentError> {
        let content = Content::parse(&self.data)?;
        self.body = content.text.clone().unwrap_or_default();
        self.content = Some(content);
        Ok(())
    }

    /// Dump the decoded parts below `dir`, recording the written paths
    /// in `local_files_paths`. `parse_content` must have run first.
    ///
    /// # Errors
    ///
    /// * no parsed content is available
    /// * filesystem errors while creating `dir` or writing parts
    pub async fn save_local_files(
        &mut self,
        dir: impl AsRef<std::path::Path>,
    ) -> Result<(), crate::ContentError> {
        let content = self
            .content
            .as_ref()
            .ok_or(crate::ContentError::NotParsed)?;
        self.local_files_paths = content.save_parts(dir.as_ref(), &self.queued_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Envelope;
    use guerrilla_common::Address;

    #[test]
    fn reseed_clears_volatile_state_and_renews_the_id() {
        let mut envelope = Envelope::new("192.0.2.1", 1);
        let first_id = envelope.queued_id.clone();
        envelope.mail_from = Some(Address::new("a", "b.example"));
        envelope.rcpt_to.push(Address::new("c", "d.example"));
        envelope.data.extend_from_slice(b"Subject: hi\r\n\r\nbody");
        envelope.helo = "client.example".into();
        envelope.tls = true;

        envelope.reseed("198.51.100.7", 2);

        assert_eq!(envelope.remote_ip, "198.51.100.7");
        assert!(envelope.mail_from.is_none());
        assert!(envelope.rcpt_to.is_empty());
        assert!(envelope.data.is_empty());
        assert!(envelope.helo.is_empty());
        assert!(!envelope.tls);
        assert_ne!(envelope.queued_id, first_id);
    }

    #[test]
    fn reset_transaction_keeps_connection_state() {
        let mut envelope = Envelope::new("192.0.2.1", 1);
        envelope.helo = "client.example".into();
        envelope.esmtp = true;
        envelope.mail_from = Some(Address::null());
        envelope.data.extend_from_slice(b"x");

        envelope.reset_transaction();

        assert_eq!(envelope.helo, "client.example");
        assert!(envelope.esmtp);
        assert!(envelope.mail_from.is_none());
        assert!(envelope.data.is_empty());
    }

    #[test]
    fn parse_headers_fills_subject() {
        let mut envelope = Envelope::new("192.0.2.1", 1);
        envelope
            .data
            .extend_from_slice(b"From: a@b\r\nSubject: Is dkim ready?\r\n\r\nHi.\r\n");
        envelope.parse_headers().unwrap();
        assert_eq!(envelope.subject, "Is dkim ready?");
        assert_eq!(envelope.header.get("From").unwrap(), "a@b");
    }
}
