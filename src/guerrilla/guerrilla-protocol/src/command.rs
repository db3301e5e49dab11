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

use crate::COMMAND_VERB_MAX_LENGTH;

/// SMTP command verbs this server reacts to.
///
/// The serialized form is the wire prefix the verb is matched on; a
/// trailing space or colon is part of the match so that the remainder of
/// the line is exactly the argument string.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumString, strum::EnumVariantNames,
)]
pub enum Verb {
    /// RFC 5321 client greeting. (historical)
    #[strum(serialize = "HELO")]
    Helo,
    /// RFC 5321 extended greeting, unlocks extension advertisement.
    #[strum(serialize = "EHLO")]
    Ehlo,
    /// Reply with helpful information.
    #[strum(serialize = "HELP")]
    Help,
    /// Postfix extension: a trusted front proxy overrides connection
    /// attributes.
    #[strum(serialize = "XCLIENT ")]
    Xclient,
    /// Open a mail transaction.
    #[strum(serialize = "MAIL FROM:")]
    MailFrom,
    /// Add one recipient to the open transaction.
    #[strum(serialize = "RCPT TO:")]
    RcptTo,
    /// Abort the transaction, clear all buffers.
    #[strum(serialize = "RSET")]
    Rset,
    /// Verify a mailbox; answered without verifying.
    #[strum(serialize = "VRFY")]
    Vrfy,
    /// No operation.
    #[strum(serialize = "NOOP")]
    Noop,
    /// Close the transmission channel.
    #[strum(serialize = "QUIT")]
    Quit,
    /// Switch to message input.
    #[strum(serialize = "DATA")]
    Data,
    /// RFC 3207 in-band TLS upgrade.
    #[strum(serialize = "STARTTLS")]
    StartTls,
}

/// Match a command line against the verb table.
///
/// Only the uppercased first [`COMMAND_VERB_MAX_LENGTH`] bytes take part
/// in the match; the verb is a prefix match so trailing arguments (and
/// trailing junk, as in the original) are tolerated. Returns the verb
/// and the argument bytes of the original line, case preserved.
#[must_use]
pub fn parse_verb(line: &[u8]) -> Option<(Verb, &[u8])> {
    let head_len = line.len().min(COMMAND_VERB_MAX_LENGTH);
    let head: Vec<u8> = line[..head_len].to_ascii_uppercase();

    <Verb as strum::VariantNames>::VARIANTS
        .iter()
        .find(|name| head.len() >= name.len() && &head[..name.len()] == name.as_bytes())
        .map(|name| {
            let verb = name.parse::<Verb>().expect("name comes from the table");
            (verb, &line[name.len()..])
        })
}
