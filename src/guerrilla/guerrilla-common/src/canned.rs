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

//! The canned reply table. This table is the authority for every fixed
//! SMTP response the daemon emits.

use crate::Reply;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::LazyLock;

/// Fixed replies, named after the command or failure they answer.
#[allow(missing_docs)]
#[derive(Debug)]
pub struct Canned {
    pub success_mail_cmd: Reply,
    pub success_rcpt_cmd: Reply,
    pub success_reset_cmd: Reply,
    pub success_verify_cmd: Reply,
    pub success_noop_cmd: Reply,
    pub success_quit_cmd: Reply,
    pub success_data_cmd: Reply,
    pub success_start_tls_cmd: Reply,
    pub success_message_queued: Reply,
    pub fail_syntax_error: Reply,
    pub fail_line_too_long: Reply,
    pub fail_nested_mail_cmd: Reply,
    pub fail_no_recipients_data_cmd: Reply,
    pub fail_unrecognized_cmd: Reply,
    pub fail_max_unrecognized_cmd: Reply,
    pub fail_read_limit_exceeded_data_cmd: Reply,
    pub fail_message_size_exceeded: Reply,
    pub fail_read_error_data_cmd: Reply,
    pub fail_backend_transaction: Reply,
    pub fail_rcpt_cmd: Reply,
    pub error_too_many_recipients: Reply,
    pub error_relay_denied: Reply,
    pub error_shutdown: Reply,
}

static CANNED: LazyLock<Canned> = LazyLock::new(|| Canned {
    success_mail_cmd: Reply::new(250, "2.1.0 OK"),
    success_rcpt_cmd: Reply::new(250, "2.1.5 OK"),
    success_reset_cmd: Reply::new(250, "2.0.0 OK"),
    success_verify_cmd: Reply::new(252, "2.1.5 Cannot verify user"),
    success_noop_cmd: Reply::new(250, "2.0.0 OK"),
    success_quit_cmd: Reply::new(221, "2.0.0 Bye"),
    success_data_cmd: Reply::new(354, "Enter message, ending with '.' on a line by itself"),
    success_start_tls_cmd: Reply::new(220, "2.0.0 Ready to start TLS"),
    success_message_queued: Reply::new(250, "2.0.0 OK: queued as"),
    fail_syntax_error: Reply::new(501, "5.5.2 Syntax error"),
    fail_line_too_long: Reply::new(554, "5.5.4 Line too long"),
    fail_nested_mail_cmd: Reply::new(503, "5.5.1 Error: nested MAIL command"),
    fail_no_recipients_data_cmd: Reply::new(503, "5.5.1 Error: No recipients"),
    fail_unrecognized_cmd: Reply::new(500, "5.5.1 Unrecognized command"),
    fail_max_unrecognized_cmd: Reply::new(554, "5.5.1 Too many unrecognized commands"),
    fail_read_limit_exceeded_data_cmd: Reply::new(550, "5.3.4 Error: Maximum line length exceeded"),
    fail_message_size_exceeded: Reply::new(552, "5.3.4 Error: Maximum message size exceeded"),
    fail_read_error_data_cmd: Reply::new(451, "4.3.0 Error: Could not read your message"),
    fail_backend_transaction: Reply::new(554, "5.3.0 Error: transaction failed"),
    fail_rcpt_cmd: Reply::new(550, "5.1.1 Bad destination mailbox address"),
    error_too_many_recipients: Reply::new(452, "4.5.3 Too many recipients"),
    error_relay_denied: Reply::new(550, "5.7.1 Relay access denied for"),
    error_shutdown: Reply::new(
        421,
        "4.3.0 Server is shutting down. Please try again later. Sayonara!",
    ),
});

/// Access the canned reply table.
#[must_use]
pub fn canned() -> &'static Canned {
    &CANNED
}

const QUOTES: &[&str] = &[
    "I would love to change the world, but they won't give me the source code",
    "Documentation is like sex: when it's good, it's very good; when it's bad, it's better than nothing",
    "Great things are not done by impulse, but by a series of small things brought together",
    "To err is human, to really foul things up requires a computer",
    "It works on my machine",
];

static QUOTE_CURSOR: AtomicUsize = AtomicUsize::new(0);

/// The HELP quote, rotating through the table on every call.
#[must_use]
pub fn quote() -> &'static str {
    let next = QUOTE_CURSOR.fetch_add(1, Ordering::Relaxed);
    QUOTES[next % QUOTES.len()]
}

#[cfg(test)]
mod tests {
    use super::{canned, quote, QUOTES};

    #[test]
    fn codes_are_in_the_documented_set() {
        let allowed = [220, 221, 250, 252, 354, 421, 451, 500, 501, 503, 550, 552, 554, 556];
        let table = canned();
        for reply in [
            &table.success_mail_cmd,
            &table.success_quit_cmd,
            &table.success_data_cmd,
            &table.fail_unrecognized_cmd,
            &table.fail_message_size_exceeded,
            &table.error_too_many_recipients,
            &table.error_relay_denied,
            &table.error_shutdown,
        ] {
            assert!(allowed.contains(&reply.code()), "{reply}");
        }
    }

    #[test]
    fn quotes_rotate() {
        let first = quote();
        let mut seen = vec![first];
        for _ in 1..QUOTES.len() {
            let q = quote();
            assert!(!seen.contains(&q));
            seen.push(q);
        }
    }
}
