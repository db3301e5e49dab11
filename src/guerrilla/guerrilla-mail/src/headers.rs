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

use std::collections::HashMap;

/// Error while locating the header section.
#[derive(Debug, thiserror::Error)]
pub enum HeaderParseError {
    /// No header/body separator and no header-shaped first line.
    #[error("message has no header section")]
    NoHeaderSection,
}

/// Parse the header section of a raw message into a canonicalized
/// name → value map. Folded continuation lines are unfolded with a
/// single space. A repeated field keeps the last value.
///
/// # Errors
///
/// * [`HeaderParseError::NoHeaderSection`]
pub fn parse(data: &[u8]) -> Result<HashMap<String, String>, HeaderParseError> {
    let section = header_section(data);
    if section.is_empty() {
        return Err(HeaderParseError::NoHeaderSection);
    }

    let mut headers = HashMap::new();
    let mut current: Option<(String, String)> = None;
    for line in section.split(|&b| b == b'\n') {
        let line = strip_cr(line);
        if line.is_empty() {
            continue;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            // folded continuation
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(String::from_utf8_lossy(line).trim());
            }
            continue;
        }
        if let Some((name, value)) = current.take() {
            headers.insert(name, value);
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = canonical_key(String::from_utf8_lossy(&line[..colon]).trim());
        let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_owned();
        if !name.is_empty() {
            current = Some((name, value));
        }
    }
    if let Some((name, value)) = current.take() {
        headers.insert(name, value);
    }

    if headers.is_empty() {
        return Err(HeaderParseError::NoHeaderSection);
    }
    Ok(headers)
}

// The header section ends at the first empty line; a message without a
// body is all headers.
fn header_section(data: &[u8]) -> &[u8] {
    for (i, window) in data.windows(4).enumerate() {
        if window == b"\r\n\r\n" {
            return &data[..i];
        }
    }
    for (i, window) in data.windows(2).enumerate() {
        if window == b"\n\n" {
            return &data[..i];
        }
    }
    data
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Canonical MIME header form: first letter of every dash-separated word
/// upper-cased, the rest lowered (`content-TYPE` → `Content-Type`).
#[must_use]
pub fn canonical_key(name: &str) -> String {
    name.split('-')
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
            })
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::{canonical_key, parse};

    #[test]
    fn canonicalizes_names() {
        assert_eq!(canonical_key("subject"), "Subject");
        assert_eq!(canonical_key("content-TYPE"), "Content-Type");
        assert_eq!(canonical_key("DKIM-Signature"), "Dkim-Signature");
        assert_eq!(canonical_key("x--odd"), "X--Odd");
    }

    #[test]
    fn parses_simple_headers() {
        let headers =
            parse(b"From: a@b.example\r\nTo: c@d.example\r\nSubject: Test\r\n\r\nbody\r\n").unwrap();
        assert_eq!(headers.get("From").unwrap(), "a@b.example");
        assert_eq!(headers.get("Subject").unwrap(), "Test");
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn unfolds_continuation_lines() {
        let headers = parse(
            b"Received: from mx.example\r\n by relay.example with ESMTP;\r\nSubject: ok\r\n\r\n.",
        )
        .unwrap();
        assert_eq!(
            headers.get("Received").unwrap(),
            "from mx.example by relay.example with ESMTP;"
        );
    }

    #[test]
    fn bare_lf_messages_are_accepted() {
        let headers = parse(b"Subject: lf only\nFrom: a@b\n\nbody").unwrap();
        assert_eq!(headers.get("Subject").unwrap(), "lf only");
    }

    #[test]
    fn no_headers_is_an_error() {
        assert!(parse(b"").is_err());
        assert!(parse(b"\r\n\r\njust a body").is_err());
    }

    #[test]
    fn repeated_field_keeps_the_last_value() {
        let headers = parse(b"X-Spam: one\r\nX-Spam: two\r\n\r\n.").unwrap();
        assert_eq!(headers.get("X-Spam").unwrap(), "two");
    }
}
