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

/// A single SMTP reply line: a 3-digit code and its text.
///
/// The text may start with an RFC 2034 enhanced status code, it is kept
/// verbatim. `Display` renders the full wire form including the trailing
/// CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    text: String,
}

/// Error while parsing a reply line.
#[derive(Debug, thiserror::Error)]
pub enum ReplyParseError {
    /// The line does not start with a 3-digit code in the 200..=599 range.
    #[error("invalid reply code in {0:?}")]
    InvalidCode(String),
    /// Nothing after the code.
    #[error("reply has no text: {0:?}")]
    MissingText(String),
}

impl Reply {
    /// Create a reply from a code and its text.
    #[must_use]
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// The numeric reply code.
    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    /// The reply text, without code and line terminator.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Permanent or transient failure (4xx / 5xx).
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.code >= 400
    }

    /// Codes below 300 let the transaction proceed.
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code < 300
    }

    /// Same code, `detail` appended to the text after a space.
    #[must_use]
    pub fn with_detail(&self, detail: &str) -> Self {
        Self {
            code: self.code,
            text: format!("{} {detail}", self.text),
        }
    }

    /// Render a multi-line reply (`250-a`, `250-b`, `250 last`).
    ///
    /// # Panics
    ///
    /// * if `lines` is empty
    #[must_use]
    pub fn multiline(code: u16, lines: &[&str]) -> String {
        assert!(!lines.is_empty(), "multiline reply needs at least one line");
        let mut out = String::new();
        for line in &lines[..lines.len() - 1] {
            out.push_str(&format!("{code}-{line}\r\n"));
        }
        out.push_str(&format!("{code} {}\r\n", lines[lines.len() - 1]));
        out
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}\r\n", self.code, self.text)
    }
}

impl std::str::FromStr for Reply {
    type Err = ReplyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end_matches(['\r', '\n']);
        let (code, text) = s
            .split_once(' ')
            .ok_or_else(|| ReplyParseError::MissingText(s.to_owned()))?;
        let code = code
            .parse::<u16>()
            .ok()
            .filter(|c| (200..600).contains(c))
            .ok_or_else(|| ReplyParseError::InvalidCode(s.to_owned()))?;
        Ok(Self {
            code,
            text: text.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Reply;

    #[test]
    fn parse() {
        let reply = "250 2.0.0 OK\r\n".parse::<Reply>().unwrap();
        assert_eq!(reply.code(), 250);
        assert_eq!(reply.text(), "2.0.0 OK");
        assert!(reply.is_positive());
        assert!(!reply.is_error());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("hello world".parse::<Reply>().is_err());
        assert!("99 too low".parse::<Reply>().is_err());
        assert!("600 too high".parse::<Reply>().is_err());
        assert!("250".parse::<Reply>().is_err());
    }

    #[test]
    fn wire_form() {
        let reply = Reply::new(554, "5.3.0 Error: transaction failed");
        assert_eq!(reply.to_string(), "554 5.3.0 Error: transaction failed\r\n");
        assert!(reply.is_error());
    }

    #[test]
    fn detail_is_appended() {
        let reply = Reply::new(550, "5.7.1 Relay access denied for").with_detail("evil.example");
        assert_eq!(reply.text(), "5.7.1 Relay access denied for evil.example");
    }

    #[test]
    fn multiline_format() {
        let out = Reply::multiline(250, &["host Hello", "PIPELINING", "HELP"]);
        assert_eq!(out, "250-host Hello\r\n250-PIPELINING\r\n250 HELP\r\n");
        assert_eq!(Reply::multiline(250, &["only"]), "250 only\r\n");
    }
}
