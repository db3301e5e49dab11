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

//! Just enough RFC 5321 to parse what clients put after `MAIL FROM:` and
//! `RCPT TO:`, plus HELO/EHLO argument validation.

use guerrilla_common::Address;

/// Hard cap on accepted recipients per transaction (RFC 5321 §4.5.3.1.8).
pub const LIMIT_RECIPIENTS: usize = 100;

/// Maximum length of a forward/reverse path (RFC 5321 §4.5.3.1.3).
pub const LIMIT_PATH: usize = 256;

/// Maximum length of a local part (RFC 5321 §4.5.3.1.1).
pub const LIMIT_LOCAL_PART: usize = 64;

/// Error while parsing a path or a HELO argument.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The path exceeds [`LIMIT_PATH`].
    #[error("path too long")]
    PathTooLong,
    /// Missing angle brackets or malformed mailbox.
    #[error("syntax error in path")]
    Syntax,
    /// The domain part failed validation.
    #[error("invalid domain")]
    BadDomain,
    /// An address literal failed to parse as an IP address.
    #[error("invalid address literal")]
    BadAddressLiteral,
    /// The HELO/EHLO argument is not a host name or address literal.
    #[error("invalid helo argument")]
    BadHelo,
}

/// A parsed forward or reverse path.
#[derive(Debug, PartialEq, Eq)]
pub struct Path {
    /// The mailbox; empty for the null reverse-path.
    pub address: Address,
    /// `MAIL FROM:<>`.
    pub null_path: bool,
}

/// Parse the argument of `MAIL FROM:`/`RCPT TO:`: an angle-bracketed
/// path, optionally followed by ESMTP parameters (accepted and ignored).
///
/// Source routes (`<@relay:user@host>`) are accepted and stripped.
/// `<postmaster>` is accepted without a domain.
///
/// # Errors
///
/// * [`ParseError`] on malformed input
pub fn parse_path(input: &[u8]) -> Result<Path, ParseError> {
    let input = std::str::from_utf8(input).map_err(|_| ParseError::Syntax)?;
    let input = input.trim_start();

    let open = input.find('<').ok_or(ParseError::Syntax)?;
    if open != 0 {
        return Err(ParseError::Syntax);
    }
    let close = input.find('>').ok_or(ParseError::Syntax)?;
    let path = &input[1..close];
    if path.len() > LIMIT_PATH {
        return Err(ParseError::PathTooLong);
    }

    if path.is_empty() {
        return Ok(Path {
            address: Address::null(),
            null_path: true,
        });
    }

    // strip an RFC 5321 source route, "@a,@b:" before the mailbox
    let mailbox = match path.rfind(':') {
        Some(colon) if path.starts_with('@') => &path[colon + 1..],
        _ => path,
    };

    let address = match mailbox.rsplit_once('@') {
        None => {
            // only postmaster may come without a domain
            if mailbox.eq_ignore_ascii_case("postmaster") {
                Address::new(mailbox, "")
            } else {
                return Err(ParseError::Syntax);
            }
        }
        Some((user, host)) => parse_mailbox(user, host)?,
    };

    Ok(Path {
        address,
        null_path: false,
    })
}

fn parse_mailbox(user: &str, host: &str) -> Result<Address, ParseError> {
    if user.is_empty()
        || user.len() > LIMIT_LOCAL_PART
        || user.bytes().any(|b| b.is_ascii_control() || b == b' ')
    {
        return Err(ParseError::Syntax);
    }
    if host.starts_with('[') && host.ends_with(']') {
        let literal = &host[1..host.len() - 1];
        let literal = literal.strip_prefix("IPv6:").unwrap_or(literal);
        let ip = literal
            .parse::<std::net::IpAddr>()
            .map_err(|_| ParseError::BadAddressLiteral)?;
        let mut address = Address::new(user, host);
        address.ip = Some(ip);
        return Ok(address);
    }
    if addr::parse_domain_name(host).is_err() {
        return Err(ParseError::BadDomain);
    }
    Ok(Address::new(user, host))
}

/// Validate the argument of HELO/EHLO: a host name or a bracketed
/// address literal. Returns the name as sent, surrounding space trimmed.
///
/// # Errors
///
/// * [`ParseError::BadHelo`]
pub fn parse_helo(input: &[u8]) -> Result<String, ParseError> {
    let input = std::str::from_utf8(input).map_err(|_| ParseError::BadHelo)?;
    let name = input.trim();
    if name.is_empty() {
        return Err(ParseError::BadHelo);
    }
    if name.starts_with('[') && name.ends_with(']') {
        let literal = &name[1..name.len() - 1];
        let literal = literal.strip_prefix("IPv6:").unwrap_or(literal);
        literal
            .parse::<std::net::IpAddr>()
            .map_err(|_| ParseError::BadHelo)?;
        return Ok(name.to_owned());
    }
    addr::parse_domain_name(name).map_err(|_| ParseError::BadHelo)?;
    Ok(name.to_owned())
}

#[cfg(test)]
mod tests {
    use super::{parse_helo, parse_path, ParseError, LIMIT_PATH};

    #[test]
    fn plain_path() {
        let path = parse_path(b"<test@example.com>").unwrap();
        assert!(!path.null_path);
        assert_eq!(path.address.full(), "test@example.com");
    }

    #[test]
    fn null_path() {
        let path = parse_path(b"<>").unwrap();
        assert!(path.null_path);
        assert!(path.address.is_empty());
    }

    #[test]
    fn esmtp_params_are_ignored() {
        let path = parse_path(b"<test@example.com> SIZE=1024 BODY=8BITMIME").unwrap();
        assert_eq!(path.address.full(), "test@example.com");
    }

    #[test]
    fn source_route_is_stripped() {
        let path = parse_path(b"<@relay.example,@other.example:user@example.com>").unwrap();
        assert_eq!(path.address.full(), "user@example.com");
    }

    #[test]
    fn bare_postmaster() {
        let path = parse_path(b"<Postmaster>").unwrap();
        assert!(path.address.is_postmaster());
    }

    #[test]
    fn address_literal() {
        let path = parse_path(b"<test@[192.0.2.1]>").unwrap();
        assert_eq!(path.address.ip.unwrap().to_string(), "192.0.2.1");
        let path = parse_path(b"<test@[IPv6:2001:db8::1]>").unwrap();
        assert_eq!(path.address.ip.unwrap().to_string(), "2001:db8::1");
        assert_eq!(
            parse_path(b"<test@[not-an-ip]>"),
            Err(ParseError::BadAddressLiteral)
        );
    }

    #[test]
    fn malformed_paths() {
        assert_eq!(parse_path(b"no brackets"), Err(ParseError::Syntax));
        assert_eq!(parse_path(b"<user-without-domain>"), Err(ParseError::Syntax));
        assert_eq!(parse_path(b"<@example.com>"), Err(ParseError::Syntax));
        assert_eq!(parse_path(b"<a b@example.com>"), Err(ParseError::Syntax));
    }

    #[test]
    fn overlong_path() {
        let long = format!("<{}@example.com>", "x".repeat(LIMIT_PATH));
        assert_eq!(parse_path(long.as_bytes()), Err(ParseError::PathTooLong));
    }

    #[test]
    fn helo_accepts_names_and_literals() {
        assert_eq!(parse_helo(b" mail.example.com ").unwrap(), "mail.example.com");
        assert_eq!(parse_helo(b"[192.0.2.1]").unwrap(), "[192.0.2.1]");
        assert!(parse_helo(b"").is_err());
        assert!(parse_helo(b"not a domain").is_err());
    }
}
