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

//! PROXY protocol v1 preamble parsing, v2 detection.
//!
//! PROXY is not SMTP: the prefix must be exactly `PROXY ` with single
//! spaces between parameters and a CRLF terminator, and the whole line
//! fits in 107 bytes (the worst case the haproxy spec names).

/// Worst-case v1 header length, CRLF included.
pub const PROXY_V1_MAX_LINE: usize = 107;

/// The 12-byte magic opening a binary PROXY v2 header.
pub const PROXY_V2_MAGIC: &[u8; 12] = b"\x0D\x0A\x0D\x0A\x00\x0D\x0AQUIT\x0A";

/// Source address information conveyed by an accepted v1 preamble.
#[derive(Debug, PartialEq, Eq)]
pub enum ProxyInfo {
    /// `PROXY UNKNOWN …`: the proxy cannot name the source; the remote
    /// address is cleared.
    Unknown,
    /// `PROXY TCP4/TCP6 <src> <dst> <sport> <dport>`.
    Tcp {
        /// Normalized source address sent by the proxy.
        source: std::net::IpAddr,
        /// The named protocol does not match the address family; the
        /// original server logs this but carries on.
        family_mismatch: bool,
    },
}

/// Why a preamble was refused. Every variant kills the connection.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    /// Binary v2 magic; only v1 is supported.
    #[error("PROXY v2 binary header received, only v1 is supported")]
    V2NotSupported,
    /// The line does not open with `PROXY ` or lacks the CRLF terminator.
    #[error("not a valid PROXY v1 header")]
    Malformed,
    /// The protocol token is neither UNKNOWN, TCP4 nor TCP6.
    #[error("PROXY header names unknown protocol {0:?}")]
    UnknownProtocol(String),
    /// Source address missing or unparsable.
    #[error("invalid source address in PROXY header")]
    BadAddress,
    /// The spec requires the canonical form of the address, byte for byte.
    #[error("source address {sent:?} is not in normalized form ({normalized:?})")]
    NotNormalized {
        /// What the proxy sent.
        sent: String,
        /// Its canonical rendering.
        normalized: String,
    },
}

/// True when the buffered preamble opens with the v2 binary magic.
#[must_use]
pub fn is_v2_preamble(window: &[u8]) -> bool {
    let n = window.len().min(PROXY_V2_MAGIC.len());
    n == PROXY_V2_MAGIC.len() && window[..n] == PROXY_V2_MAGIC[..]
}

/// Parse one v1 preamble line, terminator included.
///
/// # Errors
///
/// * [`ProxyError`] — the caller must drop the connection
pub fn parse_v1(line: &[u8]) -> Result<ProxyInfo, ProxyError> {
    if is_v2_preamble(line) {
        return Err(ProxyError::V2NotSupported);
    }
    let line = line
        .strip_suffix(b"\r\n")
        .filter(|rest| rest.starts_with(b"PROXY "))
        .ok_or(ProxyError::Malformed)?;

    let mut params = line.split(|&b| b == b' ').skip(1);
    let proto = params.next().ok_or(ProxyError::Malformed)?;

    match proto {
        b"UNKNOWN" => Ok(ProxyInfo::Unknown),
        b"TCP4" | b"TCP6" => {
            let sent = params.next().ok_or(ProxyError::BadAddress)?;
            let sent = std::str::from_utf8(sent).map_err(|_| ProxyError::BadAddress)?;
            let source = sent
                .parse::<std::net::IpAddr>()
                .map_err(|_| ProxyError::BadAddress)?;
            let normalized = source.to_string();
            if sent != normalized {
                return Err(ProxyError::NotNormalized {
                    sent: sent.to_owned(),
                    normalized,
                });
            }
            Ok(ProxyInfo::Tcp {
                source,
                family_mismatch: source.is_ipv4() != (proto == b"TCP4"),
            })
        }
        other => Err(ProxyError::UnknownProtocol(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::{is_v2_preamble, parse_v1, ProxyError, ProxyInfo, PROXY_V2_MAGIC};

    #[test]
    fn accepts_tcp4() {
        let info = parse_v1(b"PROXY TCP4 10.0.0.1 10.0.0.2 54321 25\r\n").unwrap();
        assert_eq!(
            info,
            ProxyInfo::Tcp {
                source: "10.0.0.1".parse().unwrap(),
                family_mismatch: false,
            }
        );
    }

    #[test]
    fn accepts_tcp6() {
        let info = parse_v1(b"PROXY TCP6 2001:db8::1 2001:db8::2 54321 25\r\n").unwrap();
        assert!(matches!(info, ProxyInfo::Tcp { family_mismatch: false, .. }));
    }

    #[test]
    fn accepts_unknown() {
        assert_eq!(parse_v1(b"PROXY UNKNOWN\r\n").unwrap(), ProxyInfo::Unknown);
        assert_eq!(
            parse_v1(b"PROXY UNKNOWN whatever else\r\n").unwrap(),
            ProxyInfo::Unknown
        );
    }

    #[test]
    fn rejects_unnormalized_addresses() {
        assert!(matches!(
            parse_v1(b"PROXY TCP4 010.0.0.1 10.0.0.2 1 2\r\n"),
            Err(ProxyError::BadAddress | ProxyError::NotNormalized { .. })
        ));
        assert_eq!(
            parse_v1(b"PROXY TCP6 2001:DB8:0:0:0:0:0:1 ::2 1 2\r\n"),
            Err(ProxyError::NotNormalized {
                sent: "2001:DB8:0:0:0:0:0:1".to_owned(),
                normalized: "2001:db8::1".to_owned(),
            })
        );
    }

    #[test]
    fn flags_a_family_mismatch() {
        let info = parse_v1(b"PROXY TCP6 10.0.0.1 10.0.0.2 1 2\r\n").unwrap();
        assert!(matches!(info, ProxyInfo::Tcp { family_mismatch: true, .. }));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_v1(b"EHLO hi\r\n"), Err(ProxyError::Malformed));
        // bare LF is not enough, the spec wants CRLF
        assert_eq!(parse_v1(b"PROXY TCP4 1.2.3.4 5.6.7.8 1 2\n"), Err(ProxyError::Malformed));
        assert_eq!(
            parse_v1(b"PROXY SCTP 1.2.3.4 5.6.7.8 1 2\r\n"),
            Err(ProxyError::UnknownProtocol("SCTP".to_owned()))
        );
    }

    #[test]
    fn detects_the_v2_magic() {
        assert!(is_v2_preamble(PROXY_V2_MAGIC));
        let mut with_payload = PROXY_V2_MAGIC.to_vec();
        with_payload.extend_from_slice(&[0x21, 0x11, 0x00, 0x0C]);
        assert!(is_v2_preamble(&with_payload));
        assert!(!is_v2_preamble(b"PROXY TCP4"));
        assert!(!is_v2_preamble(b"\r\n"));
    }
}
