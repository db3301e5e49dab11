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

/// A mailbox from a forward or reverse path.
///
/// The empty address denotes the null reverse-path of a bounce
/// (`MAIL FROM:<>`). When the path carried an address literal instead of
/// a domain (`user@[192.0.2.1]`), `ip` holds the parsed literal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    /// Local part, kept as sent.
    pub user: String,
    /// Domain part, lowercased.
    pub host: String,
    /// Parsed address literal, when the host was one.
    pub ip: Option<std::net::IpAddr>,
}

impl Address {
    /// Build an address from its parts.
    #[must_use]
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into().to_lowercase(),
            ip: None,
        }
    }

    /// The null reverse-path.
    #[must_use]
    pub fn null() -> Self {
        Self::default()
    }

    /// True for the null reverse-path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.host.is_empty()
    }

    /// `postmaster` with no domain, case-insensitive (RFC 5321 §4.1.1.3).
    #[must_use]
    pub fn is_postmaster(&self) -> bool {
        self.host.is_empty() && self.user.eq_ignore_ascii_case("postmaster")
    }

    /// The full `user@host` form, empty for the null path.
    #[must_use]
    pub fn full(&self) -> String {
        if self.is_empty() {
            String::new()
        } else if self.host.is_empty() {
            self.user.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full())
    }
}
