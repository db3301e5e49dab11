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

use std::collections::HashSet;

/// The recipient domains this server accepts mail for.
///
/// Three entry forms: literal names (case-insensitive), bracketed IP
/// literals (stored in normalized form), and `*` globs. A table holding
/// the single entry `.` turns checking off entirely.
#[derive(Debug, Default)]
pub struct AllowedHosts {
    table: HashSet<String>,
    wildcards: Vec<globset::GlobMatcher>,
}

impl AllowedHosts {
    /// Build the table from the `allowed_hosts` config entries.
    #[must_use]
    pub fn new(entries: &[String]) -> Self {
        let mut table = HashSet::with_capacity(entries.len());
        let mut wildcards = Vec::new();
        for entry in entries {
            if entry.contains('*') {
                match globset::Glob::new(&entry.to_lowercase()) {
                    Ok(glob) => wildcards.push(glob.compile_matcher()),
                    Err(error) => {
                        tracing::warn!(%entry, %error, "Unusable wildcard in allowed_hosts.");
                    }
                }
            } else if entry.len() > 5 && entry.starts_with('[') && entry.ends_with(']') {
                // store the normalized rendering, so lookups by parsed
                // address always hit
                match entry[1..entry.len() - 1].parse::<std::net::IpAddr>() {
                    Ok(ip) => {
                        table.insert(format!("[{ip}]"));
                    }
                    Err(error) => {
                        tracing::warn!(%entry, %error, "Unusable IP literal in allowed_hosts.");
                    }
                }
            } else {
                table.insert(entry.to_lowercase());
            }
        }
        Self { table, wildcards }
    }

    /// Is `host` an acceptable recipient domain?
    #[must_use]
    pub fn allows_host(&self, host: &str) -> bool {
        if self.table.len() == 1 && self.table.contains(".") {
            return true;
        }
        let host = host.to_lowercase();
        if self.table.contains(&host) {
            return true;
        }
        self.wildcards.iter().any(|glob| glob.is_match(&host))
    }

    /// Is the address literal an acceptable recipient "domain"?
    #[must_use]
    pub fn allows_ip(&self, ip: std::net::IpAddr) -> bool {
        self.allows_host(&format!("[{ip}]"))
    }
}

#[cfg(test)]
mod tests {
    use super::AllowedHosts;

    fn hosts(entries: &[&str]) -> AllowedHosts {
        AllowedHosts::new(&entries.iter().map(|e| (*e).to_owned()).collect::<Vec<_>>())
    }

    #[test]
    fn exact_names_are_case_insensitive() {
        let hosts = hosts(&["Example.COM", "grr.la"]);
        assert!(hosts.allows_host("example.com"));
        assert!(hosts.allows_host("EXAMPLE.com"));
        assert!(hosts.allows_host("grr.la"));
        assert!(!hosts.allows_host("other.example"));
    }

    #[test]
    fn a_single_dot_allows_everything() {
        let hosts = hosts(&["."]);
        assert!(hosts.allows_host("anything.example"));
        assert!(hosts.allows_ip("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn ip_literals_are_normalized() {
        let hosts = hosts(&["[2001:DB8:0:0:0:0:0:1]", "[192.0.2.1]"]);
        assert!(hosts.allows_ip("2001:db8::1".parse().unwrap()));
        assert!(hosts.allows_ip("192.0.2.1".parse().unwrap()));
        assert!(hosts.allows_host("[2001:db8::1]"));
        assert!(!hosts.allows_ip("192.0.2.2".parse().unwrap()));
    }

    #[test]
    fn wildcards_glob_match() {
        let hosts = hosts(&["*.example.com"]);
        assert!(hosts.allows_host("mail.example.com"));
        assert!(hosts.allows_host("MX.Example.Com"));
        assert!(!hosts.allows_host("example.com"));
        assert!(!hosts.allows_host("mail.example.org"));
    }

    #[test]
    fn the_dot_must_be_alone_to_disable_checking() {
        let hosts = hosts(&[".", "example.com"]);
        assert!(hosts.allows_host("example.com"));
        assert!(!hosts.allows_host("anything.example"));
    }
}
