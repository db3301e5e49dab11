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

/// Untyped backend options; every processor extracts its own typed slice.
pub type BackendConfig = serde_json::Map<String, serde_json::Value>;

/// The whole configuration file.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct AppConfig {
    /// Where the daemon writes its pid.
    #[serde(default)]
    pub pid_file: String,
    /// Main log destination: a path, `stderr`, `stdout` or `off`.
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// Main log level (`trace` … `error`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Recipient domains accepted for relay. Exact names, `[ip]`
    /// literals, `*` globs; a single `.` disables checking.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Host used when completing a bare `postmaster` recipient and by
    /// the header processor.
    #[serde(default)]
    pub primary_mail_host: String,
    /// One entry per listener.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Options handed to the backend gateway and its processors.
    #[serde(default)]
    pub backend_config: BackendConfig,
}

/// One SMTP listener.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ServerConfig {
    /// Disabled servers are configured but never started.
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    /// `host:port` to bind.
    #[serde(default = "default_listen_interface")]
    pub listen_interface: String,
    /// Name used in the greeting and HELO replies.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Maximum accepted DATA size in bytes.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Per-read/write deadline, seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Fixed client pool capacity.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Per-server log destination; empty means the main log.
    #[serde(default)]
    pub log_file: String,
    /// Expect a PROXY protocol preamble on every connection.
    #[serde(default, rename = "proxyon")]
    pub proxy_on: bool,
    /// Honor the XCLIENT command.
    #[serde(default)]
    pub xclient_on: bool,
    /// TLS material and policy.
    #[serde(default)]
    pub tls: TlsSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            is_enabled: true,
            listen_interface: default_listen_interface(),
            hostname: default_hostname(),
            max_size: default_max_size(),
            timeout: default_timeout(),
            max_clients: default_max_clients(),
            log_file: String::new(),
            proxy_on: false,
            xclient_on: false,
            tls: TlsSettings::default(),
        }
    }
}

impl ServerConfig {
    /// The per-read/write deadline as a duration.
    #[must_use]
    pub const fn timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout)
    }

    /// TLS is needed at startup (implicit or advertised).
    #[must_use]
    pub const fn tls_required(&self) -> bool {
        self.tls.always_on || self.tls.start_tls_on
    }
}

/// The nested `tls` section of a server.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct TlsSettings {
    /// Wrap every connection in TLS from the first byte.
    #[serde(default)]
    pub always_on: bool,
    /// Advertise and accept STARTTLS.
    #[serde(default)]
    pub start_tls_on: bool,
    /// PEM certificate chain.
    #[serde(default)]
    pub public_key_file: String,
    /// PEM private key.
    #[serde(default)]
    pub private_key_file: String,
    /// `[min, max]` protocol names, e.g. `["tls1.2", "tls1.3"]`.
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Allowed cipher suite names; empty means the library defaults.
    #[serde(default)]
    pub ciphers: Vec<String>,
    /// Allowed key exchange curves; empty means the library defaults.
    #[serde(default)]
    pub curves: Vec<String>,
    /// PEM file with client CA roots.
    #[serde(default)]
    pub root_cas: String,
    /// Client certificate policy, Go crypto/tls naming
    /// (`NoClientCert`, `VerifyClientCertIfGiven`, …).
    #[serde(default)]
    pub client_auth_type: String,
}

fn default_true() -> bool {
    true
}

fn default_log_file() -> String {
    "stderr".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_listen_interface() -> String {
    "127.0.0.1:2525".to_owned()
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "mail.example.com".to_owned())
}

const fn default_max_size() -> usize {
    10 * 1024 * 1024
}

const fn default_timeout() -> u64 {
    30
}

const fn default_max_clients() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::AppConfig;

    #[test]
    fn minimal_document_gets_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "allowed_hosts": ["example.com"],
                "servers": [{ "listen_interface": "127.0.0.1:2525" }]
            }"#,
        )
        .unwrap();
        let server = &config.servers[0];
        assert!(server.is_enabled);
        assert_eq!(server.max_size, 10 * 1024 * 1024);
        assert_eq!(server.timeout, 30);
        assert_eq!(server.max_clients, 100);
        assert!(!server.proxy_on);
        assert!(!server.tls_required());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn recognized_keys_round_trip() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "pid_file": "/var/run/guerrillad.pid",
                "log_file": "/var/log/guerrillad.log",
                "log_level": "debug",
                "allowed_hosts": ["grr.la", "[192.0.2.1]", "*.example.com"],
                "primary_mail_host": "mail.example.com",
                "servers": [{
                    "is_enabled": true,
                    "listen_interface": "0.0.0.0:25",
                    "hostname": "mx.example.com",
                    "max_size": 1048576,
                    "timeout": 60,
                    "max_clients": 500,
                    "proxyon": true,
                    "xclient_on": true,
                    "tls": {
                        "start_tls_on": true,
                        "public_key_file": "/etc/ssl/cert.pem",
                        "private_key_file": "/etc/ssl/key.pem",
                        "protocols": ["tls1.2", "tls1.3"]
                    }
                }],
                "backend_config": {
                    "save_process": "HeadersParser|Debugger",
                    "log_received_mails": true
                }
            }"#,
        )
        .unwrap();
        let server = &config.servers[0];
        assert!(server.proxy_on);
        assert!(server.xclient_on);
        assert!(server.tls_required());
        assert_eq!(server.tls.protocols, vec!["tls1.2", "tls1.3"]);
        assert_eq!(
            config.backend_config.get("save_process").unwrap(),
            "HeadersParser|Debugger"
        );
    }
}
