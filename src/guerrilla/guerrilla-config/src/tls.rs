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

use crate::TlsSettings;
use anyhow::Context;

// Named lookup tables from config strings to rustls values, the same
// shape the original keeps for crypto/tls. rustls does not ship TLS 1.0
// or 1.1 at all, those names are skipped with a warning.
const TLS_PROTOCOLS: &[(&str, &rustls::SupportedProtocolVersion)] = &[
    ("tls1.2", &rustls::version::TLS12),
    ("tls1.3", &rustls::version::TLS13),
];

const TLS_CIPHERS: &[(&str, rustls::SupportedCipherSuite)] = &[
    (
        "TLS_AES_128_GCM_SHA256",
        rustls::cipher_suite::TLS13_AES_128_GCM_SHA256,
    ),
    (
        "TLS_AES_256_GCM_SHA384",
        rustls::cipher_suite::TLS13_AES_256_GCM_SHA384,
    ),
    (
        "TLS_CHACHA20_POLY1305_SHA256",
        rustls::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ),
    (
        "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
        rustls::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ),
    (
        "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
        rustls::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    ),
    (
        "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
        rustls::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ),
    (
        "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
        rustls::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ),
    (
        "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
        rustls::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    ),
    (
        "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
        rustls::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ),
];

const TLS_CURVES: &[(&str, &rustls::SupportedKxGroup)] = &[
    ("X25519", &rustls::kx_group::X25519),
    ("P256", &rustls::kx_group::SECP256R1),
    ("P384", &rustls::kx_group::SECP384R1),
];

/// Build the rustls server configuration for one listener.
///
/// # Errors
///
/// * unreadable or unparsable certificate/key/root files
/// * a protocol selection rustls cannot satisfy
pub fn build_tls_config(settings: &TlsSettings) -> anyhow::Result<rustls::ServerConfig> {
    let certs = load_certs(&settings.public_key_file)?;
    let key = load_private_key(&settings.private_key_file)?;

    let ciphers = if settings.ciphers.is_empty() {
        rustls::ALL_CIPHER_SUITES.to_vec()
    } else {
        settings
            .ciphers
            .iter()
            .filter_map(|name| {
                let found = TLS_CIPHERS
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case(name))
                    .map(|(_, suite)| *suite);
                if found.is_none() {
                    tracing::warn!(cipher = %name, "Unknown cipher suite in config, skipping.");
                }
                found
            })
            .collect()
    };
    anyhow::ensure!(!ciphers.is_empty(), "cipher selection left nothing usable");

    let curves = if settings.curves.is_empty() {
        rustls::ALL_KX_GROUPS.to_vec()
    } else {
        settings
            .curves
            .iter()
            .filter_map(|name| {
                let found = TLS_CURVES
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case(name))
                    .map(|(_, group)| *group);
                if found.is_none() {
                    tracing::warn!(curve = %name, "Unknown curve in config, skipping.");
                }
                found
            })
            .collect()
    };
    anyhow::ensure!(!curves.is_empty(), "curve selection left nothing usable");

    let versions = protocol_range(&settings.protocols);

    let verifier = client_auth(settings)?;

    let config = rustls::ServerConfig::builder()
        .with_cipher_suites(&ciphers)
        .with_kx_groups(&curves)
        .with_protocol_versions(&versions)
        .context("protocol selection rejected by rustls")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("certificate/key pair rejected")?;

    Ok(config)
}

// `protocols` is a [min, max] pair of names; anything rustls does not
// ship (tls1.0/tls1.1) falls back to the lowest shipped version.
fn protocol_range(names: &[String]) -> Vec<&'static rustls::SupportedProtocolVersion> {
    fn index_of(name: &str) -> Option<usize> {
        TLS_PROTOCOLS
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    if names.is_empty() {
        return TLS_PROTOCOLS.iter().map(|(_, v)| *v).collect();
    }
    let min = names.first().map_or(0, |name| {
        index_of(name).unwrap_or_else(|| {
            tracing::warn!(protocol = %name, "Protocol not available, using the lowest supported.");
            0
        })
    });
    let max = names.get(1).and_then(|name| index_of(name)).unwrap_or(TLS_PROTOCOLS.len() - 1);
    TLS_PROTOCOLS[min..=max.max(min)]
        .iter()
        .map(|(_, v)| *v)
        .collect()
}

fn client_auth(
    settings: &TlsSettings,
) -> anyhow::Result<std::sync::Arc<dyn rustls::server::ClientCertVerifier>> {
    use rustls::server::{AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient, NoClientAuth};

    let roots = || -> anyhow::Result<rustls::RootCertStore> {
        let mut store = rustls::RootCertStore::empty();
        if !settings.root_cas.is_empty() {
            for cert in load_certs(&settings.root_cas)? {
                store
                    .add(&cert)
                    .context("invalid certificate in root_cas")?;
            }
        }
        Ok(store)
    };

    Ok(match settings.client_auth_type.as_str() {
        "NoClientCert" => NoClientAuth::boxed(),
        "RequireAnyClientCert" | "RequireAndVerifyClientCert" => {
            AllowAnyAuthenticatedClient::new(roots()?).boxed()
        }
        // the original's default
        "" | "RequestClientCert" | "VerifyClientCertIfGiven" => {
            AllowAnyAnonymousOrAuthenticatedClient::new(roots()?).boxed()
        }
        other => {
            tracing::warn!(client_auth_type = %other, "Unknown client auth type, verifying if given.");
            AllowAnyAnonymousOrAuthenticatedClient::new(roots()?).boxed()
        }
    })
}

fn load_certs(path: &str) -> anyhow::Result<Vec<rustls::Certificate>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("could not open certificate file {path}"))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .with_context(|| format!("could not parse certificates in {path}"))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {path}");
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &str) -> anyhow::Result<rustls::PrivateKey> {
    let file =
        std::fs::File::open(path).with_context(|| format!("could not open key file {path}"))?;
    for item in rustls_pemfile::read_all(&mut std::io::BufReader::new(file))
        .with_context(|| format!("could not parse key file {path}"))?
    {
        match item {
            rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::ECKey(key) => return Ok(rustls::PrivateKey(key)),
            _ => {}
        }
    }
    anyhow::bail!("no private key in {path}")
}
