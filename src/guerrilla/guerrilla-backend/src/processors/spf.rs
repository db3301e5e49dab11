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

//! `SPF`: evaluates the sender policy of the reverse-path domain
//! against the connecting address. Only a hard `fail` blocks the mail.

use crate::{Decorator, InitError, Processor, ProcessorError, ProcessorResult, ServiceRegistry, Task};
use guerrilla_common::Reply;
use guerrilla_mail::Envelope;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, OnceLock};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;
use viaspf::lookup::{Lookup, LookupError, LookupResult, Name};

fn unauthorized() -> ProcessorError {
    ProcessorError::new(
        Reply::new(
            556,
            "5.7.0 Unauthorized sender. Email blocked due to policy reasons.",
        ),
        "SPF evaluation failed",
    )
}

/// Factory registered under `spf`.
pub fn decorator(svc: &ServiceRegistry) -> Decorator {
    let lookup: Arc<OnceLock<DnsLookup>> = Arc::new(OnceLock::new());

    let cell = lookup.clone();
    svc.add_initializer(move |_backend_config| {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|error| InitError::Resource(format!("spf resolver: {error}")))?;
        let _ = cell.set(DnsLookup(resolver));
        Ok(())
    });

    Box::new(move |inner| Box::new(SpfProcessor { inner, lookup }))
}

struct SpfProcessor {
    inner: Box<dyn Processor>,
    lookup: Arc<OnceLock<DnsLookup>>,
}

#[async_trait::async_trait]
impl Processor for SpfProcessor {
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
        if task == Task::SaveMail {
            // the null reverse-path has no policy to evaluate
            let sender = envelope.mail_from.clone().filter(|from| !from.is_empty());
            if let Some(sender) = sender {
                let lookup = self
                    .lookup
                    .get()
                    .expect("the gateway runs initializers before processing");
                let spf_sender = match viaspf::Sender::from_address(&sender.full()) {
                    Ok(spf_sender) => spf_sender,
                    Err(error) => {
                        tracing::warn!(%error, sender = %sender, "Sender not evaluable for SPF.");
                        return self.inner.process(envelope, task).await;
                    }
                };
                let client_ip = envelope
                    .remote_ip
                    .parse::<IpAddr>()
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

                let result = viaspf::evaluate_sender(
                    lookup,
                    &viaspf::Config::default(),
                    client_ip,
                    &spf_sender,
                    None,
                )
                .await;

                tracing::info!(result = %result.spf_result, %client_ip, "SPF result.");
                if matches!(result.spf_result, viaspf::SpfResult::Fail(_)) {
                    return Err(unauthorized());
                }
            }
        }
        self.inner.process(envelope, task).await
    }
}

struct DnsLookup(TokioAsyncResolver);

fn to_lookup_error(error: ResolveError) -> LookupError {
    match error.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => LookupError::NoRecords,
        ResolveErrorKind::Timeout => LookupError::Timeout,
        _ => LookupError::Dns(Some(error.into())),
    }
}

#[async_trait::async_trait]
impl Lookup for DnsLookup {
    async fn lookup_a(&self, name: &Name) -> LookupResult<Vec<Ipv4Addr>> {
        Ok(self
            .0
            .ipv4_lookup(name.as_str())
            .await
            .map_err(to_lookup_error)?
            .into_iter()
            .map(|a| a.0)
            .collect())
    }

    async fn lookup_aaaa(&self, name: &Name) -> LookupResult<Vec<Ipv6Addr>> {
        Ok(self
            .0
            .ipv6_lookup(name.as_str())
            .await
            .map_err(to_lookup_error)?
            .into_iter()
            .map(|aaaa| aaaa.0)
            .collect())
    }

    async fn lookup_mx(&self, name: &Name) -> LookupResult<Vec<Name>> {
        let mut records = self
            .0
            .mx_lookup(name.as_str())
            .await
            .map_err(to_lookup_error)?
            .into_iter()
            .collect::<Vec<_>>();
        records.sort_by_key(trust_dns_resolver::proto::rr::rdata::MX::preference);
        records
            .into_iter()
            .map(|mx| {
                Name::new(&mx.exchange().to_ascii())
                    .map_err(|error| LookupError::Dns(Some(error.into())))
            })
            .collect()
    }

    async fn lookup_txt(&self, name: &Name) -> LookupResult<Vec<String>> {
        Ok(self
            .0
            .txt_lookup(name.as_str())
            .await
            .map_err(to_lookup_error)?
            .into_iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                    .collect::<String>()
            })
            .collect())
    }

    async fn lookup_ptr(&self, ip: IpAddr) -> LookupResult<Vec<Name>> {
        self.0
            .reverse_lookup(ip)
            .await
            .map_err(to_lookup_error)?
            .into_iter()
            .map(|ptr| {
                Name::new(&ptr.0.to_ascii())
                    .map_err(|error| LookupError::Dns(Some(error.into())))
            })
            .collect()
    }
}
