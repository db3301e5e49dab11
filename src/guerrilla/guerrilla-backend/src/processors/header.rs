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

//! `Header`: prepends the `Delivered-To:`/`Received:` delivery block to
//! the envelope's delivery header.

use crate::{Decorator, Processor, ProcessorResult, ServiceRegistry, Task};
use guerrilla_mail::Envelope;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Default, serde::Deserialize)]
struct HeaderConfig {
    #[serde(default)]
    primary_mail_host: String,
}

/// Factory registered under `header`.
pub fn decorator(svc: &ServiceRegistry) -> Decorator {
    let config = svc.register_config::<HeaderConfig>();
    Box::new(move |inner| Box::new(HeaderProcessor { inner, config }))
}

struct HeaderProcessor {
    inner: Box<dyn Processor>,
    config: Arc<OnceLock<HeaderConfig>>,
}

#[async_trait::async_trait]
impl Processor for HeaderProcessor {
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
        if matches!(task, Task::SaveMail | Task::Test) {
            let config = self
                .config
                .get()
                .expect("the gateway runs initializers before processing");
            envelope.delivery_header = delivery_header(envelope, &config.primary_mail_host);
        }
        self.inner.process(envelope, task).await
    }
}

fn delivery_header(envelope: &Envelope, primary_host: &str) -> String {
    let Some(first_rcpt) = envelope.rcpt_to.first() else {
        return String::new();
    };

    let hash = envelope
        .hashes
        .first()
        .map_or("unknown", String::as_str);
    let mut protocol = String::from("SMTP");
    if envelope.esmtp {
        protocol.insert(0, 'E');
    }
    if envelope.tls {
        protocol.push('S');
    }
    let date = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc2822)
        .unwrap_or_default();

    format!(
        "Delivered-To: {}@{}\nReceived: from {} ([{}])\n\tby {} with {} id {}@{};\n\t{}\n",
        first_rcpt.user.trim(),
        primary_host,
        envelope.remote_ip,
        envelope.remote_ip,
        first_rcpt.host,
        protocol,
        hash,
        first_rcpt.host,
        date,
    )
}
