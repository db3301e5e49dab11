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

//! `HeadersParser`: fills `envelope.header`/`subject`. Parse failures
//! are logged, never fatal.

use crate::{Decorator, Processor, ProcessorResult, ServiceRegistry, Task};
use guerrilla_mail::Envelope;

/// Factory registered under `headersparser`.
pub fn decorator(_svc: &ServiceRegistry) -> Decorator {
    Box::new(|inner| Box::new(HeadersParserProcessor { inner }))
}

struct HeadersParserProcessor {
    inner: Box<dyn Processor>,
}

#[async_trait::async_trait]
impl Processor for HeadersParserProcessor {
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
        if matches!(task, Task::SaveMail | Task::Test) {
            if let Err(error) = envelope.parse_headers() {
                tracing::error!(%error, "parse headers error");
            }
        }
        self.inner.process(envelope, task).await
    }
}

#[cfg(test)]
mod tests {
    use crate::{decorate, ServiceRegistry, Task};
    use guerrilla_mail::Envelope;

    #[tokio::test]
    async fn fills_the_header_map_and_continues() {
        let svc = ServiceRegistry::new();
        let chain = decorate(vec![super::decorator(&svc)]);

        let mut envelope = Envelope::new("192.0.2.1", 1);
        envelope
            .data
            .extend_from_slice(b"Subject: parsed\r\nFrom: a@b\r\n\r\nbody\r\n");
        let reply = chain.process(&mut envelope, Task::SaveMail).await.unwrap();

        assert_eq!(reply.code(), 250);
        assert_eq!(envelope.subject, "parsed");
    }

    #[tokio::test]
    async fn garbage_data_is_logged_not_fatal() {
        let svc = ServiceRegistry::new();
        let chain = decorate(vec![super::decorator(&svc)]);

        let mut envelope = Envelope::new("192.0.2.1", 1);
        let reply = chain.process(&mut envelope, Task::SaveMail).await.unwrap();
        assert_eq!(reply.code(), 250);
    }

    #[tokio::test]
    async fn skips_foreign_tasks() {
        let svc = ServiceRegistry::new();
        let chain = decorate(vec![super::decorator(&svc)]);

        let mut envelope = Envelope::new("192.0.2.1", 1);
        envelope.data.extend_from_slice(b"Subject: skipped\r\n\r\n.");
        chain
            .process(&mut envelope, Task::ValidateRcpt)
            .await
            .unwrap();
        assert!(envelope.subject.is_empty());
    }
}
