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

//! `DKIM`: requires a signature header and verifies it. Under the
//! `Test` task the DNS side is a local key table instead of the network.

use crate::{Decorator, InitError, Processor, ProcessorError, ProcessorResult, ServiceRegistry, Task};
use guerrilla_common::Reply;
use guerrilla_mail::Envelope;
use mail_auth::common::parse::TxtRecordParser;
use mail_auth::common::verify::DomainKey;
use mail_auth::{AuthenticatedMessage, DkimResult, Resolver};
use std::sync::{Arc, OnceLock};

// canonicalized form of "DKIM-Signature"
const SIGNATURE_HEADER: &str = "Dkim-Signature";

const TEST_KEY_DOMAIN: &str = "grrla._domainkey.example.com.";
const TEST_KEY_RECORD: &str = "v=DKIM1; k=ed25519; p=xSvJUKTEe5zW0XuekE6pkPyd/mhSfpVqSZ2yGtvbt/I=";

fn no_signature() -> ProcessorError {
    ProcessorError::new(Reply::new(556, "5.7.20 No DKIM signature."), "no DKIM signature")
}

fn verification_error(message: impl Into<String>) -> ProcessorError {
    ProcessorError::new(Reply::new(556, "5.7.20 DKIM verification error."), message)
}

fn unauthorized() -> ProcessorError {
    ProcessorError::new(
        Reply::new(
            556,
            "5.7.0 Unauthorized sender. Email blocked due to policy reasons.",
        ),
        "DKIM signature did not verify",
    )
}

struct Resolvers {
    live: Resolver,
    // preloaded with the fixture key, nothing else resolves
    test: Resolver,
}

/// Factory registered under `dkim`.
pub fn decorator(svc: &ServiceRegistry) -> Decorator {
    let resolvers: Arc<OnceLock<Resolvers>> = Arc::new(OnceLock::new());

    let cell = resolvers.clone();
    svc.add_initializer(move |_backend_config| {
        let live = Resolver::new_system_conf()
            .or_else(|_| Resolver::new_cloudflare())
            .map_err(|error| InitError::Resource(format!("dkim resolver: {error}")))?;
        let test = Resolver::new_system_conf()
            .or_else(|_| Resolver::new_cloudflare())
            .map_err(|error| InitError::Resource(format!("dkim test resolver: {error}")))?;
        let key = DomainKey::parse(TEST_KEY_RECORD.as_bytes())
            .map_err(|error| InitError::Resource(format!("dkim test key: {error}")))?;
        test.txt_add(
            TEST_KEY_DOMAIN.to_owned(),
            key,
            std::time::Instant::now() + std::time::Duration::from_secs(86400),
        );
        let _ = cell.set(Resolvers { live, test });
        Ok(())
    });

    Box::new(move |inner| Box::new(DkimProcessor { inner, resolvers }))
}

struct DkimProcessor {
    inner: Box<dyn Processor>,
    resolvers: Arc<OnceLock<Resolvers>>,
}

#[async_trait::async_trait]
impl Processor for DkimProcessor {
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
        if matches!(task, Task::SaveMail | Task::Test) {
            if !envelope.header.contains_key(SIGNATURE_HEADER) {
                return Err(no_signature());
            }

            let resolvers = self
                .resolvers
                .get()
                .expect("the gateway runs initializers before processing");
            let resolver = if task == Task::Test {
                &resolvers.test
            } else {
                &resolvers.live
            };

            let Some(message) = AuthenticatedMessage::parse(&envelope.data) else {
                return Err(verification_error("message is not verifiable"));
            };
            let outputs = resolver.verify_dkim(&message).await;
            if outputs.is_empty() {
                return Err(verification_error("no verifiable signature found"));
            }
            for output in &outputs {
                match output.result() {
                    DkimResult::Pass => tracing::info!("DKIM Valid signature."),
                    other => {
                        tracing::info!(result = ?other, "DKIM Invalid signature.");
                        return Err(unauthorized());
                    }
                }
            }
        }
        self.inner.process(envelope, task).await
    }
}

#[cfg(test)]
mod tests {
    use crate::{decorate, ServiceRegistry, Task};
    use guerrilla_config::BackendConfig;
    use guerrilla_mail::Envelope;

    async fn run(task: Task, data: &[u8]) -> crate::ProcessorResult {
        let svc = ServiceRegistry::new();
        let chain = decorate(vec![super::decorator(&svc)]);
        svc.initialize(&BackendConfig::new()).unwrap();

        let mut envelope = Envelope::new("192.0.2.1", 1);
        envelope.data.extend_from_slice(data);
        let _ = envelope.parse_headers();
        chain.process(&mut envelope, task).await
    }

    #[tokio::test]
    async fn missing_signature_is_rejected() {
        let error = run(Task::Test, b"From: a@b.example\r\nSubject: x\r\n\r\nhello\r\n")
            .await
            .unwrap_err();
        assert_eq!(error.reply().code(), 556);
        assert_eq!(error.reply().text(), "5.7.20 No DKIM signature.");
    }

    #[tokio::test]
    async fn unverifiable_signature_is_unauthorized() {
        // a syntactically present signature for a selector the test
        // table does not hold
        let error = run(
            Task::Test,
            b"DKIM-Signature: v=1; a=ed25519-sha256; d=unknown.example; s=nope;\r\n\
              \tbh=AAAA; b=BBBB; h=From:Subject;\r\n\
              From: a@unknown.example\r\nSubject: x\r\n\r\nhello\r\n",
        )
        .await
        .unwrap_err();
        assert_eq!(error.reply().code(), 556);
    }

    #[tokio::test]
    async fn foreign_tasks_pass_through() {
        let reply = run(Task::ValidateRcpt, b"no headers at all")
            .await
            .unwrap();
        assert_eq!(reply.code(), 250);
    }
}
