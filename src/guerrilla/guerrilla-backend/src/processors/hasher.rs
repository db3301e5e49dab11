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

//! `Hasher`: one BLAKE2s-128 hash per recipient, the key the storage
//! sinks file the message under.

use crate::util::blake2s128_hex;
use crate::{Decorator, Processor, ProcessorResult, ServiceRegistry, Task};
use guerrilla_mail::Envelope;

/// Factory registered under `hasher`.
pub fn decorator(_svc: &ServiceRegistry) -> Decorator {
    Box::new(|inner| Box::new(HasherProcessor { inner }))
}

struct HasherProcessor {
    inner: Box<dyn Processor>,
}

#[async_trait::async_trait]
impl Processor for HasherProcessor {
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
        if matches!(task, Task::SaveMail | Task::Test) {
            let sender = envelope.mail_from.clone().unwrap_or_default().full();
            let stamp = time::OffsetDateTime::now_utc()
                .unix_timestamp_nanos()
                .to_string();
            for rcpt in &envelope.rcpt_to {
                let hash = blake2s128_hex(&[
                    sender.as_bytes(),
                    rcpt.full().as_bytes(),
                    stamp.as_bytes(),
                    &envelope.data,
                ]);
                envelope.hashes.push(hash);
            }
        }
        self.inner.process(envelope, task).await
    }
}

#[cfg(test)]
mod tests {
    use crate::{decorate, ServiceRegistry, Task};
    use guerrilla_common::Address;
    use guerrilla_mail::Envelope;

    #[tokio::test]
    async fn one_hash_per_recipient() {
        let svc = ServiceRegistry::new();
        let chain = decorate(vec![super::decorator(&svc)]);

        let mut envelope = Envelope::new("192.0.2.1", 1);
        envelope.mail_from = Some(Address::new("from", "example.com"));
        envelope.rcpt_to.push(Address::new("one", "grr.la"));
        envelope.rcpt_to.push(Address::new("two", "grr.la"));
        envelope.data.extend_from_slice(b"Subject: x\r\n\r\nbody");

        chain.process(&mut envelope, Task::SaveMail).await.unwrap();

        assert_eq!(envelope.hashes.len(), 2);
        assert_ne!(envelope.hashes[0], envelope.hashes[1]);
        for hash in &envelope.hashes {
            assert_eq!(hash.len(), 32);
            assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
        }
    }

    #[tokio::test]
    async fn validate_task_leaves_the_envelope_alone() {
        let svc = ServiceRegistry::new();
        let chain = decorate(vec![super::decorator(&svc)]);

        let mut envelope = Envelope::new("192.0.2.1", 1);
        envelope.rcpt_to.push(Address::new("one", "grr.la"));
        chain
            .process(&mut envelope, Task::ValidateRcpt)
            .await
            .unwrap();
        assert!(envelope.hashes.is_empty());
    }
}
