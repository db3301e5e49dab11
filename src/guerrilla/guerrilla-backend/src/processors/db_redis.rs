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

//! `GuerrillaDBRedis`: the legacy compat sink. The zlib-compressed
//! message body goes to Redis under the recipient hash; the relational
//! half lives behind the external storage-driver contract, so the row
//! it would receive is logged for the driver to pick up.

use crate::processors::redis::RedisClient;
use crate::util::compress;
use crate::{Decorator, Processor, ProcessorError, ProcessorResult, ServiceRegistry, Task};
use guerrilla_common::canned;
use guerrilla_mail::Envelope;
use std::sync::{Arc, OnceLock};

#[derive(Debug, serde::Deserialize)]
struct DbRedisConfig {
    #[serde(default = "default_interface")]
    redis_interface: String,
    #[serde(default = "default_expire")]
    redis_expire_seconds: usize,
}

fn default_interface() -> String {
    "127.0.0.1:6379".to_owned()
}

const fn default_expire() -> usize {
    7200
}

/// Factory registered under `guerrilladbredis`.
pub fn decorator(svc: &ServiceRegistry) -> Decorator {
    let client: Arc<OnceLock<RedisClient>> = Arc::new(OnceLock::new());

    let cell = client.clone();
    svc.add_initializer(move |backend_config| {
        let config: DbRedisConfig = crate::service::extract_config(backend_config)?;
        let connected = RedisClient::connect(&config.redis_interface, config.redis_expire_seconds)?;
        let _ = cell.set(connected);
        Ok(())
    });

    Box::new(move |inner| Box::new(DbRedisProcessor { inner, client }))
}

struct DbRedisProcessor {
    inner: Box<dyn Processor>,
    client: Arc<OnceLock<RedisClient>>,
}

#[async_trait::async_trait]
impl Processor for DbRedisProcessor {
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
        if matches!(task, Task::SaveMail | Task::Test) {
            let Some(hash) = envelope.hashes.first().cloned() else {
                return Err(ProcessorError::new(
                    canned().fail_backend_transaction.with_detail("no hash"),
                    "guerrilladbredis needs the hasher upstream of it",
                ));
            };
            let client = self
                .client
                .get()
                .expect("the gateway runs initializers before processing");

            let compressed = compress(&[envelope.delivery_header.as_bytes(), &envelope.data]);
            if let Err(error) = client.set_ex(hash.clone(), compressed).await {
                tracing::error!(%error, "Redis save failed.");
                return Err(ProcessorError::new(
                    canned().fail_backend_transaction.with_detail("storage failed"),
                    format!("guerrilladbredis: {error}"),
                ));
            }

            // the row the relational driver files, keyed by the same hash
            tracing::debug!(
                %hash,
                queued_id = %envelope.queued_id,
                from = %envelope.mail_from.clone().unwrap_or_default(),
                to = ?envelope.rcpt_to.iter().map(ToString::to_string).collect::<Vec<_>>(),
                subject = %envelope.subject,
                "Queued for the database driver."
            );
        }
        self.inner.process(envelope, task).await
    }
}
