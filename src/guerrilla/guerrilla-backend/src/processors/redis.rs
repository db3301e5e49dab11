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

//! `Redis`: files the raw message under each recipient hash with an
//! expiry.

use crate::{Decorator, InitError, Processor, ProcessorError, ProcessorResult, ServiceRegistry, Task};
use guerrilla_common::canned;
use guerrilla_mail::Envelope;
use r2d2_redis::redis::Commands;
use r2d2_redis::RedisConnectionManager;
use std::sync::{Arc, OnceLock};

#[derive(Debug, serde::Deserialize)]
struct RedisConfig {
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

/// Shared connection pool, also used by the compat sink.
#[derive(Clone)]
pub(crate) struct RedisClient {
    pool: r2d2_redis::r2d2::Pool<RedisConnectionManager>,
    expire_seconds: usize,
}

impl RedisClient {
    pub(crate) fn connect(interface: &str, expire_seconds: usize) -> Result<Self, InitError> {
        let manager = RedisConnectionManager::new(format!("redis://{interface}"))
            .map_err(|error| InitError::Resource(format!("redis manager: {error}")))?;
        let pool = r2d2_redis::r2d2::Pool::builder()
            .connection_timeout(std::time::Duration::from_secs(5))
            .build(manager)
            .map_err(|error| InitError::Resource(format!("redis pool: {error}")))?;
        Ok(Self {
            pool,
            expire_seconds,
        })
    }

    /// `SETEX key expire value` on a blocking worker thread.
    pub(crate) async fn set_ex(&self, key: String, value: Vec<u8>) -> Result<(), String> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = client.pool.get().map_err(|error| error.to_string())?;
            tracing::debug!(%key, expire = client.expire_seconds, "SETEX");
            connection
                .set_ex::<_, _, ()>(&key, value, client.expire_seconds)
                .map_err(|error| error.to_string())
        })
        .await
        .map_err(|error| error.to_string())?
    }
}

/// Factory registered under `redis`.
pub fn decorator(svc: &ServiceRegistry) -> Decorator {
    let client: Arc<OnceLock<RedisClient>> = Arc::new(OnceLock::new());

    let cell = client.clone();
    svc.add_initializer(move |backend_config| {
        let config: RedisConfig = crate::service::extract_config(backend_config)?;
        let connected = RedisClient::connect(&config.redis_interface, config.redis_expire_seconds)?;
        let _ = cell.set(connected);
        Ok(())
    });
    svc.add_shutdowner(|| tracing::debug!("Redis pool dropped."));

    Box::new(move |inner| Box::new(RedisProcessor { inner, client }))
}

struct RedisProcessor {
    inner: Box<dyn Processor>,
    client: Arc<OnceLock<RedisClient>>,
}

#[async_trait::async_trait]
impl Processor for RedisProcessor {
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
        if matches!(task, Task::SaveMail | Task::Test) {
            if envelope.hashes.is_empty() {
                return Err(ProcessorError::new(
                    canned().fail_backend_transaction.with_detail("no hash"),
                    "redis needs the hasher upstream of it",
                ));
            }
            let client = self
                .client
                .get()
                .expect("the gateway runs initializers before processing");

            let mut message =
                Vec::with_capacity(envelope.delivery_header.len() + envelope.data.len());
            message.extend_from_slice(envelope.delivery_header.as_bytes());
            message.extend_from_slice(&envelope.data);

            for hash in &envelope.hashes {
                if let Err(error) = client.set_ex(hash.clone(), message.clone()).await {
                    tracing::error!(%error, "Redis save failed.");
                    return Err(ProcessorError::new(
                        canned().fail_backend_transaction.with_detail("storage failed"),
                        format!("redis: {error}"),
                    ));
                }
            }
            tracing::info!(keys = envelope.hashes.len(), "Message saved to redis.");
        }
        self.inner.process(envelope, task).await
    }
}
