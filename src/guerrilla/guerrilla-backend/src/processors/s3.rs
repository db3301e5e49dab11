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

//! `S3`: uploads the raw message to an S3-compatible store, keyed by
//! the first recipient hash (or the queued id).

use crate::{Decorator, InitError, Processor, ProcessorError, ProcessorResult, ServiceRegistry, Task};
use guerrilla_common::canned;
use guerrilla_mail::Envelope;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Default, serde::Deserialize)]
struct S3Config {
    #[serde(default)]
    s3_endpoint: String,
    #[serde(default)]
    s3_bucket_name: String,
    #[serde(default)]
    s3_region: String,
    #[serde(default = "default_use_tls")]
    s3_use_tls: bool,
    #[serde(default)]
    s3_access_key_id: String,
    #[serde(default)]
    s3_secret_access_key: String,
}

const fn default_use_tls() -> bool {
    true
}

/// Factory registered under `s3`.
pub fn decorator(svc: &ServiceRegistry) -> Decorator {
    let bucket: Arc<OnceLock<Bucket>> = Arc::new(OnceLock::new());

    let cell = bucket.clone();
    svc.add_initializer(move |backend_config| {
        let config: S3Config = crate::service::extract_config(backend_config)?;
        let scheme = if config.s3_use_tls { "https" } else { "http" };
        let region = Region::Custom {
            region: config.s3_region.clone(),
            endpoint: format!("{scheme}://{}", config.s3_endpoint),
        };
        let credentials = Credentials::new(
            Some(&config.s3_access_key_id),
            Some(&config.s3_secret_access_key),
            None,
            None,
            None,
        )
        .map_err(|error| InitError::Resource(format!("s3 credentials: {error}")))?;
        let built = Bucket::new(&config.s3_bucket_name, region, credentials)
            .map_err(|error| InitError::Resource(format!("s3 bucket: {error}")))?
            .with_path_style();
        let _ = cell.set(built);
        Ok(())
    });

    Box::new(move |inner| Box::new(S3Processor { inner, bucket }))
}

struct S3Processor {
    inner: Box<dyn Processor>,
    bucket: Arc<OnceLock<Bucket>>,
}

#[async_trait::async_trait]
impl Processor for S3Processor {
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
        if matches!(task, Task::SaveMail | Task::Test) {
            let bucket = self
                .bucket
                .get()
                .expect("the gateway runs initializers before processing");
            let key = envelope
                .hashes
                .first()
                .unwrap_or(&envelope.queued_id)
                .clone();

            let mut message =
                Vec::with_capacity(envelope.delivery_header.len() + envelope.data.len());
            message.extend_from_slice(envelope.delivery_header.as_bytes());
            message.extend_from_slice(&envelope.data);

            match bucket.put_object(format!("{key}.eml"), &message).await {
                Ok(response) if response.status_code() == 200 => {
                    tracing::info!(%key, "successfully uploaded");
                }
                Ok(response) => {
                    tracing::error!(%key, status = response.status_code(), "S3 upload refused.");
                    return Err(ProcessorError::new(
                        canned().fail_backend_transaction.with_detail("storage failed"),
                        format!("s3 status {}", response.status_code()),
                    ));
                }
                Err(error) => {
                    tracing::error!(%key, %error, "S3 upload failed.");
                    return Err(ProcessorError::new(
                        canned().fail_backend_transaction.with_detail("storage failed"),
                        format!("s3: {error}"),
                    ));
                }
            }
        }
        self.inner.process(envelope, task).await
    }
}
