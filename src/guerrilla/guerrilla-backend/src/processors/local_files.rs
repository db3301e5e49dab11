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

//! `LocalFiles`: dumps the decoded parts below `local_storage_path`,
//! recording the written paths on the envelope. Failures are logged,
//! never fatal.

use crate::{Decorator, Processor, ProcessorResult, ServiceRegistry, Task};
use guerrilla_mail::Envelope;
use std::sync::{Arc, OnceLock};

#[derive(Debug, serde::Deserialize)]
struct LocalFilesConfig {
    #[serde(default = "default_storage_path")]
    local_storage_path: String,
}

fn default_storage_path() -> String {
    "/tmp/guerrilla-mail".to_owned()
}

/// Factory registered under `localfiles`.
pub fn decorator(svc: &ServiceRegistry) -> Decorator {
    let config = svc.register_config::<LocalFilesConfig>();
    Box::new(move |inner| Box::new(LocalFilesProcessor { inner, config }))
}

struct LocalFilesProcessor {
    inner: Box<dyn Processor>,
    config: Arc<OnceLock<LocalFilesConfig>>,
}

#[async_trait::async_trait]
impl Processor for LocalFilesProcessor {
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
        if task == Task::SaveMail {
            let config = self
                .config
                .get()
                .expect("the gateway runs initializers before processing");
            if envelope.content.is_none() {
                // tolerate a chain without an explicit contentparser
                if let Err(error) = envelope.parse_content() {
                    tracing::error!(%error, "save local file error");
                    return self.inner.process(envelope, task).await;
                }
            }
            match envelope.save_local_files(&config.local_storage_path).await {
                Ok(()) => tracing::info!(paths = ?envelope.local_files_paths, "Dumped content."),
                Err(error) => tracing::error!(%error, "save local file error"),
            }
        }
        self.inner.process(envelope, task).await
    }
}
