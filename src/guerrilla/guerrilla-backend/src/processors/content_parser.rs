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

//! `ContentParser`: decodes the MIME structure into
//! `envelope.content`/`body`. Failures are logged, never fatal.

use crate::{Decorator, Processor, ProcessorResult, ServiceRegistry, Task};
use guerrilla_mail::Envelope;

/// Factory registered under `contentparser`.
pub fn decorator(_svc: &ServiceRegistry) -> Decorator {
    Box::new(|inner| Box::new(ContentParserProcessor { inner }))
}

struct ContentParserProcessor {
    inner: Box<dyn Processor>,
}

#[async_trait::async_trait]
impl Processor for ContentParserProcessor {
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
        if task == Task::SaveMail {
            match envelope.parse_content() {
                Ok(()) => tracing::info!(
                    attachments = envelope.content.as_ref().map_or(0, |c| c.attachments.len()),
                    "Parsed content."
                ),
                Err(error) => tracing::error!(%error, "parse content error"),
            }
        }
        self.inner.process(envelope, task).await
    }
}
