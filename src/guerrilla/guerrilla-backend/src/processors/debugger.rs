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

//! `Debugger`: logs received mail, and doubles as the fault-injection
//! hook for the gateway's panic recovery.

use crate::{Decorator, Processor, ProcessorResult, ServiceRegistry, Task};
use guerrilla_mail::Envelope;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Default, serde::Deserialize)]
struct DebuggerConfig {
    #[serde(default)]
    log_received_mails: bool,
    #[serde(default)]
    sleep_seconds: u64,
}

/// Factory registered under `debugger`.
pub fn decorator(svc: &ServiceRegistry) -> Decorator {
    let config = svc.register_config::<DebuggerConfig>();
    Box::new(move |inner| Box::new(DebuggerProcessor { inner, config }))
}

struct DebuggerProcessor {
    inner: Box<dyn Processor>,
    config: Arc<OnceLock<DebuggerConfig>>,
}

#[async_trait::async_trait]
impl Processor for DebuggerProcessor {
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
        if matches!(task, Task::SaveMail | Task::Test) {
            let config = self
                .config
                .get()
                .expect("the gateway runs initializers before processing");
            if config.log_received_mails {
                tracing::info!(
                    from = %envelope.mail_from.clone().unwrap_or_default(),
                    to = ?envelope.rcpt_to.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    subject = %envelope.subject,
                    headers = ?envelope.header,
                    size = envelope.data.len(),
                    "Mail received."
                );
            }
            if config.sleep_seconds > 0 {
                tracing::info!(seconds = config.sleep_seconds, "sleeping");
                tokio::time::sleep(std::time::Duration::from_secs(config.sleep_seconds)).await;
                tracing::info!("woke up");

                if config.sleep_seconds == 1 {
                    panic!("panic on purpose");
                }
            }
        }
        self.inner.process(envelope, task).await
    }
}
