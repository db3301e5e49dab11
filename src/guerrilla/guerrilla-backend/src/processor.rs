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

use guerrilla_common::Reply;
use guerrilla_mail::Envelope;

/// The named invocation mode a chain runs under. Processors inspect it
/// and act only on the tasks they care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Persist a completed message.
    SaveMail,
    /// Confirm a recipient during RCPT TO.
    ValidateRcpt,
    /// Run the security processors only.
    SecurityChecks,
    /// Test fixtures; like `SaveMail` but with test doubles substituted.
    Test,
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::SaveMail => "save mail",
            Self::ValidateRcpt => "validate recipient",
            Self::SecurityChecks => "check security",
            Self::Test => "test",
        })
    }
}

/// A processor failure. Carries the SMTP reply that is surfaced to the
/// client verbatim, and a log-facing message.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProcessorError {
    reply: Reply,
    message: String,
}

impl ProcessorError {
    /// A failure answering `reply` on the wire.
    #[must_use]
    pub fn new(reply: Reply, message: impl Into<String>) -> Self {
        Self {
            reply,
            message: message.into(),
        }
    }

    /// The reply to send to the client.
    #[must_use]
    pub const fn reply(&self) -> &Reply {
        &self.reply
    }
}

/// What a chain step produces: the reply to propagate, or a failure
/// that short-circuits every processor below.
pub type ProcessorResult = Result<Reply, ProcessorError>;

/// A single processing step with the uniform signature. The envelope is
/// exclusively owned by the running chain.
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    /// Inspect/transform the envelope under `task`.
    async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult;
}

/// The terminal no-op at the bottom of every chain. Reaching it means
/// every decorator above let the envelope through.
pub struct DefaultProcessor;

/// The reply [`DefaultProcessor`] produces.
pub(crate) const DEFAULT_OK_CODE: u16 = 250;
pub(crate) const DEFAULT_OK_TEXT: &str = "2.0.0 OK";

#[async_trait::async_trait]
impl Processor for DefaultProcessor {
    async fn process(&self, _envelope: &mut Envelope, _task: Task) -> ProcessorResult {
        Ok(Reply::new(DEFAULT_OK_CODE, DEFAULT_OK_TEXT))
    }
}

/// A decorator wraps an inner processor, returning the outer one. The
/// closure owns its configuration; composition is the only dynamic
/// dispatch involved.
pub type Decorator = Box<dyn FnOnce(Box<dyn Processor>) -> Box<dyn Processor> + Send>;

/// Fold decorators right-to-left over [`DefaultProcessor`], so that the
/// first decorator in the list runs first.
#[must_use]
pub fn decorate(decorators: Vec<Decorator>) -> Box<dyn Processor> {
    decorators
        .into_iter()
        .rev()
        .fold(Box::new(DefaultProcessor) as Box<dyn Processor>, |inner, decorator| decorator(inner))
}

#[cfg(test)]
mod tests {
    use super::{decorate, Decorator, Processor, ProcessorError, ProcessorResult, Task};
    use guerrilla_common::Reply;
    use guerrilla_mail::Envelope;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
        inner: Box<dyn Processor>,
    }

    #[async_trait::async_trait]
    impl Processor for Recorder {
        async fn process(&self, envelope: &mut Envelope, task: Task) -> ProcessorResult {
            self.seen.lock().unwrap().push(self.name);
            if self.fail {
                return Err(ProcessorError::new(
                    Reply::new(554, "5.3.0 Error: transaction failed"),
                    "deliberate failure",
                ));
            }
            self.inner.process(envelope, task).await
        }
    }

    fn recorder(
        name: &'static str,
        seen: &Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) -> Decorator {
        let seen = seen.clone();
        Box::new(move |inner| {
            Box::new(Recorder {
                name,
                seen,
                fail,
                inner,
            })
        })
    }

    #[tokio::test]
    async fn chain_runs_in_configured_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = decorate(vec![
            recorder("first", &seen, false),
            recorder("second", &seen, false),
            recorder("third", &seen, false),
        ]);

        let mut envelope = Envelope::new("192.0.2.1", 1);
        let reply = chain.process(&mut envelope, Task::SaveMail).await.unwrap();

        assert_eq!(reply.code(), 250);
        assert_eq!(reply.text(), "2.0.0 OK");
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn an_error_short_circuits_the_rest() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = decorate(vec![
            recorder("first", &seen, false),
            recorder("fails", &seen, true),
            recorder("never", &seen, false),
        ]);

        let mut envelope = Envelope::new("192.0.2.1", 1);
        let error = chain
            .process(&mut envelope, Task::SaveMail)
            .await
            .unwrap_err();

        assert_eq!(error.reply().code(), 554);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "fails"]);
    }

    #[tokio::test]
    async fn the_empty_chain_is_the_default_processor() {
        let chain = decorate(Vec::new());
        let mut envelope = Envelope::new("192.0.2.1", 1);
        let reply = chain.process(&mut envelope, Task::Test).await.unwrap();
        assert_eq!(reply.code(), 250);
    }
}
