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

use crate::processor::{DEFAULT_OK_CODE, DEFAULT_OK_TEXT};
use crate::{
    decorate, service, BackendConfig, Processor, ProcessorRegistry, ProcessorResult,
    ServiceRegistry, Task,
};
use futures_util::FutureExt;
use guerrilla_common::{canned, Reply};
use guerrilla_mail::Envelope;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

/// How long shutdown waits for in-flight envelopes before giving up.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Initialized,
    Running,
    Shutdown,
}

impl State {
    const fn name(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Initialized => "Initialized",
            Self::Running => "Running",
            Self::Shutdown => "Shutdown",
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct GatewayConfig {
    #[serde(default = "default_save_process")]
    save_process: String,
    #[serde(default)]
    validate_process: String,
    #[serde(default = "default_workers_size")]
    workers_size: usize,
}

fn default_save_process() -> String {
    "Debugger".to_owned()
}

fn default_workers_size() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

struct Request {
    envelope: Envelope,
    task: Task,
    reply: oneshot::Sender<(Envelope, ProcessorResult)>,
}

#[derive(Clone)]
struct Chains {
    save: Arc<dyn Processor>,
    // None when validate_process is empty: recipients are accepted
    // without a round-trip through the workers
    validate: Option<Arc<dyn Processor>>,
}

/// The backend façade: builds the decorator chains from config and
/// dispatches tasks to a fixed pool of workers.
///
/// Lifecycle: `new` → [`Gateway::initialize`] → [`Gateway::start`] →
/// `process`/`validate_rcpt` calls → [`Gateway::shutdown`].
pub struct Gateway {
    state: Mutex<State>,
    config: GatewayConfig,
    backend_config: BackendConfig,
    svc: Arc<ServiceRegistry>,
    registry: ProcessorRegistry,
    chains: RwLock<Option<Chains>>,
    sender: RwLock<Option<mpsc::Sender<Request>>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Gateway {
    /// A gateway for `backend_config`, resolving processor names against
    /// the standard registry.
    ///
    /// # Errors
    ///
    /// * [`service::InitError::Config`] when the gateway keys have the
    ///   wrong shape
    pub fn new(backend_config: BackendConfig) -> Result<Self, service::InitError> {
        Self::with_registry(backend_config, ProcessorRegistry::standard())
    }

    /// Same, against a caller-supplied registry.
    ///
    /// # Errors
    ///
    /// * [`service::InitError::Config`]
    pub fn with_registry(
        backend_config: BackendConfig,
        registry: ProcessorRegistry,
    ) -> Result<Self, service::InitError> {
        let config: GatewayConfig = service::extract_config(&backend_config)?;
        Ok(Self {
            state: Mutex::new(State::New),
            config,
            backend_config,
            svc: Arc::new(ServiceRegistry::new()),
            registry,
            chains: RwLock::new(None),
            sender: RwLock::new(None),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Compose the chains and run every registered initializer, in
    /// registration order.
    ///
    /// # Errors
    ///
    /// * unknown processor names, config extraction failures, resource
    ///   construction failures — all fatal at startup
    pub fn initialize(&self) -> Result<(), service::InitError> {
        {
            let state = self.state.lock().expect("gateway state lock");
            if *state != State::New {
                return Err(service::InitError::WrongState(state.name(), "New"));
            }
        }

        let save = self.compose(&self.config.save_process)?;
        let validate = if self.config.validate_process.is_empty() {
            None
        } else {
            Some(self.compose(&self.config.validate_process)?)
        };

        self.svc.initialize(&self.backend_config)?;

        *self.chains.write().expect("gateway chains lock") = Some(Chains { save, validate });
        *self.state.lock().expect("gateway state lock") = State::Initialized;
        Ok(())
    }

    fn compose(&self, line: &str) -> Result<Arc<dyn Processor>, service::InitError> {
        let mut decorators = Vec::new();
        for name in line.split('|').filter(|name| !name.is_empty()) {
            let factory = self
                .registry
                .get(name)
                .ok_or_else(|| service::InitError::UnknownProcessor(name.to_owned()))?;
            decorators.push(factory(&self.svc));
        }
        Ok(Arc::from(decorate(decorators)))
    }

    /// Spawn the worker pool and start accepting work.
    ///
    /// # Errors
    ///
    /// * [`service::InitError::WrongState`] unless initialized
    pub fn start(&self) -> Result<(), service::InitError> {
        {
            let state = self.state.lock().expect("gateway state lock");
            if *state != State::Initialized {
                return Err(service::InitError::WrongState(state.name(), "Initialized"));
            }
        }
        let chains = self
            .chains
            .read()
            .expect("gateway chains lock")
            .clone()
            .expect("chains are composed during initialize");

        let (sender, receiver) = mpsc::channel::<Request>(self.config.workers_size.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let mut workers = self.workers.lock().expect("gateway workers lock");
        for worker_id in 0..self.config.workers_size.max(1) {
            workers.push(tokio::spawn(worker(
                worker_id,
                receiver.clone(),
                chains.clone(),
            )));
        }

        *self.sender.write().expect("gateway sender lock") = Some(sender);
        *self.state.lock().expect("gateway state lock") = State::Running;
        tracing::info!(workers = self.config.workers_size.max(1), "Backend started.");
        Ok(())
    }

    /// Run the envelope through the save chain under `task` and hand it
    /// back together with the SMTP reply for the client.
    ///
    /// The envelope comes back as `None` only when a worker vanished
    /// mid-call (shutdown race); the caller must treat the connection as
    /// dead.
    pub async fn process(&self, envelope: Envelope, task: Task) -> (Option<Envelope>, Reply) {
        let queued_id = envelope.queued_id.clone();
        match self.dispatch(envelope, task).await {
            Err(envelope) => (
                envelope,
                canned().fail_backend_transaction.with_detail("backend not running"),
            ),
            Ok((envelope, Ok(reply))) => {
                // the untouched default result becomes the queued
                // confirmation, anything a processor substituted goes
                // out verbatim
                let reply = if reply.code() == DEFAULT_OK_CODE && reply.text() == DEFAULT_OK_TEXT {
                    canned().success_message_queued.with_detail(&queued_id)
                } else {
                    reply
                };
                (Some(envelope), reply)
            }
            Ok((envelope, Err(error))) => {
                tracing::warn!(%task, %error, "Backend chain failed.");
                (Some(envelope), error.reply().clone())
            }
        }
    }

    /// Run the envelope through the validate chain. `None` means the
    /// recipient is accepted.
    pub async fn validate_rcpt(&self, envelope: Envelope) -> (Option<Envelope>, Option<Reply>) {
        {
            let chains = self.chains.read().expect("gateway chains lock");
            match chains.as_ref() {
                Some(chains) if chains.validate.is_some() => {}
                // no validate chain configured: accept immediately
                _ => return (Some(envelope), None),
            }
        }
        match self.dispatch(envelope, Task::ValidateRcpt).await {
            Err(envelope) => (
                envelope,
                Some(canned().fail_backend_transaction.with_detail("backend not running")),
            ),
            Ok((envelope, Ok(_))) => (Some(envelope), None),
            Ok((envelope, Err(error))) => {
                tracing::info!(%error, "Recipient rejected by the backend.");
                (Some(envelope), Some(error.reply().clone()))
            }
        }
    }

    // send to a worker and wait for the envelope to come back.
    // Err(Some(envelope)) = gateway not running, envelope untouched.
    async fn dispatch(
        &self,
        envelope: Envelope,
        task: Task,
    ) -> Result<(Envelope, ProcessorResult), Option<Envelope>> {
        let sender = {
            let guard = self.sender.read().expect("gateway sender lock");
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(Some(envelope));
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if let Err(rejected) = sender
            .send(Request {
                envelope,
                task,
                reply: reply_tx,
            })
            .await
        {
            return Err(Some(rejected.0.envelope));
        }
        // a worker always answers; a dropped reply channel means the
        // pool died under us and the envelope is gone with it
        reply_rx.await.map_err(|_| None)
    }

    /// Stop accepting work, drain in-flight envelopes within the grace
    /// period, then run the registered shutdowners.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().expect("gateway state lock");
            if *state == State::Shutdown {
                return;
            }
            *state = State::Shutdown;
        }
        // dropping the sender lets idle workers drain and exit
        *self.sender.write().expect("gateway sender lock") = None;

        let workers = std::mem::take(&mut *self.workers.lock().expect("gateway workers lock"));
        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("Backend workers did not drain in time, forcing shutdown.");
        }

        self.svc.shutdown();
        tracing::info!("Backend shut down.");
    }
}

async fn worker(worker_id: usize, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Request>>>, chains: Chains) {
    loop {
        let request = { receiver.lock().await.recv().await };
        let Some(Request {
            mut envelope,
            task,
            reply,
        }) = request
        else {
            tracing::debug!(worker_id, "Backend worker draining out.");
            return;
        };

        let chain = match task {
            Task::ValidateRcpt => chains
                .validate
                .clone()
                .unwrap_or_else(|| chains.save.clone()),
            Task::SaveMail | Task::SecurityChecks | Task::Test => chains.save.clone(),
        };

        // a panicking processor must not take the worker down; the
        // envelope lives outside the future and survives the unwind
        let outcome = std::panic::AssertUnwindSafe(chain.process(&mut envelope, task))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                tracing::error!(worker_id, %message, "Backend worker recovered from a panic.");
                Err(crate::ProcessorError::new(
                    canned().fail_backend_transaction.clone(),
                    format!("processor panicked: {message}"),
                ))
            }
        };
        let _ = reply.send((envelope, result));
    }
}

#[cfg(test)]
mod tests {
    use super::Gateway;
    use crate::{BackendConfig, Task};
    use guerrilla_common::Address;
    use guerrilla_mail::Envelope;

    fn config(raw: &str) -> BackendConfig {
        serde_json::from_str(raw).unwrap()
    }

    fn envelope() -> Envelope {
        let mut envelope = Envelope::new("127.0.0.1", 1);
        envelope.mail_from = Some(Address::new("test", "example.com"));
        envelope.rcpt_to.push(Address::new("to", "grr.la"));
        envelope
            .data
            .extend_from_slice(b"Subject: Test\r\n\r\nThis is a test.\r\n");
        envelope
    }

    async fn running_gateway(raw: &str) -> Gateway {
        let gateway = Gateway::new(config(raw)).unwrap();
        gateway.initialize().unwrap();
        gateway.start().unwrap();
        gateway
    }

    #[tokio::test]
    async fn default_chain_queues_the_message() {
        let gateway = running_gateway(r#"{ "workers_size": 2 }"#).await;

        let envelope = envelope();
        let queued_id = envelope.queued_id.clone();
        let (envelope, reply) = gateway.process(envelope, Task::SaveMail).await;

        assert!(envelope.is_some());
        assert_eq!(reply.code(), 250);
        assert!(reply.text().contains("queued as"));
        assert!(reply.text().contains(&queued_id));
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_processor_aborts_initialization() {
        let gateway = Gateway::new(config(r#"{ "save_process": "Debugger|NoSuchThing" }"#)).unwrap();
        let error = gateway.initialize().unwrap_err();
        assert!(error.to_string().contains("NoSuchThing"));
    }

    #[tokio::test]
    async fn lifecycle_is_enforced() {
        let gateway = Gateway::new(config("{}")).unwrap();
        // start before initialize
        assert!(gateway.start().is_err());
        gateway.initialize().unwrap();
        assert!(gateway.initialize().is_err());
    }

    #[tokio::test]
    async fn empty_validate_chain_accepts_recipients() {
        let gateway = running_gateway("{}").await;
        let (envelope, rejection) = gateway.validate_rcpt(envelope()).await;
        assert!(envelope.is_some());
        assert!(rejection.is_none());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn a_panicking_processor_does_not_kill_the_pool() {
        // sleep_seconds == 1 is the deliberate fault-injection hook
        let gateway = running_gateway(
            r#"{ "save_process": "Debugger", "sleep_seconds": 1, "workers_size": 1 }"#,
        )
        .await;

        let (returned, reply) = gateway.process(envelope(), Task::SaveMail).await;
        assert!(returned.is_some());
        assert_eq!(reply.code(), 554);
        assert!(!reply.text().contains("backend not running"));

        // the single worker recovered and serves the next call instead
        // of leaving it hanging on a dead pool
        let (returned, reply) = gateway.process(envelope(), Task::SaveMail).await;
        assert!(returned.is_some());
        assert_eq!(reply.code(), 554);
        assert!(!reply.text().contains("backend not running"));

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn process_after_shutdown_reports_backend_down() {
        let gateway = running_gateway("{}").await;
        gateway.shutdown().await;
        let (envelope, reply) = gateway.process(envelope(), Task::SaveMail).await;
        assert!(envelope.is_some());
        assert_eq!(reply.code(), 554);
        assert!(reply.text().contains("backend not running"));
    }
}
