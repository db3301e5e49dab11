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

use guerrilla_config::BackendConfig;
use std::sync::{Arc, Mutex, OnceLock};

/// Error from an initializer. Any of these aborts gateway startup.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// A typed config slice could not be extracted from `backend_config`.
    #[error("invalid backend config: {0}")]
    Config(#[from] serde_json::Error),
    /// A processor resource (connection pool, resolver, …) failed to
    /// come up.
    #[error("backend resource failed: {0}")]
    Resource(String),
    /// A chain names a processor the registry does not know.
    #[error("config names unknown processor {0:?}")]
    UnknownProcessor(String),
    /// A lifecycle call arrived in the wrong gateway state.
    #[error("gateway is in state {0:?}, expected {1:?}")]
    WrongState(&'static str, &'static str),
}

type Initializer = Box<dyn Fn(&BackendConfig) -> Result<(), InitError> + Send + Sync>;
type Shutdowner = Box<dyn Fn() + Send + Sync>;

/// Shared registry the decorators hang their lifecycle callbacks on.
///
/// Factories register initializers while the chain is being composed;
/// the gateway runs them in registration order before any process call.
/// Shutdowners run, in order, when the gateway shuts down.
#[derive(Default)]
pub struct ServiceRegistry {
    initializers: Mutex<Vec<Initializer>>,
    shutdowners: Mutex<Vec<Shutdowner>>,
}

impl ServiceRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback run at gateway start.
    pub fn add_initializer(
        &self,
        callback: impl Fn(&BackendConfig) -> Result<(), InitError> + Send + Sync + 'static,
    ) {
        self.initializers
            .lock()
            .expect("service registry lock")
            .push(Box::new(callback));
    }

    /// Register a callback run at gateway shutdown.
    pub fn add_shutdowner(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shutdowners
            .lock()
            .expect("service registry lock")
            .push(Box::new(callback));
    }

    /// Shorthand for the common case: an initializer that extracts the
    /// processor's typed config slice into a cell the decorator holds.
    pub fn register_config<C>(&self) -> Arc<OnceLock<C>>
    where
        C: serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        let cell = Arc::new(OnceLock::<C>::new());
        let for_initializer = cell.clone();
        self.add_initializer(move |backend_config| {
            let config = extract_config::<C>(backend_config)?;
            // a rebuilt gateway composes fresh decorators with fresh cells
            let _ = for_initializer.set(config);
            Ok(())
        });
        cell
    }

    /// Run every initializer in registration order; the first error
    /// aborts.
    ///
    /// # Errors
    ///
    /// * the error of the failing initializer
    pub fn initialize(&self, backend_config: &BackendConfig) -> Result<(), InitError> {
        for initializer in self
            .initializers
            .lock()
            .expect("service registry lock")
            .iter()
        {
            initializer(backend_config)?;
        }
        Ok(())
    }

    /// Run every shutdowner in registration order.
    pub fn shutdown(&self) {
        for shutdowner in self
            .shutdowners
            .lock()
            .expect("service registry lock")
            .iter()
        {
            shutdowner();
        }
    }
}

/// Deserialize a typed slice out of the flat backend config map.
/// Unknown keys are other processors' business and are ignored.
///
/// # Errors
///
/// * [`InitError::Config`] when present keys carry the wrong shape
pub fn extract_config<C: serde::de::DeserializeOwned>(
    backend_config: &BackendConfig,
) -> Result<C, InitError> {
    Ok(serde_json::from_value(serde_json::Value::Object(
        backend_config.clone(),
    ))?)
}

#[cfg(test)]
mod tests {
    use super::{extract_config, InitError, ServiceRegistry};
    use guerrilla_config::BackendConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default, serde::Deserialize)]
    struct DebugSlice {
        #[serde(default)]
        log_received_mails: bool,
        #[serde(default)]
        sleep_seconds: u64,
    }

    fn config(raw: &str) -> BackendConfig {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn extracts_a_typed_slice_ignoring_foreign_keys() {
        let backend_config = config(
            r#"{ "log_received_mails": true, "save_process": "Debugger", "redis_expire_seconds": 7200 }"#,
        );
        let slice: DebugSlice = extract_config(&backend_config).unwrap();
        assert!(slice.log_received_mails);
        assert_eq!(slice.sleep_seconds, 0);
    }

    #[test]
    fn wrong_shapes_are_an_error() {
        let backend_config = config(r#"{ "sleep_seconds": "not a number" }"#);
        assert!(extract_config::<DebugSlice>(&backend_config).is_err());
    }

    #[test]
    fn initializers_run_in_order_and_stop_at_the_first_error() {
        let registry = ServiceRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        registry.add_initializer(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.add_initializer(|_| Err(InitError::Resource("boom".into())));
        let c = counter.clone();
        registry.add_initializer(move |_| {
            c.fetch_add(100, Ordering::SeqCst);
            Ok(())
        });

        assert!(registry.initialize(&BackendConfig::new()).is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn register_config_fills_the_cell_at_initialize() {
        let registry = ServiceRegistry::new();
        let cell = registry.register_config::<DebugSlice>();
        assert!(cell.get().is_none());

        registry
            .initialize(&config(r#"{ "log_received_mails": true }"#))
            .unwrap();
        assert!(cell.get().unwrap().log_received_mails);
    }
}
