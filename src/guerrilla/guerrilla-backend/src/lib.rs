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

//! The backend: a gateway dispatching envelopes to a worker pool, each
//! worker walking a configurable chain of processor decorators.

#![doc(html_no_source)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod gateway;
mod processor;
pub mod processors;
mod service;
pub mod util;

pub use gateway::Gateway;
pub use guerrilla_config::BackendConfig;
pub use processor::{
    decorate, Decorator, DefaultProcessor, Processor, ProcessorError, ProcessorResult, Task,
};
pub use service::{InitError, ServiceRegistry};

use std::collections::HashMap;

/// A named processor constructor: builds a [`Decorator`] and registers
/// its initializers/shutdowners with the service registry.
pub type ProcessorFactory = fn(&ServiceRegistry) -> Decorator;

/// The name → factory map the gateway resolves chain configs against.
///
/// Names are matched case-insensitively. The plugin-style global map of
/// the original is an explicit value here; embedders may add their own
/// entries before handing the registry to a gateway.
pub struct ProcessorRegistry {
    map: HashMap<String, ProcessorFactory>,
}

impl ProcessorRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// The registry with every built-in processor.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("header", processors::header::decorator);
        registry.register("headersparser", processors::headers_parser::decorator);
        registry.register("contentparser", processors::content_parser::decorator);
        registry.register("debugger", processors::debugger::decorator);
        registry.register("dkim", processors::dkim::decorator);
        registry.register("spf", processors::spf::decorator);
        registry.register("hasher", processors::hasher::decorator);
        registry.register("redis", processors::redis::decorator);
        registry.register("s3", processors::s3::decorator);
        registry.register("localfiles", processors::local_files::decorator);
        registry.register("guerrilladbredis", processors::db_redis::decorator);
        registry
    }

    /// Add or replace a factory under `name`.
    pub fn register(&mut self, name: &str, factory: ProcessorFactory) {
        self.map.insert(name.to_lowercase(), factory);
    }

    /// Look a factory up, case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ProcessorFactory> {
        self.map.get(&name.to_lowercase()).copied()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
