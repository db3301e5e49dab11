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

//! The SMTP server: listener, client pool, per-connection protocol
//! state machine and the daemon wiring around them.

#![doc(html_no_source)]
#![forbid(unsafe_code)]
//
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod daemon;
mod hosts;
mod pool;
mod server;

pub use client::Client;
pub use daemon::Daemon;
pub use hosts::AllowedHosts;
pub use pool::{ClientPool, PoolError};
pub use server::Server;

/// Version string advertised in the greeting.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
