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

use crate::client::Client;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{Notify, Semaphore};

/// Why a borrow failed.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool stopped handing out clients.
    #[error("pool is shutting down")]
    ShuttingDown,
}

/// Fixed-capacity pool of reusable client slots.
///
/// `borrow` blocks until a slot frees up or shutdown is signaled. While
/// shutting down new borrows fail, existing borrowers drain, and
/// [`ClientPool::shutdown_wait`] blocks until the last one returned.
#[derive(Debug)]
pub struct ClientPool {
    free: Mutex<Vec<Client>>,
    permits: Semaphore,
    active: AtomicUsize,
    shutting_down: AtomicBool,
    shutdown_signal: Notify,
    drained: Notify,
}

impl ClientPool {
    /// A pool serving up to `capacity` concurrent connections.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            permits: Semaphore::new(capacity.max(1)),
            active: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Take a client seeded with the accepted connection, waiting for a
    /// free slot.
    ///
    /// # Errors
    ///
    /// * [`PoolError::ShuttingDown`] before or while waiting
    pub async fn borrow(
        &self,
        stream: tokio::net::TcpStream,
        client_id: u64,
    ) -> Result<Client, PoolError> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        tokio::select! {
            permit = self.permits.acquire() => {
                permit.expect("client pool semaphore is never closed").forget();
            }
            () = self.shutdown_signal.notified() => {
                return Err(PoolError::ShuttingDown);
            }
        }
        self.active.fetch_add(1, Ordering::SeqCst);

        let mut client = self
            .free
            .lock()
            .expect("client pool lock")
            .pop()
            .unwrap_or_else(Client::idle);
        client.reseed(stream, client_id);
        Ok(client)
    }

    /// Return a finished client, freeing its slot.
    pub fn give_back(&self, client: Client) {
        self.free.lock().expect("client pool lock").push(client);
        self.permits.add_permits(1);
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Connections currently being served.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop handing out clients; waiting borrowers fail immediately.
    pub fn shutdown_state(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_signal.notify_waiters();
    }

    ///
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Block until every borrowed client came back.
    pub async fn shutdown_wait(&self) {
        loop {
            let drained = self.drained.notified();
            if self.active_count() == 0 {
                return;
            }
            drained.await;
        }
    }
}
