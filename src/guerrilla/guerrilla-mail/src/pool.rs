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

use crate::Envelope;
use std::sync::Mutex;
use tokio::sync::Semaphore;

/// A sized pool of lazily allocated envelopes.
///
/// At most `capacity` envelopes are out at any time; further borrowers
/// wait. Returned envelopes keep their buffers and are reseeded on the
/// next borrow.
#[derive(Debug)]
pub struct Pool {
    free: Mutex<Vec<Envelope>>,
    permits: Semaphore,
}

impl Pool {
    /// A pool handing out up to `capacity` envelopes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            permits: Semaphore::new(capacity),
        }
    }

    /// Take an envelope seeded for the given connection, waiting for one
    /// to be returned when the pool is exhausted.
    pub async fn borrow(&self, remote_ip: impl Into<String>, client_id: u64) -> Envelope {
        self.permits
            .acquire()
            .await
            .expect("envelope pool semaphore is never closed")
            .forget();
        let recycled = self.free.lock().expect("envelope pool lock").pop();
        match recycled {
            Some(mut envelope) => {
                envelope.reseed(remote_ip, client_id);
                envelope
            }
            None => Envelope::new(remote_ip, client_id),
        }
    }

    /// Give an envelope back, freeing a slot.
    pub fn give_back(&self, envelope: Envelope) {
        self.free.lock().expect("envelope pool lock").push(envelope);
        self.permits.add_permits(1);
    }

    /// Free a slot whose envelope is unrecoverable (lost to a dying
    /// backend worker). The replacement is allocated lazily.
    pub fn forfeit(&self) {
        self.permits.add_permits(1);
    }
}
