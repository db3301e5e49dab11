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

/// Error while reading from or writing to the wire.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Peer closed the connection.
    #[error("connection closed by peer")]
    Eof,
    /// A line grew past its limit before the terminator showed up.
    #[error("maximum line length exceeded ({limit} bytes)")]
    LineLimitExceeded {
        /// The limit that was in force.
        limit: usize,
    },
    /// The unstuffed DATA payload grew past the configured maximum.
    #[error("maximum message size exceeded ({limit} bytes)")]
    MessageSizeExceeded {
        /// The limit that was in force.
        limit: usize,
    },
    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
