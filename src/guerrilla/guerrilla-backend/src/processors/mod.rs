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

//! The built-in processors. Each module exposes a `decorator` factory
//! the registry maps its name to.

pub mod content_parser;
pub mod db_redis;
pub mod debugger;
pub mod dkim;
pub mod hasher;
pub mod header;
pub mod headers_parser;
pub mod local_files;
pub mod redis;
pub mod s3;
pub mod spf;
