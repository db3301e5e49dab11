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

//! Hashing and compression helpers shared by the storage processors.

use blake2::digest::consts::U16;
use blake2::digest::Mac;
use std::io::Write;

type Blake2sMac128 = blake2::Blake2sMac<U16>;

// Keyed hashing with an all-zero key, for compatibility with existing
// stores keyed by the original implementation.
const ZERO_KEY: [u8; 16] = [0; 16];

/// BLAKE2s-128 over the concatenation of `parts`, lowercase hex.
#[must_use]
pub fn blake2s128_hex(parts: &[&[u8]]) -> String {
    let mut mac =
        Blake2sMac128::new_from_slice(&ZERO_KEY).expect("a 16 byte key is valid for blake2s");
    for part in parts {
        mac.update(part);
    }
    hex(&mac.finalize().into_bytes())
}

/// MD5 over the concatenation of `parts`, lowercase hex.
#[deprecated(note = "kept for stores written by old deployments, use blake2s128_hex")]
#[must_use]
pub fn md5_hex(parts: &[&[u8]]) -> String {
    let mut context = md5::Context::new();
    for part in parts {
        context.consume(part);
    }
    format!("{:x}", context.compute())
}

/// zlib-compress the concatenation of `parts` at best-speed level.
#[must_use]
pub fn compress(parts: &[&[u8]]) -> Vec<u8> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
    for part in parts {
        // writing to a Vec cannot fail
        let _ = encoder.write_all(part);
    }
    encoder.finish().unwrap_or_default()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::{blake2s128_hex, compress};
    use std::io::Read;

    // expected values produced by the original implementation
    #[test]
    fn blake2s_vectors() {
        assert_eq!(
            blake2s128_hex(&[b"example"]),
            "8b944eb07157cea5041a4b209fda1f09"
        );
        assert_eq!(
            blake2s128_hex(&[b"example", b"string", b"arguments"]),
            "9645451b82265ee62552a4a1a12bc285"
        );
        assert_eq!(blake2s128_hex(&[b""]), "69c907decfc59db6ceec48fb3412eccc");
        assert_eq!(blake2s128_hex(&[]), "69c907decfc59db6ceec48fb3412eccc");
        assert_eq!(
            blake2s128_hex(&["♥️ unicode input".as_bytes()]),
            "900fdd1d2a1c73d69a60fe08721e8ddc"
        );
    }

    #[test]
    #[allow(deprecated)]
    fn md5_vectors() {
        assert_eq!(
            super::md5_hex(&[b"example"]),
            "1a79a4d60de6718e8e5b326e338ae533"
        );
        assert_eq!(
            super::md5_hex(&[b"example", b"string", b"arguments"]),
            "3a64be4275748ae9b712864a9d827405"
        );
        assert_eq!(super::md5_hex(&[]), "d41d8cd98f00b204e9800998ecf8427e");
    }

    // compressed bytes are codec-specific, assert the round trip instead
    #[test]
    fn compress_round_trips() {
        let compressed = compress(&[b"example", b"string", b"arguments"]);
        let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "examplestringarguments");
    }

    #[test]
    fn compress_handles_empty_input() {
        let compressed = compress(&[]);
        let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut out).unwrap();
        assert!(out.is_empty());
    }
}
