// Copyright 2020-2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod flock;

pub use flock::LockedFile;

use std::fmt::Write;
use std::fs::OpenOptions;
use std::io::Read;

/// Read `len` bytes from the system CSPRNG and return them hex-encoded.
pub fn random_hex(len: usize) -> Result<String, std::io::Error> {
    OpenOptions::new()
        .read(true)
        .open("/dev/urandom")
        .and_then(|mut file| {
            let mut buf = vec![0u8; len];
            file.read_exact(buf.as_mut_slice())?;
            Ok(bytes_to_hex(buf.as_slice()))
        })
}

pub fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Writing to a String only fails on OOM.
        write!(hex, "{:02x}", b).unwrap_or_default();
    }
    hex
}
