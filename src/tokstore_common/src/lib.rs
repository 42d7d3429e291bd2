// Copyright 2020-2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

extern crate libc;

pub mod config;
pub mod logger;
pub mod util;

pub mod defs {
    /// Default location of the token store, i.e. the directory holding one sub-directory per
    /// token.
    pub const DEFAULT_STORE_PATH: &str = "/var/lib/tokstore/tokens";

    /// Name of the per-token metadata record (label, serial, flags, PIN blobs), stored inside
    /// the token directory.
    pub const TOKEN_OBJECT_FILE: &str = "tokenObject";
    /// Name of the per-token change counter used for cross-process re-indexing.
    pub const TOKEN_SYNC_FILE: &str = "tokenSync";
    /// Every file in a token directory with this suffix is a stored object. Anything else is
    /// ignored by the indexer.
    pub const OBJECT_FILE_SUFFIX: &str = ".object";
    /// Number of random bytes used to name a new object file (hex-encoded).
    pub const OBJECT_NAME_BYTES: usize = 16;
    /// Number of random bytes used to name a new token directory (hex-encoded).
    pub const TOKEN_DIR_NAME_BYTES: usize = 16;

    /// Minimum length (in bytes) of a token label.
    pub const TOKEN_MIN_LABEL_LEN: usize = 1;
    /// Maximum length (in bytes) of a token label.
    pub const TOKEN_MAX_LABEL_LEN: usize = 32;
    /// Length (in bytes) of a token serial number.
    pub const TOKEN_SERIAL_LEN: usize = 16;

    pub const DEFAULT_LOG_LEVEL: log::Level = log::Level::Info;
    pub const DEFAULT_LOG_TIMESTAMP: bool = false;
}
