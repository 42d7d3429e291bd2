// Copyright 2020-2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::io::BufReader;
use std::path::Path;

use crate::defs;
use crate::util::LockedFile;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),
    SerdeError(serde_json::error::Error),
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Log {
    pub level: LogLevel,
    pub enable_timestamp: Option<bool>,
}

/// Object store configuration, read from a JSON file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_store_path")]
    pub store_path: String,
    pub log: Option<Log>,
}

impl StoreConfig {
    /// Load the config from `path`.
    /// The config file lock is held only until the data is read and parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut file = LockedFile::open_ro(path).map_err(Error::IoError)?;
        serde_json::from_reader(BufReader::new(file.as_mut_file())).map_err(Error::SerdeError)
    }

    fn default_store_path() -> String {
        defs::DEFAULT_STORE_PATH.to_string()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_path: Self::default_store_path(),
            log: None,
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(src: LogLevel) -> Self {
        match src {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}
