// Copyright 2020-2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{info, warn};

use super::directory::Directory;
use super::token::{self, TokenIndex};
use tokstore_common::config::StoreConfig;
use tokstore_common::defs;
use tokstore_common::logger::Logger;
use tokstore_common::util;

#[derive(Debug)]
pub enum Error {
    RngError(std::io::Error),
    StoreDirInvalid,
    StoreLockPoisoned,
    TokenError(token::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RngError(e) => write!(f, "rng error: {}", e),
            Self::StoreDirInvalid => write!(f, "store directory is not usable"),
            Self::StoreLockPoisoned => write!(f, "store lock poisoned"),
            Self::TokenError(e) => write!(f, "token error: {}", e),
        }
    }
}

/// The set of tokens kept in a store directory, one token per sub-directory.
pub struct ObjectStore {
    path: PathBuf,
    tokens: Mutex<Vec<Arc<TokenIndex>>>,
}

impl ObjectStore {
    /// Initialize logging as per `config`, then open the configured store directory.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Logger::init(config.log.clone());
        Self::open(config.store_path.as_str())
    }

    /// Open every token found under `path`. Sub-directories that don't hold a valid token are
    /// skipped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let dir = Directory::new(path.as_ref());
        if !dir.is_valid() {
            return Err(Error::StoreDirInvalid);
        }

        let mut tokens = Vec::new();
        for name in dir.subdirs() {
            match TokenIndex::open(dir.path().join(&name)) {
                Ok(token) => tokens.push(Arc::new(token)),
                Err(e) => warn!("Skipping {}: {}", name, e),
            }
        }
        info!(
            "Opened object store {} with {} token(s)",
            dir.path().display(),
            tokens.len()
        );

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            tokens: Mutex::new(tokens),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn tokens(&self) -> Result<Vec<Arc<TokenIndex>>> {
        self.tokens
            .lock()
            .map(|tokens| tokens.clone())
            .map_err(|_| Error::StoreLockPoisoned)
    }

    pub fn token_count(&self) -> Result<usize> {
        self.tokens
            .lock()
            .map(|tokens| tokens.len())
            .map_err(|_| Error::StoreLockPoisoned)
    }

    pub fn token(&self, index: usize) -> Option<Arc<TokenIndex>> {
        self.tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(index).cloned())
    }

    /// Create a new token with a random directory name and serial number.
    pub fn new_token(&self, label: &[u8]) -> Result<Arc<TokenIndex>> {
        let token_dir = util::random_hex(defs::TOKEN_DIR_NAME_BYTES).map_err(Error::RngError)?;
        let serial = util::random_hex(defs::TOKEN_SERIAL_LEN / 2).map_err(Error::RngError)?;

        let token = TokenIndex::create(&self.path, token_dir.as_str(), label, serial.as_bytes())
            .map(Arc::new)
            .map_err(Error::TokenError)?;
        self.tokens
            .lock()
            .map_err(|_| Error::StoreLockPoisoned)?
            .push(Arc::clone(&token));
        Ok(token)
    }
}
