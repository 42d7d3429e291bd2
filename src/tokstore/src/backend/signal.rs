// Copyright 2020-2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::debug;
use serde::{Deserialize, Serialize};

use tokstore_common::defs;
use tokstore_common::util::LockedFile;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),
    SerdeError(serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// "Something changed" notification for a token directory.
///
/// Any party that adds or removes object files calls `trigger()`. Readers call
/// `was_triggered()`, which reports whether a trigger happened since this instance last
/// looked, and clears that pending state.
pub trait ChangeSignal: Send + Sync {
    fn trigger(&self) -> Result<()>;
    fn was_triggered(&self) -> bool;
}

#[derive(Default, Deserialize, Serialize)]
struct SyncState {
    generation: u64,
}

impl SyncState {
    fn load(file: &mut LockedFile) -> Result<Self> {
        let mut buf = String::new();
        BufReader::new(file.as_mut_file())
            .read_to_string(&mut buf)
            .map_err(Error::IoError)?;
        if buf.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&buf).map_err(Error::SerdeError)
    }

    fn store(&self, file: &mut LockedFile) -> Result<()> {
        file.seek(SeekFrom::Start(0)).map_err(Error::IoError)?;
        file.set_len(0).map_err(Error::IoError)?;
        let mut writer = BufWriter::new(file.as_mut_file());
        serde_json::to_writer(&mut writer, self).map_err(Error::SerdeError)?;
        writer.flush().map_err(Error::IoError)
    }
}

/// Cross-process change signal, backed by a generation counter file inside the token
/// directory. Every process (and every `FileSignal` instance) tracks the last generation it
/// has seen.
pub struct FileSignal {
    path: PathBuf,
    seen: AtomicU64,
}

impl FileSignal {
    /// Attach to the signal of the token at `token_path`, creating the counter file if needed.
    /// Triggers that happened before this call are not reported.
    pub fn create<P: AsRef<Path>>(token_path: P) -> Result<Self> {
        let path = token_path.as_ref().join(defs::TOKEN_SYNC_FILE);
        let mut file = LockedFile::open_or_create_rw(&path).map_err(Error::IoError)?;
        let state = SyncState::load(&mut file)?;
        Ok(Self {
            path,
            seen: AtomicU64::new(state.generation),
        })
    }

    fn generation(&self) -> Result<u64> {
        let mut file = match LockedFile::open_ro(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Restart the counter. The generation change is reported once.
                debug!("Recreating {}", self.path.display());
                LockedFile::open_or_create_rw(&self.path).map_err(Error::IoError)?
            }
            Err(e) => return Err(Error::IoError(e)),
        };
        SyncState::load(&mut file).map(|s| s.generation)
    }
}

impl ChangeSignal for FileSignal {
    fn trigger(&self) -> Result<()> {
        let mut file = LockedFile::open_or_create_rw(&self.path).map_err(Error::IoError)?;
        let mut state = SyncState::load(&mut file)?;
        state.generation = state.generation.wrapping_add(1);
        state.store(&mut file)
    }

    fn was_triggered(&self) -> bool {
        match self.generation() {
            Ok(generation) => self.seen.swap(generation, Ordering::SeqCst) != generation,
            Err(e) => {
                // Report a change: the caller re-validates the token and finds out what broke.
                debug!("Unable to read {}: {:?}", self.path.display(), e);
                true
            }
        }
    }
}

/// In-process change signal. Useful when a single process owns the token directory, and for
/// driving re-indexing deterministically in tests.
#[derive(Default)]
pub struct ManualSignal {
    pending: AtomicBool,
}

impl ManualSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChangeSignal for ManualSignal {
    fn trigger(&self) -> Result<()> {
        self.pending.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn was_triggered(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

impl<T: ChangeSignal + ?Sized> ChangeSignal for std::sync::Arc<T> {
    fn trigger(&self) -> Result<()> {
        (**self).trigger()
    }

    fn was_triggered(&self) -> bool {
        (**self).was_triggered()
    }
}
