// Copyright 2020-2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::pkcs11;
use tokstore_common::util::LockedFile;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),
    SerdeError(serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable identifier of an object within the token that indexed it. Handles are never reused
/// for the lifetime of the token, even after the backing file is removed.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectHandle(u64);

impl From<usize> for ObjectHandle {
    fn from(src: usize) -> Self {
        Self(src as u64)
    }
}

impl From<u64> for ObjectHandle {
    fn from(src: u64) -> Self {
        Self(src)
    }
}

impl From<ObjectHandle> for u64 {
    fn from(src: ObjectHandle) -> Self {
        src.0
    }
}

impl From<ObjectHandle> for usize {
    fn from(src: ObjectHandle) -> Self {
        src.0 as usize
    }
}

/// A typed attribute value, as persisted in an object file.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Attr {
    Bytes(Vec<u8>),
    Ulong(pkcs11::CK_ULONG),
    Bool(bool),
}

impl Attr {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_ulong(&self) -> Option<pkcs11::CK_ULONG> {
        match self {
            Self::Ulong(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for Attr {
    fn from(src: Vec<u8>) -> Self {
        Self::Bytes(src)
    }
}

impl From<&[u8]> for Attr {
    fn from(src: &[u8]) -> Self {
        Self::Bytes(src.to_vec())
    }
}

impl From<pkcs11::CK_ULONG> for Attr {
    fn from(src: pkcs11::CK_ULONG) -> Self {
        Self::Ulong(src)
    }
}

impl From<bool> for Attr {
    fn from(src: bool) -> Self {
        Self::Bool(src)
    }
}

/// On-disk layout of an object file.
#[derive(Default, Deserialize, Serialize)]
struct Record {
    attrs: BTreeMap<pkcs11::CK_ATTRIBUTE_TYPE, Attr>,
}

impl Record {
    fn load(file: &mut LockedFile) -> Result<Self> {
        serde_json::from_reader(BufReader::new(file.as_mut_file())).map_err(Error::SerdeError)
    }

    fn store(&self, file: &mut LockedFile) -> Result<()> {
        file.seek(SeekFrom::Start(0)).map_err(Error::IoError)?;
        file.set_len(0).map_err(Error::IoError)?;
        let mut writer = BufWriter::new(file.as_mut_file());
        serde_json::to_writer(&mut writer, self).map_err(Error::SerdeError)?;
        writer.flush().map_err(Error::IoError)
    }
}

struct State {
    valid: bool,
    attrs: BTreeMap<pkcs11::CK_ATTRIBUTE_TYPE, Attr>,
}

/// Back-reference from an object to the token that indexed it.
struct TokenLink {
    token: PathBuf,
    handle: ObjectHandle,
}

/// A persisted object: a set of attributes backed by a single file.
///
/// Reads always reload the file (under a shared lock), so that changes made by other processes
/// are observed. Writes are read-modify-write cycles performed under an exclusive lock.
/// Any load or store failure marks the object invalid until the next successful one.
pub struct ObjectFile {
    path: PathBuf,
    filename: String,
    link: Option<TokenLink>,
    state: Mutex<State>,
}

impl ObjectFile {
    /// Open an existing object file.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let obj = Self::new(path.as_ref());
        obj.refresh();
        obj
    }

    /// Create a new, empty object file. The resulting object is invalid if the file already
    /// exists or cannot be written.
    pub fn create<P: AsRef<Path>>(path: P) -> Self {
        let obj = Self::new(path.as_ref());
        let res = LockedFile::create_new(&obj.path)
            .map_err(Error::IoError)
            .and_then(|mut file| Record::default().store(&mut file));
        match res {
            Ok(()) => obj.lock_state().valid = true,
            Err(e) => warn!("Unable to create object file {}: {:?}", obj.path.display(), e),
        }
        obj
    }

    fn new(path: &Path) -> Self {
        Self {
            filename: path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            link: None,
            state: Mutex::new(State {
                valid: false,
                attrs: BTreeMap::new(),
            }),
        }
    }

    /// Attach this object to the token that owns it.
    pub(crate) fn link_token(mut self, token: &Path, handle: ObjectHandle) -> Self {
        self.link = Some(TokenLink {
            token: token.to_path_buf(),
            handle,
        });
        self
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        // The state is replaced as a whole on every load/store, so it is consistent even if a
        // holder panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the last load or store of this object succeeded. No I/O is performed.
    pub fn is_valid(&self) -> bool {
        self.lock_state().valid
    }

    /// Reload the object from disk and report whether it is (still) valid.
    pub fn refresh(&self) -> bool {
        let mut state = self.lock_state();
        let res = LockedFile::open_ro(&self.path)
            .map_err(Error::IoError)
            .and_then(|mut file| Record::load(&mut file));
        match res {
            Ok(record) => {
                state.attrs = record.attrs;
                state.valid = true;
            }
            Err(e) => {
                if state.valid {
                    debug!("Object file {} became invalid: {:?}", self.path.display(), e);
                }
                state.attrs.clear();
                state.valid = false;
            }
        }
        state.valid
    }

    pub fn attr(&self, attr_type: pkcs11::CK_ATTRIBUTE_TYPE) -> Option<Attr> {
        if !self.refresh() {
            return None;
        }
        self.lock_state().attrs.get(&attr_type).cloned()
    }

    pub fn attr_exists(&self, attr_type: pkcs11::CK_ATTRIBUTE_TYPE) -> bool {
        self.refresh() && self.lock_state().attrs.contains_key(&attr_type)
    }

    pub fn set_attr(&self, attr_type: pkcs11::CK_ATTRIBUTE_TYPE, attr: Attr) -> Result<()> {
        self.modify(|attrs| {
            attrs.insert(attr_type, attr);
        })
    }

    pub fn remove_attr(&self, attr_type: pkcs11::CK_ATTRIBUTE_TYPE) -> Result<()> {
        self.modify(|attrs| {
            attrs.remove(&attr_type);
        })
    }

    fn modify<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<pkcs11::CK_ATTRIBUTE_TYPE, Attr>),
    {
        let mut state = self.lock_state();
        let res = LockedFile::open_rw(&self.path)
            .map_err(Error::IoError)
            .and_then(|mut file| {
                let mut record = Record::load(&mut file)?;
                f(&mut record.attrs);
                record.store(&mut file)?;
                Ok(record)
            });
        match res {
            Ok(record) => {
                state.attrs = record.attrs;
                state.valid = true;
                Ok(())
            }
            Err(e) => {
                warn!("Unable to update object file {}: {:?}", self.path.display(), e);
                state.valid = false;
                Err(e)
            }
        }
    }

    /// Name of the backing file (i.e. the last component of its path).
    pub fn filename(&self) -> &str {
        self.filename.as_str()
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Handle assigned by the owning token, if this object was indexed by one.
    pub fn handle(&self) -> Option<ObjectHandle> {
        self.link.as_ref().map(|l| l.handle)
    }

    /// Path of the owning token, if this object was indexed by one.
    pub fn token(&self) -> Option<&Path> {
        self.link.as_ref().map(|l| l.token.as_path())
    }
}
