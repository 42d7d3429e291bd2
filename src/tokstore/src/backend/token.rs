// Copyright 2020-2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use super::directory::{self, Directory};
use super::object::{self, Attr, ObjectFile, ObjectHandle};
use super::signal::{self, ChangeSignal, FileSignal};
use crate::pkcs11;
use tokstore_common::defs;
use tokstore_common::util;

#[derive(Debug)]
pub enum Error {
    AttrMissing(pkcs11::CK_ATTRIBUTE_TYPE),
    AttrTypeMismatch(pkcs11::CK_ATTRIBUTE_TYPE),
    BadLabel,
    BadSerial,
    BaseDirInvalid,
    DirectoryError(directory::Error),
    LockPoisoned,
    ObjectCreate,
    ObjectError(object::Error),
    ObjectNotFound,
    RngError(std::io::Error),
    SignalError(signal::Error),
    TokenInvalid,
    TokenObjectInvalid,
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AttrMissing(t) => write!(f, "attribute {:#x} not present", t),
            Self::AttrTypeMismatch(t) => write!(f, "attribute {:#x} has an unexpected type", t),
            Self::BadLabel => write!(f, "invalid token label length"),
            Self::BadSerial => write!(f, "invalid token serial length"),
            Self::BaseDirInvalid => write!(f, "token base directory is not usable"),
            Self::DirectoryError(e) => write!(f, "directory error: {:?}", e),
            Self::LockPoisoned => write!(f, "token lock poisoned"),
            Self::ObjectCreate => write!(f, "unable to create object file"),
            Self::ObjectError(e) => write!(f, "object error: {:?}", e),
            Self::ObjectNotFound => write!(f, "object not found on this token"),
            Self::RngError(e) => write!(f, "rng error: {}", e),
            Self::SignalError(e) => write!(f, "change signal error: {:?}", e),
            Self::TokenInvalid => write!(f, "token is invalid"),
            Self::TokenObjectInvalid => write!(f, "token metadata record is invalid"),
        }
    }
}

/// Flags a freshly created token starts with.
pub const INITIAL_TOKEN_FLAGS: pkcs11::CK_FLAGS = pkcs11::CKF_RNG
    | pkcs11::CKF_LOGIN_REQUIRED
    | pkcs11::CKF_RESTORE_KEY_NOT_NEEDED
    | pkcs11::CKF_TOKEN_INITIALIZED
    | pkcs11::CKF_SO_PIN_LOCKED
    | pkcs11::CKF_SO_PIN_TO_BE_CHANGED;

fn is_object_file(name: &str) -> bool {
    name.len() > defs::OBJECT_FILE_SUFFIX.len() && name.ends_with(defs::OBJECT_FILE_SUFFIX)
}

#[derive(Default)]
struct ObjectSet {
    /// Every object indexed during the lifetime of the token. Slots are never freed, so that
    /// object references handed out earlier stay usable after the file is removed.
    arena: Vec<Arc<ObjectFile>>,
    /// Objects currently believed to exist on disk, by file name.
    live: BTreeMap<String, ObjectHandle>,
    /// Object file names seen by the last index pass.
    current_files: BTreeSet<String>,
}

impl ObjectSet {
    fn get(&self, handle: ObjectHandle) -> Option<Arc<ObjectFile>> {
        self.arena.get(usize::from(handle)).cloned()
    }
}

/// A token backed by a directory.
///
/// The token keeps an index of the `*.object` files found in its directory. The index is
/// rebuilt incrementally whenever the change signal reports that some party (this process or
/// another one) added or removed object files. Object instances are owned by the token;
/// callers get shared references through `objects()`.
pub struct TokenIndex {
    path: PathBuf,
    dir: Directory,
    token_object: ObjectFile,
    signal: Option<Box<dyn ChangeSignal>>,
    valid: AtomicBool,
    objects: Mutex<ObjectSet>,
}

impl TokenIndex {
    /// Open the token stored at `path`, using the cross-process `FileSignal` for change
    /// notification.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::attach(path.as_ref(), |token_path| match FileSignal::create(token_path) {
            Ok(signal) => Some(Box::new(signal) as Box<dyn ChangeSignal>),
            Err(e) => {
                warn!("Unable to attach change signal for {}: {:?}", token_path.display(), e);
                None
            }
        })
        .into_valid()
    }

    /// Open the token stored at `path`, with a caller-provided change signal.
    pub fn open_with_signal<P, S>(path: P, signal: S) -> Result<Self>
    where
        P: AsRef<Path>,
        S: ChangeSignal + 'static,
    {
        Self::attach(path.as_ref(), |_| {
            Some(Box::new(signal) as Box<dyn ChangeSignal>)
        })
        .into_valid()
    }

    fn attach<F>(path: &Path, make_signal: F) -> Self
    where
        F: FnOnce(&Path) -> Option<Box<dyn ChangeSignal>>,
    {
        let dir = Directory::new(path);
        let token_object = ObjectFile::open(path.join(defs::TOKEN_OBJECT_FILE));
        // Don't leave a signal file behind in directories that don't hold a token.
        let signal = if dir.is_valid() && token_object.is_valid() {
            make_signal(path)
        } else {
            None
        };
        let valid = signal.is_some() && dir.is_valid() && token_object.is_valid();

        let token = Self {
            path: path.to_path_buf(),
            dir,
            token_object,
            signal,
            valid: AtomicBool::new(valid),
            objects: Mutex::new(ObjectSet::default()),
        };
        if let Err(e) = token.index(true) {
            debug!("Initial index of {} failed: {}", path.display(), e);
        }
        token
    }

    fn into_valid(self) -> Result<Self> {
        if self.is_valid() {
            debug!("Opened token {}", self.path.display());
            Ok(self)
        } else {
            warn!("Unable to open token {}", self.path.display());
            Err(Error::TokenInvalid)
        }
    }

    /// Provision a new token in `base_path/token_dir` and open it. On failure, nothing created
    /// by this call is left on disk.
    pub fn create<P: AsRef<Path>>(
        base_path: P,
        token_dir: &str,
        label: &[u8],
        serial: &[u8],
    ) -> Result<Self> {
        Self::create_with(
            base_path.as_ref(),
            token_dir,
            label,
            serial,
            ObjectFile::create,
            |token_path| Self::open(token_path),
        )
    }

    fn create_with<M, O>(
        base_path: &Path,
        token_dir: &str,
        label: &[u8],
        serial: &[u8],
        create_metadata: M,
        open: O,
    ) -> Result<Self>
    where
        M: FnOnce(PathBuf) -> ObjectFile,
        O: FnOnce(&Path) -> Result<Self>,
    {
        if label.len() < defs::TOKEN_MIN_LABEL_LEN || label.len() > defs::TOKEN_MAX_LABEL_LEN {
            return Err(Error::BadLabel);
        }
        if serial.is_empty() || serial.len() > defs::TOKEN_SERIAL_LEN {
            return Err(Error::BadSerial);
        }

        let token_path = Self::provision(base_path, token_dir, create_metadata, |token_object| {
            token_object.set_attr(pkcs11::CKA_OS_TOKENLABEL, Attr::from(label))?;
            token_object.set_attr(pkcs11::CKA_OS_TOKENSERIAL, Attr::from(serial))?;
            token_object.set_attr(pkcs11::CKA_OS_TOKENFLAGS, Attr::from(INITIAL_TOKEN_FLAGS))
        })?;

        match open(&token_path) {
            Ok(token) => {
                info!("Created token {}", token_path.display());
                Ok(token)
            }
            Err(e) => {
                Self::rollback(&Directory::new(base_path), token_dir);
                Err(e)
            }
        }
    }

    fn provision<M, F>(
        base_path: &Path,
        token_dir: &str,
        create_metadata: M,
        init: F,
    ) -> Result<PathBuf>
    where
        M: FnOnce(PathBuf) -> ObjectFile,
        F: FnOnce(&ObjectFile) -> object::Result<()>,
    {
        let base_dir = Directory::new(base_path);
        if !base_dir.is_valid() {
            return Err(Error::BaseDirInvalid);
        }
        base_dir.mkdir(token_dir).map_err(Error::DirectoryError)?;

        let token_path = base_path.join(token_dir);
        let token_object = create_metadata(token_path.join(defs::TOKEN_OBJECT_FILE));
        if !token_object.is_valid() {
            Self::rollback(&base_dir, token_dir);
            return Err(Error::TokenObjectInvalid);
        }
        if let Err(e) = init(&token_object) {
            Self::rollback(&base_dir, token_dir);
            return Err(Error::ObjectError(e));
        }
        Ok(token_path)
    }

    /// Remove everything a failed `create()` may have left in `base_dir/token_dir`.
    fn rollback(base_dir: &Directory, token_dir: &str) {
        warn!("Rolling back creation of token {}", token_dir);
        for name in &[defs::TOKEN_SYNC_FILE, defs::TOKEN_OBJECT_FILE] {
            if base_dir.path().join(token_dir).join(name).exists() {
                let entry = format!("{}/{}", token_dir, name);
                if let Err(e) = base_dir.remove(entry.as_str()) {
                    warn!("Unable to remove {}: {:?}", entry, e);
                }
            }
        }
        if let Err(e) = base_dir.remove(token_dir) {
            warn!("Unable to remove {}: {:?}", token_dir, e);
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn lock_objects(&self) -> Result<MutexGuard<'_, ObjectSet>> {
        self.objects.lock().map_err(|_| Error::LockPoisoned)
    }

    fn needs_index(&self) -> bool {
        self.is_valid()
            && self
                .signal
                .as_ref()
                .map(|s| s.was_triggered())
                .unwrap_or(false)
    }

    /// Bring the object index in line with the directory contents. Unless `first_time` is set,
    /// this is a no-op when the change signal hasn't fired since the last pass.
    fn index(&self, first_time: bool) -> Result<()> {
        if !first_time && !self.needs_index() {
            return Ok(());
        }
        self.rescan(first_time).map(|_| ())
    }

    /// Unconditional index pass. The returned guard reflects the directory contents as of
    /// this pass.
    fn rescan(&self, first_time: bool) -> Result<MutexGuard<'_, ObjectSet>> {
        if !self.token_object.refresh() {
            return Err(self.invalidate());
        }

        let mut set = self.lock_objects()?;

        // List under the lock: a listing taken before a concurrent pass must not be applied
        // after it.
        if !self.dir.refresh() {
            return Err(self.invalidate());
        }
        let new_files: BTreeSet<String> = self
            .dir
            .files()
            .into_iter()
            .filter(|name| is_object_file(name))
            .collect();

        let (added, removed): (Vec<String>, BTreeSet<String>) = if first_time {
            (new_files.iter().cloned().collect(), BTreeSet::new())
        } else {
            (
                new_files.difference(&set.current_files).cloned().collect(),
                set.current_files.difference(&new_files).cloned().collect(),
            )
        };

        for name in added.iter() {
            let handle = ObjectHandle::from(set.arena.len());
            let obj = ObjectFile::open(self.path.join(name)).link_token(&self.path, handle);
            if !obj.is_valid() {
                debug!("Indexed object {} is not readable yet", name);
            }
            set.arena.push(Arc::new(obj));
            set.live.insert(name.clone(), handle);
        }

        set.live.retain(|name, _| !removed.contains(name));
        set.current_files = new_files;

        debug!(
            "Indexed token {}: {} added, {} removed, {} live",
            self.path.display(),
            added.len(),
            removed.len(),
            set.live.len()
        );

        Ok(set)
    }

    fn invalidate(&self) -> Error {
        if self.valid.swap(false, Ordering::SeqCst) {
            warn!("Token {} is no longer valid", self.path.display());
        }
        Error::TokenInvalid
    }

    /// Snapshot of the objects currently stored on the token.
    pub fn objects(&self) -> Result<Vec<Arc<ObjectFile>>> {
        self.index(false)?;
        if !self.is_valid() {
            return Err(Error::TokenInvalid);
        }

        let set = self.lock_objects()?;
        let snapshot = set.live.values().filter_map(|h| set.get(*h)).collect();
        Ok(snapshot)
    }

    /// Look up any object indexed by this token, including ones whose file was since removed.
    pub fn object(&self, handle: ObjectHandle) -> Option<Arc<ObjectFile>> {
        self.lock_objects().ok().and_then(|set| set.get(handle))
    }

    /// Create a new, empty object file on the token and return it once indexed.
    pub fn create_object(&self) -> Result<Arc<ObjectFile>> {
        if !self.is_valid() {
            return Err(Error::TokenInvalid);
        }

        let name = format!(
            "{}{}",
            util::random_hex(defs::OBJECT_NAME_BYTES).map_err(Error::RngError)?,
            defs::OBJECT_FILE_SUFFIX
        );
        if !ObjectFile::create(self.path.join(&name)).is_valid() {
            return Err(Error::ObjectCreate);
        }
        self.notify_change()?;

        let set = self.rescan(false)?;
        let obj = set
            .live
            .get(&name)
            .and_then(|h| set.get(*h))
            .ok_or(Error::ObjectNotFound)?;
        // A concurrent pass may have indexed the file before its content was written.
        obj.refresh();
        Ok(obj)
    }

    /// Delete the file backing `object`. The in-memory object itself stays alive.
    pub fn delete_object(&self, object: &ObjectFile) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::TokenInvalid);
        }
        if object.token() != Some(self.path.as_path()) {
            return Err(Error::ObjectNotFound);
        }

        self.dir
            .remove(object.filename())
            .map_err(Error::DirectoryError)?;
        self.notify_change()?;
        self.rescan(false).map(|_| ())
    }

    /// Raise the change signal for other parties. Callers rescan right after, so this
    /// instance's own pending trigger is consumed here. Any trigger consumed along with it was
    /// raised after its file change, which the following rescan picks up.
    fn notify_change(&self) -> Result<()> {
        let signal = self.signal.as_ref().ok_or(Error::TokenInvalid)?;
        signal.trigger().map_err(Error::SignalError)?;
        signal.was_triggered();
        Ok(())
    }

    fn metadata(&self) -> Result<&ObjectFile> {
        if !self.is_valid() {
            return Err(Error::TokenInvalid);
        }
        Ok(&self.token_object)
    }

    fn metadata_attr(&self, attr_type: pkcs11::CK_ATTRIBUTE_TYPE) -> Result<Attr> {
        let token_object = self.metadata()?;
        token_object.attr(attr_type).ok_or_else(|| {
            if token_object.is_valid() {
                Error::AttrMissing(attr_type)
            } else {
                Error::TokenObjectInvalid
            }
        })
    }

    fn metadata_bytes(&self, attr_type: pkcs11::CK_ATTRIBUTE_TYPE) -> Result<Vec<u8>> {
        match self.metadata_attr(attr_type)? {
            Attr::Bytes(bytes) => Ok(bytes),
            _ => Err(Error::AttrTypeMismatch(attr_type)),
        }
    }

    fn set_metadata_attr(&self, attr_type: pkcs11::CK_ATTRIBUTE_TYPE, attr: Attr) -> Result<()> {
        self.metadata()?
            .set_attr(attr_type, attr)
            .map_err(Error::ObjectError)
    }

    pub fn set_so_pin(&self, so_pin_blob: &[u8]) -> Result<()> {
        self.set_metadata_attr(pkcs11::CKA_OS_SOPIN, Attr::from(so_pin_blob))
    }

    pub fn so_pin(&self) -> Result<Vec<u8>> {
        self.metadata_bytes(pkcs11::CKA_OS_SOPIN)
    }

    pub fn set_user_pin(&self, user_pin_blob: &[u8]) -> Result<()> {
        self.set_metadata_attr(pkcs11::CKA_OS_USERPIN, Attr::from(user_pin_blob))
    }

    pub fn user_pin(&self) -> Result<Vec<u8>> {
        self.metadata_bytes(pkcs11::CKA_OS_USERPIN)
    }

    pub fn clear_user_pin(&self) -> Result<()> {
        self.metadata()?
            .remove_attr(pkcs11::CKA_OS_USERPIN)
            .map_err(Error::ObjectError)
    }

    /// Stored token flags. CKF_USER_PIN_INITIALIZED is never stored: it is set here based on
    /// whether a user PIN is currently present.
    pub fn token_flags(&self) -> Result<pkcs11::CK_FLAGS> {
        let mut flags = self
            .metadata_attr(pkcs11::CKA_OS_TOKENFLAGS)?
            .as_ulong()
            .ok_or(Error::AttrTypeMismatch(pkcs11::CKA_OS_TOKENFLAGS))?;

        let user_pin_set = self
            .token_object
            .attr(pkcs11::CKA_OS_USERPIN)
            .map(|a| a.as_bytes().is_some())
            .unwrap_or(false);
        if user_pin_set {
            flags |= pkcs11::CKF_USER_PIN_INITIALIZED;
        }

        Ok(flags)
    }

    pub fn set_token_flags(&self, flags: pkcs11::CK_FLAGS) -> Result<()> {
        self.set_metadata_attr(pkcs11::CKA_OS_TOKENFLAGS, Attr::from(flags))
    }

    pub fn label(&self) -> Result<Vec<u8>> {
        self.metadata_bytes(pkcs11::CKA_OS_TOKENLABEL)
    }

    pub fn serial(&self) -> Result<Vec<u8>> {
        self.metadata_bytes(pkcs11::CKA_OS_TOKENSERIAL)
    }
}

impl Drop for TokenIndex {
    fn drop(&mut self) {
        let count = self.objects.get_mut().map(|set| set.arena.len()).unwrap_or(0);
        debug!(
            "Closing token {}, releasing {} object(s)",
            self.path.display(),
            count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::signal::ManualSignal;
    use std::fs;

    const LABEL: &[u8] = b"test token";
    const SERIAL: &[u8] = b"0123456789abcdef";

    /// Provision a token under `base` and return its path.
    fn provision_token(base: &Path) -> PathBuf {
        let token = TokenIndex::create(base, "token", LABEL, SERIAL).unwrap();
        token.path().to_path_buf()
    }

    fn open_manual(path: &Path) -> (TokenIndex, Arc<ManualSignal>) {
        let signal = Arc::new(ManualSignal::new());
        let token = TokenIndex::open_with_signal(path, Arc::clone(&signal)).unwrap();
        (token, signal)
    }

    fn add_object(token_path: &Path, name: &str) {
        assert!(ObjectFile::create(token_path.join(name)).is_valid());
    }

    fn names(objects: &[Arc<ObjectFile>]) -> Vec<String> {
        objects.iter().map(|o| o.filename().to_string()).collect()
    }

    #[test]
    fn test_create_token() {
        let tmp = tempfile::tempdir().unwrap();
        let token = TokenIndex::create(tmp.path(), "token", LABEL, SERIAL).unwrap();

        assert!(token.is_valid());
        assert_eq!(token.label().unwrap(), LABEL);
        assert_eq!(token.serial().unwrap(), SERIAL);
        assert_eq!(token.token_flags().unwrap(), INITIAL_TOKEN_FLAGS);
        assert!(token.objects().unwrap().is_empty());
        match token.so_pin() {
            Err(Error::AttrMissing(pkcs11::CKA_OS_SOPIN)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(tmp.path().join("token").join(defs::TOKEN_OBJECT_FILE).is_file());
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let tmp = tempfile::tempdir().unwrap();
        match TokenIndex::create(tmp.path(), "token", b"", SERIAL) {
            Err(Error::BadLabel) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        match TokenIndex::create(tmp.path(), "token", LABEL, &[b'x'; 17]) {
            Err(Error::BadSerial) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        match TokenIndex::create(tmp.path().join("missing"), "token", LABEL, SERIAL) {
            Err(Error::BaseDirInvalid) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_create_existing_dir_is_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("token")).unwrap();
        fs::write(tmp.path().join("token").join("keep"), b"data").unwrap();

        assert!(TokenIndex::create(tmp.path(), "token", LABEL, SERIAL).is_err());
        assert_eq!(fs::read(tmp.path().join("token").join("keep")).unwrap(), b"data");
    }

    #[test]
    fn test_provision_rollback() {
        let tmp = tempfile::tempdir().unwrap();
        let res = TokenIndex::provision(tmp.path(), "token", ObjectFile::create, |token_object| {
            token_object.set_attr(pkcs11::CKA_OS_TOKENLABEL, Attr::from(LABEL))?;
            // Simulate a failing write.
            fs::remove_file(token_object.path()).unwrap();
            token_object.set_attr(pkcs11::CKA_OS_TOKENSERIAL, Attr::from(SERIAL))
        });
        match res {
            Err(Error::ObjectError(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        let base = Directory::new(tmp.path());
        assert!(base.subdirs().is_empty());
        assert!(base.files().is_empty());
    }

    #[test]
    fn test_metadata_create_rollback() {
        let tmp = tempfile::tempdir().unwrap();
        // Opening instead of creating leaves the metadata record invalid.
        let res = TokenIndex::provision(tmp.path(), "token", ObjectFile::open, |_| Ok(()));
        match res {
            Err(Error::TokenObjectInvalid) => (),
            other => panic!("unexpected result: {:?}", other),
        }

        let base = Directory::new(tmp.path());
        assert!(base.subdirs().is_empty());
        assert!(base.files().is_empty());
    }

    #[test]
    fn test_open_after_provision_rollback() {
        let tmp = tempfile::tempdir().unwrap();
        let res = TokenIndex::create_with(
            tmp.path(),
            "token",
            LABEL,
            SERIAL,
            ObjectFile::create,
            |token_path| {
                // The token opens (and attaches its signal file) before the failure.
                let token = TokenIndex::open(token_path)?;
                assert!(token_path.join(defs::TOKEN_SYNC_FILE).is_file());
                drop(token);
                Err(Error::TokenInvalid)
            },
        );
        match res {
            Err(Error::TokenInvalid) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        let base = Directory::new(tmp.path());
        assert!(base.subdirs().is_empty());
        assert!(base.files().is_empty());
    }

    #[test]
    fn test_open_non_token_dir() {
        let tmp = tempfile::tempdir().unwrap();
        match TokenIndex::open(tmp.path()) {
            Err(Error::TokenInvalid) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(!tmp.path().join(defs::TOKEN_SYNC_FILE).exists());
        assert!(TokenIndex::open(tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_fast_path_without_trigger() {
        let tmp = tempfile::tempdir().unwrap();
        let path = provision_token(tmp.path());
        add_object(&path, "a.object");
        add_object(&path, "b.object");

        let (token, signal) = open_manual(&path);
        assert_eq!(names(&token.objects().unwrap()), vec!["a.object", "b.object"]);

        // Without a trigger the directory isn't looked at again.
        add_object(&path, "c.object");
        assert_eq!(token.objects().unwrap().len(), 2);
        assert_eq!(token.objects().unwrap().len(), 2);

        signal.trigger().unwrap();
        assert_eq!(
            names(&token.objects().unwrap()),
            vec!["a.object", "b.object", "c.object"]
        );
    }

    #[test]
    fn test_diff_and_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let path = provision_token(tmp.path());
        add_object(&path, "a.object");
        add_object(&path, "b.object");

        let (token, signal) = open_manual(&path);
        let before = token.objects().unwrap();
        let a = Arc::clone(&before[0]);
        let b = Arc::clone(&before[1]);
        assert_eq!(a.filename(), "a.object");
        assert_eq!(a.token(), Some(path.as_path()));

        add_object(&path, "c.object");
        fs::remove_file(path.join("a.object")).unwrap();
        signal.trigger().unwrap();

        let after = token.objects().unwrap();
        assert_eq!(names(&after), vec!["b.object", "c.object"]);
        // Surviving objects keep their identity.
        assert!(Arc::ptr_eq(&after[0], &b));

        // The removed object is still alive and reachable by handle.
        assert_eq!(a.filename(), "a.object");
        let handle = a.handle().unwrap();
        assert!(Arc::ptr_eq(&token.object(handle).unwrap(), &a));

        // The old snapshot is untouched.
        assert_eq!(names(&before), vec!["a.object", "b.object"]);
    }

    #[test]
    fn test_spurious_trigger_is_harmless() {
        let tmp = tempfile::tempdir().unwrap();
        let path = provision_token(tmp.path());
        add_object(&path, "a.object");
        let (token, signal) = open_manual(&path);

        add_object(&path, "b.object");
        signal.trigger().unwrap();
        let first = token.objects().unwrap();

        // Nothing changed on disk: the same instances come back and nothing is re-added.
        signal.trigger().unwrap();
        let second = token.objects().unwrap();
        assert_eq!(names(&second), vec!["a.object", "b.object"]);
        assert!(first.iter().zip(second.iter()).all(|(x, y)| Arc::ptr_eq(x, y)));
        assert_eq!(token.objects.lock().unwrap().arena.len(), 2);
    }

    #[test]
    fn test_readded_file_gets_new_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let path = provision_token(tmp.path());
        add_object(&path, "a.object");
        let (token, signal) = open_manual(&path);
        let old = token.objects().unwrap().remove(0);

        fs::remove_file(path.join("a.object")).unwrap();
        signal.trigger().unwrap();
        assert!(token.objects().unwrap().is_empty());

        add_object(&path, "a.object");
        signal.trigger().unwrap();
        let new = token.objects().unwrap().remove(0);
        assert!(!Arc::ptr_eq(&old, &new));
        assert_ne!(old.handle(), new.handle());
    }

    #[test]
    fn test_namespace_filter() {
        let tmp = tempfile::tempdir().unwrap();
        let path = provision_token(tmp.path());
        fs::write(path.join("notes.txt"), b"hello").unwrap();
        fs::write(path.join(".object"), b"{}").unwrap();
        fs::create_dir(path.join("dir.object")).unwrap();
        add_object(&path, "key.object");

        let (token, signal) = open_manual(&path);
        assert_eq!(names(&token.objects().unwrap()), vec!["key.object"]);
        signal.trigger().unwrap();
        assert_eq!(names(&token.objects().unwrap()), vec!["key.object"]);
    }

    #[test]
    fn test_pins_and_derived_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let token = TokenIndex::create(tmp.path(), "token", LABEL, SERIAL).unwrap();

        token.set_so_pin(b"so-pin-blob").unwrap();
        assert_eq!(token.so_pin().unwrap(), b"so-pin-blob");

        assert!(token.user_pin().is_err());
        assert_eq!(token.token_flags().unwrap() & pkcs11::CKF_USER_PIN_INITIALIZED, 0);

        token.set_user_pin(b"user-pin-blob").unwrap();
        assert_eq!(token.user_pin().unwrap(), b"user-pin-blob");
        assert_ne!(token.token_flags().unwrap() & pkcs11::CKF_USER_PIN_INITIALIZED, 0);

        token.clear_user_pin().unwrap();
        assert!(token.user_pin().is_err());
        assert_eq!(token.token_flags().unwrap() & pkcs11::CKF_USER_PIN_INITIALIZED, 0);

        // The derived flag is never persisted.
        token.set_user_pin(b"user-pin-blob").unwrap();
        token
            .set_token_flags(INITIAL_TOKEN_FLAGS & !pkcs11::CKF_SO_PIN_TO_BE_CHANGED)
            .unwrap();
        assert_ne!(token.token_flags().unwrap() & pkcs11::CKF_USER_PIN_INITIALIZED, 0);
        token.clear_user_pin().unwrap();
        assert_eq!(
            token.token_flags().unwrap(),
            INITIAL_TOKEN_FLAGS & !pkcs11::CKF_SO_PIN_TO_BE_CHANGED
        );
    }

    #[test]
    fn test_flags_type_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let token = TokenIndex::create(tmp.path(), "token", LABEL, SERIAL).unwrap();
        token
            .token_object
            .set_attr(pkcs11::CKA_OS_TOKENFLAGS, Attr::from(&b"bogus"[..]))
            .unwrap();
        match token.token_flags() {
            Err(Error::AttrTypeMismatch(pkcs11::CKA_OS_TOKENFLAGS)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_token_becomes_invalid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = provision_token(tmp.path());
        let (token, signal) = open_manual(&path);

        fs::remove_dir_all(&path).unwrap();
        // Still cached until the next indexed access.
        assert!(token.is_valid());

        signal.trigger().unwrap();
        match token.objects() {
            Err(Error::TokenInvalid) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(!token.is_valid());

        // Invalid tokens stay inert.
        signal.trigger().unwrap();
        assert!(token.objects().is_err());
        assert!(signal.was_triggered());
        assert!(token.so_pin().is_err());
        assert!(token.set_user_pin(b"pin").is_err());
        assert!(token.create_object().is_err());
    }

    #[test]
    fn test_create_and_delete_object() {
        let tmp = tempfile::tempdir().unwrap();
        let path = provision_token(tmp.path());
        let (token, signal) = open_manual(&path);

        let obj = token.create_object().unwrap();
        assert!(obj.is_valid());
        // The index is current, so nothing is left pending for the next read.
        assert!(!signal.was_triggered());
        assert!(obj.filename().ends_with(defs::OBJECT_FILE_SUFFIX));
        obj.set_attr(pkcs11::CKA_OS_TOKENLABEL, Attr::from(&b"key"[..]))
            .unwrap();
        assert_eq!(token.objects().unwrap().len(), 1);

        token.delete_object(&obj).unwrap();
        assert!(!signal.was_triggered());
        assert!(token.objects().unwrap().is_empty());
        assert!(!obj.path().exists());
        assert!(Arc::ptr_eq(&token.object(obj.handle().unwrap()).unwrap(), &obj));

        // Objects from elsewhere are rejected.
        let stray = ObjectFile::create(tmp.path().join("stray.object"));
        match token.delete_object(&stray) {
            Err(Error::ObjectNotFound) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let tmp = tempfile::tempdir().unwrap();
        let path = provision_token(tmp.path());
        let (token, _signal) = open_manual(&path);
        let token = Arc::new(token);

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let token = Arc::clone(&token);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        token.create_object().unwrap();
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let token = Arc::clone(&token);
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..50 {
                        // Nothing is deleted, so the live set never shrinks.
                        let count = token.objects().unwrap().len();
                        assert!(count >= last);
                        last = count;
                    }
                })
            })
            .collect();

        for t in writers.into_iter().chain(readers) {
            t.join().unwrap();
        }
        assert_eq!(token.objects().unwrap().len(), 40);
    }
}
