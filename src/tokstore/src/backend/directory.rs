// Copyright 2020-2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),
    BadName(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Default)]
struct Listing {
    valid: bool,
    files: Vec<String>,
    subdirs: Vec<String>,
}

/// Cached listing of a directory. The listing only changes on `refresh()` (or on a successful
/// `mkdir()` / `remove()`, which refresh implicitly).
pub struct Directory {
    path: PathBuf,
    listing: Mutex<Listing>,
}

impl Directory {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let dir = Self {
            path: path.as_ref().to_path_buf(),
            listing: Mutex::new(Listing::default()),
        };
        dir.refresh();
        dir
    }

    fn lock_listing(&self) -> MutexGuard<'_, Listing> {
        self.listing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn is_valid(&self) -> bool {
        self.lock_listing().valid
    }

    /// Re-read the directory contents. Returns false (and invalidates the view) if the
    /// directory can no longer be listed.
    pub fn refresh(&self) -> bool {
        let mut listing = self.lock_listing();
        match self.read_listing() {
            Ok(new_listing) => *listing = new_listing,
            Err(e) => {
                debug!("Unable to list {}: {:?}", self.path.display(), e);
                *listing = Listing::default();
            }
        }
        listing.valid
    }

    fn read_listing(&self) -> std::io::Result<Listing> {
        let mut listing = Listing {
            valid: true,
            ..Default::default()
        };
        for entry in fs::read_dir(&self.path)? {
            let entry = match skip_vanished(entry)? {
                Some(entry) => entry,
                None => continue,
            };
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                // Not something we could have created.
                Err(_) => continue,
            };
            let file_type = match skip_vanished(entry.file_type())? {
                Some(file_type) => file_type,
                None => continue,
            };
            if file_type.is_dir() {
                listing.subdirs.push(name);
            } else if file_type.is_file() {
                listing.files.push(name);
            }
        }
        listing.files.sort();
        listing.subdirs.sort();
        Ok(listing)
    }

    /// Regular files found by the last refresh, sorted by name.
    pub fn files(&self) -> Vec<String> {
        self.lock_listing().files.clone()
    }

    /// Sub-directories found by the last refresh, sorted by name.
    pub fn subdirs(&self) -> Vec<String> {
        self.lock_listing().subdirs.clone()
    }

    /// Create the directory `name` (relative to this directory).
    pub fn mkdir(&self, name: &str) -> Result<()> {
        let path = self.entry_path(name)?;
        fs::create_dir(&path).map_err(Error::IoError)?;
        self.refresh();
        Ok(())
    }

    /// Remove the file or (empty) directory `name`, which may be a relative path inside this
    /// directory.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.entry_path(name)?;
        let meta = fs::symlink_metadata(&path).map_err(Error::IoError)?;
        if meta.is_dir() {
            fs::remove_dir(&path).map_err(Error::IoError)?;
        } else {
            fs::remove_file(&path).map_err(Error::IoError)?;
        }
        self.refresh();
        Ok(())
    }

    fn entry_path(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        if name.is_empty()
            || rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(Error::BadName(name.to_string()));
        }
        Ok(self.path.join(rel))
    }
}

/// Entries removed by another party between `readdir` and the follow-up `lstat` are dropped
/// from the listing instead of failing it.
fn skip_vanished<T>(res: std::io::Result<T>) -> std::io::Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
