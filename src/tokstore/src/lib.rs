// Copyright 2020-2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Persistent object store for a software PKCS#11 token.
//!
//! A token lives in a directory: `tokenObject` holds the token metadata (label, serial, flags,
//! PIN blobs) and each `*.object` file holds one stored object. `TokenIndex` keeps an in-memory
//! view of those files in sync with the directory, across threads and across processes sharing
//! the same directory.

extern crate log;
extern crate serde;
extern crate serde_json;
extern crate tokstore_common;

pub mod backend;
pub mod pkcs11;

pub use backend::{
    Attr, ChangeSignal, Directory, FileSignal, ManualSignal, ObjectFile, ObjectHandle,
    ObjectStore, TokenIndex,
};
pub use tokstore_common::config::StoreConfig;
pub use tokstore_common::defs;
