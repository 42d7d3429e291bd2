// Copyright 2020-2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod directory;
pub mod object;
pub mod signal;
pub mod store;
pub mod token;

pub use directory::Directory;
pub use object::{Attr, ObjectFile, ObjectHandle};
pub use signal::{ChangeSignal, FileSignal, ManualSignal};
pub use store::ObjectStore;
pub use token::TokenIndex;
