// Copyright 2020-2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The subset of Cryptoki types and constants used by the object store.

#![allow(non_camel_case_types)]

pub type CK_ULONG = u64;
pub type CK_FLAGS = CK_ULONG;
pub type CK_ATTRIBUTE_TYPE = CK_ULONG;

// Token information flags
pub const CKF_RNG: CK_FLAGS = 0x0000_0001;
pub const CKF_LOGIN_REQUIRED: CK_FLAGS = 0x0000_0004;
pub const CKF_USER_PIN_INITIALIZED: CK_FLAGS = 0x0000_0008;
pub const CKF_RESTORE_KEY_NOT_NEEDED: CK_FLAGS = 0x0000_0020;
pub const CKF_TOKEN_INITIALIZED: CK_FLAGS = 0x0000_0400;
pub const CKF_SO_PIN_LOCKED: CK_FLAGS = 0x0040_0000;
pub const CKF_SO_PIN_TO_BE_CHANGED: CK_FLAGS = 0x0080_0000;

pub const CKA_VENDOR_DEFINED: CK_ATTRIBUTE_TYPE = 0x8000_0000;

// Object store private attributes, kept in the token metadata record.
pub const CKA_OS_VENDOR_BASE: CK_ATTRIBUTE_TYPE = CKA_VENDOR_DEFINED + 0x5348;
pub const CKA_OS_TOKENLABEL: CK_ATTRIBUTE_TYPE = CKA_OS_VENDOR_BASE + 1;
pub const CKA_OS_TOKENSERIAL: CK_ATTRIBUTE_TYPE = CKA_OS_VENDOR_BASE + 2;
pub const CKA_OS_TOKENFLAGS: CK_ATTRIBUTE_TYPE = CKA_OS_VENDOR_BASE + 3;
pub const CKA_OS_SOPIN: CK_ATTRIBUTE_TYPE = CKA_OS_VENDOR_BASE + 4;
pub const CKA_OS_USERPIN: CK_ATTRIBUTE_TYPE = CKA_OS_VENDOR_BASE + 5;
