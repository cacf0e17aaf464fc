// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Helpers for reading and writing integers at arbitrary byte offsets.
//!
//! Device models and exit record decoding deal in byte buffers whose fields
//! are not naturally aligned for the host. These helpers copy through fixed
//! size arrays so the compiler never assumes alignment.
//!
//! All functions panic if the slice is shorter than the integer being
//! accessed, the same contract as slice indexing.

/// Reads a native-endian `u16` from the start of `data`.
pub fn load_u16_ne(data: &[u8]) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&data[..2]);
    u16::from_ne_bytes(bytes)
}

/// Reads a little-endian `u16` from the start of `data`.
pub fn load_u16_le(data: &[u8]) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&data[..2]);
    u16::from_le_bytes(bytes)
}

/// Reads a big-endian `u16` from the start of `data`.
pub fn load_u16_be(data: &[u8]) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&data[..2]);
    u16::from_be_bytes(bytes)
}

/// Writes a native-endian `u16` to the start of `data`.
pub fn store_u16_ne(data: &mut [u8], val: u16) {
    data[..2].copy_from_slice(&val.to_ne_bytes());
}

/// Writes a little-endian `u16` to the start of `data`.
pub fn store_u16_le(data: &mut [u8], val: u16) {
    data[..2].copy_from_slice(&val.to_le_bytes());
}

/// Writes a big-endian `u16` to the start of `data`. The high byte lands at
/// `data[0]`.
pub fn store_u16_be(data: &mut [u8], val: u16) {
    data[..2].copy_from_slice(&val.to_be_bytes());
}

/// Reads a native-endian `u32` from the start of `data`.
pub fn load_u32_ne(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[..4]);
    u32::from_ne_bytes(bytes)
}

/// Reads a little-endian `u32` from the start of `data`.
pub fn load_u32_le(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[..4]);
    u32::from_le_bytes(bytes)
}

/// Reads a big-endian `u32` from the start of `data`.
pub fn load_u32_be(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[..4]);
    u32::from_be_bytes(bytes)
}

/// Writes a native-endian `u32` to the start of `data`.
pub fn store_u32_ne(data: &mut [u8], val: u32) {
    data[..4].copy_from_slice(&val.to_ne_bytes());
}

/// Writes a little-endian `u32` to the start of `data`.
pub fn store_u32_le(data: &mut [u8], val: u32) {
    data[..4].copy_from_slice(&val.to_le_bytes());
}

/// Writes a big-endian `u32` to the start of `data`.
pub fn store_u32_be(data: &mut [u8], val: u32) {
    data[..4].copy_from_slice(&val.to_be_bytes());
}

/// Reads a native-endian `u64` from the start of `data`.
pub fn load_u64_ne(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[..8]);
    u64::from_ne_bytes(bytes)
}

/// Reads a little-endian `u64` from the start of `data`.
pub fn load_u64_le(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[..8]);
    u64::from_le_bytes(bytes)
}

/// Reads a big-endian `u64` from the start of `data`.
pub fn load_u64_be(data: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[..8]);
    u64::from_be_bytes(bytes)
}

/// Writes a native-endian `u64` to the start of `data`.
pub fn store_u64_ne(data: &mut [u8], val: u64) {
    data[..8].copy_from_slice(&val.to_ne_bytes());
}

/// Writes a little-endian `u64` to the start of `data`.
pub fn store_u64_le(data: &mut [u8], val: u64) {
    data[..8].copy_from_slice(&val.to_le_bytes());
}

/// Writes a big-endian `u64` to the start of `data`.
pub fn store_u64_be(data: &mut [u8], val: u64) {
    data[..8].copy_from_slice(&val.to_be_bytes());
}
