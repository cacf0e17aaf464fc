// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A mutex whose methods panic rather than return an error on poison.
//!
//! Release builds run with `panic = 'abort'`, so a poisoned lock means the
//! process is already gone. Treating poison as unreachable keeps lock sites
//! free of `unwrap`, which this codebase otherwise reserves for tests.

mod mutex;

pub use crate::mutex::Mutex;
