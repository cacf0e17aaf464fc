// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Direct host CPU identification, used when probing host capabilities and
//! when constructing guest cpuid tables from real hardware leaves.

use std::arch::x86_64::__cpuid;

/// The four output registers of one cpuid invocation.
///
/// For the vendor string leaf (function 0), `ecx` and `edx` are stored
/// swapped relative to raw register order so that `ebx`, `ecx`, `edx`
/// concatenate into the documented byte order of the identifier.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidResult {
    /// Returns the 12 identifier bytes held by `ebx`, `ecx` and `edx`, in
    /// string order for a result produced by `host_cpuid(0)`.
    pub fn ident_bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&self.ebx.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.ecx.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.edx.to_le_bytes());
        bytes
    }
}

/// Executes the cpuid instruction on the host for the given function.
pub fn host_cpuid(function: u32) -> CpuidResult {
    // Safe because cpuid only writes the four output registers and has no
    // other side effects.
    let raw = unsafe { __cpuid(function) };
    let mut res = CpuidResult {
        eax: raw.eax,
        ebx: raw.ebx,
        ecx: raw.ecx,
        edx: raw.edx,
    };
    if function == 0 {
        std::mem::swap(&mut res.ecx, &mut res.edx);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_string() {
        let res = host_cpuid(0);
        let bytes = res.ident_bytes();
        let vendor = std::str::from_utf8(&bytes).expect("vendor string not ascii");
        assert_eq!(vendor.len(), 12);
        assert!(vendor.chars().all(|c| c.is_ascii_graphic() || c == ' '));
    }

    #[test]
    fn function_zero_swaps_ecx_edx() {
        let raw = unsafe { __cpuid(0) };
        let res = host_cpuid(0);
        assert_eq!(res.ecx, raw.edx);
        assert_eq!(res.edx, raw.ecx);
    }

    #[test]
    fn other_functions_preserve_order() {
        let raw = unsafe { __cpuid(1) };
        let res = host_cpuid(1);
        assert_eq!(res.eax, raw.eax);
        assert_eq!(res.ecx, raw.ecx);
        assert_eq!(res.edx, raw.edx);
    }
}
