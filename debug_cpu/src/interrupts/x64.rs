//! CPU exception context for X64.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

///
/// Universal EFI_SYSTEM_CONTEXT_X64 definition. The field order is fixed by
/// the UEFI specification; the debugger addresses registers by byte offset
/// into this layout.
///
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ExceptionContextX64 {
    pub exception_data: u64,
    pub fx_save_state: FxSaveStateX64,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub cr0: u64,
    pub cr1: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub rflags: u64,
    pub ldtr: u64,
    pub tr: u64,
    pub gdtr: [u64; 2],
    pub idtr: [u64; 2],
    pub rip: u64,
    pub gs: u64,
    pub fs: u64,
    pub es: u64,
    pub ds: u64,
    pub cs: u64,
    pub ss: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

///
/// EFI_FX_SAVE_STATE_X64 definition.
///
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FxSaveStateX64 {
    pub fcw: u16,
    pub fsw: u16,
    pub ftw: u16,
    pub opcode: u16,
    pub rip: u64,
    pub data_offset: u64,
    pub reserved1: [u8; 8],
    pub st_mm: [[u8; 16]; 8],
    pub xmm: [[u8; 16]; 8],
    pub reserved2: [u8; 14 * 16],
}

impl Default for ExceptionContextX64 {
    fn default() -> Self {
        // SAFETY: The context is a plain integer register frame; all zeroes is
        // a valid value.
        unsafe { core::mem::zeroed() }
    }
}
