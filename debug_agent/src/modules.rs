//! Loaded module tracking and module load breakpoints.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

#[cfg(feature = "alloc")]
use alloc::{string::String, vec::Vec};

/// Normalizes an image symbol file name for comparison: strips any directory
/// components and the extension.
#[cfg_attr(not(feature = "alloc"), allow(dead_code))]
pub(crate) fn normalize_module_name(name: &str) -> &str {
    let base = match name.rfind(['/', '\\']) {
        Some(index) => &name[index + 1..],
        None => name,
    };

    match base.find('.') {
        Some(index) => &base[..index],
        None => base,
    }
}

/// Information about a loaded module. The table is kept in memory for host
/// side tooling to read out of the target; nothing on-target consumes it.
#[cfg(feature = "alloc")]
#[allow(dead_code)]
pub(crate) struct ModuleInfo {
    pub name: String,
    pub base: usize,
    pub size: usize,
}

/// Manages loaded modules and module breakpoints.
pub(crate) struct Modules {
    #[cfg(feature = "alloc")]
    modules: Vec<ModuleInfo>,
    #[cfg(feature = "alloc")]
    module_breakpoints: Vec<String>,
    break_all: bool,
}

impl Modules {
    pub const fn new() -> Self {
        Modules {
            #[cfg(feature = "alloc")]
            modules: Vec::new(),
            #[cfg(feature = "alloc")]
            module_breakpoints: Vec::new(),
            break_all: false,
        }
    }

    #[cfg(feature = "alloc")]
    pub fn add_module(&mut self, name: &str, base: usize, size: usize) {
        self.modules.push(ModuleInfo { name: String::from(name), base, size });
    }

    #[cfg(not(feature = "alloc"))]
    pub fn add_module(&mut self, _name: &str, _base: usize, _size: usize) {}

    /// Checks whether a break was requested for the named module.
    pub fn check_module_breakpoints(&self, name: &str) -> bool {
        if self.break_all {
            return true;
        }

        #[cfg(feature = "alloc")]
        {
            let trimmed = normalize_module_name(name);
            for module in &self.module_breakpoints {
                if module.eq_ignore_ascii_case(trimmed) {
                    return true;
                }
            }
        }

        #[cfg(not(feature = "alloc"))]
        let _ = name;

        false
    }

    /// Requests a break when the named module loads. Returns false if the
    /// request cannot be recorded.
    #[cfg(feature = "alloc")]
    pub fn add_module_breakpoint(&mut self, name: &str) -> bool {
        let trimmed = normalize_module_name(name.trim());
        if trimmed.is_empty() {
            return false;
        }

        self.module_breakpoints.push(String::from(trimmed));
        true
    }

    /// Without an allocator only the break-all form is available.
    #[cfg(not(feature = "alloc"))]
    pub fn add_module_breakpoint(&mut self, _name: &str) -> bool {
        false
    }

    /// Requests a break on every module load.
    pub fn break_on_all(&mut self) {
        self.break_all = true;
    }

    #[cfg(all(test, feature = "alloc"))]
    pub fn get_modules(&self) -> &Vec<ModuleInfo> {
        &self.modules
    }
}
