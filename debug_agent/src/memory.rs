//! Memory access on behalf of the debugger host.
//!
//! Every access is split into page sized chunks. For each page, either the
//! platform memory attribute service vouches for (and if needed temporarily
//! relaxes) the page protections, or the page walk is consulted directly.
//! A failure on any page aborts the remaining chunks; pages already copied
//! stay copied and the caller reports the operation as incomplete.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use core::ptr;

use bitflags::bitflags;
use debug_cpu::error::EfiError;

use crate::arch::DebuggerArch;

pub(crate) const PAGE_SIZE: u64 = 0x1000;
pub(crate) const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

#[cfg(feature = "windbg_workarounds")]
const WINDBG_SHARED_DATA_PAGE: u64 = 0xFFFF_F780_0000_0000;

bitflags! {
    /// UEFI memory attribute bits of interest to the debugger.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAttributes: u64 {
        const READ_PROTECT = 0x2000;
        const EXECUTE_PROTECT = 0x4000;
        const READ_ONLY = 0x20000;
    }
}

/// Page attribute management published by the firmware once available.
#[cfg_attr(test, mockall::automock)]
pub trait MemoryAttributeService {
    /// Returns the attributes of the given page range.
    fn get_attributes(&self, base: u64, length: u64) -> Result<MemoryAttributes, EfiError>;

    /// Clears the masked attributes on the given page range.
    fn clear_attributes(&self, base: u64, length: u64, mask: MemoryAttributes) -> Result<(), EfiError>;

    /// Sets the given attributes on the page range.
    fn set_attributes(&self, base: u64, length: u64, attributes: MemoryAttributes) -> Result<(), EfiError>;
}

/// The attribute service is published by a protocol notification well after
/// the agent is initialized, so it is tracked process wide.
static ATTRIBUTE_SERVICE: spin::RwLock<Option<&'static (dyn MemoryAttributeService + Sync)>> =
    spin::RwLock::new(None);

/// Registers the platform memory attribute service.
pub fn set_memory_attribute_service(service: &'static (dyn MemoryAttributeService + Sync)) {
    *ATTRIBUTE_SERVICE.write() = Some(service);
}

fn attribute_service() -> Option<&'static (dyn MemoryAttributeService + Sync)> {
    *ATTRIBUTE_SERVICE.read()
}

/// Reads memory from the specified address into the buffer after validating
/// the range page by page.
pub(crate) fn read_memory<A: DebuggerArch>(address: u64, buffer: &mut [u8]) -> Result<(), ()> {
    // Windbg will try to read page 0 and the Windows shared data page, and
    // loops for quite some time when those reads fail. Satisfy them with
    // zeroes so the logic fails fast.
    #[cfg(feature = "windbg_workarounds")]
    if (address < PAGE_SIZE || address & PAGE_MASK == WINDBG_SHARED_DATA_PAGE) && buffer.len() < PAGE_SIZE as usize {
        buffer.fill(0);
        return Ok(());
    }

    let service = attribute_service().map(|service| service as &dyn MemoryAttributeService);
    access_memory::<A>(address, buffer.as_mut_ptr(), buffer.len(), false, service)
}

/// Writes the buffer to the specified address after validating the range page
/// by page, temporarily relaxing read-only pages through the attribute
/// service when one is present.
pub(crate) fn write_memory<A: DebuggerArch>(address: u64, buffer: &[u8]) -> Result<(), ()> {
    let service = attribute_service().map(|service| service as &dyn MemoryAttributeService);
    access_memory::<A>(address, buffer.as_ptr() as *mut u8, buffer.len(), true, service)
}

fn access_memory<A: DebuggerArch>(
    address: u64,
    data: *mut u8,
    length: usize,
    write: bool,
    service: Option<&dyn MemoryAttributeService>,
) -> Result<(), ()> {
    let mut address = address;
    let mut data = data;
    let mut remaining = length;

    while remaining > 0 {
        let page = address & PAGE_MASK;
        let chunk = remaining.min((PAGE_SIZE - (address & !PAGE_MASK)) as usize);

        let mut restore = None;

        if let Some(service) = service {
            let attributes = service.get_attributes(page, PAGE_SIZE).map_err(|_| ())?;

            if write && attributes.contains(MemoryAttributes::READ_ONLY) {
                service
                    .clear_attributes(page, PAGE_SIZE, MemoryAttributes::READ_ONLY | MemoryAttributes::READ_PROTECT)
                    .map_err(|_| ())?;
                restore = Some(attributes);
            } else if attributes.contains(MemoryAttributes::READ_PROTECT) {
                service.clear_attributes(page, PAGE_SIZE, MemoryAttributes::READ_PROTECT).map_err(|_| ())?;
                restore = Some(attributes);
            }
        } else {
            let accessible = if write { A::is_page_writable(address) } else { A::is_page_readable(address) };
            if !accessible {
                return Err(());
            }
        }

        // SAFETY: The page was either validated against the live page tables
        // or unprotected through the attribute service; the chunk does not
        // cross the page boundary.
        unsafe {
            if write {
                ptr::copy_nonoverlapping(data, address as *mut u8, chunk);
            } else {
                ptr::copy_nonoverlapping(address as *const u8, data, chunk);
            }
        }

        if let (Some(attributes), Some(service)) = (restore, service) {
            service.set_attributes(page, PAGE_SIZE, attributes).map_err(|_| ())?;
        }

        address += chunk as u64;
        // SAFETY: The caller's buffer is at least `length` bytes.
        data = unsafe { data.add(chunk) };
        remaining -= chunk;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestArch, ARCH_TEST_LOCK};
    use mockall::predicate::*;

    #[test]
    fn test_read_memory_checks_pages() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();

        let data = [0xCFu8; 8];
        let mut buffer = [0u8; 8];

        TestArch::set_pages_accessible(true);
        read_memory::<TestArch>(data.as_ptr() as u64, &mut buffer).expect("Failed to read memory.");
        assert_eq!(buffer, data);

        TestArch::set_pages_accessible(false);
        assert!(read_memory::<TestArch>(data.as_ptr() as u64, &mut buffer).is_err());
        TestArch::set_pages_accessible(true);
    }

    #[test]
    fn test_write_memory_checks_pages() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();

        let data = [0u8; 8];
        let buffer = [0xA5u8; 8];

        TestArch::set_pages_accessible(true);
        write_memory::<TestArch>(data.as_ptr() as u64, &buffer).expect("Failed to write memory.");
        assert_eq!(data, buffer);

        TestArch::set_pages_accessible(false);
        assert!(write_memory::<TestArch>(data.as_ptr() as u64, &buffer).is_err());
        TestArch::set_pages_accessible(true);
    }

    #[test]
    fn test_attribute_relaxation_restores_exactly() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();

        let data = [0u8; 16];
        let address = data.as_ptr() as u64;
        let page = address & PAGE_MASK;
        let original = MemoryAttributes::READ_ONLY | MemoryAttributes::EXECUTE_PROTECT;

        let mut service = MockMemoryAttributeService::new();
        service.expect_get_attributes().with(eq(page), eq(PAGE_SIZE)).times(1).returning(move |_, _| Ok(original));
        service
            .expect_clear_attributes()
            .with(eq(page), eq(PAGE_SIZE), eq(MemoryAttributes::READ_ONLY | MemoryAttributes::READ_PROTECT))
            .times(1)
            .returning(|_, _, _| Ok(()));
        service
            .expect_set_attributes()
            .with(eq(page), eq(PAGE_SIZE), eq(original))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let buffer = [0x5A_u8; 16];
        access_memory::<TestArch>(address, buffer.as_ptr() as *mut u8, buffer.len(), true, Some(&service))
            .expect("Failed to write memory.");
        assert_eq!(data, [0x5A; 16]);
    }

    #[test]
    fn test_read_protect_cleared_for_reads() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();

        let data = [0x77u8; 4];
        let address = data.as_ptr() as u64;

        let mut service = MockMemoryAttributeService::new();
        service.expect_get_attributes().times(1).returning(|_, _| Ok(MemoryAttributes::READ_PROTECT));
        service
            .expect_clear_attributes()
            .withf(|_, _, mask| *mask == MemoryAttributes::READ_PROTECT)
            .times(1)
            .returning(|_, _, _| Ok(()));
        service
            .expect_set_attributes()
            .withf(|_, _, attributes| *attributes == MemoryAttributes::READ_PROTECT)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut buffer = [0u8; 4];
        access_memory::<TestArch>(address, buffer.as_mut_ptr(), buffer.len(), false, Some(&service))
            .expect("Failed to read memory.");
        assert_eq!(buffer, [0x77; 4]);
    }

    #[test]
    fn test_writable_page_needs_no_relaxation() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();

        let data = [0u8; 4];
        let address = data.as_ptr() as u64;

        let mut service = MockMemoryAttributeService::new();
        service.expect_get_attributes().times(1).returning(|_, _| Ok(MemoryAttributes::empty()));

        let buffer = [0x42u8; 4];
        access_memory::<TestArch>(address, buffer.as_ptr() as *mut u8, buffer.len(), true, Some(&service))
            .expect("Failed to write memory.");
        assert_eq!(data, buffer);
    }

    #[test]
    fn test_failure_after_first_page_leaves_earlier_pages_written() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();

        // Two pages; the service fails the second page's query.
        let data = vec![0u8; 2 * PAGE_SIZE as usize];
        let address = data.as_ptr() as u64;
        let aligned = (address + PAGE_SIZE - 1) & PAGE_MASK;
        let first_page = aligned;

        let mut service = MockMemoryAttributeService::new();
        service
            .expect_get_attributes()
            .withf(move |base, _| *base == first_page)
            .times(1)
            .returning(|_, _| Ok(MemoryAttributes::empty()));
        service
            .expect_get_attributes()
            .withf(move |base, _| *base != first_page)
            .times(1)
            .returning(|_, _| Err(EfiError::Unsupported));

        let buffer = [0xEEu8; PAGE_SIZE as usize + 0x10];
        let result = access_memory::<TestArch>(aligned, buffer.as_ptr() as *mut u8, buffer.len(), true, Some(&service));
        assert!(result.is_err());

        // The first page was copied before the failure was discovered.
        let offset = (aligned - address) as usize;
        assert_eq!(data[offset..offset + PAGE_SIZE as usize], [0xEE; PAGE_SIZE as usize]);
        assert_eq!(data[offset + PAGE_SIZE as usize], 0);
    }

    #[cfg(feature = "windbg_workarounds")]
    #[test]
    fn test_windbg_zero_window() {
        let _guard = ARCH_TEST_LOCK.lock().unwrap();
        TestArch::set_pages_accessible(false);

        let mut buffer = [0xFFu8; 16];
        read_memory::<TestArch>(WINDBG_SHARED_DATA_PAGE, &mut buffer).expect("Failed to read shared data page.");
        assert_eq!(buffer, [0; 16]);

        let mut buffer = [0xFFu8; 16];
        read_memory::<TestArch>(0x10, &mut buffer).expect("Failed to read first page.");
        assert_eq!(buffer, [0; 16]);

        TestArch::set_pages_accessible(true);
    }
}
