//! Abstraction over physical addresses with utility functions for address conversion.
//!
//! Provides conversions between guest virtual addresses and guest physical
//! addresses, plus the host-side view of physical memory. The host runs
//! identity mapped, so a guest physical address doubles as the host virtual
//! address of the backing frame; that assumption is concentrated in
//! [`host_va_of_pa`] (hosted tests substitute an arena-backed view there).

use {
    crate::{error::HypervisorError, intel::paging},
    x86::bits64::paging::{PAddr, BASE_PAGE_SHIFT},
};

/// A representation of physical addresses.
///
/// Provides utility methods to work with physical addresses,
/// including conversions between physical and virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddress(PAddr);

impl PhysicalAddress {
    /// Constructs a `PhysicalAddress` from a given physical address.
    pub fn from_pa(pa: u64) -> Self {
        Self(PAddr::from(pa))
    }

    /// Retrieves the page frame number (PFN) for the physical address.
    pub fn pfn(&self) -> u64 {
        self.0.as_u64() >> BASE_PAGE_SHIFT
    }

    /// Retrieves the physical address.
    pub fn pa(&self) -> u64 {
        self.0.as_u64()
    }

    /// Converts a guest virtual address to its guest physical address by
    /// walking the guest's own page tables under the given CR3.
    ///
    /// # Returns
    ///
    /// A `Result<u64, HypervisorError>` containing the physical address on
    /// success, or a translation error if the walk fails at any level.
    pub fn pa_from_va(va: u64, guest_cr3: u64) -> Result<u64, HypervisorError> {
        unsafe { paging::translate_guest_virtual_to_guest_physical(guest_cr3, va) }
    }
}

/// Host virtual address backing a physical address.
///
/// The host address space is identity mapped, so the conversion is direct.
#[cfg(not(test))]
pub fn host_va_of_pa(pa: u64) -> *mut u8 {
    pa as *mut u8
}

/// Hosted-test view of physical memory: addresses resolve into an arena
/// registered by the test harness.
#[cfg(test)]
pub fn host_va_of_pa(pa: u64) -> *mut u8 {
    (testing::PHYS_BASE.load(core::sync::atomic::Ordering::Relaxed) + pa) as *mut u8
}
