//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 4.2 HIERARCHICAL PAGING STRUCTURES: AN OVERVIEW
//!
//! Walker for the guest's own 4-level page tables, used to resolve the guest
//! virtual addresses supplied over the vmcall interface into guest physical
//! addresses. Table memory is reached through the host-side view of physical
//! memory ([`crate::intel::addresses::host_va_of_pa`]).

use {
    crate::{error::HypervisorError, intel::addresses::host_va_of_pa},
    bitfield::bitfield,
    x86::bits64::paging::{
        pd_index, pdpt_index, pml4_index, pt_index, VAddr, BASE_PAGE_SHIFT, BASE_PAGE_SIZE,
        HUGE_PAGE_SIZE, LARGE_PAGE_SIZE,
    },
};

/// Mask extracting the table base address from CR3 and paging entries.
const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Translates a guest virtual address to a guest physical address using the
/// guest's CR3.
///
/// # Arguments
///
/// * `guest_cr3` - The guest CR3 register value, containing the base address
///   of the guest's page table hierarchy.
/// * `guest_va` - The guest virtual address to translate.
///
/// # Safety
///
/// Reads guest-controlled table memory through raw pointers; the caller must
/// only pass a CR3 value taken from a running guest (or fabricated test
/// tables), and the walk is only meaningful while that address space exists.
///
/// # Returns
///
/// Returns a `Result<u64, HypervisorError>` containing the translated guest
/// physical address, or an error naming the level at which the walk failed.
pub unsafe fn translate_guest_virtual_to_guest_physical(guest_cr3: u64, guest_va: u64) -> Result<u64, HypervisorError> {
    let va = VAddr::from(guest_va);

    let pml4_table = host_va_of_pa(guest_cr3 & ADDRESS_MASK) as *const Table;
    let pml4_entry = (*pml4_table).entries[pml4_index(va)];
    if !pml4_entry.present() {
        return Err(HypervisorError::InvalidPml4Entry);
    }

    let pdpt_table = host_va_of_pa((pml4_entry.pfn() << BASE_PAGE_SHIFT) & ADDRESS_MASK) as *const Table;
    let pdpt_entry = (*pdpt_table).entries[pdpt_index(va)];
    if !pdpt_entry.present() {
        return Err(HypervisorError::InvalidPdptEntry);
    }

    // 1GB huge page: the entry maps the frame directly.
    if pdpt_entry.large() {
        let base = (pdpt_entry.pfn() << BASE_PAGE_SHIFT) & !(HUGE_PAGE_SIZE as u64 - 1);
        return Ok(base + (guest_va & (HUGE_PAGE_SIZE as u64 - 1)));
    }

    let pd_table = host_va_of_pa((pdpt_entry.pfn() << BASE_PAGE_SHIFT) & ADDRESS_MASK) as *const Table;
    let pd_entry = (*pd_table).entries[pd_index(va)];
    if !pd_entry.present() {
        return Err(HypervisorError::InvalidPdEntry);
    }

    // 2MB large page: the entry maps the frame directly.
    if pd_entry.large() {
        let base = (pd_entry.pfn() << BASE_PAGE_SHIFT) & !(LARGE_PAGE_SIZE as u64 - 1);
        return Ok(base + (guest_va & (LARGE_PAGE_SIZE as u64 - 1)));
    }

    let pt_table = host_va_of_pa((pd_entry.pfn() << BASE_PAGE_SHIFT) & ADDRESS_MASK) as *const Table;
    let pt_entry = (*pt_table).entries[pt_index(va)];
    if !pt_entry.present() {
        return Err(HypervisorError::InvalidPtEntry);
    }

    Ok((pt_entry.pfn() << BASE_PAGE_SHIFT) + (guest_va & (BASE_PAGE_SIZE as u64 - 1)))
}

/// One 4-KiB table of 512 paging entries, shared by every level of the walk.
#[repr(C, align(4096))]
struct Table {
    entries: [Entry; 512],
}

bitfield! {
    /// A paging entry in the guest's standard x86-64 page tables.
    #[derive(Clone, Copy)]
    pub struct Entry(u64);
    impl Debug;

    pub present, set_present: 0;
    pub writable, set_writable: 1;
    pub large, set_large: 7;
    pub pfn, set_pfn: 51, 12;
}
