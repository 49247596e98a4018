//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)
//!
//! The extended page-table mechanism translates guest physical addresses to
//! host physical addresses through a second set of paging structures. The
//! split engine drives it in two ways: breaking a 2-MiB identity mapping
//! into 4-KiB leaves on demand, and rewriting individual leaves so a hooked
//! page is served from either its code frame or its data frame with the
//! access bits that trap the complementary access class.

use {
    crate::{error::HypervisorError, intel::mtrr::MemoryType},
    bitfield::bitfield,
    core::ptr::addr_of,
    log::*,
    x86::bits64::paging::{pd_index, pdpt_index, pt_index, VAddr, BASE_PAGE_SHIFT, BASE_PAGE_SIZE, LARGE_PAGE_SIZE},
};

/// Represents the entire Extended Page Table structure.
///
/// EPT is a set of nested page tables similar to the standard x86-64 paging
/// mechanism, consisting of PML4, PDPT, PD, and PT levels. The hierarchy
/// embedded here covers the first 512 GiB with 2-MiB granularity; regions
/// that contain split pages are subdivided into externally owned leaf tables
/// ([`Pt`]) installed over their page-directory entries.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
#[repr(C, align(4096))]
pub struct Ept {
    /// Page Map Level 4 (PML4) Table.
    pml4: Table,
    /// Page Directory Pointer Table (PDPT).
    pdpt: Table,
    /// Array of Page Directory Tables (PDT).
    pd: [Table; 512],
}

impl Ept {
    /// Builds an identity-mapped EPT using 2MB write-back pages.
    ///
    /// Maps guest-physical 0..512 GiB directly to host-physical 0..512 GiB
    /// with read/write/execute access:
    ///   - PML4[0] → PDPT
    ///   - PDPT[i] → PD[i]
    ///   - PD entries as 2MB large pages
    pub fn build_identity(&mut self) {
        trace!("Initializing EPT identity map");

        let mut pa = 0u64;
        let wb = MemoryType::WriteBack as u64;

        self.pml4.entries[0].set_readable(true);
        self.pml4.entries[0].set_writable(true);
        self.pml4.entries[0].set_executable(true);
        self.pml4.entries[0].set_pfn(addr_of!(self.pdpt) as u64 >> BASE_PAGE_SHIFT);

        for (i, pdpte) in self.pdpt.entries.iter_mut().enumerate() {
            pdpte.set_readable(true);
            pdpte.set_writable(true);
            pdpte.set_executable(true);
            pdpte.set_pfn(addr_of!(self.pd[i]) as u64 >> BASE_PAGE_SHIFT);

            for pde in &mut self.pd[i].entries {
                pde.set_readable(true);
                pde.set_writable(true);
                pde.set_executable(true);
                pde.set_memory_type(wb);
                pde.set_large(true);
                pde.set_pfn(pa >> BASE_PAGE_SHIFT);
                pa += LARGE_PAGE_SIZE as u64;
            }
        }
    }

    /// Splits a large 2MB page into 512 smaller 4KB pages for a given guest
    /// physical address, installing `pt` as the region's leaf table.
    ///
    /// The new leaves identity map the region and inherit the memory type of
    /// the large page they replace. The caller owns `pt` and must keep it
    /// alive for as long as the mapping is installed.
    ///
    /// # Arguments
    ///
    /// * `guest_pa`: The guest physical address within the 2MB page that needs to be split.
    /// * `pt`: The page table to install for the split region.
    ///
    /// # Returns
    ///
    /// A `Result<(), HypervisorError>` indicating if the operation was successful.
    pub fn split_2mb_to_4kb(&mut self, guest_pa: u64, pt: &mut Pt) -> Result<(), HypervisorError> {
        trace!("Splitting 2mb page into 4kb pages: {:#x}", guest_pa);

        let guest_va = VAddr::from(guest_pa);
        let pde = &mut self.pd[pdpt_index(guest_va)].entries[pd_index(guest_va)];

        // Only a large page can be subdivided; a page directory here means
        // the region is already split.
        if !pde.large() {
            trace!("Page is already split: {:x}.", guest_va);
            return Err(HypervisorError::PageAlreadySplit);
        }

        // Keep the memory type of the large page before unmapping it.
        let memory_type = pde.memory_type();
        *pde = Entry(0);

        for (i, pte) in pt.0.entries.iter_mut().enumerate() {
            *pte = Entry(0);

            let pa = (guest_pa & !(LARGE_PAGE_SIZE as u64 - 1)) + (i * BASE_PAGE_SIZE) as u64;
            pte.set_readable(true);
            pte.set_writable(true);
            pte.set_executable(true);
            pte.set_memory_type(memory_type);
            pte.set_pfn(pa >> BASE_PAGE_SHIFT);
        }

        // Repoint the PDE at the new page table.
        pde.set_readable(true);
        pde.set_writable(true);
        pde.set_executable(true);
        pde.set_memory_type(0); // Table 29-6. Format of an EPT Page-Directory Entry (PDE) that References an EPT Page Table: 6:3 Reserved (must be 0)
        pde.set_large(false);
        pde.set_pfn((pt as *mut Pt as u64) >> BASE_PAGE_SHIFT);

        Ok(())
    }

    /// Reads the 4-KiB leaf entry mapping `guest_pa`.
    ///
    /// # Arguments
    ///
    /// * `guest_pa` - Guest physical address of the page; must be 4-KiB aligned.
    /// * `pt` - The leaf table installed over the owning 2-MiB region.
    pub fn leaf(&self, guest_pa: u64, pt: &Pt) -> Result<Entry, HypervisorError> {
        let guest_va = VAddr::from(guest_pa);

        if !guest_va.is_base_page_aligned() {
            error!("Page is not aligned: {:#x}", guest_va);
            return Err(HypervisorError::UnalignedAddressError);
        }

        let pde = &self.pd[pdpt_index(guest_va)].entries[pd_index(guest_va)];
        if pde.large() {
            error!("Region is still mapped as a large page: {:#x}", guest_va);
            return Err(HypervisorError::LargePageRemapError);
        }

        Ok(pt.0.entries[pt_index(guest_va)])
    }

    /// Rewrites the 4-KiB leaf for `guest_pa` to point at `host_pa` with the
    /// given access bits, as a single 64-bit store.
    ///
    /// The memory-type bits of the existing leaf are preserved. No TLB or
    /// EPT invalidation is performed here; flushing is the caller's call,
    /// because leaves rewritten from the violation handler must not be
    /// flushed at all.
    ///
    /// # Arguments
    ///
    /// * `guest_pa` - Guest physical address of the page to rewrite; 4-KiB aligned.
    /// * `host_pa` - The frame the page should be served from; 4-KiB aligned.
    /// * `access_type` - The access bits to set for the page.
    /// * `pt` - The leaf table installed over the owning 2-MiB region.
    ///
    /// # Returns
    ///
    /// A `Result<(), HypervisorError>` indicating if the operation was successful.
    pub fn update_leaf(&mut self, guest_pa: u64, host_pa: u64, access_type: AccessType, pt: &mut Pt) -> Result<(), HypervisorError> {
        let guest_va = VAddr::from(guest_pa);
        let host_va = VAddr::from(host_pa);

        if !guest_va.is_base_page_aligned() || !host_va.is_base_page_aligned() {
            error!("Addresses are not aligned: GPA {:#x}, HPA {:#x}", guest_va, host_va);
            return Err(HypervisorError::UnalignedAddressError);
        }

        let pde = &self.pd[pdpt_index(guest_va)].entries[pd_index(guest_va)];
        if pde.large() {
            error!("Cannot rewrite a leaf inside an unsplit large page: GPA {:#x}", guest_va);
            return Err(HypervisorError::LargePageRemapError);
        }

        let pte = &mut pt.0.entries[pt_index(guest_va)];

        // Compose the new leaf value and commit it with one store.
        let mut entry = *pte;
        entry.set_readable(access_type.contains(AccessType::READ));
        entry.set_writable(access_type.contains(AccessType::WRITE));
        entry.set_executable(access_type.contains(AccessType::EXECUTE));
        entry.set_pfn(host_pa >> BASE_PAGE_SHIFT);
        *pte = entry;

        trace!("Leaf for GPA {:#x} now maps HPA {:#x} with {:?}", guest_pa, host_pa, access_type);

        Ok(())
    }

    /// Creates an Extended Page Table Pointer (EPTP) with a Write-Back
    /// memory type and a 4-level page walk for this hierarchy.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 28.2.6 EPT Paging-Structure Entries
    pub fn eptp(&self) -> Result<u64, HypervisorError> {
        let ept_pml4_base_addr = addr_of!(self.pml4) as u64;

        // The EPTP encodes "number of levels minus one" in bits 5:3.
        const EPT_PAGE_WALK_LENGTH_4: u64 = 3 << 3;
        const EPT_MEMORY_TYPE_WB: u64 = MemoryType::WriteBack as u64;

        if ept_pml4_base_addr.trailing_zeros() >= 12 {
            Ok(ept_pml4_base_addr | EPT_PAGE_WALK_LENGTH_4 | EPT_MEMORY_TYPE_WB)
        } else {
            Err(HypervisorError::InvalidEptPml4BaseAddress)
        }
    }
}

/// An EPT Page-Table: the leaf level mapping 4-KByte pages for one 2-MiB
/// region that has been subdivided.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Format of an EPT Page-Table Entry that Maps a 4-KByte Page
#[derive(Debug, Clone, Copy)]
pub struct Pt(Table);

/// General struct to represent a table in the EPT paging structure.
#[repr(C, align(4096))]
#[derive(Debug, Clone, Copy)]
struct Table {
    entries: [Entry; 512],
}

bitfield! {
    /// Represents an Extended Page Table Entry (EPT Entry).
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
    #[derive(Clone, Copy)]
    pub struct Entry(u64);
    impl Debug;

    // Flag definitions for an EPT entry.
    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub large, set_large: 7;
    pub pfn, set_pfn: 51, 12;
}

impl Entry {
    /// True when the entry grants read, write, and execute access, meaning
    /// the page is identity pass-through rather than under engine control.
    pub fn is_pass_through(&self) -> bool {
        self.readable() && self.writable() && self.executable()
    }
}

bitflags::bitflags! {
    /// Access permissions for an EPT entry.
    ///
    /// The bit layout matches the low three bits of the EPT violation exit
    /// qualification, so the same type doubles as the violating access mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessType: u8 {
        /// The EPT entry allows read access.
        const READ = 0b001;
        /// The EPT entry allows write access.
        const WRITE = 0b010;
        /// The EPT entry allows execute access.
        const EXECUTE = 0b100;
        /// The EPT entry allows read and write access.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// The EPT entry allows read, write, and execute access.
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}
