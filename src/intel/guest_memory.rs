//! Scoped host-side view of a guest virtual address range.
//!
//! The engine never dereferences guest pointers directly: every copy in or
//! out of guest memory goes through a [`GuestMemoryMapping`], which resolves
//! the range under the requesting CR3 and exposes bulk copies. Because the
//! host address space is identity mapped, acquiring the view allocates
//! nothing; it fails up front if any page of the range is unmapped.

use {
    crate::{
        error::HypervisorError,
        intel::{addresses::host_va_of_pa, paging},
    },
    core::ptr::copy_nonoverlapping,
    log::trace,
    x86::bits64::paging::BASE_PAGE_SIZE,
};

/// A validated view of `len` bytes of guest memory starting at `gva` in the
/// address space identified by `cr3`.
pub struct GuestMemoryMapping {
    gva: u64,
    cr3: u64,
    len: usize,
}

impl GuestMemoryMapping {
    /// Resolves a guest range for subsequent copies.
    ///
    /// # Arguments
    ///
    /// * `gva` - Start of the guest virtual range; need not be aligned.
    /// * `cr3` - Guest CR3 identifying the address space.
    /// * `len` - Number of bytes; must be non-zero.
    /// * `pat` - Guest IA32_PAT at the time of the request. The identity
    ///   mapped host does not re-derive caching attributes, so the value is
    ///   only reported for diagnostics.
    ///
    /// # Returns
    ///
    /// The mapping, or a translation error if any page of the range has no
    /// backing under `cr3`.
    pub fn new(gva: u64, cr3: u64, len: usize, pat: u64) -> Result<Self, HypervisorError> {
        if gva == 0 || len == 0 {
            return Err(HypervisorError::BadArgument);
        }

        trace!("Mapping guest range gva: {:#x} len: {:#x} cr3: {:#x} pat: {:#x}", gva, len, cr3, pat);

        let end = gva.checked_add(len as u64 - 1).ok_or(HypervisorError::BadArgument)?;

        // Probe every page up front so copies cannot fail half way through.
        let last_page = end & !(BASE_PAGE_SIZE as u64 - 1);
        let mut va = gva & !(BASE_PAGE_SIZE as u64 - 1);
        loop {
            unsafe { paging::translate_guest_virtual_to_guest_physical(cr3, va)? };
            if va == last_page {
                break;
            }
            va += BASE_PAGE_SIZE as u64;
        }

        Ok(Self { gva, cr3, len })
    }

    /// Copies the mapped guest range into `out`.
    pub fn read_into(&self, out: &mut [u8]) -> Result<(), HypervisorError> {
        if out.len() != self.len {
            return Err(HypervisorError::BadArgument);
        }

        self.for_each_chunk(|host, offset, chunk| unsafe {
            copy_nonoverlapping(host, out.as_mut_ptr().add(offset), chunk);
        })
    }

    /// Copies `data` over the mapped guest range.
    pub fn write_from(&self, data: &[u8]) -> Result<(), HypervisorError> {
        if data.len() != self.len {
            return Err(HypervisorError::BadArgument);
        }

        self.for_each_chunk(|host, offset, chunk| unsafe {
            copy_nonoverlapping(data.as_ptr().add(offset), host, chunk);
        })
    }

    /// Walks the range one guest page at a time, handing the host pointer of
    /// each chunk to `f` together with its offset into the range.
    fn for_each_chunk(&self, mut f: impl FnMut(*mut u8, usize, usize)) -> Result<(), HypervisorError> {
        let mut va = self.gva;
        let mut done = 0usize;

        while done < self.len {
            let page_offset = (va & (BASE_PAGE_SIZE as u64 - 1)) as usize;
            let chunk = core::cmp::min(BASE_PAGE_SIZE - page_offset, self.len - done);

            let gpa = unsafe { paging::translate_guest_virtual_to_guest_physical(self.cr3, va)? };
            f(host_va_of_pa(gpa), done, chunk);

            va += chunk as u64;
            done += chunk;
        }

        Ok(())
    }
}
