//! The split engine: creation, activation, teardown, and patching of TLB
//! splits, plus the leaf transitions the violation handler flips through.
//!
//! All methods take `&mut self`; the engine is shared behind the core engine
//! lock and every vmcall operation holds that lock for its whole effect, so
//! concurrent vCPUs observe engine operations as linearizable.

use {
    crate::{
        allocate::box_zeroed,
        error::HypervisorError,
        global_const::THRASH_REPEAT_LIMIT,
        intel::{
            addresses::PhysicalAddress,
            ept::{AccessType, Ept, Pt},
            guest_memory::GuestMemoryMapping,
            invept::invept_all_contexts,
            invvpid::invvpid_all_contexts,
            page::Page,
            split::registry::{LargePageTracker, SplitContext, SplitRegistry},
        },
    },
    alloc::{boxed::Box, vec},
    log::*,
    x86::bits64::paging::{BASE_PAGE_SIZE, LARGE_PAGE_SIZE},
};

/// Result of an `is_split` query, in the encoding returned over the vmcall
/// interface.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStatus {
    /// A split exists for the page and has been activated.
    Split = 1,
    /// No active split exists for the page.
    NotSplit = 0,
    /// The guest virtual address has no backing under the requesting CR3.
    Unmapped = -1,
}

/// Consecutive same-RIP violation bookkeeping used to spot a guest
/// instruction that keeps faulting without making progress.
#[derive(Default)]
pub(crate) struct ThrashTracker {
    last_rip: u64,
    repeat_count: u32,
}

impl ThrashTracker {
    /// Notes a violation at `rip` and reports whether the thrash threshold
    /// was crossed. Crossing it resets the tracker.
    pub(crate) fn note(&mut self, rip: u64) -> bool {
        if rip == self.last_rip {
            self.repeat_count += 1;
        } else {
            self.last_rip = rip;
            self.repeat_count = 1;
        }

        if self.repeat_count > THRASH_REPEAT_LIMIT {
            self.last_rip = 0;
            self.repeat_count = 0;
            true
        } else {
            false
        }
    }
}

/// Owner of the split registry, the large-page tracker, and the hooked EPT
/// hierarchy they describe.
pub struct SplitEngine {
    pub(crate) registry: SplitRegistry,
    pub(crate) tracker: LargePageTracker,
    ept: Box<Ept>,
    pub(crate) thrash: ThrashTracker,

    /// Guest RFLAGS saved while an instruction single-steps under the clean
    /// EPT view with interrupts masked.
    pub(crate) old_rflags: Option<u64>,
}

impl SplitEngine {
    pub fn new(ept: Box<Ept>) -> Self {
        Self {
            registry: SplitRegistry::default(),
            tracker: LargePageTracker::default(),
            ept,
            thrash: ThrashTracker::default(),
            old_rflags: None,
        }
    }

    /// Creates a split for the page containing `gva`, or takes another hook
    /// reference on an existing one.
    ///
    /// The first split inside a 2-MiB region remaps that region from one
    /// large page to 512 identity 4-KiB leaves so a single page can be
    /// retargeted without disturbing its neighbors.
    pub fn create_split(&mut self, gva: u64, cr3: u64, pat: u64) -> Result<(), HypervisorError> {
        if gva == 0 {
            return Err(HypervisorError::BadArgument);
        }

        let d_va = gva & !(BASE_PAGE_SIZE as u64 - 1);
        let d_pa = PhysicalAddress::pa_from_va(d_va, cr3)?;
        let aligned_2m_pa = d_pa & !(LARGE_PAGE_SIZE as u64 - 1);

        if !self.tracker.is_tracked(aligned_2m_pa) {
            debug!("create_split: remapping region from 2m to 4k for: {:#x}", aligned_2m_pa);

            let mut pt = unsafe { box_zeroed::<Pt>() };
            self.ept.split_2mb_to_4kb(aligned_2m_pa, &mut pt)?;
            self.tracker.track(aligned_2m_pa, pt);

            Self::invalidate_caches();
        }

        if let Some(context) = self.registry.get_mut(d_pa) {
            // Already split, another hook shares the page.
            context.hook_count += 1;
            debug!("create_split: page already split for: {:#x}, hooks: {}", d_pa, context.hook_count);
            return Ok(());
        }

        debug!("create_split: splitting page for: {:#x}", d_pa);

        // The code frame starts out as an exact copy of the data page, so an
        // inactive or freshly activated split is invisible to the guest.
        let mut code_frame = unsafe { box_zeroed::<Page>() };
        GuestMemoryMapping::new(d_va, cr3, BASE_PAGE_SIZE, pat)?.read_into(code_frame.as_mut_slice())?;

        self.registry.insert(SplitContext::new(code_frame, d_va, d_pa, gva, cr3));
        self.tracker.increment(aligned_2m_pa);

        debug!(
            "create_split: splits in this (2m) range: {}",
            self.tracker.split_count(aligned_2m_pa)
        );

        Ok(())
    }

    /// Points the page's leaf at the code frame with exec-only access, which
    /// arms the split: the next read or write will trap and flip back.
    pub fn activate_split(&mut self, gva: u64, cr3: u64) -> Result<(), HypervisorError> {
        if gva == 0 {
            return Err(HypervisorError::BadArgument);
        }

        let d_va = gva & !(BASE_PAGE_SIZE as u64 - 1);
        let d_pa = PhysicalAddress::pa_from_va(d_va, cr3)?;

        let Some(context) = self.registry.get(d_pa) else {
            warn!("activate_split: no split found for: {:#x}", d_pa);
            return Err(HypervisorError::SplitNotFound);
        };

        if context.active {
            debug!("activate_split: split already active for: {:#x}", d_pa);
            return Ok(());
        }

        debug!("activate_split: activating split for: {:#x}", d_pa);

        // Serve the code frame first; execution is the most likely next
        // access to a freshly hooked page.
        let c_pa = context.c_pa;
        self.rewrite_leaf(d_pa, c_pa, AccessType::EXECUTE)?;
        Self::invalidate_caches();

        if let Some(context) = self.registry.get_mut(d_pa) {
            context.active = true;
        }

        Ok(())
    }

    /// Releases one hook reference on the split owning `gva`, tearing the
    /// split down when the last reference goes away.
    pub fn deactivate_split(&mut self, gva: u64, cr3: u64) -> Result<(), HypervisorError> {
        if gva == 0 {
            return Err(HypervisorError::BadArgument);
        }

        let d_va = gva & !(BASE_PAGE_SIZE as u64 - 1);
        let d_pa = PhysicalAddress::pa_from_va(d_va, cr3)?;

        self.deactivate_by_pa(d_pa, true)
    }

    /// Deactivates the split keyed by `d_pa`.
    ///
    /// With more than one hook anchored in the page only the reference count
    /// drops. Otherwise the leaf is restored to identity pass-through, the
    /// context is removed, and the page directly after the torn-down one is
    /// swept: a neighbor with a zero hook count is the residue of a write
    /// that crossed the page boundary and is deactivated as well.
    ///
    /// `invalidate` is false when called from the violation handler, where
    /// the hardware has already invalidated the violating translation and an
    /// explicit flush would re-trigger the violation.
    pub fn deactivate_by_pa(&mut self, d_pa: u64, invalidate: bool) -> Result<(), HypervisorError> {
        let Some(context) = self.registry.get(d_pa) else {
            warn!("deactivate_split: no split found for: {:#x}", d_pa);
            return Err(HypervisorError::SplitNotFound);
        };

        if context.hook_count > 1 {
            if let Some(context) = self.registry.get_mut(d_pa) {
                context.hook_count -= 1;
                debug!("deactivate_split: other hooks remain on page {:#x}, hooks: {}", d_pa, context.hook_count);
            }
            return Ok(());
        }

        debug!("deactivate_split: deactivating split for: {:#x}", d_pa);

        // Flip back to the data frame and restore full access before the
        // context (and with it the code frame) goes away.
        self.rewrite_leaf(d_pa, d_pa, AccessType::READ_WRITE_EXECUTE)?;
        self.registry.remove(d_pa);

        if invalidate {
            Self::invalidate_caches();
        }

        let aligned_2m_pa = d_pa & !(LARGE_PAGE_SIZE as u64 - 1);
        self.tracker.decrement(aligned_2m_pa);
        debug!(
            "deactivate_split: splits in this (2m) range: {}",
            self.tracker.split_count(aligned_2m_pa)
        );

        if let Some(next) = self.registry.adjacent(d_pa) {
            if next.hook_count == 0 {
                let next_pa = next.d_pa;
                debug!("deactivate_split: deactivating adjacent split for: {:#x}", next_pa);
                self.deactivate_by_pa(next_pa, invalidate)?;
            }
        }

        Ok(())
    }

    /// Tears down every split, draining the registry from its head so that
    /// adjacent-split sweeps removing further entries cannot trip the loop.
    pub fn deactivate_all(&mut self) -> Result<(), HypervisorError> {
        debug!("deactivate_all: current num of splits: {}", self.registry.len());

        while let Some(d_pa) = self.registry.head() {
            self.deactivate_by_pa(d_pa, true)?;
        }

        Ok(())
    }

    /// Reports whether the page containing `gva` carries an active split.
    pub fn is_split(&self, gva: u64, cr3: u64) -> SplitStatus {
        if gva == 0 {
            return SplitStatus::NotSplit;
        }

        let d_va = gva & !(BASE_PAGE_SIZE as u64 - 1);
        let d_pa = match PhysicalAddress::pa_from_va(d_va, cr3) {
            Ok(pa) => pa,
            Err(error) if error.is_translation_failure() => return SplitStatus::Unmapped,
            Err(_) => return SplitStatus::NotSplit,
        };

        match self.registry.get(d_pa) {
            Some(context) if context.active => SplitStatus::Split,
            _ => SplitStatus::NotSplit,
        }
    }

    /// Copies `size` bytes from guest memory at `from_va` into the code
    /// frame(s) backing `to_va`.
    ///
    /// A destination range that runs off the end of its page spills into the
    /// next page's code frame; if that page is not yet split and active, it
    /// is split and activated here so the spilled bytes take effect.
    pub fn write_to_code(&mut self, from_va: u64, to_va: u64, size: u64, cr3: u64, pat: u64) -> Result<(), HypervisorError> {
        if from_va == 0 || to_va == 0 || size == 0 {
            return Err(HypervisorError::BadArgument);
        }

        debug!("write_to_code: from_va: {:#x}, to_va: {:#x}, size: {:#x}", from_va, to_va, size);

        let d_va = to_va & !(BASE_PAGE_SIZE as u64 - 1);
        let d_pa = PhysicalAddress::pa_from_va(d_va, cr3)?;

        if !self.registry.contains(d_pa) {
            warn!("write_to_code: no split found for: {:#x}", d_pa);
            return Err(HypervisorError::SplitNotFound);
        }

        let end_range = to_va.checked_add(size - 1).ok_or(HypervisorError::BadArgument)?;
        let spans_pages = (end_range >> 12) > (to_va >> 12);

        // The destination may cover at most two consecutive pages.
        if (end_range >> 12) - (to_va >> 12) > 1 {
            return Err(HypervisorError::BadArgument);
        }

        let write_offset = (to_va & (BASE_PAGE_SIZE as u64 - 1)) as usize;
        let size = size as usize;

        let mut staged = vec![0u8; size];
        GuestMemoryMapping::new(from_va, cr3, size, pat)?.read_into(&mut staged)?;

        if spans_pages {
            let end_va = end_range & !(BASE_PAGE_SIZE as u64 - 1);
            let end_pa = PhysicalAddress::pa_from_va(end_va, cr3)?;

            debug!("write_to_code: writing to two pages: {:#x} & {:#x}", d_pa, end_pa);

            if self.is_split(end_va, cr3) != SplitStatus::Split {
                debug!("write_to_code: splitting second page: {:#x}", end_pa);
                self.create_split(end_va, cr3, pat)?;
                self.activate_split(end_va, cr3)?;
            }

            let bytes_first_page = BASE_PAGE_SIZE - write_offset;
            let bytes_second_page = size - bytes_first_page;

            let first = self.registry.get_mut(d_pa).ok_or(HypervisorError::SplitNotFound)?;
            first.code_bytes_mut()[write_offset..].copy_from_slice(&staged[..bytes_first_page]);

            let second = self.registry.get_mut(end_pa).ok_or(HypervisorError::SplitNotFound)?;
            second.code_bytes_mut()[..bytes_second_page].copy_from_slice(&staged[bytes_first_page..]);
        } else {
            debug!("write_to_code: writing to one page: {:#x}", d_pa);

            let context = self.registry.get_mut(d_pa).ok_or(HypervisorError::SplitNotFound)?;
            context.code_bytes_mut()[write_offset..write_offset + size].copy_from_slice(&staged);
        }

        Ok(())
    }

    /// Leaf transition taken on a read or write violation: serve the data
    /// frame, keep trapping instruction fetches.
    pub fn flip_to_data(&mut self, d_pa: u64) -> Result<(), HypervisorError> {
        self.rewrite_leaf(d_pa, d_pa, AccessType::READ_WRITE)
    }

    /// Leaf transition taken on an execute violation: serve the code frame,
    /// keep trapping reads and writes.
    pub fn flip_to_code(&mut self, d_pa: u64) -> Result<(), HypervisorError> {
        let context = self.registry.get(d_pa).ok_or(HypervisorError::SplitNotFound)?;
        let c_pa = context.c_pa;
        self.rewrite_leaf(d_pa, c_pa, AccessType::EXECUTE)
    }

    /// Restores the identity pass-through mapping for a page that violated
    /// without being under engine control.
    pub fn restore_pass_through(&mut self, d_pa: u64) -> Result<(), HypervisorError> {
        self.rewrite_leaf(d_pa, d_pa, AccessType::READ_WRITE_EXECUTE)
    }

    /// Read access to the hooked EPT hierarchy.
    pub fn ept(&self) -> &Ept {
        &self.ept
    }

    fn rewrite_leaf(&mut self, d_pa: u64, host_pa: u64, access_type: AccessType) -> Result<(), HypervisorError> {
        let aligned_2m_pa = d_pa & !(LARGE_PAGE_SIZE as u64 - 1);
        let pt = self.tracker.pt_mut(aligned_2m_pa).ok_or(HypervisorError::PageTableNotFound)?;
        self.ept.update_leaf(d_pa, host_pa, access_type, pt)
    }

    /// Global flush after an engine-initiated leaf change. Never called on
    /// the violation path, where the hardware invalidates the violating
    /// translation itself.
    fn invalidate_caches() {
        invept_all_contexts();
        invvpid_all_contexts();
    }
}
