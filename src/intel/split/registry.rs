//! Bookkeeping for split pages: the registry of per-page split contexts and
//! the tracker of 2-MiB regions that have been subdivided for them.

use {
    crate::intel::{ept::Pt, page::Page},
    alloc::{boxed::Box, collections::BTreeMap},
    x86::bits64::paging::{BASE_PAGE_SIZE, LARGE_PAGE_SIZE},
};

/// Per-page state for one TLB split.
///
/// The context exclusively owns the code frame; the data frame is the
/// guest's own page and is referenced only by address.
pub struct SplitContext {
    /// Host-allocated frame served on instruction fetches.
    code_frame: Box<Page>,

    /// Host physical address of the code frame.
    pub c_pa: u64,

    /// Guest virtual address of the data page (4-KiB aligned).
    pub d_va: u64,

    /// Guest physical address of the data page.
    pub d_pa: u64,

    /// The guest virtual address the split was first requested for,
    /// retained unaligned for diagnostics.
    pub gva: u64,

    /// CR3 of the address space that requested the split.
    pub cr3: u64,

    /// Number of hooks anchored in this page.
    pub hook_count: u64,

    /// Set once the leaf has been flipped to the code frame for the first time.
    pub active: bool,
}

impl SplitContext {
    pub fn new(code_frame: Box<Page>, d_va: u64, d_pa: u64, gva: u64, cr3: u64) -> Self {
        let c_pa = &*code_frame as *const Page as u64;
        Self {
            code_frame,
            c_pa,
            d_va,
            d_pa,
            gva,
            cr3,
            hook_count: 1,
            active: false,
        }
    }

    pub fn code_bytes(&self) -> &[u8] {
        self.code_frame.as_slice()
    }

    pub fn code_bytes_mut(&mut self) -> &mut [u8] {
        self.code_frame.as_mut_slice()
    }
}

/// Ordered mapping from data-frame physical address to the owned split
/// context for that page.
#[derive(Default)]
pub struct SplitRegistry {
    splits: BTreeMap<u64, SplitContext>,
}

impl SplitRegistry {
    pub fn get(&self, d_pa: u64) -> Option<&SplitContext> {
        self.splits.get(&d_pa)
    }

    pub fn get_mut(&mut self, d_pa: u64) -> Option<&mut SplitContext> {
        self.splits.get_mut(&d_pa)
    }

    pub fn contains(&self, d_pa: u64) -> bool {
        self.splits.contains_key(&d_pa)
    }

    pub fn insert(&mut self, context: SplitContext) {
        self.splits.insert(context.d_pa, context);
    }

    pub fn remove(&mut self, d_pa: u64) -> Option<SplitContext> {
        self.splits.remove(&d_pa)
    }

    /// The split living in the page directly after `d_pa`, if any. Used to
    /// discover residues of writes that crossed a page boundary.
    pub fn adjacent(&self, d_pa: u64) -> Option<&SplitContext> {
        self.splits.get(&(d_pa + BASE_PAGE_SIZE as u64))
    }

    /// Physical address of the first split in the registry. Drain loops take
    /// the head repeatedly so erasure during iteration is harmless.
    pub fn head(&self) -> Option<u64> {
        self.splits.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    /// Number of splits whose data page falls inside the 2-MiB region at
    /// `aligned_2m_pa`.
    pub fn count_in_region(&self, aligned_2m_pa: u64) -> u64 {
        self.splits.range(aligned_2m_pa..aligned_2m_pa + LARGE_PAGE_SIZE as u64).count() as u64
    }
}

/// State for one 2-MiB region that has been remapped to 4-KiB granularity.
pub struct LargePageEntry {
    /// The leaf table installed over the region's page-directory entry. It
    /// must outlive the subdivided mapping, which is why the tracker never
    /// discards entries.
    pub pt: Box<Pt>,

    /// Number of splits currently living inside the region.
    pub split_count: u64,
}

/// Ordered mapping from 2-MiB-aligned physical address to the region state.
///
/// A region is subdivided when its first split arrives and stays subdivided
/// for the lifetime of the hypervisor; recoalescing at zero is deliberately
/// left out, matching the behavior this engine was built against.
#[derive(Default)]
pub struct LargePageTracker {
    regions: BTreeMap<u64, LargePageEntry>,
}

impl LargePageTracker {
    pub fn is_tracked(&self, aligned_2m_pa: u64) -> bool {
        self.regions.contains_key(&aligned_2m_pa)
    }

    /// Starts tracking a freshly subdivided region with a zero split count.
    pub fn track(&mut self, aligned_2m_pa: u64, pt: Box<Pt>) {
        self.regions.insert(aligned_2m_pa, LargePageEntry { pt, split_count: 0 });
    }

    pub fn pt_mut(&mut self, aligned_2m_pa: u64) -> Option<&mut Pt> {
        self.regions.get_mut(&aligned_2m_pa).map(|entry| &mut *entry.pt)
    }

    pub fn pt(&self, aligned_2m_pa: u64) -> Option<&Pt> {
        self.regions.get(&aligned_2m_pa).map(|entry| &*entry.pt)
    }

    pub fn split_count(&self, aligned_2m_pa: u64) -> u64 {
        self.regions.get(&aligned_2m_pa).map(|entry| entry.split_count).unwrap_or(0)
    }

    pub fn increment(&mut self, aligned_2m_pa: u64) {
        if let Some(entry) = self.regions.get_mut(&aligned_2m_pa) {
            entry.split_count += 1;
        }
    }

    pub fn decrement(&mut self, aligned_2m_pa: u64) {
        if let Some(entry) = self.regions.get_mut(&aligned_2m_pa) {
            entry.split_count = entry.split_count.saturating_sub(1);
        }
    }
}
