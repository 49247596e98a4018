//! Rolling diagnostic log of EPT violation round-trips.
//!
//! Each record describes one `(RIP, access mask)` pair; re-observations bump
//! a counter instead of appending, so a hot loop that flips a page thousands
//! of times occupies a single slot. The log is read out over the vmcall
//! interface as a packed array of records.

use {
    crate::global_const::MAX_FLIP_RECORDS,
    core::mem::size_of,
    static_assertions::const_assert_eq,
};

/// One logged violation, in the exact order and width it is copied out to
/// the guest: eight little-endian 64-bit fields.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlipRecord {
    /// Guest RIP at the exit.
    pub rip: u64,
    /// Guest linear address of the violating access.
    pub gva: u64,
    /// The address the split was originally requested for.
    pub original_gva: u64,
    /// Guest physical address of the violating access.
    pub gpa: u64,
    /// Data-frame physical address (the registry key).
    pub d_pa: u64,
    /// CR3 of the violating address space.
    pub cr3: u64,
    /// R/W/X mask taken from the exit qualification.
    pub access_bits: u64,
    /// Number of times this `(rip, access_bits)` pair has been observed.
    pub count: u64,
}

const_assert_eq!(size_of::<FlipRecord>(), 64);

/// Bounded dedup log of flip records.
#[derive(Default)]
pub struct FlipLog {
    records: heapless::Vec<FlipRecord, MAX_FLIP_RECORDS>,
}

impl FlipLog {
    pub const fn new() -> Self {
        Self {
            records: heapless::Vec::new(),
        }
    }

    /// Appends a record, or bumps the counter of the record already keyed by
    /// `(rip, access_bits)` while refreshing its address fields. When the
    /// log is full the oldest record is evicted first.
    pub fn record(&mut self, record: FlipRecord) {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|r| r.rip == record.rip && r.access_bits == record.access_bits)
        {
            existing.count += 1;
            existing.gva = record.gva;
            existing.original_gva = record.original_gva;
            existing.gpa = record.gpa;
            existing.d_pa = record.d_pa;
            existing.cr3 = record.cr3;
            return;
        }

        if self.records.is_full() {
            self.records.as_mut_slice().copy_within(1.., 0);
            self.records.pop();
        }

        let mut record = record;
        record.count = 1;
        // Cannot fail: a slot was freed above if necessary.
        let _ = self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Removes every record with the given RIP regardless of access mask.
    pub fn remove_rip(&mut self, rip: u64) {
        self.records.retain(|r| r.rip != rip);
    }

    pub fn records(&self) -> &[FlipRecord] {
        self.records.as_slice()
    }

    /// The record array viewed as wire bytes for the bulk copy-out.
    pub fn as_bytes(&self) -> &[u8] {
        let records = self.records.as_slice();
        // `FlipRecord` is repr(C) with eight u64 fields and no padding.
        unsafe { core::slice::from_raw_parts(records.as_ptr().cast::<u8>(), records.len() * size_of::<FlipRecord>()) }
    }
}
