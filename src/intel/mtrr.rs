//! EPT memory type encodings.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! Table 29-6. Format of an EPT Page-Table Entry that Maps a 4-KByte Page

/// Memory types as encoded in EPT paging-structure entries and the EPTP.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}
