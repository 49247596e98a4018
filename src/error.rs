use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Required address is zero or size is out of range")]
    BadArgument,

    #[error("Invalid PML4 entry")]
    InvalidPml4Entry,

    #[error("Invalid PDPT entry")]
    InvalidPdptEntry,

    #[error("Invalid PD entry")]
    InvalidPdEntry,

    #[error("Invalid PT entry")]
    InvalidPtEntry,

    #[error("No split context found for the requested page")]
    SplitNotFound,

    #[error("Page is already split")]
    PageAlreadySplit,

    #[error("Large page remap error")]
    LargePageRemapError,

    #[error("Leaf page table not found for the requested region")]
    PageTableNotFound,

    #[error("Unaligned address error")]
    UnalignedAddressError,

    #[error("Invalid EPT PML4 base address")]
    InvalidEptPml4BaseAddress,

    #[error("Output buffer size does not match the record layout")]
    BufferSizeMismatch,
}

impl HypervisorError {
    /// True when the error reports a failed guest virtual address walk,
    /// meaning the address has no backing under the requesting CR3.
    pub fn is_translation_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidPml4Entry | Self::InvalidPdptEntry | Self::InvalidPdEntry | Self::InvalidPtEntry
        )
    }
}
