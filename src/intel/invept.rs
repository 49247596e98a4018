//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.4.3.1 Operations that Invalidate Cached Mappings
//!
//! The INVEPT instruction invalidates entries in the translation lookaside buffer (TLB) and other
//! processor structures that cache translations derived from EPT, ensuring that EPT entry rewrites
//! do not leave stale cached translations behind.

/// Represents the types of INVEPT operations.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InveptType {
    /// Invalidate mappings associated with a single EPTP value.
    SingleContext = 1,

    /// Invalidate mappings associated with all EPTP values.
    AllContexts = 2,
}

/// Executes the INVEPT instruction.
///
/// The descriptor is a 128-bit value: the first 64 bits hold the EPTP for a
/// single-context invalidation (ignored for all-contexts), the second 64 bits
/// must be zero.
#[cfg(not(test))]
fn invept(invept_type: InveptType, eptp: u64) {
    let descriptor: [u64; 2] = [eptp, 0];

    unsafe {
        core::arch::asm!(
            "invept {0}, [{1}]",
            in(reg) invept_type as u64,
            in(reg) &descriptor,
            options(nostack),
        );
    };
}

/// Invalidates EPT-derived mappings associated with a single EPTP value.
pub fn invept_single_context(eptp: u64) {
    invept(InveptType::SingleContext, eptp);
}

/// Invalidates EPT-derived mappings for all EPTP values.
pub fn invept_all_contexts() {
    // The EPT pointer is irrelevant for this type of operation.
    invept(InveptType::AllContexts, 0);
}

#[cfg(test)]
use core::sync::atomic::{AtomicU64, Ordering};

/// Number of INVEPT executions observed during hosted tests.
#[cfg(test)]
pub static INVEPT_CALLS: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
fn invept(_invept_type: InveptType, _eptp: u64) {
    INVEPT_CALLS.fetch_add(1, Ordering::Relaxed);
}
