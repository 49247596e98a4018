//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.4.3.3 Guidelines for Use of the INVVPID Instruction
//!
//! The INVVPID instruction invalidates linear and combined mappings tagged with a VPID. Paired with
//! INVEPT whenever the engine rewrites a leaf outside the violation handler.

/// Represents the types of INVVPID operations.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InvvpidType {
    /// Invalidate mappings for the linear address and VPID in the descriptor.
    IndividualAddress = 0,

    /// Invalidate mappings tagged with the VPID in the descriptor.
    SingleContext = 1,

    /// Invalidate mappings tagged with all VPIDs except VPID 0000H.
    AllContexts = 2,
}

/// INVVPID descriptor layout: VPID in bits 15:0, linear address in the upper
/// 64 bits. Reserved bits must be zero.
#[cfg(not(test))]
#[repr(C, align(16))]
struct InvvpidDescriptor {
    vpid: u64,
    linear_address: u64,
}

/// Executes the INVVPID instruction.
#[cfg(not(test))]
fn invvpid(invvpid_type: InvvpidType, vpid: u16, linear_address: u64) {
    let descriptor = InvvpidDescriptor {
        vpid: vpid as u64,
        linear_address,
    };

    unsafe {
        core::arch::asm!(
            "invvpid {0}, [{1}]",
            in(reg) invvpid_type as u64,
            in(reg) &descriptor,
            options(nostack),
        );
    };
}

/// Invalidates linear and combined mappings for all VPIDs.
pub fn invvpid_all_contexts() {
    invvpid(InvvpidType::AllContexts, 0, 0);
}

#[cfg(test)]
use core::sync::atomic::{AtomicU64, Ordering};

/// Number of INVVPID executions observed during hosted tests.
#[cfg(test)]
pub static INVVPID_CALLS: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
fn invvpid(_invvpid_type: InvvpidType, _vpid: u16, _linear_address: u64) {
    INVVPID_CALLS.fetch_add(1, Ordering::Relaxed);
}
