//! Handlers for the VM exits the split core participates in. The bringup
//! glue owns the exit loop; it registers these handlers at VMCS setup and
//! invokes them with the core state and the captured guest registers.

pub mod ept_violation;
pub mod mtf;
pub mod vmcall;

/// How the exit loop should resume the guest after a handled exit.
#[derive(Debug, PartialOrd, PartialEq)]
pub enum ExitType {
    /// Advance the guest RIP past the exiting instruction before resuming.
    IncrementRIP,
    /// Resume at the same RIP so the instruction re-executes.
    Continue,
}
