//! Handles VM exits caused by VMCALL (hypercall) from the guest, routing
//! split-engine operations requested by the privileged guest agent.
//!
//! Register protocol (register-based vmcall convention):
//!
//! - `r00` = RAX \[RESERVED\] vmcall mode (2)
//! - `r01` = RDX \[RESERVED\] magic number (0xB045EACDACD52E22)
//! - `r02` = RCX method number in, status out
//! - `r03` = RBX, `r04` = RSI, `r05` = RDI for arguments
//!
//! Methods:
//!
//! | `r02` | operation | args |
//! |---|---|---|
//! | 0 | `hv_present` | |
//! | 1 | `create_split` | `r03` = gva |
//! | 2 | `activate_split` | `r03` = gva |
//! | 3 | `deactivate_split` | `r03` = gva |
//! | 4 | `deactivate_all` | |
//! | 5 | `is_split` | `r03` = gva |
//! | 6 | `write_to_code` | `r03` = from, `r04` = to, `r05` = size |
//! | 7 | `get_flip_count` | |
//! | 8 | `get_flip_data` | `r03` = out va, `r04` = out size |
//! | 9 | `clear_flips` | |
//! | 10 | `remove_flip` | `r03` = rip |
//!
//! The status is 1 for success and 0 for failure; `is_split` additionally
//! returns -1 for an unmapped address, `get_flip_count` returns the record
//! count, and an unknown method returns all-ones.

use {
    crate::{
        error::HypervisorError,
        global::CoreState,
        global_const::{VMCALL_MAGIC, VMCALL_MODE_REGISTERS},
        intel::{
            guest_memory::GuestMemoryMapping,
            registers::GuestRegisters,
            split::flip_log::FlipRecord,
            support::vmread,
            vmexit::ExitType,
        },
    },
    core::mem::size_of,
    log::*,
    x86::vmx::vmcs,
};

/// Status value reporting a completed operation.
pub const STATUS_SUCCESS: u64 = 1;

/// Status value reporting a rejected or failed operation.
pub const STATUS_FAILURE: u64 = 0;

/// Status value reporting an unknown method number.
pub const STATUS_UNKNOWN_METHOD: u64 = u64::MAX;

/// The operations a guest agent can request.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmcallMethod {
    HvPresent = 0,
    CreateSplit = 1,
    ActivateSplit = 2,
    DeactivateSplit = 3,
    DeactivateAll = 4,
    IsSplit = 5,
    WriteToCode = 6,
    GetFlipCount = 7,
    GetFlipData = 8,
    ClearFlips = 9,
    RemoveFlip = 10,
}

impl VmcallMethod {
    fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::HvPresent),
            1 => Some(Self::CreateSplit),
            2 => Some(Self::ActivateSplit),
            3 => Some(Self::DeactivateSplit),
            4 => Some(Self::DeactivateAll),
            5 => Some(Self::IsSplit),
            6 => Some(Self::WriteToCode),
            7 => Some(Self::GetFlipCount),
            8 => Some(Self::GetFlipData),
            9 => Some(Self::ClearFlips),
            10 => Some(Self::RemoveFlip),
            _ => None,
        }
    }
}

/// Handles a VMCALL VM exit by validating the register protocol and routing
/// the requested method to the split engine or the flip log.
pub fn handle_vmcall(core: &CoreState, regs: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
    if regs.rax != VMCALL_MODE_REGISTERS || regs.rdx != VMCALL_MAGIC {
        warn!("Undispatched VMCALL, mode: {:#x} magic: {:#x}", regs.rax, regs.rdx);
        return Ok(ExitType::IncrementRIP);
    }

    let method = regs.rcx;
    trace!("VMCALL method number: {:#x}", method);

    // Pointer arguments are guest virtual addresses in the calling address
    // space; resolve them under the caller's CR3 and PAT.
    let cr3 = vmread(vmcs::guest::CR3);
    let pat = vmread(vmcs::guest::IA32_PAT_FULL);

    regs.rcx = match VmcallMethod::from_u64(method) {
        Some(VmcallMethod::HvPresent) => STATUS_SUCCESS,
        Some(VmcallMethod::CreateSplit) => status(core.engine.lock().create_split(regs.rbx, cr3, pat)),
        Some(VmcallMethod::ActivateSplit) => status(core.engine.lock().activate_split(regs.rbx, cr3)),
        Some(VmcallMethod::DeactivateSplit) => status(core.engine.lock().deactivate_split(regs.rbx, cr3)),
        Some(VmcallMethod::DeactivateAll) => status(core.engine.lock().deactivate_all()),
        Some(VmcallMethod::IsSplit) => core.engine.lock().is_split(regs.rbx, cr3) as i64 as u64,
        Some(VmcallMethod::WriteToCode) => status(core.engine.lock().write_to_code(regs.rbx, regs.rsi, regs.rdi, cr3, pat)),
        Some(VmcallMethod::GetFlipCount) => core.flip_log.lock().len() as u64,
        Some(VmcallMethod::GetFlipData) => status(copy_flip_data(core, regs.rbx, regs.rsi, cr3, pat)),
        Some(VmcallMethod::ClearFlips) => {
            core.flip_log.lock().clear();
            STATUS_SUCCESS
        }
        Some(VmcallMethod::RemoveFlip) => {
            core.flip_log.lock().remove_rip(regs.rbx);
            STATUS_SUCCESS
        }
        None => {
            warn!("Unknown VMCALL method: {:#x}", method);
            STATUS_UNKNOWN_METHOD
        }
    };

    Ok(ExitType::IncrementRIP)
}

/// Copies the flip-record snapshot into a guest buffer.
///
/// `out_size` must be a non-zero multiple of the record size and no larger
/// than the snapshot; exactly `out_size` bytes are written.
fn copy_flip_data(core: &CoreState, out_va: u64, out_size: u64, cr3: u64, pat: u64) -> Result<(), HypervisorError> {
    if out_va == 0 || out_size == 0 {
        return Err(HypervisorError::BadArgument);
    }

    if out_size as usize % size_of::<FlipRecord>() != 0 {
        return Err(HypervisorError::BufferSizeMismatch);
    }

    // Acquire the guest mapping before touching the log so the log lock is
    // never held across the acquisition.
    let mapping = GuestMemoryMapping::new(out_va, cr3, out_size as usize, pat)?;

    let flip_log = core.flip_log.lock();
    let bytes = flip_log.as_bytes();
    if out_size as usize > bytes.len() {
        return Err(HypervisorError::BufferSizeMismatch);
    }

    mapping.write_from(&bytes[..out_size as usize])
}

fn status(result: Result<(), HypervisorError>) -> u64 {
    match result {
        Ok(()) => STATUS_SUCCESS,
        Err(error) => {
            warn!("VMCALL operation failed: {}", error);
            STATUS_FAILURE
        }
    }
}
