//! Handles VM exits for EPT violations.
//!
//! For a split page every access class that the current leaf traps lands
//! here, and the handler flips the leaf to the configuration serving that
//! class: reads and writes resolve against the data frame, instruction
//! fetches against the code frame. Each round-trip is recorded in the flip
//! log, and a RIP that keeps violating without progress is single-stepped
//! once under the clean EPT view.
//!
//! No TLB or EPT invalidation happens anywhere on this path: the processor
//! invalidates the violating translation itself, and issuing INVEPT or
//! INVVPID from the handler provokes an endless re-violation loop.

use {
    crate::{
        error::HypervisorError,
        global::CoreState,
        intel::{
            ept::AccessType,
            registers::GuestRegisters,
            split::flip_log::FlipRecord,
            support::{vmread, vmwrite},
            vmexit::{
                mtf::{mask_guest_interrupts, set_monitor_trap_flag},
                ExitType,
            },
        },
    },
    bit_field::BitField,
    log::*,
    x86::{bits64::paging::BASE_PAGE_SIZE, vmx::vmcs},
};

/// The state of one EPT violation exit, as read from the VMCS.
#[derive(Debug, Clone, Copy)]
pub struct EptViolationExit {
    /// Guest RIP at the exit.
    pub rip: u64,
    /// CR3 of the violating address space.
    pub cr3: u64,
    /// Guest linear address of the access.
    pub gva: u64,
    /// Guest physical address of the access.
    pub gpa: u64,
    /// Violating access classes, from bits 2:0 of the exit qualification
    /// (bit 0 read, bit 1 write, bit 2 instruction fetch).
    pub access: AccessType,
}

impl EptViolationExit {
    /// Captures the violation state for the current exit.
    pub fn capture(regs: &GuestRegisters) -> Self {
        let qualification = vmread(vmcs::ro::EXIT_QUALIFICATION);

        Self {
            rip: regs.rip,
            cr3: vmread(vmcs::guest::CR3),
            gva: vmread(vmcs::ro::GUEST_LINEAR_ADDR),
            gpa: vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL),
            access: AccessType::from_bits_truncate(qualification.get_bits(0..3) as u8),
        }
    }
}

/// Handles an EPT violation VM exit.
pub fn handle_ept_violation(core: &CoreState, regs: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
    let exit = EptViolationExit::capture(regs);
    process_ept_violation(core, regs, &exit)
}

/// Classifies a violation and drives the leaf state machine.
///
/// Access classes are evaluated write first, then read, then execute; a
/// combined read+execute violation therefore resolves as a read and flips
/// to the data frame, with the fetch re-faulting afterwards.
pub fn process_ept_violation(core: &CoreState, regs: &mut GuestRegisters, exit: &EptViolationExit) -> Result<ExitType, HypervisorError> {
    let d_pa = exit.gpa & !(BASE_PAGE_SIZE as u64 - 1);

    let mut engine = core.engine.lock();

    let Some(context) = engine.registry.get(d_pa) else {
        // Violation for a page the engine does not control. A write usually
        // means another process touched a frame whose leaf was left
        // trapping; recover by resetting the leaf to pass-through.
        if exit.access.contains(AccessType::WRITE) {
            warn!(
                "WRITE: gva: {:#x} gpa: {:#x} d_pa: {:#x} cr3: {:#x} access: {:?}",
                exit.gva, exit.gpa, d_pa, exit.cr3, exit.access
            );
        } else {
            error!(
                "UNX_V: gva: {:#x} gpa: {:#x} d_pa: {:#x} cr3: {:#x} access: {:?}",
                exit.gva, exit.gpa, d_pa, exit.cr3, exit.access
            );
        }

        if let Err(error) = engine.restore_pass_through(d_pa) {
            warn!("Failed to restore pass-through for {:#x}: {}", d_pa, error);
        }

        return Ok(ExitType::Continue);
    };

    let original_gva = context.gva;
    let creator_cr3 = context.cr3;

    if exit.access.contains(AccessType::WRITE) {
        if exit.cr3 != creator_cr3 {
            // A writer from a foreign address space shares the physical
            // frame; the split cannot stay coherent for it, so tear down.
            info!(
                "Foreign writer cr3: {:#x} (creator: {:#x}), deactivating split for: {:#x}",
                exit.cr3, creator_cr3, d_pa
            );
            engine.deactivate_by_pa(d_pa, false)?;
        } else {
            engine.flip_to_data(d_pa)?;
        }
    } else if exit.access.contains(AccessType::READ) {
        if exit.access.contains(AccessType::EXECUTE) {
            warn!("READ|EXEC violation resolved as read for gpa: {:#x}", d_pa);
        }
        engine.flip_to_data(d_pa)?;
    } else if exit.access.contains(AccessType::EXECUTE) {
        engine.flip_to_code(d_pa)?;
    } else {
        warn!(
            "UNX_Q: gva: {:#x} gpa: {:#x} d_pa: {:#x} cr3: {:#x} access mask empty",
            exit.gva, exit.gpa, d_pa, exit.cr3
        );
    }

    let engage_clean_view = engine.thrash.note(exit.rip);
    drop(engine);

    // The log has its own lock so recording never serializes with leaf
    // rewrites performed by other vCPUs.
    core.flip_log.lock().record(FlipRecord {
        rip: exit.rip,
        gva: exit.gva,
        original_gva,
        gpa: exit.gpa,
        d_pa,
        cr3: exit.cr3,
        access_bits: exit.access.bits() as u64,
        count: 0,
    });

    if engage_clean_view {
        debug!("Thrashing at RIP {:#x}, single-stepping under the clean EPT view", exit.rip);

        vmwrite(vmcs::control::EPTP_FULL, core.clean_eptp);
        set_monitor_trap_flag(true);
        mask_guest_interrupts(core, regs);
    }

    // Do not increment RIP; the violating instruction must execute again.
    Ok(ExitType::Continue)
}
