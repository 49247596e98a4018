//! Monitor trap flag handling for the thrash-mitigation single step.
//!
//! When the violation handler detects a guest instruction making no progress
//! it lets exactly one instruction execute under the clean (unhooked) EPT
//! view: it switches the EPTP, arms MTF, and masks guest interrupts. The MTF
//! exit lands here, where the hooked view and the saved RFLAGS come back.

use {
    crate::{
        error::HypervisorError,
        global::CoreState,
        intel::{
            registers::GuestRegisters,
            support::{vmread, vmwrite},
            vmexit::ExitType,
        },
    },
    log::trace,
    x86::{bits64::rflags::RFlags, vmx::vmcs},
};

/// Restores the hooked EPT view after the single clean-view step.
pub fn handle_monitor_trap_flag(core: &CoreState, regs: &mut GuestRegisters) -> Result<ExitType, HypervisorError> {
    trace!("Handling Monitor Trap Flag exit");

    vmwrite(vmcs::control::EPTP_FULL, core.hooked_eptp);
    set_monitor_trap_flag(false);
    restore_guest_interrupt_flag(core, regs);

    trace!("Hooked EPT view restored, continuing guest execution");

    Ok(ExitType::Continue)
}

/// Set the monitor trap flag
///
/// # Arguments
///
/// * `set` - A flag indicating whether to set the monitor trap flag.
pub fn set_monitor_trap_flag(set: bool) {
    let controls = vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS);
    let mut primary_controls = unsafe { vmcs::control::PrimaryControls::from_bits_unchecked(controls as u32) };

    if set {
        primary_controls.insert(vmcs::control::PrimaryControls::MONITOR_TRAP_FLAG);
    } else {
        primary_controls.remove(vmcs::control::PrimaryControls::MONITOR_TRAP_FLAG);
    }

    vmwrite(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, primary_controls.bits());
    trace!("Monitor Trap Flag set to: {}", set);
}

/// Clears the guest interrupt flag for the duration of the single step,
/// saving the previous RFLAGS so the step cannot be diverted by an
/// interrupt delivered between arming MTF and the next instruction.
pub fn mask_guest_interrupts(core: &CoreState, regs: &mut GuestRegisters) {
    core.engine.lock().old_rflags = Some(regs.rflags);

    let mut rflags = RFlags::from_raw(regs.rflags);
    rflags.remove(RFlags::FLAGS_IF);
    regs.rflags = rflags.bits();

    vmwrite(vmcs::guest::RFLAGS, regs.rflags);
}

fn restore_guest_interrupt_flag(core: &CoreState, regs: &mut GuestRegisters) {
    if let Some(old_rflags) = core.engine.lock().old_rflags.take() {
        regs.rflags = old_rflags;
        vmwrite(vmcs::guest::RFLAGS, old_rflags);
    }
}
