//! Process-lifetime state of the split core and the exit-handler
//! registration surface consumed by the bringup glue.
//!
//! All state lives in a single [`CoreState`] value created once at VMCS
//! bringup and passed to the handlers by reference; nothing here is an
//! ambient global. Two locks partition the state: the engine lock guards
//! the registry, the large-page tracker, and every leaf rewrite, while the
//! flip log has its own lock so logging never serializes with EPT changes.

use {
    crate::{
        allocate::box_zeroed,
        error::HypervisorError,
        intel::{
            ept::Ept,
            registers::GuestRegisters,
            split::{engine::SplitEngine, flip_log::FlipLog},
            vmexit::{
                ept_violation::handle_ept_violation, mtf::handle_monitor_trap_flag, vmcall::handle_vmcall, ExitType,
            },
        },
    },
    alloc::boxed::Box,
    log::debug,
    spin::Mutex,
};

/// Everything the split core owns: the engine (registry, tracker, hooked
/// EPT), the flip log, and the two EPT pointers the handlers switch between.
pub struct CoreState {
    /// The split engine and the hooked EPT hierarchy it rewrites.
    pub engine: Mutex<SplitEngine>,

    /// Diagnostic log of violation round-trips, under its own lock.
    pub flip_log: Mutex<FlipLog>,

    /// EPTP of the hooked hierarchy; installed in the VMCS at bringup.
    pub hooked_eptp: u64,

    /// EPTP of the clean identity hierarchy used for thrash single-steps.
    pub clean_eptp: u64,

    /// The clean hierarchy itself. Never rewritten after construction; held
    /// here so the address encoded in `clean_eptp` stays valid.
    clean_ept: Box<Ept>,
}

impl CoreState {
    /// Builds the hooked and clean EPT hierarchies and the engine state.
    ///
    /// Called once at VMCS bringup; the glue installs [`Self::hooked_eptp`]
    /// as the active EPTP before launching the guest.
    pub fn new() -> Result<Box<Self>, HypervisorError> {
        debug!("Building hooked and clean EPT hierarchies");

        let mut hooked_ept = unsafe { box_zeroed::<Ept>() };
        hooked_ept.build_identity();
        let hooked_eptp = hooked_ept.eptp()?;

        let mut clean_ept = unsafe { box_zeroed::<Ept>() };
        clean_ept.build_identity();
        let clean_eptp = clean_ept.eptp()?;

        debug!("Core state initialized, hooked eptp: {:#x} clean eptp: {:#x}", hooked_eptp, clean_eptp);

        Ok(Box::new(Self {
            engine: Mutex::new(SplitEngine::new(hooked_ept)),
            flip_log: Mutex::new(FlipLog::new()),
            hooked_eptp,
            clean_eptp,
            clean_ept,
        }))
    }

    /// Read access to the clean hierarchy.
    pub fn clean_ept(&self) -> &Ept {
        &self.clean_ept
    }
}

/// Signature shared by all registered exit handlers.
pub type ExitHandler = fn(&CoreState, &mut GuestRegisters) -> Result<ExitType, HypervisorError>;

/// The exit callbacks the bringup glue dispatches to from its exit loop.
pub struct ExitHandlers {
    pub ept_violation: ExitHandler,
    pub vmcall: ExitHandler,
    pub monitor_trap: ExitHandler,
}

impl ExitHandlers {
    /// Registers the split core's handlers.
    pub fn register() -> Self {
        Self {
            ept_violation: handle_ept_violation,
            vmcall: handle_vmcall,
            monitor_trap: handle_monitor_trap_flag,
        }
    }
}
