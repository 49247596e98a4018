//! Cross-component tests driving the split engine, the violation handler,
//! and the vmcall dispatcher against a fabricated guest.
//!
//! The harness allocates an arena that stands in for physical memory
//! (registered through `intel::addresses::testing`), builds real x86-64
//! page tables inside it for the synthetic guest address spaces, and uses
//! the in-memory VMCS field store from `intel::support`. Tests serialize on
//! a global lock because the arena registration and the VMCS store are
//! process wide.

use {
    crate::{
        global::{CoreState, ExitHandlers},
        global_const::{VMCALL_MAGIC, VMCALL_MODE_REGISTERS},
        intel::{
            addresses::testing::set_phys_base,
            ept::{AccessType, Entry},
            invept::INVEPT_CALLS,
            invvpid::INVVPID_CALLS,
            registers::GuestRegisters,
            split::{engine::SplitStatus, registry::SplitContext},
            support::{vmcs_reset, vmread, vmwrite},
            vmexit::{
                ept_violation::{process_ept_violation, EptViolationExit},
                mtf::handle_monitor_trap_flag,
                vmcall::{handle_vmcall, STATUS_FAILURE, STATUS_SUCCESS, STATUS_UNKNOWN_METHOD},
                ExitType,
            },
        },
    },
    alloc::{boxed::Box, vec::Vec},
    core::{
        alloc::Layout,
        sync::atomic::Ordering,
    },
    std::sync::{Mutex, MutexGuard},
    x86::{
        bits64::paging::{pd_index, pdpt_index, pml4_index, pt_index, VAddr, BASE_PAGE_SIZE, LARGE_PAGE_SIZE},
        vmx::vmcs,
    },
};

static TEST_LOCK: Mutex<()> = Mutex::new(());

const ARENA_SIZE: usize = 16 * 1024 * 1024;
const PAGE: u64 = BASE_PAGE_SIZE as u64;

/// Fabricated physical memory plus a bump allocator for guest page tables.
struct GuestArena {
    base: *mut u8,
    layout: Layout,
    next_table_pa: u64,
}

impl GuestArena {
    fn new() -> Self {
        let layout = Layout::from_size_align(ARENA_SIZE, BASE_PAGE_SIZE).unwrap();
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        set_phys_base(base as u64);

        Self {
            base,
            layout,
            // Leave page zero unused so null-ish addresses stay invalid.
            next_table_pa: PAGE,
        }
    }

    fn alloc_table(&mut self) -> u64 {
        let pa = self.next_table_pa;
        self.next_table_pa += PAGE;
        assert!(self.next_table_pa < 0x10_0000, "page-table arena exhausted");
        pa
    }

    /// Creates an empty guest address space and returns its CR3.
    fn create_address_space(&mut self) -> u64 {
        self.alloc_table()
    }

    fn read_u64(&self, pa: u64) -> u64 {
        unsafe { (self.base.add(pa as usize) as *const u64).read() }
    }

    fn write_u64(&mut self, pa: u64, value: u64) {
        unsafe { (self.base.add(pa as usize) as *mut u64).write(value) };
    }

    fn ensure_table(&mut self, table_pa: u64, index: usize) -> u64 {
        let raw = self.read_u64(table_pa + index as u64 * 8);
        if raw & 1 != 0 {
            raw & 0x000F_FFFF_FFFF_F000
        } else {
            let new_table = self.alloc_table();
            self.write_u64(table_pa + index as u64 * 8, new_table | 0x3);
            new_table
        }
    }

    /// Installs a present and writable 4-KiB mapping `va -> pa` under `cr3`.
    fn map_page(&mut self, cr3: u64, va: u64, pa: u64) {
        let vaddr = VAddr::from(va);
        let pdpt = self.ensure_table(cr3, pml4_index(vaddr));
        let pd = self.ensure_table(pdpt, pdpt_index(vaddr));
        let pt = self.ensure_table(pd, pd_index(vaddr));
        self.write_u64(pt + pt_index(vaddr) as u64 * 8, pa | 0x3);
    }

    fn write_bytes(&mut self, pa: u64, bytes: &[u8]) {
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(pa as usize), bytes.len()) };
    }

    fn read_bytes(&self, pa: u64, len: usize) -> Vec<u8> {
        let mut out = alloc::vec![0u8; len];
        unsafe { core::ptr::copy_nonoverlapping(self.base.add(pa as usize), out.as_mut_ptr(), len) };
        out
    }

    fn fill(&mut self, pa: u64, len: usize, byte: u8) {
        unsafe { core::ptr::write_bytes(self.base.add(pa as usize), byte, len) };
    }
}

impl Drop for GuestArena {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.base, self.layout) };
    }
}

struct TestEnv {
    arena: GuestArena,
    core: Box<CoreState>,
    _guard: MutexGuard<'static, ()>,
}

impl TestEnv {
    fn new() -> Self {
        let guard = TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        vmcs_reset();

        Self {
            arena: GuestArena::new(),
            core: CoreState::new().unwrap(),
            _guard: guard,
        }
    }

    /// Issues a register-based vmcall and returns the status left in `r02`.
    fn vmcall(&self, cr3: u64, method: u64, r03: u64, r04: u64, r05: u64) -> u64 {
        vmwrite(vmcs::guest::CR3, cr3);

        let mut regs = GuestRegisters {
            rax: VMCALL_MODE_REGISTERS,
            rdx: VMCALL_MAGIC,
            rcx: method,
            rbx: r03,
            rsi: r04,
            rdi: r05,
            ..Default::default()
        };

        assert_eq!(handle_vmcall(&self.core, &mut regs).unwrap(), ExitType::IncrementRIP);
        regs.rcx
    }

    /// Drives the violation handler with a synthetic exit.
    fn violate(&self, rip: u64, cr3: u64, gva: u64, gpa: u64, bits: u8) {
        let mut regs = GuestRegisters {
            rip,
            rflags: 0x202,
            ..Default::default()
        };
        self.violate_with_regs(&mut regs, cr3, gva, gpa, bits);
    }

    fn violate_with_regs(&self, regs: &mut GuestRegisters, cr3: u64, gva: u64, gpa: u64, bits: u8) {
        let exit = EptViolationExit {
            rip: regs.rip,
            cr3,
            gva,
            gpa,
            access: AccessType::from_bits_truncate(bits),
        };
        assert_eq!(process_ept_violation(&self.core, regs, &exit).unwrap(), ExitType::Continue);
    }

    /// Reads the 4-KiB EPT leaf for `d_pa` in the hooked hierarchy.
    fn leaf(&self, d_pa: u64) -> Entry {
        let engine = self.core.engine.lock();
        let pt = engine.tracker.pt(d_pa & !(LARGE_PAGE_SIZE as u64 - 1)).unwrap();
        engine.ept().leaf(d_pa, pt).unwrap()
    }

    fn hook_count(&self, d_pa: u64) -> Option<u64> {
        self.core.engine.lock().registry.get(d_pa).map(|c| c.hook_count)
    }

    fn code_frame_pa(&self, d_pa: u64) -> u64 {
        self.core.engine.lock().registry.get(d_pa).unwrap().c_pa
    }

    fn code_frame_bytes(&self, d_pa: u64) -> Vec<u8> {
        self.core.engine.lock().registry.get(d_pa).unwrap().code_bytes().to_vec()
    }
}

fn assert_pass_through_identity(leaf: Entry, d_pa: u64) {
    assert!(leaf.is_pass_through());
    assert_eq!(leaf.pfn() << 12, d_pa);
}

const METHOD_HV_PRESENT: u64 = 0;
const METHOD_CREATE_SPLIT: u64 = 1;
const METHOD_ACTIVATE_SPLIT: u64 = 2;
const METHOD_DEACTIVATE_SPLIT: u64 = 3;
const METHOD_DEACTIVATE_ALL: u64 = 4;
const METHOD_IS_SPLIT: u64 = 5;
const METHOD_WRITE_TO_CODE: u64 = 6;
const METHOD_GET_FLIP_COUNT: u64 = 7;
const METHOD_GET_FLIP_DATA: u64 = 8;
const METHOD_CLEAR_FLIPS: u64 = 9;
const METHOD_REMOVE_FLIP: u64 = 10;

#[test]
fn happy_path_create_activate_flip_deactivate() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();

    // Guest page at VA 0x400000 backed by PA 0x600000, filled with 0xAA.
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);
    env.arena.fill(0x60_0000, BASE_PAGE_SIZE, 0xAA);

    assert_eq!(env.vmcall(cr3, METHOD_HV_PRESENT, 0, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0123, 0, 0), STATUS_SUCCESS);

    // The code frame starts as an exact copy of the data page.
    assert!(env.code_frame_bytes(0x60_0000).iter().all(|&b| b == 0xAA));
    // Not yet activated: query reports no active split, leaf untouched.
    assert_eq!(env.vmcall(cr3, METHOD_IS_SPLIT, 0x40_0123, 0, 0), SplitStatus::NotSplit as i64 as u64);
    assert_pass_through_identity(env.leaf(0x60_0000), 0x60_0000);

    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x40_0123, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_IS_SPLIT, 0x40_0123, 0, 0), SplitStatus::Split as i64 as u64);

    // Armed: the leaf serves the code frame and traps everything else.
    let c_pa = env.code_frame_pa(0x60_0000);
    let leaf = env.leaf(0x60_0000);
    assert_eq!(leaf.pfn() << 12, c_pa);
    assert!(leaf.executable() && !leaf.readable() && !leaf.writable());

    // A guest read traps and flips to the data frame with execute trapped.
    env.violate(0x40_0123, cr3, 0x40_0123, 0x60_0123, 0b001);
    let leaf = env.leaf(0x60_0000);
    assert_eq!(leaf.pfn() << 12, 0x60_0000);
    assert!(leaf.readable() && leaf.writable() && !leaf.executable());

    // The data bytes the read observes are the original ones.
    assert!(env.arena.read_bytes(0x60_0000, BASE_PAGE_SIZE).iter().all(|&b| b == 0xAA));

    // A fetch traps and flips back to the code frame.
    env.violate(0x40_0123, cr3, 0x40_0123, 0x60_0123, 0b100);
    let leaf = env.leaf(0x60_0000);
    assert_eq!(leaf.pfn() << 12, c_pa);
    assert!(leaf.executable() && !leaf.readable());

    // Teardown restores identity pass-through and forgets the context.
    assert_eq!(env.vmcall(cr3, METHOD_DEACTIVATE_SPLIT, 0x40_0123, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_IS_SPLIT, 0x40_0123, 0, 0), SplitStatus::NotSplit as i64 as u64);
    assert!(env.core.engine.lock().registry.is_empty());
    assert_pass_through_identity(env.leaf(0x60_0000), 0x60_0000);
}

#[test]
fn hook_refcount_keeps_split_until_last_deactivate() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);

    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0080, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.hook_count(0x60_0000), Some(2));
    assert_eq!(env.core.engine.lock().tracker.split_count(0x60_0000), 1);

    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);

    // First deactivate only drops the reference.
    assert_eq!(env.vmcall(cr3, METHOD_DEACTIVATE_SPLIT, 0x40_0080, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.hook_count(0x60_0000), Some(1));
    assert!(!env.leaf(0x60_0000).is_pass_through());

    // Second deactivate tears down and the region counter follows.
    assert_eq!(env.vmcall(cr3, METHOD_DEACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.hook_count(0x60_0000), None);
    assert_eq!(env.core.engine.lock().tracker.split_count(0x60_0000), 0);
    assert_pass_through_identity(env.leaf(0x60_0000), 0x60_0000);
}

#[test]
fn region_counter_matches_registry_contents() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();

    // Three pages in one 2-MiB region, one page in another.
    for (va, pa) in [(0x40_0000, 0x60_0000), (0x40_1000, 0x60_1000), (0x40_5000, 0x60_5000), (0x48_0000, 0x80_0000)] {
        env.arena.map_page(cr3, va, pa);
        assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, va, 0, 0), STATUS_SUCCESS);
    }

    {
        let engine = env.core.engine.lock();
        assert_eq!(engine.tracker.split_count(0x60_0000), engine.registry.count_in_region(0x60_0000));
        assert_eq!(engine.tracker.split_count(0x60_0000), 3);
        assert_eq!(engine.tracker.split_count(0x80_0000), 1);
    }

    assert_eq!(env.vmcall(cr3, METHOD_DEACTIVATE_ALL, 0, 0, 0), STATUS_SUCCESS);

    let engine = env.core.engine.lock();
    assert!(engine.registry.is_empty());
    assert_eq!(engine.tracker.split_count(0x60_0000), 0);
    assert_eq!(engine.tracker.split_count(0x80_0000), 0);
}

#[test]
fn foreign_writer_tears_down_split() {
    let mut env = TestEnv::new();
    let cr3_creator = env.arena.create_address_space();
    env.arena.map_page(cr3_creator, 0x40_0000, 0x60_0000);

    assert_eq!(env.vmcall(cr3_creator, METHOD_CREATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3_creator, METHOD_ACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);

    // A write from a different address space sharing the frame.
    let cr3_foreign = 0xBBBB_0000;
    env.violate(0x7FF6_0010, cr3_foreign, 0x50_0020, 0x60_0020, 0b010);

    // One violation round-trip removed the split and restored the frame.
    assert!(env.core.engine.lock().registry.is_empty());
    assert_pass_through_identity(env.leaf(0x60_0000), 0x60_0000);

    let log = env.core.flip_log.lock();
    assert_eq!(log.len(), 1);
    assert_eq!(log.records()[0].access_bits, 0b010);
    assert_eq!(log.records()[0].count, 1);
    assert_eq!(log.records()[0].cr3, cr3_foreign);
    assert_eq!(log.records()[0].d_pa, 0x60_0000);
}

#[test]
fn write_from_creator_cr3_flips_to_data_without_teardown() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);

    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);

    vmwrite(vmcs::guest::CR3, cr3);
    env.violate(0x40_0050, cr3, 0x40_0050, 0x60_0050, 0b010);

    assert_eq!(env.hook_count(0x60_0000), Some(1));
    let leaf = env.leaf(0x60_0000);
    assert_eq!(leaf.pfn() << 12, 0x60_0000);
    assert!(leaf.readable() && leaf.writable() && !leaf.executable());
}

#[test]
fn cross_page_write_splits_and_patches_both_frames() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();

    env.arena.map_page(cr3, 0x60_0000, 0x80_0000);
    env.arena.map_page(cr3, 0x60_1000, 0x80_1000);
    env.arena.map_page(cr3, 0x50_0000, 0x70_0000);
    env.arena.write_bytes(0x70_0000, &[0xDE, 0xAD, 0xBE, 0xEF]);

    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x60_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x60_0000, 0, 0), STATUS_SUCCESS);

    // Destination runs over the page boundary by two bytes.
    assert_eq!(env.vmcall(cr3, METHOD_WRITE_TO_CODE, 0x50_0000, 0x60_0FFE, 4), STATUS_SUCCESS);

    // The second page was split and activated on demand.
    assert_eq!(env.hook_count(0x80_1000), Some(1));
    assert_eq!(env.vmcall(cr3, METHOD_IS_SPLIT, 0x60_1000, 0, 0), SplitStatus::Split as i64 as u64);
    let second_leaf = env.leaf(0x80_1000);
    assert_eq!(second_leaf.pfn() << 12, env.code_frame_pa(0x80_1000));
    assert!(second_leaf.executable() && !second_leaf.readable());

    // Both code frames carry their segment of the source bytes.
    let first = env.code_frame_bytes(0x80_0000);
    assert_eq!(&first[0xFFE..], &[0xDE, 0xAD]);
    let second = env.code_frame_bytes(0x80_1000);
    assert_eq!(&second[..2], &[0xBE, 0xEF]);

    // The data pages are untouched.
    assert_eq!(env.arena.read_bytes(0x80_0FFE, 2), alloc::vec![0, 0]);
    assert_eq!(env.arena.read_bytes(0x80_1000, 2), alloc::vec![0, 0]);
}

#[test]
fn single_page_write_patches_at_offset() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();

    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);
    env.arena.map_page(cr3, 0x50_0000, 0x70_0000);
    env.arena.write_bytes(0x70_0000, &[0x90, 0x90, 0xCC]);

    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_WRITE_TO_CODE, 0x50_0000, 0x40_0010, 3), STATUS_SUCCESS);

    let frame = env.code_frame_bytes(0x60_0000);
    assert_eq!(&frame[0x10..0x13], &[0x90, 0x90, 0xCC]);

    // Bad arguments and oversized ranges are rejected at the boundary.
    assert_eq!(env.vmcall(cr3, METHOD_WRITE_TO_CODE, 0, 0x40_0010, 3), STATUS_FAILURE);
    assert_eq!(env.vmcall(cr3, METHOD_WRITE_TO_CODE, 0x50_0000, 0x40_0010, 0), STATUS_FAILURE);
    assert_eq!(env.vmcall(cr3, METHOD_WRITE_TO_CODE, 0x50_0000, 0x40_0FFF, 0x2002), STATUS_FAILURE);
    // Writes against a page with no split fail.
    assert_eq!(env.vmcall(cr3, METHOD_WRITE_TO_CODE, 0x50_0000, 0x50_0010, 3), STATUS_FAILURE);
}

#[test]
fn thrashing_rip_single_steps_under_clean_view() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);

    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);

    vmwrite(vmcs::control::EPTP_FULL, env.core.hooked_eptp);
    let mtf_bit = 1u64 << 27;

    // A locked RMW at one RIP alternating between fetch and read faults.
    let rip = 0x7000_0010;
    let mut regs = GuestRegisters { rip, rflags: 0x202, ..Default::default() };
    for (i, bits) in [0b100u8, 0b001, 0b100].iter().enumerate() {
        env.violate_with_regs(&mut regs, cr3, 0x40_0010, 0x60_0010, *bits);
        assert_eq!(vmread(vmcs::control::EPTP_FULL), env.core.hooked_eptp, "engaged too early at {}", i);
        assert_eq!(vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS) & mtf_bit, 0);
    }

    // The fourth consecutive hit engages the clean view for one step.
    env.violate_with_regs(&mut regs, cr3, 0x40_0010, 0x60_0010, 0b001);
    assert_eq!(vmread(vmcs::control::EPTP_FULL), env.core.clean_eptp);
    assert_ne!(vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS) & mtf_bit, 0);
    // Interrupts are masked for the step.
    assert_eq!(regs.rflags & 0x200, 0);
    assert_eq!(vmread(vmcs::guest::RFLAGS) & 0x200, 0);

    // The monitor-trap exit restores the hooked view and the saved RFLAGS.
    assert_eq!(handle_monitor_trap_flag(&env.core, &mut regs).unwrap(), ExitType::Continue);
    assert_eq!(vmread(vmcs::control::EPTP_FULL), env.core.hooked_eptp);
    assert_eq!(vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS) & mtf_bit, 0);
    assert_eq!(regs.rflags, 0x202);

    // The counter was reset: three more hits at the same RIP stay on the
    // hooked view, the fourth engages again.
    for _ in 0..3 {
        env.violate_with_regs(&mut regs, cr3, 0x40_0010, 0x60_0010, 0b001);
        assert_eq!(vmread(vmcs::control::EPTP_FULL), env.core.hooked_eptp);
    }
    env.violate_with_regs(&mut regs, cr3, 0x40_0010, 0x60_0010, 0b001);
    assert_eq!(vmread(vmcs::control::EPTP_FULL), env.core.clean_eptp);
}

#[test]
fn flip_log_dedups_and_copies_out_wire_records() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);

    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);

    // A thousand read violations at one RIP collapse into one record.
    // Thrash engagements along the way do not touch the log.
    for _ in 0..1000 {
        env.violate(0x7000_0010, cr3, 0x40_0020, 0x60_0020, 0b001);
    }
    assert_eq!(env.vmcall(cr3, METHOD_GET_FLIP_COUNT, 0, 0, 0), 1);
    {
        let log = env.core.flip_log.lock();
        assert_eq!(log.records()[0].count, 1000);
        assert_eq!(log.records()[0].rip, 0x7000_0010);
    }

    // Copy the snapshot into a guest buffer and check the wire layout.
    env.arena.map_page(cr3, 0x90_0000, 0xA0_0000);
    assert_eq!(env.vmcall(cr3, METHOD_GET_FLIP_DATA, 0x90_0000, 64, 0), STATUS_SUCCESS);

    let bytes = env.arena.read_bytes(0xA0_0000, 64);
    let field = |i: usize| u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
    assert_eq!(field(0), 0x7000_0010); // rip
    assert_eq!(field(1), 0x40_0020); // gva
    assert_eq!(field(2), 0x40_0000); // original_gva
    assert_eq!(field(3), 0x60_0020); // gpa
    assert_eq!(field(4), 0x60_0000); // d_pa
    assert_eq!(field(5), cr3); // cr3
    assert_eq!(field(6), 0b001); // access_bits
    assert_eq!(field(7), 1000); // count

    // Sizes that are not record multiples or overrun the snapshot fail.
    assert_eq!(env.vmcall(cr3, METHOD_GET_FLIP_DATA, 0x90_0000, 63, 0), STATUS_FAILURE);
    assert_eq!(env.vmcall(cr3, METHOD_GET_FLIP_DATA, 0x90_0000, 128, 0), STATUS_FAILURE);

    // remove_flip drops every record for the RIP, clear_flips empties.
    env.violate(0x7000_0010, cr3, 0x40_0020, 0x60_0020, 0b100);
    assert_eq!(env.vmcall(cr3, METHOD_GET_FLIP_COUNT, 0, 0, 0), 2);
    assert_eq!(env.vmcall(cr3, METHOD_REMOVE_FLIP, 0x7000_0010, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_GET_FLIP_COUNT, 0, 0, 0), 0);

    env.violate(0x7000_0020, cr3, 0x40_0020, 0x60_0020, 0b001);
    assert_eq!(env.vmcall(cr3, METHOD_CLEAR_FLIPS, 0, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_GET_FLIP_COUNT, 0, 0, 0), 0);
}

#[test]
fn deactivate_sweeps_zero_hook_neighbor() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);

    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);

    // Plant a residual write-only secondary split in the next page.
    {
        let mut engine = env.core.engine.lock();
        let frame = unsafe { crate::allocate::box_zeroed::<crate::intel::page::Page>() };
        let mut neighbor = SplitContext::new(frame, 0x40_1000, 0x60_1000, 0x40_1000, cr3);
        neighbor.hook_count = 0;
        engine.registry.insert(neighbor);
        engine.tracker.increment(0x60_0000);
    }

    assert_eq!(env.vmcall(cr3, METHOD_DEACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);

    let engine = env.core.engine.lock();
    assert!(engine.registry.is_empty());
    assert_eq!(engine.tracker.split_count(0x60_0000), 0);
}

#[test]
fn unexpected_violation_restores_pass_through() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);

    // Subdivide the region by splitting one page, then fault on another.
    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    env.core.engine.lock().flip_to_data(0x60_3000).unwrap();
    assert!(!env.leaf(0x60_3000).is_pass_through());

    env.violate(0x1234, cr3, 0x40_3000, 0x60_3000, 0b010);

    assert_pass_through_identity(env.leaf(0x60_3000), 0x60_3000);
    // Misses are diagnostics only, never flip-log entries.
    assert!(env.core.flip_log.lock().is_empty());
}

#[test]
fn invalidation_runs_for_engine_ops_but_never_in_the_handler() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);

    let invept_before = INVEPT_CALLS.load(Ordering::Relaxed);
    let invvpid_before = INVVPID_CALLS.load(Ordering::Relaxed);

    // Region remap flushes once, activation flushes once.
    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    let after_setup = INVEPT_CALLS.load(Ordering::Relaxed);
    assert_eq!(after_setup - invept_before, 2);
    assert_eq!(INVVPID_CALLS.load(Ordering::Relaxed) - invvpid_before, 2);

    // Violation flips, including a foreign-writer teardown, never flush.
    env.violate(0x9000, cr3, 0x40_0010, 0x60_0010, 0b001);
    env.violate(0x9008, cr3, 0x40_0010, 0x60_0010, 0b100);
    env.violate(0x9010, 0xBBBB_0000, 0x40_0010, 0x60_0010, 0b010);
    assert_eq!(INVEPT_CALLS.load(Ordering::Relaxed), after_setup);
    assert_eq!(INVVPID_CALLS.load(Ordering::Relaxed) - invvpid_before, 2);
    assert!(env.core.engine.lock().registry.is_empty());
}

#[test]
fn read_exec_violation_classifies_as_read() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);

    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);

    // R and X both set: the write-read-exec priority resolves it as a read
    // and the leaf flips to the data frame.
    env.violate(0x5000, cr3, 0x40_0010, 0x60_0010, 0b101);
    let leaf = env.leaf(0x60_0000);
    assert_eq!(leaf.pfn() << 12, 0x60_0000);
    assert!(leaf.readable() && leaf.writable() && !leaf.executable());

    let log = env.core.flip_log.lock();
    assert_eq!(log.records()[0].access_bits, 0b101);
}

#[test]
fn vmcall_protocol_validation_and_unknown_methods() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);
    vmwrite(vmcs::guest::CR3, cr3);

    // Wrong magic: nothing is dispatched and the registers stay untouched.
    let mut regs = GuestRegisters {
        rax: VMCALL_MODE_REGISTERS,
        rdx: 0x1122_3344,
        rcx: METHOD_CREATE_SPLIT,
        rbx: 0x40_0000,
        ..Default::default()
    };
    assert_eq!(handle_vmcall(&env.core, &mut regs).unwrap(), ExitType::IncrementRIP);
    assert_eq!(regs.rcx, METHOD_CREATE_SPLIT);
    assert!(env.core.engine.lock().registry.is_empty());

    // Wrong mode value.
    let mut regs = GuestRegisters {
        rax: 1,
        rdx: VMCALL_MAGIC,
        rcx: METHOD_CREATE_SPLIT,
        rbx: 0x40_0000,
        ..Default::default()
    };
    assert_eq!(handle_vmcall(&env.core, &mut regs).unwrap(), ExitType::IncrementRIP);
    assert!(env.core.engine.lock().registry.is_empty());

    // Unknown method number reports all-ones.
    assert_eq!(env.vmcall(cr3, 11, 0, 0, 0), STATUS_UNKNOWN_METHOD);
    assert_eq!(env.vmcall(cr3, 0xFFFF, 0, 0, 0), STATUS_UNKNOWN_METHOD);

    // Operations on unmapped or zero addresses fail cleanly.
    assert_eq!(env.vmcall(cr3, METHOD_IS_SPLIT, 0x7777_0000, 0, 0), SplitStatus::Unmapped as i64 as u64);
    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0, 0, 0), STATUS_FAILURE);
    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x7777_0000, 0, 0), STATUS_FAILURE);
    assert_eq!(env.vmcall(cr3, METHOD_DEACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_FAILURE);
    assert_eq!(env.vmcall(cr3, METHOD_GET_FLIP_DATA, 0, 64, 0), STATUS_FAILURE);
}

#[test]
fn activate_is_idempotent_and_create_rejects_unmapped() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);

    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    let snapshot = |leaf: Entry| (leaf.pfn(), leaf.readable(), leaf.writable(), leaf.executable(), leaf.memory_type());
    let leaf_before = snapshot(env.leaf(0x60_0000));

    let invept_before = INVEPT_CALLS.load(Ordering::Relaxed);
    assert_eq!(env.vmcall(cr3, METHOD_ACTIVATE_SPLIT, 0x40_0000, 0, 0), STATUS_SUCCESS);
    assert_eq!(snapshot(env.leaf(0x60_0000)), leaf_before);
    // Re-activation has no side effects, not even a flush.
    assert_eq!(INVEPT_CALLS.load(Ordering::Relaxed), invept_before);

    assert_eq!(env.vmcall(cr3, METHOD_CREATE_SPLIT, 0x7777_0000, 0, 0), STATUS_FAILURE);
}

#[test]
fn registered_handlers_route_to_the_core() {
    let mut env = TestEnv::new();
    let cr3 = env.arena.create_address_space();
    env.arena.map_page(cr3, 0x40_0000, 0x60_0000);
    vmwrite(vmcs::guest::CR3, cr3);

    let handlers = ExitHandlers::register();

    // A vmcall through the registered callback creates the split.
    let mut regs = GuestRegisters {
        rax: VMCALL_MODE_REGISTERS,
        rdx: VMCALL_MAGIC,
        rcx: METHOD_CREATE_SPLIT,
        rbx: 0x40_0000,
        ..Default::default()
    };
    assert_eq!((handlers.vmcall)(&env.core, &mut regs).unwrap(), ExitType::IncrementRIP);
    assert_eq!(regs.rcx, STATUS_SUCCESS);
    assert!(env.core.engine.lock().registry.contains(0x60_0000));

    // The violation callback reads its exit state from the VMCS store.
    regs.rcx = METHOD_ACTIVATE_SPLIT;
    regs.rax = VMCALL_MODE_REGISTERS;
    assert_eq!((handlers.vmcall)(&env.core, &mut regs).unwrap(), ExitType::IncrementRIP);
    assert_eq!(regs.rcx, STATUS_SUCCESS);

    vmwrite(vmcs::ro::EXIT_QUALIFICATION, 0b001u64);
    vmwrite(vmcs::ro::GUEST_LINEAR_ADDR, 0x40_0010u64);
    vmwrite(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL, 0x60_0010u64);
    let mut regs = GuestRegisters { rip: 0x40_0010, ..Default::default() };
    assert_eq!((handlers.ept_violation)(&env.core, &mut regs).unwrap(), ExitType::Continue);

    let leaf = env.leaf(0x60_0000);
    assert_eq!(leaf.pfn() << 12, 0x60_0000);
    assert!(leaf.readable() && !leaf.executable());

    // The monitor-trap callback always lands back on the hooked view.
    let mut regs = GuestRegisters::default();
    assert_eq!((handlers.monitor_trap)(&env.core, &mut regs).unwrap(), ExitType::Continue);
    assert_eq!(vmread(vmcs::control::EPTP_FULL), env.core.hooked_eptp);
}
