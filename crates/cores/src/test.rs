use std::cell::RefCell;
use std::rc::Rc;

use gekko::{Address, Cpu, Exception, Ram};

use crate::{Config, Core, ExitReason};

// addi r5, r5, 1
const ADDI_R5_1: u32 = 0x38A5_0001;
// addi r5, r5, 2
const ADDI_R5_2: u32 = 0x38A5_0002;
// stw r4, 0(r3)
const STW_R4_R3: u32 = 0x9083_0000;
// icbi r0, r3
const ICBI_R3: u32 = 0x7C00_1FAC;
// blr
const BLR: u32 = 0x4E80_0020;

fn core() -> Core<Ram> {
    let mut cpu = Cpu::default();
    cpu.supervisor.msr.set_float_available(true);
    cpu.user.lr = 0x800;

    Core::new(Config::default(), cpu, Ram::new(Address(0), 0x1000)).unwrap()
}

fn load(core: &mut Core<Ram>, addr: u32, code: &[u32]) {
    let bytes: Vec<u8> = code.iter().flat_map(|c| c.to_be_bytes()).collect();
    assert!(core.mem.load(Address(addr), &bytes));
}

#[test]
fn blocks_are_cached() {
    let mut core = core();
    load(&mut core, 0x200, &[ADDI_R5_1, BLR]);

    let exit = core.compile_and_run(Address(0x200)).unwrap();
    assert_eq!(exit.pc, 0x800);
    assert_eq!(exit.reason, ExitReason::Branch);
    assert_eq!(exit.instructions, 2);

    core.compile_and_run(Address(0x200)).unwrap();
    assert_eq!(core.flush_register_cache().user.gpr[5], 2);
    assert_eq!(core.compiler().compiled_count(), 1);
    assert_eq!(core.blocks().len(), 1);
}

#[test]
fn invalidated_block_is_recompiled() {
    let mut core = core();
    load(&mut core, 0x200, &[ADDI_R5_1, BLR]);
    core.compile_and_run(Address(0x200)).unwrap();

    load(&mut core, 0x200, &[ADDI_R5_2]);
    core.invalidate_range(Address(0x1F0), 0x14);
    assert!(core.blocks().is_empty());

    core.compile_and_run(Address(0x200)).unwrap();
    assert_eq!(core.cpu.user.gpr[5], 3);
    assert_eq!(core.compiler().compiled_count(), 2);
}

#[test]
fn range_outside_block_keeps_it() {
    let mut core = core();
    load(&mut core, 0x200, &[ADDI_R5_1, BLR]);
    core.compile_and_run(Address(0x200)).unwrap();

    core.invalidate_range(Address(0x208), 0x100);
    core.invalidate_range(Address(0x1F0), 0x10);
    assert_eq!(core.blocks().len(), 1);
}

#[test]
fn self_modifying_store() {
    let mut core = core();
    load(&mut core, 0x100, &[STW_R4_R3, BLR]);
    load(&mut core, 0x200, &[ADDI_R5_1, BLR]);

    core.compile_and_run(Address(0x200)).unwrap();
    assert_eq!(core.cpu.user.gpr[5], 1);

    core.cpu.user.gpr[3] = 0x200;
    core.cpu.user.gpr[4] = ADDI_R5_2;
    core.compile_and_run(Address(0x100)).unwrap();
    assert_eq!(core.blocks().len(), 1);
    assert!(core.blocks().get(Address(0x200)).is_none());

    core.compile_and_run(Address(0x200)).unwrap();
    assert_eq!(core.cpu.user.gpr[5], 3);
}

#[test]
fn icbi_invalidates_cache_block() {
    let mut core = core();
    load(&mut core, 0x100, &[ICBI_R3, BLR]);
    load(&mut core, 0x200, &[ADDI_R5_1, BLR]);

    core.compile_and_run(Address(0x200)).unwrap();
    core.cpu.user.gpr[3] = 0x21C;

    let exit = core.compile_and_run(Address(0x100)).unwrap();
    assert_eq!(exit.reason, ExitReason::FallThrough);
    assert_eq!(exit.pc, 0x104);
    assert!(core.blocks().get(Address(0x200)).is_none());
}

#[test]
fn fetch_fault_raises_isi() {
    let mut core = core();

    let exit = core.compile_and_run(Address(0x10_0000)).unwrap();
    assert_eq!(exit.reason, ExitReason::Exception);
    assert_eq!(exit.instructions, 0);
    assert_eq!(exit.pc, 0xFFF0_0000 | Exception::ISI as u32);
    assert_eq!(core.cpu.supervisor.srr[0], 0x10_0000);
    assert!(core.blocks().is_empty());
}

#[test]
fn exit_callback() {
    let mut core = core();
    load(&mut core, 0x200, &[ADDI_R5_1, BLR]);

    let exits = Rc::new(RefCell::new(Vec::new()));
    let recorded = exits.clone();
    core.on_exit(move |pc, reason| recorded.borrow_mut().push((pc, reason)));

    core.compile_and_run(Address(0x200)).unwrap();
    core.compile_and_run(Address(0x10_0000)).unwrap();

    assert_eq!(
        *exits.borrow(),
        [
            (Address(0x800), ExitReason::Branch),
            (Address(0xFFF0_0400), ExitReason::Exception)
        ]
    );
}

#[test]
fn steps_use_their_own_blocks() {
    let mut core = core();
    load(&mut core, 0x200, &[ADDI_R5_1, ADDI_R5_2, BLR]);
    core.cpu.pc = Address(0x200);

    let exit = core.step().unwrap();
    assert_eq!(exit.instructions, 1);
    assert_eq!(exit.pc, 0x204);
    assert_eq!(core.cpu.user.gpr[5], 1);
    assert!(core.blocks().is_empty());
    assert_eq!(core.steps().len(), 1);

    // a regular block at the same address is compiled separately
    core.compile_and_run(Address(0x200)).unwrap();
    assert_eq!(core.cpu.user.gpr[5], 4);
    assert_eq!(core.blocks().len(), 1);
    assert_eq!(core.compiler().compiled_count(), 2);
}

#[test]
fn stepping_reuses_blocks() {
    let mut core = core();
    // addi r5, r5, 1; b -4
    load(&mut core, 0x200, &[ADDI_R5_1, 0x4BFF_FFFC]);
    core.cpu.pc = Address(0x200);

    core.step().unwrap();
    core.step().unwrap();
    let code_size = core.compiler().code_size();

    for _ in 0..1000 {
        core.step().unwrap();
    }

    assert_eq!(core.cpu.user.gpr[5], 501);
    assert_eq!(core.cpu.pc, 0x200);
    assert_eq!(core.compiler().compiled_count(), 2);
    assert_eq!(core.compiler().code_size(), code_size);
}

#[test]
fn stepped_code_is_invalidated() {
    let mut core = core();
    load(&mut core, 0x100, &[STW_R4_R3, BLR]);
    load(&mut core, 0x200, &[ADDI_R5_1]);

    core.cpu.pc = Address(0x200);
    core.step().unwrap();
    assert_eq!(core.steps().len(), 1);

    core.cpu.user.gpr[3] = 0x200;
    core.cpu.user.gpr[4] = ADDI_R5_2;
    core.compile_and_run(Address(0x100)).unwrap();
    assert!(core.steps().is_empty());

    core.cpu.pc = Address(0x200);
    core.step().unwrap();
    assert_eq!(core.cpu.user.gpr[5], 3);
}

#[test]
fn code_budget_reclaims_memory() {
    let config = Config {
        code_budget: 0,
        ..Config::default()
    };

    let mut cpu = Cpu::default();
    cpu.user.lr = 0x800;
    let mut core = Core::new(config, cpu, Ram::new(Address(0), 0x1000)).unwrap();
    load(&mut core, 0x200, &[ADDI_R5_1, BLR]);
    load(&mut core, 0x300, &[ADDI_R5_2, BLR]);

    core.compile_and_run(Address(0x200)).unwrap();
    let code_size = core.compiler().code_size();

    for _ in 0..100 {
        core.compile_and_run(Address(0x300)).unwrap();
        core.compile_and_run(Address(0x200)).unwrap();
    }

    // every miss dropped the previous blocks and their code
    assert_eq!(core.blocks().len(), 1);
    assert_eq!(core.compiler().code_size(), code_size);
    assert_eq!(core.cpu.user.gpr[5], 301);
}

#[test]
fn run_loop() {
    let mut core = core();
    core.cpu.user.ctr = 3;
    core.cpu.pc = Address(0);
    load(
        &mut core,
        0,
        &[
            // addi r3, r3, 1
            0x3863_0001,
            // bdnz -4
            0x4200_FFFC,
            // b 0
            0x4800_0000,
        ],
    );

    let executed = core.run(7).unwrap();
    assert_eq!(executed.instructions, 7);
    assert_eq!(executed.blocks, 4);
    assert_eq!(core.cpu.user.gpr[3], 3);
    assert_eq!(core.cpu.user.ctr, 0);
    // the last block branched back to the start
    assert_eq!(core.cpu.pc, 0);
    assert_eq!(core.blocks().len(), 2);
}

#[test]
fn run_stops_without_progress() {
    let mut core = core();
    core.cpu.pc = Address(0x10_0000);

    let executed = core.run(100).unwrap();
    assert_eq!(executed.instructions, 0);
    assert_eq!(executed.blocks, 2);
}

#[test]
fn clear_releases_blocks() {
    let mut core = core();
    load(&mut core, 0x200, &[ADDI_R5_1, BLR]);
    core.compile_and_run(Address(0x200)).unwrap();

    core.clear().unwrap();
    assert!(core.blocks().is_empty());

    core.compile_and_run(Address(0x200)).unwrap();
    assert_eq!(core.cpu.user.gpr[5], 2);
}
