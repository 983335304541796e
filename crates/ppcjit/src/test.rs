use gekko::disasm::Ins;
use gekko::fpu::QNAN;
use gekko::{Address, Cpu, Exception, Memory, Ram};
use ppcint::Outcome;

use crate::block::Info;
use crate::hooks::{Context, Hooks};
use crate::{BuildError, Capacity, ExitReason, Jit, Settings};

macro_rules! ppc {
    ($($mnemonic:ident $($arg:expr)*);* $(;)?) => {
        {
            let mut sequence: Vec<Ins> = vec![];

            #[allow(unused_variables, unused_mut, unused_assignments, unused_imports, dead_code)]
            {
                use powerpc_asm::Argument;

                fn u(value: u32) -> Argument {
                    Argument::Unsigned(value)
                }

                fn i(value: i32) -> Argument {
                    Argument::Signed(value)
                }

                fn gpr(index: u32) -> Argument {
                    u(index)
                }

                fn fpr(index: u32) -> Argument {
                    u(index)
                }

                fn off(value: i32) -> Argument {
                    i(value)
                }

                $(
                    let mut i = 0;
                    let mut arguments = [Argument::None; 5];

                    $(
                        arguments[i] = $arg;
                        i += 1;
                    )*

                    sequence.push(ppcint::decode(
                        powerpc_asm::assemble(stringify!($mnemonic), &arguments).unwrap(),
                    ));
                )*
            }

            sequence
        }
    };
}

/// Sets the Rc bit of an instruction.
fn record(ins: Ins) -> Ins {
    ppcint::decode(ins.code | 1)
}

struct Harness {
    cpu: Cpu,
    ram: Ram,
    invalidated: Vec<Address>,
}

fn harness(ctx: *mut Context) -> &'static mut Harness {
    unsafe { &mut *ctx.cast::<Harness>() }
}

extern "C-unwind" fn get_registers(ctx: *mut Context) -> *mut Cpu {
    &raw mut harness(ctx).cpu
}

extern "C-unwind" fn read<P: gekko::Primitive>(ctx: *mut Context, addr: Address, out: *mut P) -> bool {
    match harness(ctx).ram.read::<P>(addr) {
        Some(value) => {
            unsafe { out.write(value) };
            true
        }
        None => false,
    }
}

extern "C-unwind" fn write<P: gekko::Primitive>(ctx: *mut Context, addr: Address, value: P) -> bool {
    harness(ctx).ram.write(addr, value)
}

extern "C-unwind" fn interpret(ctx: *mut Context, code: u32) -> u8 {
    let harness = harness(ctx);
    ppcint::step(&mut harness.cpu, &mut harness.ram, code) as u8
}

extern "C-unwind" fn invalidate_icache(ctx: *mut Context, addr: Address) {
    harness(ctx).invalidated.push(addr);
}

fn hooks() -> Hooks {
    Hooks {
        get_registers,
        read_i32: read::<i32>,
        write_i32: write::<i32>,
        read_i64: read::<i64>,
        write_i64: write::<i64>,
        interpret,
        invalidate_icache,
    }
}

fn setup() -> Harness {
    let mut cpu = Cpu::default();
    cpu.pc = Address(0x100);
    cpu.supervisor.msr.set_float_available(true);

    Harness {
        cpu,
        ram: Ram::new(Address(0), 0x1000),
        invalidated: Vec::new(),
    }
}

/// Runs the sequence through the interpreter, stopping at the first instruction that leaves the
/// sequential flow.
fn interpret_sequence(harness: &mut Harness, sequence: &[Ins]) -> u32 {
    let mut executed = 0;
    for ins in sequence {
        executed += 1;
        let outcome = ppcint::Interpreter::new(&mut harness.cpu, &mut harness.ram).step(*ins);
        if outcome != Outcome::Continue {
            break;
        }
    }

    executed
}

fn run_jit(jit: &mut Jit, harness: &mut Harness, sequence: &[Ins]) -> Info {
    let block = jit.build(sequence.iter().copied()).unwrap();
    unsafe { jit.call((&raw mut *harness).cast(), block.as_ptr()) }
}

fn assert_same_state(jit: &Cpu, int: &Cpu) {
    assert_eq!(jit.pc, int.pc, "pc");
    assert_eq!(jit.user.gpr, int.user.gpr, "gpr");
    for (index, (a, b)) in jit.user.fpr.iter().zip(&int.user.fpr).enumerate() {
        assert_eq!(
            [a[0].to_bits(), a[1].to_bits()],
            [b[0].to_bits(), b[1].to_bits()],
            "fpr{index}"
        );
    }
    assert_eq!(jit.user.cr, int.user.cr, "cr");
    assert_eq!(jit.user.fpscr.to_bits(), int.user.fpscr.to_bits(), "fpscr");
    assert_eq!(jit.user.xer, int.user.xer, "xer");
    assert_eq!(jit.user.lr, int.user.lr, "lr");
    assert_eq!(jit.user.ctr, int.user.ctr, "ctr");
    assert_eq!(jit.supervisor, int.supervisor, "supervisor");
}

/// Runs the sequence through both the JIT and the interpreter, asserting both end up in the same
/// state.
fn compare(settings: Settings, prepare: impl Fn(&mut Harness), sequence: Vec<Ins>) -> (Harness, Info) {
    let mut jit = Jit::new(settings, hooks()).unwrap();

    let mut expected = setup();
    prepare(&mut expected);
    let executed = interpret_sequence(&mut expected, &sequence);

    let mut actual = setup();
    prepare(&mut actual);
    let info = run_jit(&mut jit, &mut actual, &sequence);

    assert_same_state(&actual.cpu, &expected.cpu);
    assert_eq!(actual.ram.as_slice(), expected.ram.as_slice());
    assert_eq!(info.instructions, executed);

    (actual, info)
}

#[test]
fn float_arith_record() {
    let (harness, info) = compare(
        Settings::default(),
        |h| {
            h.cpu.user.fpr[1].0 = [1.5, 0.0];
            h.cpu.user.fpr[2].0 = [2.25, 0.0];
            h.cpu.user.fpr[3].0 = [1.0, 0.0];
            h.cpu.user.fpr[4].0 = [f64::EPSILON, 0.0];
        },
        vec![
            record(ppc! { fadd fpr(0) fpr(1) fpr(2) }[0]),
            ppc! { fmul fpr(5) fpr(0) fpr(1) }[0],
            record(ppc! { fadds fpr(6) fpr(3) fpr(4) }[0]),
            ppc! { fmadd fpr(7) fpr(1) fpr(2) fpr(3) }[0],
        ],
    );

    assert_eq!(info.exit_reason(), ExitReason::FallThrough);
    assert_eq!(harness.cpu.pc, 0x110);
    assert_eq!(harness.cpu.user.fpr[0].0[0], 3.75);
    assert_eq!(harness.cpu.user.fpr[6].0, [1.0, 1.0]);
    assert!(harness.cpu.user.fpscr.inexact_exception());
}

#[test]
fn nan_results() {
    let (harness, _) = compare(
        Settings::default(),
        |h| {
            h.cpu.user.fpr[1].0 = [0.0, 0.0];
            h.cpu.user.fpr[2].0 = [f64::from_bits(0x7FF0_0000_0000_0001), 0.0];
            h.cpu.user.fpr[3].0 = [1.0, 0.0];
        },
        ppc! {
            fdiv fpr(4) fpr(1) fpr(1);
            fadd fpr(5) fpr(2) fpr(3);
            fcmpo u(1) fpr(2) fpr(3);
        },
    );

    assert_eq!(harness.cpu.user.fpr[4].0[0].to_bits(), QNAN);
    assert!(harness.cpu.user.fpscr.invalid_zero_div_zero_exception());
    assert!(harness.cpu.user.fpscr.invalid_snan_exception());
    assert!(harness.cpu.user.cr.field(1).so);
}

#[test]
fn exact_zero_towards_neg_inf() {
    let (harness, _) = compare(
        Settings::default(),
        |h| {
            h.cpu.user.fpr[2].0 = [1.0, 0.0];
            h.cpu.user.fpr[3].0 = [0.5, 0.0];
        },
        vec![
            ppc! { mtfsfi u(7) u(3) }[0],
            ppc! { fadd fpr(4) fpr(3) fpr(3) }[0],
            ppc! { fsub fpr(1) fpr(2) fpr(2) }[0],
        ],
    );

    assert_eq!(harness.cpu.user.fpr[1].0[0].to_bits(), (-0.0f64).to_bits());
    assert_eq!(harness.cpu.user.fpr[4].0[0], 1.0);
    assert_eq!(harness.cpu.user.fpscr.rounding(), gekko::FloatRounding::TowardsNegInf);
    assert_eq!(harness.cpu.user.fpscr.fprf().value(), 0b1_0010);
}

#[test]
fn fctiwz_saturates() {
    let (harness, _) = compare(
        Settings::default(),
        |h| {
            h.cpu.user.fpr[1].0 = [3.0e10, 0.0];
            h.cpu.user.fpr[2].0 = [-3.0e10, 0.0];
            h.cpu.user.fpr[3].0 = [-7.9, 0.0];
        },
        ppc! {
            fctiwz fpr(4) fpr(1);
            fctiwz fpr(5) fpr(2);
            fctiwz fpr(6) fpr(3);
        },
    );

    assert_eq!(harness.cpu.user.fpr[4].0[0].to_bits() as u32, 0x7FFF_FFFF);
    assert_eq!(harness.cpu.user.fpr[5].0[0].to_bits() as u32, 0x8000_0000);
    assert_eq!(harness.cpu.user.fpr[6].0[0].to_bits() as u32 as i32, -7);
}

#[test]
fn paired_singles() {
    let (harness, _) = compare(
        Settings::default(),
        |h| {
            h.cpu.user.fpr[1].0 = [2.0, 8.0];
            h.cpu.user.fpr[2].0 = [3.0, 5.0];
            h.cpu.user.fpr[3].0 = [-1.0, 0.5];
        },
        ppc! {
            ps_add fpr(0) fpr(1) fpr(2);
            ps_muls0 fpr(4) fpr(2) fpr(1);
            ps_madds1 fpr(5) fpr(1) fpr(2) fpr(3);
            ps_sum0 fpr(6) fpr(1) fpr(2) fpr(3);
            ps_merge10 fpr(7) fpr(1) fpr(2);
            ps_neg fpr(8) fpr(3);
            ps_sel fpr(9) fpr(3) fpr(1) fpr(2);
            ps_cmpo1 u(2) fpr(1) fpr(2);
        },
    );

    assert_eq!(harness.cpu.user.fpr[0].0, [5.0, 13.0]);
    assert_eq!(harness.cpu.user.fpr[4].0, [6.0, 10.0]);
    assert_eq!(harness.cpu.user.fpr[7].0, [8.0, 3.0]);
}

#[test]
fn fpscr_moves() {
    compare(
        Settings::default(),
        |h| {
            h.cpu.user.fpr[1].0 = [f64::from_bits(0xFFF8_0000_0000_00F3), 0.0];
            h.cpu.user.fpscr = gekko::FloatControlReg::from_bits(0x0200_1000);
        },
        vec![
            ppc! { mffs fpr(0) }[0],
            ppc! { mtfsf u(0xFF) fpr(1) }[0],
            ppc! { mtfsb1 u(25) }[0],
            ppc! { mcrfs u(2) u(6) }[0],
            record(ppc! { mtfsfi u(7) u(2) }[0]),
        ],
    );
}

#[test]
fn float_loads_and_stores() {
    let (harness, _) = compare(
        Settings::default(),
        |h| {
            h.ram.write(Address(0x200), 0x3FC0_0000u32);
            h.ram.write(Address(0x208), 2.5f64.to_bits());
            h.cpu.user.gpr[31] = 0x200;
            h.cpu.user.fpr[4].0 = [-3.0, 0.0];
        },
        ppc! {
            lfs fpr(0) off(0) gpr(31);
            lfdu fpr(1) off(8) gpr(31);
            stfd fpr(4) off(8) gpr(31);
            stfs fpr(0) off(16) gpr(31);
        },
    );

    assert_eq!(harness.cpu.user.fpr[0].0, [1.5, 1.5]);
    assert_eq!(harness.cpu.user.fpr[1].0[0], 2.5);
    assert_eq!(harness.cpu.user.gpr[31], 0x208);
}

#[test]
fn dsi_side_exit() {
    let (harness, info) = compare(
        Settings::default(),
        |h| {
            h.cpu.user.gpr[3] = 0x10_0000;
            h.cpu.user.fpr[1].0 = [1.0, 0.0];
        },
        ppc! {
            fadd fpr(2) fpr(1) fpr(1);
            lfs fpr(0) off(4) gpr(3);
            fadd fpr(3) fpr(1) fpr(1);
        },
    );

    assert_eq!(info.exit_reason(), ExitReason::Exception);
    assert_eq!(info.instructions, 2);
    assert_eq!(harness.cpu.pc, 0xFFF0_0300);
    assert_eq!(harness.cpu.supervisor.dar, 0x10_0004);
    assert_eq!(harness.cpu.supervisor.srr[0], 0x104);
    // registers computed before the fault are visible
    assert_eq!(harness.cpu.user.fpr[2].0[0], 2.0);
}

#[test]
fn float_unavailable() {
    let (harness, info) = compare(
        Settings::default(),
        |h| h.cpu.supervisor.msr.set_float_available(false),
        ppc! { fadd fpr(0) fpr(1) fpr(2) },
    );

    assert_eq!(info.exit_reason(), ExitReason::Exception);
    assert_eq!(harness.cpu.pc, 0xFFF0_0000 | Exception::FloatUnavailable as u32);
}

#[test]
fn fallback_instructions() {
    let (harness, _) = compare(
        Settings::default(),
        |h| {
            h.cpu.user.gpr[4] = 6;
            h.cpu.user.gpr[5] = 7;
            h.cpu.user.fpr[1].0 = [1.0, 0.0];
        },
        vec![
            // addi r3, r0, 5
            ppcint::decode(0x3860_0005),
            // mullw r6, r4, r5
            ppcint::decode(0x7CC4_29D6),
            // rlwinm r7, r6, 8, 24, 31
            ppcint::decode(0x54C7_463E),
            ppc! { fadd fpr(2) fpr(1) fpr(1) }[0],
        ],
    );

    assert_eq!(harness.cpu.user.gpr[3], 5);
    assert_eq!(harness.cpu.user.gpr[6], 42);
}

#[test]
fn fallback_exception_leaves_block() {
    let (harness, info) = compare(
        Settings::default(),
        |h| h.cpu.user.fpr[1].0 = [1.0, 0.0],
        vec![
            ppc! { fadd fpr(2) fpr(1) fpr(1) }[0],
            // illegal
            ppcint::decode(0),
            ppc! { fadd fpr(3) fpr(1) fpr(1) }[0],
        ],
    );

    assert_eq!(info.exit_reason(), ExitReason::Exception);
    assert_eq!(info.instructions, 2);
    assert_eq!(harness.cpu.pc, 0xFFF0_0700);
    assert_eq!(harness.cpu.user.fpr[3].0[0], 0.0);
}

#[test]
fn conditional_branch() {
    let sequence = vec![
        // cmpwi r3, 0
        ppcint::decode(0x2C03_0000),
        // beq +0x10
        ppcint::decode(0x4182_0010),
    ];

    let (harness, info) = compare(Settings::default(), |_| (), sequence.clone());
    assert_eq!(info.exit_reason(), ExitReason::Branch);
    assert_eq!(harness.cpu.pc, 0x114);

    let (harness, info) = compare(
        Settings::default(),
        |h| h.cpu.user.gpr[3] = 1,
        sequence,
    );
    assert_eq!(info.exit_reason(), ExitReason::FallThrough);
    assert_eq!(harness.cpu.pc, 0x108);
}

#[test]
fn branch_and_link() {
    let (harness, info) = compare(
        Settings::default(),
        |h| {
            h.cpu.user.ctr = 2;
            h.cpu.user.lr = 0x803;
        },
        vec![
            // bdnz +8
            ppcint::decode(0x4200_0008),
            // bclrl 20, 0
            ppcint::decode(0x4E80_0021),
        ],
    );

    assert_eq!(info.exit_reason(), ExitReason::Branch);
    assert_eq!(info.instructions, 1);
    assert_eq!(harness.cpu.pc, 0x108);
    assert_eq!(harness.cpu.user.ctr, 1);
}

#[test]
fn blr_with_link() {
    let (harness, _) = compare(
        Settings::default(),
        |h| h.cpu.user.lr = 0x803,
        vec![
            // blrl
            ppcint::decode(0x4E80_0021),
        ],
    );

    assert_eq!(harness.cpu.pc, 0x800);
    assert_eq!(harness.cpu.user.lr, 0x104);
}

#[test]
fn tight_capacity_routes_to_interpreter() {
    let settings = Settings {
        capacity: Capacity { int: 2, float: 4 },
        ..Default::default()
    };

    let mut jit = Jit::new(settings.clone(), hooks()).unwrap();
    let sequence = ppc! {
        ps_madd fpr(0) fpr(1) fpr(2) fpr(3);
        fmr fpr(4) fpr(0);
    };

    let mut harness = setup();
    let block = jit.build(sequence.iter().copied()).unwrap();
    assert_eq!(block.meta().interpreted, 1);
    drop(block);

    compare(
        settings,
        |h| {
            h.cpu.user.fpr[1].0 = [2.0, 3.0];
            h.cpu.user.fpr[2].0 = [4.0, 5.0];
            h.cpu.user.fpr[3].0 = [1.0, 1.0];
        },
        sequence.clone(),
    );

    let info = run_jit(&mut jit, &mut harness, &sequence);
    assert_eq!(info.instructions, 2);
}

#[test]
fn icbi_ends_block() {
    let mut jit = Jit::new(Settings::default(), hooks()).unwrap();
    let mut harness = setup();
    harness.cpu.user.gpr[3] = 0x400;

    let sequence = vec![
        // icbi r0, r3
        ppcint::decode(0x7C00_1FAC),
        ppc! { fadd fpr(2) fpr(1) fpr(1) }[0],
    ];

    let block = jit.build(sequence.iter().copied()).unwrap();
    assert_eq!(block.len(), 1);

    let info = unsafe { jit.call((&raw mut harness).cast(), block.as_ptr()) };
    assert_eq!(info.exit_reason(), ExitReason::FallThrough);
    assert_eq!(harness.cpu.pc, 0x104);
    assert_eq!(harness.invalidated, [Address(0x400)]);
}

#[test]
fn syscall_exits() {
    let (harness, info) = compare(
        Settings::default(),
        |_| (),
        vec![
            // sc
            ppcint::decode(0x4400_0002),
        ],
    );

    assert_eq!(info.exit_reason(), ExitReason::Exception);
    assert_eq!(harness.cpu.pc, 0xFFF0_0000 | Exception::Syscall as u32);
}

#[test]
fn empty_block() {
    let mut jit = Jit::new(Settings::default(), hooks()).unwrap();
    let result = jit.build(std::iter::empty());
    assert!(matches!(result, Err(BuildError::EmptyBlock)));
}

#[test]
fn reset_recompiles_trampoline() {
    let mut jit = Jit::new(Settings::default(), hooks()).unwrap();
    let sequence = ppc! { fadd fpr(2) fpr(1) fpr(1) };

    let mut harness = setup();
    run_jit(&mut jit, &mut harness, &sequence);
    assert_eq!(jit.compiled_count(), 1);
    assert!(jit.code_size() > 0);

    unsafe { jit.reset().unwrap() };

    let mut harness = setup();
    harness.cpu.user.fpr[1].0 = [2.0, 0.0];
    let info = run_jit(&mut jit, &mut harness, &sequence);
    assert_eq!(info.instructions, 1);
    assert_eq!(harness.cpu.user.fpr[2].0[0], 4.0);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn baseline_isa() {
    let isa = jitclif::x86_64_v1().unwrap();
    let mut jit = Jit::with_isa(isa, Settings::default(), hooks()).unwrap();
    let sequence = ppc! {
        fmadd fpr(3) fpr(1) fpr(2) fpr(1);
        fctiwz fpr(4) fpr(3);
    };

    let mut expected = setup();
    expected.cpu.user.fpr[1].0 = [1.5, 0.0];
    expected.cpu.user.fpr[2].0 = [-4.0, 0.0];
    let executed = interpret_sequence(&mut expected, &sequence);

    let mut actual = setup();
    actual.cpu.user.fpr[1].0 = [1.5, 0.0];
    actual.cpu.user.fpr[2].0 = [-4.0, 0.0];
    let info = run_jit(&mut jit, &mut actual, &sequence);

    assert_eq!(info.instructions, executed);
    assert_same_state(&actual.cpu, &expected.cpu);
    assert_eq!(actual.cpu.user.fpr[4].0[0].to_bits() as u32 as i32, -4);
}
