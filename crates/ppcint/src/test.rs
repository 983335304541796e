use gekko::disasm::Ins;
use gekko::fpu::{self, QNAN};
use gekko::{Address, Cpu, Exception, Memory, ProgramReason, QuantReg, QuantizedType, Ram};

use crate::{Interpreter, Outcome};

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

                    sequence.push(crate::decode(
                        powerpc_asm::assemble(stringify!($mnemonic), &arguments).unwrap(),
                    ));
                )*
            }

            sequence
        }
    };
}

fn setup() -> (Cpu, Ram) {
    let mut cpu = Cpu::default();
    cpu.supervisor.msr.set_float_available(true);

    (cpu, Ram::new(Address(0), 0x1000))
}

fn exec(cpu: &mut Cpu, mem: &mut Ram, sequence: Vec<Ins>) -> Vec<Outcome> {
    let mut interpreter = Interpreter::new(cpu, mem);
    sequence
        .into_iter()
        .map(|ins| interpreter.step(ins))
        .collect()
}

fn load_program(mem: &mut Ram, code: &[u32]) {
    let bytes: Vec<u8> = code.iter().flat_map(|c| c.to_be_bytes()).collect();
    assert!(mem.load(Address(0), &bytes));
}

#[test]
fn fadd() {
    let (mut cpu, mut mem) = setup();
    cpu.user.fpr[1].0 = [1.5, 0.0];
    cpu.user.fpr[2].0 = [2.25, 0.0];
    cpu.user.fpr[0].0 = [0.0, 7.0];

    let outcomes = exec(&mut cpu, &mut mem, ppc! { fadd fpr(0) fpr(1) fpr(2) });

    assert_eq!(outcomes, [Outcome::Continue]);
    assert_eq!(cpu.pc, 4);
    // double precision arithmetic leaves ps1 alone
    assert_eq!(cpu.user.fpr[0].0, [3.75, 7.0]);
    assert_eq!(cpu.user.fpscr.fprf().value(), fpu::classify(3.75, false));
    assert!(!cpu.user.fpscr.inexact_exception());
    assert!(!cpu.user.fpscr.exception_summary());
}

#[test]
fn fadds_writes_both_lanes() {
    let (mut cpu, mut mem) = setup();
    cpu.user.fpr[1].0 = [1.0, 0.0];
    cpu.user.fpr[2].0 = [f64::EPSILON, 0.0];

    exec(&mut cpu, &mut mem, ppc! { fadds fpr(0) fpr(1) fpr(2) });

    assert_eq!(cpu.user.fpr[0].0, [1.0, 1.0]);
    assert!(cpu.user.fpscr.inexact_exception());
    assert!(cpu.user.fpscr.fraction_inexact());
    assert!(cpu.user.fpscr.exception_summary());
}

#[test]
fn snan_operand() {
    let (mut cpu, mut mem) = setup();
    cpu.user.fpr[1].0 = [f64::from_bits(0x7FF0_0000_0000_0001), 0.0];
    cpu.user.fpr[2].0 = [1.0, 0.0];

    exec(&mut cpu, &mut mem, ppc! { fadd fpr(0) fpr(1) fpr(2) });

    let fpscr = cpu.user.fpscr;
    assert_eq!(cpu.user.fpr[0].0[0].to_bits(), QNAN);
    assert!(fpscr.invalid_snan_exception());
    assert!(fpscr.invalid_op_exception_summary());
    assert!(fpscr.exception_summary());
    assert!(!fpscr.enabled_exception_summary());
}

#[test]
fn fctiwz_saturates() {
    let (mut cpu, mut mem) = setup();
    cpu.user.fpr[1].0 = [3.0e10, 0.0];
    cpu.user.fpr[2].0 = [-3.0e10, 0.0];
    cpu.user.fpr[3].0 = [-7.9, 0.0];

    exec(
        &mut cpu,
        &mut mem,
        ppc! {
            fctiwz fpr(4) fpr(1);
            fctiwz fpr(5) fpr(2);
            fctiwz fpr(6) fpr(3);
        },
    );

    assert_eq!(cpu.user.fpr[4].0[0].to_bits() as u32, 0x7FFF_FFFF);
    assert_eq!(cpu.user.fpr[5].0[0].to_bits() as u32, 0x8000_0000);
    assert_eq!(cpu.user.fpr[6].0[0].to_bits() as u32 as i32, -7);
    assert!(cpu.user.fpscr.invalid_conversion_exception());
}

#[test]
fn lfs_fills_both_lanes() {
    let (mut cpu, mut mem) = setup();
    mem.write(Address(0x100), 0x3FC0_0000u32);
    cpu.user.gpr[31] = 0x100;

    exec(&mut cpu, &mut mem, ppc! { lfs fpr(0) off(0) gpr(31) });

    assert_eq!(cpu.user.fpr[0].0, [1.5, 1.5]);
}

#[test]
fn quantized_round_trip() {
    let (mut cpu, mut mem) = setup();
    cpu.supervisor.gqr[1] = QuantReg::default()
        .with_load_type(QuantizedType::U8)
        .with_store_type(QuantizedType::U8);

    cpu.user.gpr[4] = 0x200;
    cpu.user.fpr[4].0 = [200.0, 300.0];

    exec(
        &mut cpu,
        &mut mem,
        ppc! {
            psq_st fpr(4) off(0) gpr(4) u(0) u(1);
            psq_l fpr(5) off(0) gpr(4) u(0) u(1);
            psq_l fpr(6) off(0) gpr(4) u(1) u(1);
        },
    );

    assert_eq!(mem.read::<u16>(Address(0x200)), Some(0xC8FF));
    assert_eq!(cpu.user.fpr[5].0, [200.0, 255.0]);
    assert_eq!(cpu.user.fpr[6].0, [200.0, 1.0]);
}

#[test]
fn ps_muls0() {
    let (mut cpu, mut mem) = setup();
    cpu.user.fpr[1].0 = [2.0, 8.0];
    cpu.user.fpr[2].0 = [3.0, 5.0];

    exec(&mut cpu, &mut mem, ppc! { ps_muls0 fpr(0) fpr(2) fpr(1) });

    assert_eq!(cpu.user.fpr[0].0, [6.0, 10.0]);
}

#[test]
fn fcmpu_sets_cr_field() {
    let (mut cpu, mut mem) = setup();
    cpu.user.fpr[1].0 = [1.0, 0.0];
    cpu.user.fpr[2].0 = [f64::NAN, 0.0];

    exec(
        &mut cpu,
        &mut mem,
        ppc! {
            fcmpu u(0) fpr(1) fpr(1);
            fcmpu u(7) fpr(1) fpr(2);
        },
    );

    assert!(cpu.user.cr.field(0).eq);
    assert!(cpu.user.cr.field(7).so);
    assert!(!cpu.user.fpscr.invalid_compare_exception());
}

#[test]
fn float_unavailable() {
    let (mut cpu, mut mem) = setup();
    cpu.supervisor.msr.set_float_available(false);
    cpu.pc = Address(0x80);

    let outcomes = exec(&mut cpu, &mut mem, ppc! { fadd fpr(0) fpr(1) fpr(2) });

    assert_eq!(outcomes, [Outcome::Exception]);
    assert_eq!(cpu.pc, 0xFFF0_0000 | Exception::FloatUnavailable as u32);
    assert_eq!(cpu.supervisor.srr[0], 0x80);
}

#[test]
fn integer_ops() {
    let (mut cpu, mut mem) = setup();
    cpu.user.gpr[4] = 0x1234_5678;

    let outcomes = exec(
        &mut cpu,
        &mut mem,
        vec![
            // addi r3, r0, 5
            crate::decode(0x3860_0005),
            // rlwinm r5, r4, 8, 24, 31
            crate::decode(0x5485_463E),
        ],
    );

    assert_eq!(outcomes, [Outcome::Continue, Outcome::Continue]);
    assert_eq!(cpu.user.gpr[3], 5);
    assert_eq!(cpu.user.gpr[5], 0x12);
}

#[test]
fn illegal_instruction() {
    let (mut cpu, mut mem) = setup();
    cpu.pc = Address(0x40);

    let outcomes = exec(&mut cpu, &mut mem, vec![crate::decode(0)]);

    assert_eq!(outcomes, [Outcome::Exception]);
    assert_eq!(cpu.pc, 0xFFF0_0700);
    assert_eq!(cpu.supervisor.srr[0], 0x40);
    assert_ne!(cpu.supervisor.srr[1] & ProgramReason::Illegal.srr1_bit(), 0);
}

#[test]
fn privileged_spr_in_user_mode() {
    let (mut cpu, mut mem) = setup();
    cpu.supervisor.msr.set_user_mode(true);

    // mfspr r3, SRR0
    let outcomes = exec(&mut cpu, &mut mem, vec![crate::decode(0x7C7A_02A6)]);

    assert_eq!(outcomes, [Outcome::Exception]);
    assert_ne!(cpu.supervisor.srr[1] & ProgramReason::Privileged.srr1_bit(), 0);
}

#[test]
fn unmapped_load_raises_dsi() {
    let (mut cpu, mut mem) = setup();
    cpu.user.gpr[4] = 0x10_0000;

    // lwz r3, 0(r4)
    let outcomes = exec(&mut cpu, &mut mem, vec![crate::decode(0x8064_0000)]);

    assert_eq!(outcomes, [Outcome::Exception]);
    assert_eq!(cpu.pc, 0xFFF0_0300);
    assert_eq!(cpu.supervisor.dar, 0x10_0000);
}

#[test]
fn run_loop() {
    let (mut cpu, mut mem) = setup();
    cpu.user.ctr = 3;

    load_program(
        &mut mem,
        &[
            // addi r3, r3, 1
            0x3863_0001,
            // bdnz -4
            0x4200_FFFC,
            // illegal
            0x0000_0000,
        ],
    );

    let executed = crate::run(&mut cpu, &mut mem, 100);

    assert_eq!(executed, 7);
    assert_eq!(cpu.user.gpr[3], 3);
    assert_eq!(cpu.user.ctr, 0);
    assert_eq!(cpu.pc, 0xFFF0_0700);
    assert_eq!(cpu.supervisor.srr[0], 8);
}
