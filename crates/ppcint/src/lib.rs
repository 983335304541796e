//! Reference interpreter for Gekko PowerPC code.
//!
//! The interpreter executes exactly one instruction at a time against the canonical register file
//! ([`Cpu`]) and guest memory. It is the fallback path of the JIT: anything the JIT does not
//! compile natively is executed here, so it must be correct first and fast second. Floating point
//! status updates go through [`gekko::fpu`], the same code JIT compiled blocks use.

mod branch;
mod float;
mod integer;
mod memory;
mod paired;
mod system;

#[cfg(test)]
mod test;

use gekko::disasm::{Extensions, Ins};
use gekko::{Address, Cpu, Exception, FPR, GPR, InsExt, Memory, ProgramReason};
use strum::FromRepr;

/// The outcome of executing a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum Outcome {
    /// The instruction completed and PC now points to the next sequential instruction.
    Continue = 0,
    /// The instruction redirected PC.
    Branch = 1,
    /// The instruction raised a guest exception. PC points to the exception vector.
    Exception = 2,
}

/// Executes instructions against a CPU and a memory.
pub struct Interpreter<'a, M: Memory> {
    pub cpu: &'a mut Cpu,
    pub mem: &'a mut M,
}

/// Decodes an instruction word.
#[inline(always)]
pub fn decode(code: u32) -> Ins {
    Ins::new(code, Extensions::gekko_broadway())
}

/// Executes `code` as the instruction at the current PC.
pub fn step<M: Memory>(cpu: &mut Cpu, mem: &mut M, code: u32) -> Outcome {
    Interpreter { cpu, mem }.step(decode(code))
}

/// Fetches and executes up to `instructions` instructions, stopping early at the first exception.
/// Returns how many instructions were executed.
pub fn run<M: Memory>(cpu: &mut Cpu, mem: &mut M, instructions: u32) -> u32 {
    let mut interpreter = Interpreter { cpu, mem };

    let mut executed = 0;
    while executed < instructions {
        let pc = interpreter.cpu.pc;
        let Some(code) = interpreter.mem.read::<u32>(pc) else {
            interpreter.cpu.raise_exception(Exception::ISI);
            break;
        };

        executed += 1;
        if interpreter.step(decode(code)) == Outcome::Exception {
            break;
        }
    }

    executed
}

impl<'a, M: Memory> Interpreter<'a, M> {
    pub fn new(cpu: &'a mut Cpu, mem: &'a mut M) -> Self {
        Self { cpu, mem }
    }

    /// Executes `ins` as the instruction at the current PC.
    pub fn step(&mut self, ins: Ins) -> Outcome {
        let outcome = self.exec(ins);
        if outcome == Outcome::Continue {
            self.cpu.pc += 4;
        }

        outcome
    }

    fn exec(&mut self, ins: Ins) -> Outcome {
        match ins.primary() {
            3 => self.twi(ins),
            4 => self.exec_table4(ins),
            7 => self.mulli(ins),
            8 => self.subfic(ins),
            10 => self.cmpli(ins),
            11 => self.cmpi(ins),
            12 => self.addic(ins, false),
            13 => self.addic(ins, true),
            14 => self.addi(ins),
            15 => self.addis(ins),
            16 => self.bc(ins),
            17 => self.sc(ins),
            18 => self.b(ins),
            19 => self.exec_table19(ins),
            20 => self.rlwimi(ins),
            21 => self.rlwinm(ins),
            23 => self.rlwnm(ins),
            24 => self.ori(ins),
            25 => self.oris(ins),
            26 => self.xori(ins),
            27 => self.xoris(ins),
            28 => self.andi_record(ins),
            29 => self.andis_record(ins),
            31 => self.exec_table31(ins),
            32 => self.load_imm::<u32>(ins, false),
            33 => self.load_imm::<u32>(ins, true),
            34 => self.load_imm::<u8>(ins, false),
            35 => self.load_imm::<u8>(ins, true),
            36 => self.store_imm::<u32>(ins, false),
            37 => self.store_imm::<u32>(ins, true),
            38 => self.store_imm::<u8>(ins, false),
            39 => self.store_imm::<u8>(ins, true),
            40 => self.load_imm::<u16>(ins, false),
            41 => self.load_imm::<u16>(ins, true),
            42 => self.load_imm::<i16>(ins, false),
            43 => self.load_imm::<i16>(ins, true),
            44 => self.store_imm::<u16>(ins, false),
            45 => self.store_imm::<u16>(ins, true),
            46 => self.lmw(ins),
            47 => self.stmw(ins),
            48 => self.lfs(ins, false),
            49 => self.lfs(ins, true),
            50 => self.lfd(ins, false),
            51 => self.lfd(ins, true),
            52 => self.stfs(ins, false),
            53 => self.stfs(ins, true),
            54 => self.stfd(ins, false),
            55 => self.stfd(ins, true),
            56 => self.psq_l(ins, false),
            57 => self.psq_l(ins, true),
            59 => self.exec_table59(ins),
            60 => self.psq_st(ins, false),
            61 => self.psq_st(ins, true),
            63 => self.exec_table63(ins),
            _ => self.illegal(ins),
        }
    }

    fn exec_table4(&mut self, ins: Ins) -> Outcome {
        match ins.subop10() & 0x3F {
            6 => return self.psq_lx(ins, false),
            7 => return self.psq_stx(ins, false),
            38 => return self.psq_lx(ins, true),
            39 => return self.psq_stx(ins, true),
            _ => (),
        }

        match ins.subop5() {
            10 => return self.ps_sum(ins, 0),
            11 => return self.ps_sum(ins, 1),
            12 => return self.ps_muls(ins, 0),
            13 => return self.ps_muls(ins, 1),
            14 => return self.ps_madds(ins, 0),
            15 => return self.ps_madds(ins, 1),
            18 | 20 | 21 | 24 | 25 | 26 | 28 | 29 | 30 | 31 => return self.ps_arith(ins),
            23 => return self.ps_sel(ins),
            _ => (),
        }

        match ins.subop10() {
            0 => self.ps_cmp(ins, 0, false),
            32 => self.ps_cmp(ins, 0, true),
            64 => self.ps_cmp(ins, 1, false),
            96 => self.ps_cmp(ins, 1, true),
            40 | 72 | 136 | 264 => self.ps_move(ins),
            528 | 560 | 592 | 624 => self.ps_merge(ins),
            1014 => self.dcbz(ins),
            _ => self.illegal(ins),
        }
    }

    fn exec_table19(&mut self, ins: Ins) -> Outcome {
        match ins.subop10() {
            0 => self.mcrf(ins),
            16 => self.bclr(ins),
            33 | 129 | 193 | 225 | 257 | 289 | 417 | 449 => self.cr_logic(ins),
            50 => self.rfi(ins),
            150 => Outcome::Continue,
            528 => self.bcctr(ins),
            _ => self.illegal(ins),
        }
    }

    fn exec_table31(&mut self, ins: Ins) -> Outcome {
        match ins.subop10() {
            0 => self.cmp(ins),
            32 => self.cmpl(ins),
            4 => self.tw(ins),

            // XO-form, with and without OE
            8 | 520 | 10 | 522 | 40 | 552 | 104 | 616 | 136 | 648 | 138 | 650 | 200 | 712
            | 202 | 714 | 232 | 744 | 234 | 746 | 266 | 778 => self.add_family(ins),
            235 | 747 => self.mullw(ins),
            11 => self.mulhwu(ins),
            75 => self.mulhw(ins),
            459 | 971 => self.divwu(ins),
            491 | 1003 => self.divw(ins),

            28 | 60 | 124 | 284 | 316 | 412 | 444 | 476 => self.logic(ins),
            26 => self.cntlzw(ins),
            922 => self.extsh(ins),
            954 => self.extsb(ins),
            24 => self.slw(ins),
            536 => self.srw(ins),
            792 => self.sraw(ins),
            824 => self.srawi(ins),

            19 => self.mfcr(ins),
            144 => self.mtcrf(ins),
            512 => self.mcrxr(ins),
            83 => self.mfmsr(ins),
            146 => self.mtmsr(ins),
            339 => self.mfspr(ins),
            467 => self.mtspr(ins),

            20 | 23 => self.load_idx::<u32>(ins, false),
            55 => self.load_idx::<u32>(ins, true),
            87 => self.load_idx::<u8>(ins, false),
            119 => self.load_idx::<u8>(ins, true),
            279 => self.load_idx::<u16>(ins, false),
            311 => self.load_idx::<u16>(ins, true),
            343 => self.load_idx::<i16>(ins, false),
            375 => self.load_idx::<i16>(ins, true),
            151 => self.store_idx::<u32>(ins, false),
            183 => self.store_idx::<u32>(ins, true),
            215 => self.store_idx::<u8>(ins, false),
            247 => self.store_idx::<u8>(ins, true),
            407 => self.store_idx::<u16>(ins, false),
            439 => self.store_idx::<u16>(ins, true),
            150 => self.stwcx(ins),
            534 => self.lwbrx(ins),
            790 => self.lhbrx(ins),
            662 => self.stwbrx(ins),
            918 => self.sthbrx(ins),

            535 => self.lfsx(ins, false),
            567 => self.lfsx(ins, true),
            599 => self.lfdx(ins, false),
            631 => self.lfdx(ins, true),
            663 => self.stfsx(ins, false),
            695 => self.stfsx(ins, true),
            727 => self.stfdx(ins, false),
            759 => self.stfdx(ins, true),
            983 => self.stfiwx(ins),

            // cache management, synchronization and TLB
            54 | 86 | 246 | 278 | 470 | 598 | 854 | 982 | 306 | 566 => Outcome::Continue,
            1014 => self.dcbz(ins),

            _ => self.illegal(ins),
        }
    }

    fn exec_table59(&mut self, ins: Ins) -> Outcome {
        match ins.subop5() {
            18 | 20 | 21 | 24 | 25 | 28 | 29 | 30 | 31 => self.float_arith(ins, true),
            _ => self.illegal(ins),
        }
    }

    fn exec_table63(&mut self, ins: Ins) -> Outcome {
        if ins.subop5() >= 16 {
            return match ins.subop5() {
                18 | 20 | 21 | 25 | 26 | 28 | 29 | 30 | 31 => self.float_arith(ins, false),
                23 => self.fsel(ins),
                _ => self.illegal(ins),
            };
        }

        match ins.subop10() {
            0 => self.fcmp(ins, false),
            32 => self.fcmp(ins, true),
            12 => self.frsp(ins),
            14 => self.fctiw(ins, false),
            15 => self.fctiw(ins, true),
            40 | 72 | 136 | 264 => self.float_move(ins),
            38 => self.mtfsb(ins, true),
            70 => self.mtfsb(ins, false),
            64 => self.mcrfs(ins),
            134 => self.mtfsfi(ins),
            583 => self.mffs(ins),
            711 => self.mtfsf(ins),
            _ => self.illegal(ins),
        }
    }

    /// Raises a program exception for an instruction the interpreter does not know.
    fn illegal(&mut self, ins: Ins) -> Outcome {
        tracing::debug!("illegal instruction {:08X} at {}", ins.code, self.cpu.pc);
        self.cpu.raise_program(ProgramReason::Illegal);
        Outcome::Exception
    }

    #[inline(always)]
    fn gpr(&self, gpr: GPR) -> u32 {
        self.cpu.user.gpr[gpr.index()]
    }

    #[inline(always)]
    fn set_gpr(&mut self, gpr: GPR, value: u32) {
        self.cpu.user.gpr[gpr.index()] = value;
    }

    /// Value of rA, or zero if rA is r0.
    #[inline(always)]
    fn gpr_or_zero(&self, gpr: GPR) -> u32 {
        if gpr == GPR::R0 { 0 } else { self.gpr(gpr) }
    }

    #[inline(always)]
    fn fpr(&self, fpr: FPR) -> [f64; 2] {
        self.cpu.user.fpr[fpr.index()].0
    }

    #[inline(always)]
    fn set_fpr(&mut self, fpr: FPR, value: [f64; 2]) {
        self.cpu.user.fpr[fpr.index()].0 = value;
    }

    #[inline(always)]
    fn set_ps0(&mut self, fpr: FPR, value: f64) {
        self.cpu.user.fpr[fpr.index()].0[0] = value;
    }

    /// Raises a floating point unavailable exception if MSR[FP] is clear.
    fn check_fpu(&mut self) -> bool {
        if self.cpu.supervisor.msr.float_available() {
            true
        } else {
            self.cpu.raise_exception(Exception::FloatUnavailable);
            false
        }
    }

    /// Raises a privileged program exception if running in user mode.
    fn check_supervisor(&mut self) -> bool {
        if self.cpu.supervisor.msr.user_mode() {
            self.cpu.raise_program(ProgramReason::Privileged);
            false
        } else {
            true
        }
    }

    /// Reads from memory, raising a DSI on failure.
    fn read<P: gekko::Primitive>(&mut self, addr: Address) -> Option<P> {
        let value = self.mem.read::<P>(addr);
        if value.is_none() {
            tracing::debug!("failed to read from {addr}");
            self.cpu.raise_dsi(addr, false);
        }

        value
    }

    /// Writes to memory, raising a DSI on failure.
    fn write<P: gekko::Primitive>(&mut self, addr: Address, value: P) -> bool {
        let success = self.mem.write::<P>(addr, value);
        if !success {
            tracing::debug!("failed to write to {addr}");
            self.cpu.raise_dsi(addr, true);
        }

        success
    }
}
