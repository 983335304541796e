use gekko::disasm::Ins;
use gekko::fpu::{self, ArithKind, FpOp};
use gekko::{Cond, FloatRounding, InsExt, Memory};

use crate::{Interpreter, Outcome};

/// Operation of an A-form arithmetic instruction of tables 4, 59 and 63. Callers only dispatch
/// valid extended opcodes here.
pub(crate) fn arith_op(subop5: u8) -> FpOp {
    FpOp::from_extended(subop5).unwrap_or(FpOp::NegMulAdd)
}

impl<M: Memory> Interpreter<'_, M> {
    /// Updates CR1 if the instruction has Rc set.
    pub(crate) fn record_float(&mut self, ins: Ins) {
        if ins.rc() {
            fpu::update_record_bits(&mut self.cpu.user.cr, &self.cpu.user.fpscr);
        }
    }

    /// Double precision arithmetic writes ps0, single precision arithmetic writes both lanes.
    pub(crate) fn float_arith(&mut self, ins: Ins, single: bool) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let kind = ArithKind {
            op: arith_op(ins.subop5()),
            single,
            fprf: true,
        };

        let a = self.fpr(ins.fpr_a())[0];
        let b = self.fpr(ins.fpr_b())[0];
        let c = self.fpr(ins.fpr_c())[0];
        let result = self.cpu.user.fpscr.arith(kind, a, b, c);

        if single {
            self.set_fpr(ins.fpr_d(), [result, result]);
        } else {
            self.set_ps0(ins.fpr_d(), result);
        }

        self.record_float(ins);
        Outcome::Continue
    }

    pub(crate) fn fsel(&mut self, ins: Ins) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let a = self.fpr(ins.fpr_a())[0];
        let result = if a >= 0.0 {
            self.fpr(ins.fpr_c())[0]
        } else {
            self.fpr(ins.fpr_b())[0]
        };

        self.set_ps0(ins.fpr_d(), result);
        self.record_float(ins);
        Outcome::Continue
    }

    /// fneg, fmr, fnabs and fabs: sign manipulation of ps0 without touching the FPSCR.
    pub(crate) fn float_move(&mut self, ins: Ins) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        const SIGN: u64 = 1 << 63;
        let bits = self.fpr(ins.fpr_b())[0].to_bits();
        let result = match ins.subop10() {
            40 => bits ^ SIGN,
            136 => bits | SIGN,
            264 => bits & !SIGN,
            _ => bits,
        };

        self.set_ps0(ins.fpr_d(), f64::from_bits(result));
        self.record_float(ins);
        Outcome::Continue
    }

    pub(crate) fn frsp(&mut self, ins: Ins) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let b = self.fpr(ins.fpr_b())[0];
        let result = self.cpu.user.fpscr.round_to_single(b);

        self.set_fpr(ins.fpr_d(), [result, result]);
        self.record_float(ins);
        Outcome::Continue
    }

    pub(crate) fn fctiw(&mut self, ins: Ins, towards_zero: bool) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let mode = if towards_zero {
            FloatRounding::TowardsZero
        } else {
            self.cpu.user.fpscr.rounding()
        };

        let b = self.fpr(ins.fpr_b())[0];
        let result = self.cpu.user.fpscr.convert_to_int(b, mode);

        self.set_ps0(ins.fpr_d(), f64::from_bits(result));
        self.record_float(ins);
        Outcome::Continue
    }

    pub(crate) fn fcmp(&mut self, ins: Ins, ordered: bool) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let a = self.fpr(ins.fpr_a())[0];
        let b = self.fpr(ins.fpr_b())[0];
        let cond = self.cpu.user.fpscr.compare(a, b, ordered);

        self.cpu
            .user
            .cr
            .set_field(ins.crf_d() as usize, Cond::from_nibble(cond as u8));

        Outcome::Continue
    }

    pub(crate) fn mffs(&mut self, ins: Ins) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let bits = 0xFFF8_0000_0000_0000 | self.cpu.user.fpscr.to_bits() as u64;
        self.set_ps0(ins.fpr_d(), f64::from_bits(bits));
        self.record_float(ins);
        Outcome::Continue
    }

    pub(crate) fn mtfsf(&mut self, ins: Ins) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let value = self.fpr(ins.fpr_b())[0].to_bits() as u32;
        self.cpu.user.fpscr.mtfsf(ins.fm(), value);
        self.record_float(ins);
        Outcome::Continue
    }

    pub(crate) fn mtfsfi(&mut self, ins: Ins) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        self.cpu.user.fpscr.mtfsfi(ins.crf_d(), ins.fpscr_imm());
        self.record_float(ins);
        Outcome::Continue
    }

    pub(crate) fn mtfsb(&mut self, ins: Ins, set: bool) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        if set {
            self.cpu.user.fpscr.mtfsb1(ins.crb_d());
        } else {
            self.cpu.user.fpscr.mtfsb0(ins.crb_d());
        }

        self.record_float(ins);
        Outcome::Continue
    }

    pub(crate) fn mcrfs(&mut self, ins: Ins) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let nibble = self.cpu.user.fpscr.mcrfs(ins.crf_s());
        self.cpu
            .user
            .cr
            .set_field(ins.crf_d() as usize, Cond::from_nibble(nibble));

        Outcome::Continue
    }
}
