use gekko::disasm::Ins;
use gekko::fpu::{ArithKind, FpOp};
use gekko::{Cond, InsExt, Memory};

use crate::float::arith_op;
use crate::{Interpreter, Outcome};

impl<M: Memory> Interpreter<'_, M> {
    /// Executes two lanes of an operation, ps0 first.
    fn lanes(&mut self, kinds: [ArithKind; 2], operands: [[f64; 3]; 2]) -> [f64; 2] {
        let fpscr = &mut self.cpu.user.fpscr;
        let [a0, b0, c0] = operands[0];
        let [a1, b1, c1] = operands[1];

        let ps0 = fpscr.arith(kinds[0], a0, b0, c0);
        let ps1 = fpscr.arith(kinds[1], a1, b1, c1);

        [ps0, ps1]
    }

    pub(crate) fn ps_arith(&mut self, ins: Ins) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let [a0, a1] = self.fpr(ins.fpr_a());
        let [b0, b1] = self.fpr(ins.fpr_b());
        let [c0, c1] = self.fpr(ins.fpr_c());

        let kinds = ArithKind::paired(arith_op(ins.subop5()));
        let result = self.lanes(kinds, [[a0, b0, c0], [a1, b1, c1]]);

        self.set_fpr(ins.fpr_d(), result);
        self.record_float(ins);
        Outcome::Continue
    }

    /// ps_muls0/ps_muls1: both lanes are multiplied by lane `lane` of frC.
    pub(crate) fn ps_muls(&mut self, ins: Ins, lane: usize) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let [a0, a1] = self.fpr(ins.fpr_a());
        let c = self.fpr(ins.fpr_c())[lane];

        let kinds = ArithKind::paired(FpOp::Mul);
        let result = self.lanes(kinds, [[a0, 0.0, c], [a1, 0.0, c]]);

        self.set_fpr(ins.fpr_d(), result);
        self.record_float(ins);
        Outcome::Continue
    }

    /// ps_madds0/ps_madds1: both lanes are multiplied by lane `lane` of frC.
    pub(crate) fn ps_madds(&mut self, ins: Ins, lane: usize) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let [a0, a1] = self.fpr(ins.fpr_a());
        let [b0, b1] = self.fpr(ins.fpr_b());
        let c = self.fpr(ins.fpr_c())[lane];

        let kinds = ArithKind::paired(FpOp::MulAdd);
        let result = self.lanes(kinds, [[a0, b0, c], [a1, b1, c]]);

        self.set_fpr(ins.fpr_d(), result);
        self.record_float(ins);
        Outcome::Continue
    }

    /// ps_sum0/ps_sum1: lane `lane` receives `a.ps0 + b.ps1`, the other lane is copied from frC.
    pub(crate) fn ps_sum(&mut self, ins: Ins, lane: usize) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let a = self.fpr(ins.fpr_a())[0];
        let b = self.fpr(ins.fpr_b())[1];
        let c = self.fpr(ins.fpr_c());

        let kind = ArithKind::paired(FpOp::Add)[0];
        let sum = self.cpu.user.fpscr.arith(kind, a, b, 0.0);

        let mut result = c;
        result[lane] = sum;

        self.set_fpr(ins.fpr_d(), result);
        self.record_float(ins);
        Outcome::Continue
    }

    pub(crate) fn ps_sel(&mut self, ins: Ins) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let a = self.fpr(ins.fpr_a());
        let b = self.fpr(ins.fpr_b());
        let c = self.fpr(ins.fpr_c());

        let result = [0, 1].map(|lane| if a[lane] >= 0.0 { c[lane] } else { b[lane] });

        self.set_fpr(ins.fpr_d(), result);
        self.record_float(ins);
        Outcome::Continue
    }

    /// ps_neg, ps_mr, ps_nabs and ps_abs.
    pub(crate) fn ps_move(&mut self, ins: Ins) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        const SIGN: u64 = 1 << 63;
        let subop = ins.subop10();
        let result = self.fpr(ins.fpr_b()).map(|value| {
            let bits = value.to_bits();
            let bits = match subop {
                40 => bits ^ SIGN,
                136 => bits | SIGN,
                264 => bits & !SIGN,
                _ => bits,
            };

            f64::from_bits(bits)
        });

        self.set_fpr(ins.fpr_d(), result);
        self.record_float(ins);
        Outcome::Continue
    }

    /// ps_merge00, ps_merge01, ps_merge10 and ps_merge11.
    pub(crate) fn ps_merge(&mut self, ins: Ins) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let (lane_a, lane_b) = match ins.subop10() {
            528 => (0, 0),
            560 => (0, 1),
            592 => (1, 0),
            _ => (1, 1),
        };

        let a = self.fpr(ins.fpr_a())[lane_a];
        let b = self.fpr(ins.fpr_b())[lane_b];

        self.set_fpr(ins.fpr_d(), [a, b]);
        self.record_float(ins);
        Outcome::Continue
    }

    /// ps_cmpu0, ps_cmpo0, ps_cmpu1 and ps_cmpo1.
    pub(crate) fn ps_cmp(&mut self, ins: Ins, lane: usize, ordered: bool) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let a = self.fpr(ins.fpr_a())[lane];
        let b = self.fpr(ins.fpr_b())[lane];
        let cond = self.cpu.user.fpscr.compare(a, b, ordered);

        self.cpu
            .user
            .cr
            .set_field(ins.crf_d() as usize, Cond::from_nibble(cond as u8));

        Outcome::Continue
    }
}
