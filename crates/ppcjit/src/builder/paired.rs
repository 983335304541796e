use cranelift::prelude::{FloatCC, InstBuilder};
use gekko::InsExt;
use gekko::disasm::Ins;
use gekko::fpu::{ArithKind, FpOp};

use super::BlockBuilder;
use crate::builder::{Action, InstructionInfo};

const PAIRED_INFO: InstructionInfo = InstructionInfo {
    cycles: 2,
    action: Action::Continue,
};

impl BlockBuilder<'_> {
    pub fn ps_arith(&mut self, ins: Ins) -> InstructionInfo {
        let Some(op) = FpOp::from_extended(ins.subop5()) else {
            return self.fallback(ins);
        };

        self.check_floats();

        let [a0, a1] = self.get_pair(ins.fpr_a());
        let [b0, b1] = self.get_pair(ins.fpr_b());
        let [c0, c1] = self.get_pair(ins.fpr_c());

        let [k0, k1] = ArithKind::paired(op);
        let ps0 = self.fpu_arith(k0, a0, b0, c0);
        let ps1 = self.fpu_arith(k1, a1, b1, c1);

        self.set_pair(ins.fpr_d(), [ps0, ps1]);
        self.record_float(ins);
        PAIRED_INFO
    }

    /// ps_muls0/ps_muls1: both lanes are multiplied by lane `lane` of frC.
    fn ps_muls(&mut self, ins: Ins, lane: usize) -> InstructionInfo {
        self.check_floats();

        let [a0, a1] = self.get_pair(ins.fpr_a());
        let c = self.get_lane(ins.fpr_c(), lane);
        let zero = self.ir_value(0.0f64);

        let [k0, k1] = ArithKind::paired(FpOp::Mul);
        let ps0 = self.fpu_arith(k0, a0, zero, c);
        let ps1 = self.fpu_arith(k1, a1, zero, c);

        self.set_pair(ins.fpr_d(), [ps0, ps1]);
        self.record_float(ins);
        PAIRED_INFO
    }

    pub fn ps_muls0(&mut self, ins: Ins) -> InstructionInfo {
        self.ps_muls(ins, 0)
    }

    pub fn ps_muls1(&mut self, ins: Ins) -> InstructionInfo {
        self.ps_muls(ins, 1)
    }

    /// ps_madds0/ps_madds1: both lanes are multiplied by lane `lane` of frC.
    fn ps_madds(&mut self, ins: Ins, lane: usize) -> InstructionInfo {
        self.check_floats();

        let [a0, a1] = self.get_pair(ins.fpr_a());
        let [b0, b1] = self.get_pair(ins.fpr_b());
        let c = self.get_lane(ins.fpr_c(), lane);

        let [k0, k1] = ArithKind::paired(FpOp::MulAdd);
        let ps0 = self.fpu_arith(k0, a0, b0, c);
        let ps1 = self.fpu_arith(k1, a1, b1, c);

        self.set_pair(ins.fpr_d(), [ps0, ps1]);
        self.record_float(ins);
        PAIRED_INFO
    }

    pub fn ps_madds0(&mut self, ins: Ins) -> InstructionInfo {
        self.ps_madds(ins, 0)
    }

    pub fn ps_madds1(&mut self, ins: Ins) -> InstructionInfo {
        self.ps_madds(ins, 1)
    }

    /// ps_sum0/ps_sum1: lane `lane` receives `a.ps0 + b.ps1`, the other lane is copied from frC.
    fn ps_sum(&mut self, ins: Ins, lane: usize) -> InstructionInfo {
        self.check_floats();

        let a = self.get_lane(ins.fpr_a(), 0);
        let b = self.get_lane(ins.fpr_b(), 1);
        let mut result = self.get_pair(ins.fpr_c());
        let zero = self.ir_value(0.0f64);

        let [kind, _] = ArithKind::paired(FpOp::Add);
        result[lane] = self.fpu_arith(kind, a, b, zero);

        self.set_pair(ins.fpr_d(), result);
        self.record_float(ins);
        PAIRED_INFO
    }

    pub fn ps_sum0(&mut self, ins: Ins) -> InstructionInfo {
        self.ps_sum(ins, 0)
    }

    pub fn ps_sum1(&mut self, ins: Ins) -> InstructionInfo {
        self.ps_sum(ins, 1)
    }

    pub fn ps_sel(&mut self, ins: Ins) -> InstructionInfo {
        self.check_floats();

        let a = self.get_pair(ins.fpr_a());
        let b = self.get_pair(ins.fpr_b());
        let c = self.get_pair(ins.fpr_c());
        let zero = self.ir_value(0.0f64);

        let mut result = c;
        for lane in 0..2 {
            let ge = self
                .bd
                .ins()
                .fcmp(FloatCC::GreaterThanOrEqual, a[lane], zero);
            result[lane] = self.bd.ins().select(ge, c[lane], b[lane]);
        }

        self.set_pair(ins.fpr_d(), result);
        self.record_float(ins);
        PAIRED_INFO
    }

    /// ps_neg, ps_mr, ps_nabs and ps_abs.
    pub fn ps_move(&mut self, ins: Ins) -> InstructionInfo {
        self.check_floats();

        let [b0, b1] = self.get_pair(ins.fpr_b());
        let subop = ins.subop10();
        let ps0 = self.sign_op(subop, b0);
        let ps1 = self.sign_op(subop, b1);

        self.set_pair(ins.fpr_d(), [ps0, ps1]);
        self.record_float(ins);
        PAIRED_INFO
    }

    /// ps_merge00, ps_merge01, ps_merge10 and ps_merge11.
    pub fn ps_merge(&mut self, ins: Ins) -> InstructionInfo {
        self.check_floats();

        let (lane_a, lane_b) = match ins.subop10() {
            528 => (0, 0),
            560 => (0, 1),
            592 => (1, 0),
            _ => (1, 1),
        };

        let a = self.get_lane(ins.fpr_a(), lane_a);
        let b = self.get_lane(ins.fpr_b(), lane_b);

        self.set_pair(ins.fpr_d(), [a, b]);
        self.record_float(ins);
        PAIRED_INFO
    }

    fn ps_cmp(&mut self, ins: Ins, lane: usize, ordered: bool) -> InstructionInfo {
        self.check_floats();

        let a = self.get_lane(ins.fpr_a(), lane);
        let b = self.get_lane(ins.fpr_b(), lane);
        let nibble = self.fpu_compare(a, b, ordered);

        self.set_cr_field(ins.crf_d(), nibble);
        PAIRED_INFO
    }

    pub fn ps_cmpu0(&mut self, ins: Ins) -> InstructionInfo {
        self.ps_cmp(ins, 0, false)
    }

    pub fn ps_cmpo0(&mut self, ins: Ins) -> InstructionInfo {
        self.ps_cmp(ins, 0, true)
    }

    pub fn ps_cmpu1(&mut self, ins: Ins) -> InstructionInfo {
        self.ps_cmp(ins, 1, false)
    }

    pub fn ps_cmpo1(&mut self, ins: Ins) -> InstructionInfo {
        self.ps_cmp(ins, 1, true)
    }
}
