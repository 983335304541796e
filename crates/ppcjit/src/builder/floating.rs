use cranelift::codegen::ir;
use cranelift::prelude::{FloatCC, InstBuilder};
use gekko::disasm::Ins;
use gekko::fpu::{ArithKind, FpOp};
use gekko::{InsExt, Reg};

use super::{BlockBuilder, MEMFLAGS};
use crate::builder::{Action, InstructionInfo};
use crate::helpers::Internal;

const FLOAT_INFO: InstructionInfo = InstructionInfo {
    cycles: 2,
    action: Action::Continue,
};

const FPSCR_INFO: InstructionInfo = InstructionInfo {
    cycles: 3,
    action: Action::Continue,
};

impl BlockBuilder<'_> {
    /// Updates CR1 from the FPSCR summary bits if the instruction has Rc set.
    pub fn record_float(&mut self, ins: Ins) {
        if ins.rc() {
            let nibble = self.call_internal_value(Internal::FpuRecord, &[self.consts.regs_ptr]);
            self.set_cr_field(1, nibble);
        }
    }

    /// Computes one lane of an arithmetic operation, updating the FPSCR.
    pub fn fpu_arith(
        &mut self,
        kind: ArithKind,
        a: ir::Value,
        b: ir::Value,
        c: ir::Value,
    ) -> ir::Value {
        let kind = self.ir_value(kind.to_bits());
        self.call_internal_value(Internal::FpuArith, &[self.consts.regs_ptr, kind, a, b, c])
    }

    /// Compares two values, updating the FPSCR, and returns the condition nibble (an I8).
    pub fn fpu_compare(&mut self, a: ir::Value, b: ir::Value, ordered: bool) -> ir::Value {
        let ordered = self.ir_value(ordered);
        self.call_internal_value(Internal::FpuCompare, &[self.consts.regs_ptr, a, b, ordered])
    }

    /// Applies the sign operation of fneg (40), fnabs (136), fabs (264) or fmr to `value`.
    pub fn sign_op(&mut self, subop: u16, value: ir::Value) -> ir::Value {
        match subop {
            40 => self.bd.ins().fneg(value),
            136 => {
                let abs = self.bd.ins().fabs(value);
                self.bd.ins().fneg(abs)
            }
            264 => self.bd.ins().fabs(value),
            _ => value,
        }
    }

    /// Double precision arithmetic (table 63) writes ps0, single precision arithmetic (table
    /// 59) writes the result into both lanes.
    pub fn float_arith(&mut self, ins: Ins) -> InstructionInfo {
        let Some(op) = FpOp::from_extended(ins.subop5()) else {
            return self.fallback(ins);
        };

        self.check_floats();

        let single = ins.primary() == 59;
        let kind = ArithKind {
            op,
            single,
            fprf: true,
        };

        let a = self.get_lane(ins.fpr_a(), 0);
        let b = self.get_lane(ins.fpr_b(), 0);
        let c = self.get_lane(ins.fpr_c(), 0);
        let result = self.fpu_arith(kind, a, b, c);

        if single {
            self.set_pair(ins.fpr_d(), [result, result]);
        } else {
            self.set_lane(ins.fpr_d(), 0, result);
        }

        self.record_float(ins);
        FLOAT_INFO
    }

    pub fn fsel(&mut self, ins: Ins) -> InstructionInfo {
        self.check_floats();

        let a = self.get_lane(ins.fpr_a(), 0);
        let b = self.get_lane(ins.fpr_b(), 0);
        let c = self.get_lane(ins.fpr_c(), 0);

        let zero = self.ir_value(0.0f64);
        let ge = self.bd.ins().fcmp(FloatCC::GreaterThanOrEqual, a, zero);
        let result = self.bd.ins().select(ge, c, b);

        self.set_lane(ins.fpr_d(), 0, result);
        self.record_float(ins);
        FLOAT_INFO
    }

    /// fneg, fmr, fnabs and fabs: sign manipulation of ps0 without touching the FPSCR.
    pub fn float_move(&mut self, ins: Ins) -> InstructionInfo {
        self.check_floats();

        let b = self.get_lane(ins.fpr_b(), 0);
        let result = self.sign_op(ins.subop10(), b);

        self.set_lane(ins.fpr_d(), 0, result);
        self.record_float(ins);
        FLOAT_INFO
    }

    pub fn frsp(&mut self, ins: Ins) -> InstructionInfo {
        self.check_floats();

        let b = self.get_lane(ins.fpr_b(), 0);
        let result =
            self.call_internal_value(Internal::FpuRoundSingle, &[self.consts.regs_ptr, b]);

        self.set_pair(ins.fpr_d(), [result, result]);
        self.record_float(ins);
        FLOAT_INFO
    }

    fn convert_to_int(&mut self, ins: Ins, towards_zero: bool) -> InstructionInfo {
        self.check_floats();

        let b = self.get_lane(ins.fpr_b(), 0);
        let towards_zero = self.ir_value(towards_zero);
        let bits = self.call_internal_value(
            Internal::FpuConvert,
            &[self.consts.regs_ptr, b, towards_zero],
        );
        let result = self
            .bd
            .ins()
            .bitcast(ir::types::F64, ir::MemFlags::new(), bits);

        self.set_lane(ins.fpr_d(), 0, result);
        self.record_float(ins);
        FLOAT_INFO
    }

    pub fn fctiw(&mut self, ins: Ins) -> InstructionInfo {
        self.convert_to_int(ins, false)
    }

    pub fn fctiwz(&mut self, ins: Ins) -> InstructionInfo {
        self.convert_to_int(ins, true)
    }

    fn fcmp(&mut self, ins: Ins, ordered: bool) -> InstructionInfo {
        self.check_floats();

        let a = self.get_lane(ins.fpr_a(), 0);
        let b = self.get_lane(ins.fpr_b(), 0);
        let nibble = self.fpu_compare(a, b, ordered);

        self.set_cr_field(ins.crf_d(), nibble);
        FLOAT_INFO
    }

    pub fn fcmpu(&mut self, ins: Ins) -> InstructionInfo {
        self.fcmp(ins, false)
    }

    pub fn fcmpo(&mut self, ins: Ins) -> InstructionInfo {
        self.fcmp(ins, true)
    }

    pub fn mffs(&mut self, ins: Ins) -> InstructionInfo {
        self.check_floats();

        // FPSCR isn't cached: helpers update it behind the block's back
        let fpscr = self.bd.ins().load(
            ir::types::I32,
            MEMFLAGS,
            self.consts.regs_ptr,
            Reg::FPSCR.offset() as i32,
        );
        let fpscr = self.bd.ins().uextend(ir::types::I64, fpscr);
        let bits = self.bd.ins().bor_imm(fpscr, 0xFFF8_0000_0000_0000u64 as i64);
        let result = self
            .bd
            .ins()
            .bitcast(ir::types::F64, ir::MemFlags::new(), bits);

        self.set_lane(ins.fpr_d(), 0, result);
        self.record_float(ins);
        FPSCR_INFO
    }

    pub fn mtfsf(&mut self, ins: Ins) -> InstructionInfo {
        self.check_floats();

        let b = self.get_lane(ins.fpr_b(), 0);
        let bits = self
            .bd
            .ins()
            .bitcast(ir::types::I64, ir::MemFlags::new(), b);
        let value = self.bd.ins().ireduce(ir::types::I32, bits);
        let mask = self.ir_value(ins.fm());

        self.call_internal(Internal::Mtfsf, &[self.consts.regs_ptr, mask, value]);
        self.record_float(ins);
        FPSCR_INFO
    }

    pub fn mtfsfi(&mut self, ins: Ins) -> InstructionInfo {
        self.check_floats();

        let field = self.ir_value(ins.crf_d());
        let imm = self.ir_value(ins.fpscr_imm());

        self.call_internal(Internal::Mtfsfi, &[self.consts.regs_ptr, field, imm]);
        self.record_float(ins);
        FPSCR_INFO
    }

    fn mtfsb(&mut self, ins: Ins, set: bool) -> InstructionInfo {
        self.check_floats();

        let bit = self.ir_value(ins.crb_d());
        let set = self.ir_value(set);

        self.call_internal(Internal::Mtfsb, &[self.consts.regs_ptr, bit, set]);
        self.record_float(ins);
        FPSCR_INFO
    }

    pub fn mtfsb0(&mut self, ins: Ins) -> InstructionInfo {
        self.mtfsb(ins, false)
    }

    pub fn mtfsb1(&mut self, ins: Ins) -> InstructionInfo {
        self.mtfsb(ins, true)
    }

    pub fn mcrfs(&mut self, ins: Ins) -> InstructionInfo {
        self.check_floats();

        let field = self.ir_value(ins.crf_s());
        let nibble = self.call_internal_value(Internal::Mcrfs, &[self.consts.regs_ptr, field]);

        self.set_cr_field(ins.crf_d(), nibble);
        FPSCR_INFO
    }
}
