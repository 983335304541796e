use cranelift::codegen::ir;
use cranelift::prelude::{InstBuilder, IntCC};
use gekko::disasm::Ins;
use gekko::{GPR, InsExt, SPR};

use super::BlockBuilder;
use crate::builder::{Action, InstructionInfo};

const INTEGER_INFO: InstructionInfo = InstructionInfo {
    cycles: 1,
    action: Action::Continue,
};

impl BlockBuilder<'_> {
    /// Value of `gpr`, or zero if it is r0.
    pub fn gpr_or_zero(&mut self, gpr: GPR) -> ir::Value {
        if gpr == GPR::R0 {
            self.ir_value(0u32)
        } else {
            self.get(gpr)
        }
    }

    pub fn addi(&mut self, ins: Ins) -> InstructionInfo {
        let base = self.gpr_or_zero(ins.gpr_a());
        let value = self.bd.ins().iadd_imm(base, ins.simm() as i64);
        self.set(ins.gpr_d(), value);

        INTEGER_INFO
    }

    pub fn addis(&mut self, ins: Ins) -> InstructionInfo {
        let base = self.gpr_or_zero(ins.gpr_a());
        let imm = self.ir_value((ins.uimm() as u32) << 16);
        let value = self.bd.ins().iadd(base, imm);
        self.set(ins.gpr_d(), value);

        INTEGER_INFO
    }

    pub fn ori(&mut self, ins: Ins) -> InstructionInfo {
        let rs = self.get(ins.gpr_s());
        let value = self.bd.ins().bor_imm(rs, ins.uimm() as i64);
        self.set(ins.gpr_a(), value);

        INTEGER_INFO
    }

    pub fn oris(&mut self, ins: Ins) -> InstructionInfo {
        let rs = self.get(ins.gpr_s());
        let imm = self.ir_value((ins.uimm() as u32) << 16);
        let value = self.bd.ins().bor(rs, imm);
        self.set(ins.gpr_a(), value);

        INTEGER_INFO
    }

    /// Compares `a` and `b` into field crfD, copying XER[SO].
    fn compare(&mut self, ins: Ins, a: ir::Value, b: ir::Value, signed: bool) -> InstructionInfo {
        let (lt, gt) = if signed {
            (IntCC::SignedLessThan, IntCC::SignedGreaterThan)
        } else {
            (IntCC::UnsignedLessThan, IntCC::UnsignedGreaterThan)
        };

        let lt = self.bd.ins().icmp(lt, a, b);
        let gt = self.bd.ins().icmp(gt, a, b);
        let eq = self.bd.ins().icmp(IntCC::Equal, a, b);

        let xer = self.get(SPR::XER);
        let so = self.get_bit(xer, 31);

        self.update_cr(ins.crf_d(), lt, gt, eq, so);

        INTEGER_INFO
    }

    pub fn cmp(&mut self, ins: Ins) -> InstructionInfo {
        let a = self.get(ins.gpr_a());
        let b = self.get(ins.gpr_b());
        self.compare(ins, a, b, true)
    }

    pub fn cmpl(&mut self, ins: Ins) -> InstructionInfo {
        let a = self.get(ins.gpr_a());
        let b = self.get(ins.gpr_b());
        self.compare(ins, a, b, false)
    }

    pub fn cmpi(&mut self, ins: Ins) -> InstructionInfo {
        let a = self.get(ins.gpr_a());
        let b = self.ir_value(ins.simm() as i32 as u32);
        self.compare(ins, a, b, true)
    }

    pub fn cmpli(&mut self, ins: Ins) -> InstructionInfo {
        let a = self.get(ins.gpr_a());
        let b = self.ir_value(ins.uimm() as u32);
        self.compare(ins, a, b, false)
    }
}
