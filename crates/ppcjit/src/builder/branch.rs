use cranelift::codegen::ir;
use cranelift::prelude::{InstBuilder, IntCC};
use gekko::disasm::Ins;
use gekko::{InsExt, Reg, SPR};

use super::BlockBuilder;
use crate::block::ExitReason;
use crate::builder::{Action, InstructionInfo};

const BRANCH_INFO: InstructionInfo = InstructionInfo {
    cycles: 1,
    action: Action::Finish,
};

const BRANCH_COND_INFO: InstructionInfo = InstructionInfo {
    cycles: 2,
    action: Action::Finish,
};

impl BlockBuilder<'_> {
    /// Sets LR to the address of the next instruction if the LK bit is set.
    fn link(&mut self, ins: Ins) {
        if ins.lk() {
            let next = self.pc_after(1);
            self.set(SPR::LR, next);
        }
    }

    /// Emits the BO/BI condition of a conditional branch, decrementing CTR if required. Returns
    /// `None` if the branch is always taken, otherwise a boolean (I8).
    fn branch_condition(&mut self, bo: u8, bi: u8) -> Option<ir::Value> {
        let ctr_ok = if bo & 0b00100 == 0 {
            let ctr = self.get(SPR::CTR);
            let ctr = self.bd.ins().iadd_imm(ctr, -1);
            self.set(SPR::CTR, ctr);

            let cc = if bo & 0b00010 != 0 {
                IntCC::Equal
            } else {
                IntCC::NotEqual
            };

            Some(self.bd.ins().icmp_imm(cc, ctr, 0))
        } else {
            None
        };

        let cond_ok = if bo & 0b10000 == 0 {
            let cr = self.get(Reg::CR);
            let bit = self.get_bit(cr, 31 - bi as u32);
            let expected = (bo & 0b01000 != 0) as i64;

            Some(self.bd.ins().icmp_imm(IntCC::Equal, bit, expected))
        } else {
            None
        };

        match (ctr_ok, cond_ok) {
            (Some(ctr_ok), Some(cond_ok)) => Some(self.bd.ins().band(ctr_ok, cond_ok)),
            (ctr_ok, cond_ok) => ctr_ok.or(cond_ok),
        }
    }

    /// Leaves the block towards `target` if `taken`, otherwise towards the next instruction.
    fn branch_exit(
        &mut self,
        taken: Option<ir::Value>,
        target: ir::Value,
        info: InstructionInfo,
    ) -> InstructionInfo {
        match taken {
            None => self.exit(ExitReason::Branch, Some(target), info),
            Some(taken) => {
                let taken_bb = self.bd.create_block();
                let not_taken_bb = self.bd.create_block();

                self.bd
                    .ins()
                    .brif(taken, taken_bb, &[], not_taken_bb, &[]);

                self.bd.seal_block(taken_bb);
                self.bd.seal_block(not_taken_bb);

                self.switch_to_bb(taken_bb);
                self.exit(ExitReason::Branch, Some(target), info);

                self.switch_to_bb(not_taken_bb);
                let next = self.pc_after(1);
                self.exit(ExitReason::FallThrough, Some(next), info);
            }
        }

        // every path has left the block
        self.ints.clear();
        self.floats.clear();

        info
    }

    pub fn b(&mut self, ins: Ins) -> InstructionInfo {
        let target = if ins.aa() {
            self.ir_value(ins.branch_offset() as u32)
        } else {
            let pc = self.current_pc();
            self.bd.ins().iadd_imm(pc, ins.branch_offset() as i64)
        };

        self.link(ins);
        self.branch_exit(None, target, BRANCH_INFO)
    }

    pub fn bc(&mut self, ins: Ins) -> InstructionInfo {
        let taken = self.branch_condition(ins.bo(), ins.bi());
        let target = if ins.aa() {
            self.ir_value(ins.cond_offset() as u32)
        } else {
            let pc = self.current_pc();
            self.bd.ins().iadd_imm(pc, ins.cond_offset() as i64)
        };

        self.link(ins);
        self.branch_exit(taken, target, BRANCH_COND_INFO)
    }

    pub fn bclr(&mut self, ins: Ins) -> InstructionInfo {
        let taken = self.branch_condition(ins.bo(), ins.bi());

        // target must be read before LR is updated
        let lr = self.get(SPR::LR);
        let target = self.bd.ins().band_imm(lr, !0b11);

        self.link(ins);
        self.branch_exit(taken, target, BRANCH_COND_INFO)
    }

    pub fn bcctr(&mut self, ins: Ins) -> InstructionInfo {
        // CTR is never decremented
        let taken = self.branch_condition(ins.bo() | 0b00100, ins.bi());

        let ctr = self.get(SPR::CTR);
        let target = self.bd.ins().band_imm(ctr, !0b11);

        self.link(ins);
        self.branch_exit(taken, target, BRANCH_COND_INFO)
    }
}
