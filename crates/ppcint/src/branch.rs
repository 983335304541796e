use gekko::disasm::Ins;
use gekko::{Address, Exception, InsExt, Memory};

use crate::{Interpreter, Outcome};

impl<M: Memory> Interpreter<'_, M> {
    /// Evaluates the branch condition given by BO and BI, decrementing CTR if requested.
    fn branch_condition(&mut self, bo: u8, bi: u8) -> bool {
        if bo & 0b00100 == 0 {
            self.cpu.user.ctr = self.cpu.user.ctr.wrapping_sub(1);
        }

        let ctr_ok = bo & 0b00100 != 0 || ((self.cpu.user.ctr != 0) ^ (bo & 0b00010 != 0));
        let cond_ok = bo & 0b10000 != 0 || (self.cpu.user.cr.bit(bi) == (bo & 0b01000 != 0));

        ctr_ok && cond_ok
    }

    fn branch_to(&mut self, ins: Ins, target: u32, taken: bool) -> Outcome {
        if ins.lk() {
            self.cpu.user.lr = self.cpu.pc.value().wrapping_add(4);
        }

        if taken {
            self.cpu.pc = Address(target);
            Outcome::Branch
        } else {
            Outcome::Continue
        }
    }

    pub(crate) fn b(&mut self, ins: Ins) -> Outcome {
        let offset = ins.branch_offset();
        let target = if ins.aa() {
            offset as u32
        } else {
            self.cpu.pc.value().wrapping_add_signed(offset)
        };

        self.branch_to(ins, target, true)
    }

    pub(crate) fn bc(&mut self, ins: Ins) -> Outcome {
        let taken = self.branch_condition(ins.bo(), ins.bi());
        let offset = ins.cond_offset();
        let target = if ins.aa() {
            offset as u32
        } else {
            self.cpu.pc.value().wrapping_add_signed(offset)
        };

        self.branch_to(ins, target, taken)
    }

    pub(crate) fn bclr(&mut self, ins: Ins) -> Outcome {
        let target = self.cpu.user.lr & !0b11;
        let taken = self.branch_condition(ins.bo(), ins.bi());
        self.branch_to(ins, target, taken)
    }

    pub(crate) fn bcctr(&mut self, ins: Ins) -> Outcome {
        let target = self.cpu.user.ctr & !0b11;
        // bcctr never decrements CTR
        let taken = self.branch_condition(ins.bo() | 0b00100, ins.bi());
        self.branch_to(ins, target, taken)
    }

    pub(crate) fn sc(&mut self, _: Ins) -> Outcome {
        self.cpu.raise_exception(Exception::Syscall);
        Outcome::Exception
    }

    pub(crate) fn rfi(&mut self, _: Ins) -> Outcome {
        if !self.check_supervisor() {
            return Outcome::Exception;
        }

        let mask = Exception::SRR1_TO_MSR_MASK;
        let msr = self.cpu.supervisor.msr.to_bits();
        let restored = (msr & !mask) | (self.cpu.supervisor.srr[1] & mask);

        self.cpu.supervisor.msr = gekko::MachineState::from_bits(restored);
        self.cpu.pc = Address(self.cpu.supervisor.srr[0] & !0b11);

        Outcome::Branch
    }
}
