use gekko::disasm::Ins;
use gekko::{Cond, Cpu, InsExt, MachineState, Memory, ProgramReason, QuantReg, SPR, XerReg};

use crate::{Interpreter, Outcome};

/// Reads a special purpose register.
pub fn read_spr(cpu: &Cpu, spr: SPR) -> u32 {
    let supervisor = &cpu.supervisor;
    match spr {
        SPR::XER => cpu.user.xer.to_bits(),
        SPR::LR => cpu.user.lr,
        SPR::CTR => cpu.user.ctr,
        SPR::DSISR => supervisor.dsisr,
        SPR::DAR => supervisor.dar,
        SPR::SRR0 => supervisor.srr[0],
        SPR::SRR1 => supervisor.srr[1],
        SPR::SPRG0 | SPR::SPRG1 | SPR::SPRG2 | SPR::SPRG3 => {
            supervisor.sprg[spr as usize - SPR::SPRG0 as usize]
        }
        SPR::HID2 => supervisor.hid2,
        gqr => supervisor.gqr[gqr as usize - SPR::GQR0 as usize].to_bits(),
    }
}

/// Writes a special purpose register.
pub fn write_spr(cpu: &mut Cpu, spr: SPR, value: u32) {
    let supervisor = &mut cpu.supervisor;
    match spr {
        SPR::XER => cpu.user.xer = XerReg::from_bits(value),
        SPR::LR => cpu.user.lr = value,
        SPR::CTR => cpu.user.ctr = value,
        SPR::DSISR => supervisor.dsisr = value,
        SPR::DAR => supervisor.dar = value,
        SPR::SRR0 => supervisor.srr[0] = value,
        SPR::SRR1 => supervisor.srr[1] = value,
        SPR::SPRG0 | SPR::SPRG1 | SPR::SPRG2 | SPR::SPRG3 => {
            supervisor.sprg[spr as usize - SPR::SPRG0 as usize] = value
        }
        SPR::HID2 => supervisor.hid2 = value,
        gqr => supervisor.gqr[gqr as usize - SPR::GQR0 as usize] = QuantReg::from_bits(value),
    }
}

impl<M: Memory> Interpreter<'_, M> {
    /// crand, crandc, creqv, crnand, crnor, cror, crorc and crxor.
    pub(crate) fn cr_logic(&mut self, ins: Ins) -> Outcome {
        let cr = &mut self.cpu.user.cr;
        let a = cr.bit(ins.crb_a());
        let b = cr.bit(ins.crb_b());

        let result = match ins.subop10() {
            33 => !(a | b),
            129 => a & !b,
            193 => a ^ b,
            225 => !(a & b),
            257 => a & b,
            289 => !(a ^ b),
            417 => a | !b,
            _ => a | b,
        };

        cr.set_bit(ins.crb_d(), result);
        Outcome::Continue
    }

    pub(crate) fn mcrf(&mut self, ins: Ins) -> Outcome {
        let cr = &mut self.cpu.user.cr;
        let field = cr.field(ins.crf_s() as usize);
        cr.set_field(ins.crf_d() as usize, field);
        Outcome::Continue
    }

    pub(crate) fn mfcr(&mut self, ins: Ins) -> Outcome {
        let cr = self.cpu.user.cr.0;
        self.set_gpr(ins.gpr_d(), cr);
        Outcome::Continue
    }

    pub(crate) fn mtcrf(&mut self, ins: Ins) -> Outcome {
        let crm = ins.crm();
        let mut mask = 0u32;
        for i in 0..8 {
            if crm & (1 << i) != 0 {
                mask |= 0xF << (4 * i);
            }
        }

        let s = self.gpr(ins.gpr_s());
        let cr = &mut self.cpu.user.cr;
        cr.0 = (s & mask) | (cr.0 & !mask);

        Outcome::Continue
    }

    pub(crate) fn mcrxr(&mut self, ins: Ins) -> Outcome {
        let xer = self.cpu.user.xer.clone();
        let cond = Cond {
            lt: xer.overflow_fuse(),
            gt: xer.overflow(),
            eq: xer.carry(),
            so: false,
        };

        self.cpu.user.cr.set_field(ins.crf_d() as usize, cond);
        self.cpu.user.xer = xer
            .with_overflow_fuse(false)
            .with_overflow(false)
            .with_carry(false);

        Outcome::Continue
    }

    pub(crate) fn mfmsr(&mut self, ins: Ins) -> Outcome {
        if !self.check_supervisor() {
            return Outcome::Exception;
        }

        let msr = self.cpu.supervisor.msr.to_bits();
        self.set_gpr(ins.gpr_d(), msr);
        Outcome::Continue
    }

    /// Changing the MSR may enable exceptions or the FPU, so execution leaves the current block.
    pub(crate) fn mtmsr(&mut self, ins: Ins) -> Outcome {
        if !self.check_supervisor() {
            return Outcome::Exception;
        }

        self.cpu.supervisor.msr = MachineState::from_bits(self.gpr(ins.gpr_s()));
        self.cpu.pc += 4;
        Outcome::Branch
    }

    pub(crate) fn mfspr(&mut self, ins: Ins) -> Outcome {
        let Some(spr) = ins.spr() else {
            return self.illegal(ins);
        };

        if spr.is_privileged() && !self.check_supervisor() {
            return Outcome::Exception;
        }

        let value = read_spr(self.cpu, spr);
        self.set_gpr(ins.gpr_d(), value);
        Outcome::Continue
    }

    pub(crate) fn mtspr(&mut self, ins: Ins) -> Outcome {
        let Some(spr) = ins.spr() else {
            return self.illegal(ins);
        };

        if spr.is_privileged() && !self.check_supervisor() {
            return Outcome::Exception;
        }

        let value = self.gpr(ins.gpr_s());
        write_spr(self.cpu, spr, value);
        Outcome::Continue
    }

    fn trap(&mut self, to: u8, a: u32, b: u32) -> Outcome {
        let (sa, sb) = (a as i32, b as i32);
        let trap = (to & 0b10000 != 0 && sa < sb)
            || (to & 0b01000 != 0 && sa > sb)
            || (to & 0b00100 != 0 && a == b)
            || (to & 0b00010 != 0 && a < b)
            || (to & 0b00001 != 0 && a > b);

        if trap {
            self.cpu.raise_program(ProgramReason::Trap);
            Outcome::Exception
        } else {
            Outcome::Continue
        }
    }

    pub(crate) fn tw(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a());
        let b = self.gpr(ins.gpr_b());
        self.trap(ins.to(), a, b)
    }

    pub(crate) fn twi(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a());
        self.trap(ins.to(), a, ins.simm() as i32 as u32)
    }
}
