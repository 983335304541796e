use gekko::disasm::Ins;
use gekko::{Cond, InsExt, Memory};

use crate::{Interpreter, Outcome};

/// Adds `a`, `b` and `carry`, returning the result, the carry out and whether a signed overflow
/// happened.
fn add_with_carry(a: u32, b: u32, carry: bool) -> (u32, bool, bool) {
    let sum = a as u64 + b as u64 + carry as u64;
    let result = sum as u32;
    let overflow = ((a ^ result) & (b ^ result)) >> 31 != 0;
    (result, sum > u32::MAX as u64, overflow)
}

/// Mask of bits `mb..=me` in PowerPC numbering, wrapping around if `mb > me`.
pub(crate) fn rotate_mask(mb: u8, me: u8) -> u32 {
    let begin = u32::MAX >> mb;
    let end = u32::MAX << (31 - me);

    if mb <= me { begin & end } else { begin | end }
}

impl<M: Memory> Interpreter<'_, M> {
    /// Sets CR0 to the comparison of `value` with zero and copies XER[SO].
    pub(crate) fn update_cr0(&mut self, value: u32) {
        let value = value as i32;
        let cond = Cond {
            lt: value < 0,
            gt: value > 0,
            eq: value == 0,
            so: self.cpu.user.xer.overflow_fuse(),
        };

        self.cpu.user.cr.set_field(0, cond);
    }

    fn update_overflow(&mut self, overflow: bool) {
        let xer = &mut self.cpu.user.xer;
        xer.set_overflow(overflow);
        if overflow {
            xer.set_overflow_fuse(true);
        }
    }

    /// Writes the result of an XO-form instruction, handling OE and Rc.
    fn finish_xo(&mut self, ins: Ins, result: u32, overflow: bool) -> Outcome {
        self.set_gpr(ins.gpr_d(), result);

        if ins.oe() {
            self.update_overflow(overflow);
        }

        if ins.rc() {
            self.update_cr0(result);
        }

        Outcome::Continue
    }

    pub(crate) fn add_family(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a());
        let b = self.gpr(ins.gpr_b());
        let carry = self.cpu.user.xer.carry();

        // (lhs, rhs, carry in, updates carry)
        let (lhs, rhs, carry_in, records_carry) = match ins.subop10() & 0x1FF {
            8 => (!a, b, true, true),
            10 => (a, b, false, true),
            40 => (!a, b, true, false),
            104 => (!a, 0, true, false),
            136 => (!a, b, carry, true),
            138 => (a, b, carry, true),
            200 => (!a, 0, carry, true),
            202 => (a, 0, carry, true),
            232 => (!a, u32::MAX, carry, true),
            234 => (a, u32::MAX, carry, true),
            _ => (a, b, false, false),
        };

        let (result, carry_out, overflow) = add_with_carry(lhs, rhs, carry_in);
        if records_carry {
            self.cpu.user.xer.set_carry(carry_out);
        }

        self.finish_xo(ins, result, overflow)
    }

    pub(crate) fn addi(&mut self, ins: Ins) -> Outcome {
        let base = self.gpr_or_zero(ins.gpr_a());
        self.set_gpr(ins.gpr_d(), base.wrapping_add_signed(ins.simm() as i32));
        Outcome::Continue
    }

    pub(crate) fn addis(&mut self, ins: Ins) -> Outcome {
        let base = self.gpr_or_zero(ins.gpr_a());
        self.set_gpr(ins.gpr_d(), base.wrapping_add((ins.uimm() as u32) << 16));
        Outcome::Continue
    }

    pub(crate) fn addic(&mut self, ins: Ins, record: bool) -> Outcome {
        let a = self.gpr(ins.gpr_a());
        let (result, carry, _) = add_with_carry(a, ins.simm() as i32 as u32, false);

        self.cpu.user.xer.set_carry(carry);
        self.set_gpr(ins.gpr_d(), result);
        if record {
            self.update_cr0(result);
        }

        Outcome::Continue
    }

    pub(crate) fn subfic(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a());
        let (result, carry, _) = add_with_carry(!a, ins.simm() as i32 as u32, true);

        self.cpu.user.xer.set_carry(carry);
        self.set_gpr(ins.gpr_d(), result);
        Outcome::Continue
    }

    pub(crate) fn mulli(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a()) as i32;
        self.set_gpr(ins.gpr_d(), a.wrapping_mul(ins.simm() as i32) as u32);
        Outcome::Continue
    }

    pub(crate) fn mullw(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a()) as i32 as i64;
        let b = self.gpr(ins.gpr_b()) as i32 as i64;
        let product = a * b;

        self.finish_xo(ins, product as u32, product != product as i32 as i64)
    }

    pub(crate) fn mulhw(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a()) as i32 as i64;
        let b = self.gpr(ins.gpr_b()) as i32 as i64;

        self.finish_xo(ins, ((a * b) >> 32) as u32, false)
    }

    pub(crate) fn mulhwu(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a()) as u64;
        let b = self.gpr(ins.gpr_b()) as u64;

        self.finish_xo(ins, ((a * b) >> 32) as u32, false)
    }

    pub(crate) fn divw(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a()) as i32;
        let b = self.gpr(ins.gpr_b()) as i32;

        match a.checked_div(b) {
            Some(quotient) => self.finish_xo(ins, quotient as u32, false),
            // undefined, mimic the hardware
            None => {
                let result = if a < 0 && b == 0 { u32::MAX } else { 0 };
                self.finish_xo(ins, result, true)
            }
        }
    }

    pub(crate) fn divwu(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a());
        let b = self.gpr(ins.gpr_b());

        match a.checked_div(b) {
            Some(quotient) => self.finish_xo(ins, quotient, false),
            None => self.finish_xo(ins, 0, true),
        }
    }

    /// X-form logical operations: `rA = rS op rB`.
    pub(crate) fn logic(&mut self, ins: Ins) -> Outcome {
        let s = self.gpr(ins.gpr_s());
        let b = self.gpr(ins.gpr_b());

        let result = match ins.subop10() {
            28 => s & b,
            60 => s & !b,
            124 => !(s | b),
            284 => !(s ^ b),
            316 => s ^ b,
            412 => s | !b,
            444 => s | b,
            _ => !(s & b),
        };

        self.set_gpr(ins.gpr_a(), result);
        if ins.rc() {
            self.update_cr0(result);
        }

        Outcome::Continue
    }

    fn logic_imm(&mut self, ins: Ins, op: impl FnOnce(u32, u32) -> u32, record: bool) -> Outcome {
        let s = self.gpr(ins.gpr_s());
        let result = op(s, ins.uimm() as u32);

        self.set_gpr(ins.gpr_a(), result);
        if record {
            self.update_cr0(result);
        }

        Outcome::Continue
    }

    pub(crate) fn ori(&mut self, ins: Ins) -> Outcome {
        self.logic_imm(ins, |s, imm| s | imm, false)
    }

    pub(crate) fn oris(&mut self, ins: Ins) -> Outcome {
        self.logic_imm(ins, |s, imm| s | (imm << 16), false)
    }

    pub(crate) fn xori(&mut self, ins: Ins) -> Outcome {
        self.logic_imm(ins, |s, imm| s ^ imm, false)
    }

    pub(crate) fn xoris(&mut self, ins: Ins) -> Outcome {
        self.logic_imm(ins, |s, imm| s ^ (imm << 16), false)
    }

    pub(crate) fn andi_record(&mut self, ins: Ins) -> Outcome {
        self.logic_imm(ins, |s, imm| s & imm, true)
    }

    pub(crate) fn andis_record(&mut self, ins: Ins) -> Outcome {
        self.logic_imm(ins, |s, imm| s & (imm << 16), true)
    }

    fn unary(&mut self, ins: Ins, op: impl FnOnce(u32) -> u32) -> Outcome {
        let result = op(self.gpr(ins.gpr_s()));

        self.set_gpr(ins.gpr_a(), result);
        if ins.rc() {
            self.update_cr0(result);
        }

        Outcome::Continue
    }

    pub(crate) fn cntlzw(&mut self, ins: Ins) -> Outcome {
        self.unary(ins, u32::leading_zeros)
    }

    pub(crate) fn extsb(&mut self, ins: Ins) -> Outcome {
        self.unary(ins, |s| s as i8 as i32 as u32)
    }

    pub(crate) fn extsh(&mut self, ins: Ins) -> Outcome {
        self.unary(ins, |s| s as i16 as i32 as u32)
    }

    pub(crate) fn slw(&mut self, ins: Ins) -> Outcome {
        let amount = self.gpr(ins.gpr_b()) & 0x3F;
        self.unary(ins, |s| s.checked_shl(amount).unwrap_or(0))
    }

    pub(crate) fn srw(&mut self, ins: Ins) -> Outcome {
        let amount = self.gpr(ins.gpr_b()) & 0x3F;
        self.unary(ins, |s| s.checked_shr(amount).unwrap_or(0))
    }

    fn shift_right_algebraic(&mut self, ins: Ins, amount: u32) -> Outcome {
        let s = self.gpr(ins.gpr_s()) as i32;

        let (result, carry) = if amount > 31 {
            ((s >> 31) as u32, s < 0)
        } else {
            let shifted_out = (s as u32) & ((1u64 << amount) - 1) as u32;
            ((s >> amount) as u32, s < 0 && shifted_out != 0)
        };

        self.cpu.user.xer.set_carry(carry);
        self.set_gpr(ins.gpr_a(), result);
        if ins.rc() {
            self.update_cr0(result);
        }

        Outcome::Continue
    }

    pub(crate) fn sraw(&mut self, ins: Ins) -> Outcome {
        let amount = self.gpr(ins.gpr_b()) & 0x3F;
        self.shift_right_algebraic(ins, amount)
    }

    pub(crate) fn srawi(&mut self, ins: Ins) -> Outcome {
        self.shift_right_algebraic(ins, ins.sh() as u32)
    }

    fn rotate(&mut self, ins: Ins, amount: u32, insert: bool) -> Outcome {
        let rotated = self.gpr(ins.gpr_s()).rotate_left(amount);
        let mask = rotate_mask(ins.mb(), ins.me());

        let result = if insert {
            (rotated & mask) | (self.gpr(ins.gpr_a()) & !mask)
        } else {
            rotated & mask
        };

        self.set_gpr(ins.gpr_a(), result);
        if ins.rc() {
            self.update_cr0(result);
        }

        Outcome::Continue
    }

    pub(crate) fn rlwinm(&mut self, ins: Ins) -> Outcome {
        self.rotate(ins, ins.sh() as u32, false)
    }

    pub(crate) fn rlwimi(&mut self, ins: Ins) -> Outcome {
        self.rotate(ins, ins.sh() as u32, true)
    }

    pub(crate) fn rlwnm(&mut self, ins: Ins) -> Outcome {
        let amount = self.gpr(ins.gpr_b()) & 0x1F;
        self.rotate(ins, amount, false)
    }

    fn compare(&mut self, ins: Ins, lt: bool, gt: bool) -> Outcome {
        let cond = Cond {
            lt,
            gt,
            eq: !lt && !gt,
            so: self.cpu.user.xer.overflow_fuse(),
        };

        self.cpu.user.cr.set_field(ins.crf_d() as usize, cond);
        Outcome::Continue
    }

    pub(crate) fn cmp(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a()) as i32;
        let b = self.gpr(ins.gpr_b()) as i32;
        self.compare(ins, a < b, a > b)
    }

    pub(crate) fn cmpl(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a());
        let b = self.gpr(ins.gpr_b());
        self.compare(ins, a < b, a > b)
    }

    pub(crate) fn cmpi(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a()) as i32;
        let b = ins.simm() as i32;
        self.compare(ins, a < b, a > b)
    }

    pub(crate) fn cmpli(&mut self, ins: Ins) -> Outcome {
        let a = self.gpr(ins.gpr_a());
        let b = ins.uimm() as u32;
        self.compare(ins, a < b, a > b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carries_and_overflows() {
        assert_eq!(add_with_carry(u32::MAX, 1, false), (0, true, false));
        assert_eq!(add_with_carry(0x7FFF_FFFF, 1, false), (0x8000_0000, false, true));
        // neg of i32::MIN overflows
        assert_eq!(add_with_carry(!0x8000_0000, 0, true), (0x8000_0000, false, true));
    }

    #[test]
    fn masks() {
        assert_eq!(rotate_mask(0, 31), u32::MAX);
        assert_eq!(rotate_mask(24, 31), 0xFF);
        assert_eq!(rotate_mask(0, 7), 0xFF00_0000);
        assert_eq!(rotate_mask(31, 0), 0x8000_0001);
    }
}
