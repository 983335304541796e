use gekko::disasm::Ins;
use gekko::fpu::{load_single, store_single};
use gekko::{
    Address, Cond, DEQUANTIZATION_LUT, GPR, InsExt, Memory, Primitive, QUANTIZATION_LUT,
    QuantReg, QuantizedType,
};

use crate::{Interpreter, Outcome};

/// A primitive which can be loaded into a GPR.
pub(crate) trait IntPrimitive: Primitive {
    fn extend(self) -> u32;
    fn truncate(value: u32) -> Self;
}

macro_rules! impl_int_primitive {
    ($($ty:ty),*) => {
        $(
            impl IntPrimitive for $ty {
                #[inline(always)]
                fn extend(self) -> u32 {
                    // sign extends signed types
                    self as i32 as u32
                }

                #[inline(always)]
                fn truncate(value: u32) -> Self {
                    value as Self
                }
            }
        )*
    };
}

impl IntPrimitive for u8 {
    #[inline(always)]
    fn extend(self) -> u32 {
        self as u32
    }

    #[inline(always)]
    fn truncate(value: u32) -> Self {
        value as u8
    }
}

impl IntPrimitive for u16 {
    #[inline(always)]
    fn extend(self) -> u32 {
        self as u32
    }

    #[inline(always)]
    fn truncate(value: u32) -> Self {
        value as u16
    }
}

impl_int_primitive!(u32, i16);

impl<M: Memory> Interpreter<'_, M> {
    /// Effective address of a D-form access.
    fn ea_imm(&self, ins: Ins, update: bool) -> Address {
        let base = if update {
            self.gpr(ins.gpr_a())
        } else {
            self.gpr_or_zero(ins.gpr_a())
        };

        Address(base.wrapping_add_signed(ins.simm() as i32))
    }

    /// Effective address of an X-form access.
    fn ea_idx(&self, ins: Ins, update: bool) -> Address {
        let base = if update {
            self.gpr(ins.gpr_a())
        } else {
            self.gpr_or_zero(ins.gpr_a())
        };

        Address(base.wrapping_add(self.gpr(ins.gpr_b())))
    }

    fn load_int<P: IntPrimitive>(&mut self, ins: Ins, addr: Address, update: bool) -> Outcome {
        let Some(value) = self.read::<P>(addr) else {
            return Outcome::Exception;
        };

        self.set_gpr(ins.gpr_d(), value.extend());
        if update {
            self.set_gpr(ins.gpr_a(), addr.value());
        }

        Outcome::Continue
    }

    fn store_int<P: IntPrimitive>(&mut self, ins: Ins, addr: Address, update: bool) -> Outcome {
        let value = P::truncate(self.gpr(ins.gpr_s()));
        if !self.write::<P>(addr, value) {
            return Outcome::Exception;
        }

        if update {
            self.set_gpr(ins.gpr_a(), addr.value());
        }

        Outcome::Continue
    }

    pub(crate) fn load_imm<P: IntPrimitive>(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_imm(ins, update);
        self.load_int::<P>(ins, addr, update)
    }

    pub(crate) fn load_idx<P: IntPrimitive>(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_idx(ins, update);
        self.load_int::<P>(ins, addr, update)
    }

    pub(crate) fn store_imm<P: IntPrimitive>(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_imm(ins, update);
        self.store_int::<P>(ins, addr, update)
    }

    pub(crate) fn store_idx<P: IntPrimitive>(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_idx(ins, update);
        self.store_int::<P>(ins, addr, update)
    }

    pub(crate) fn lwbrx(&mut self, ins: Ins) -> Outcome {
        let addr = self.ea_idx(ins, false);
        let Some(value) = self.read::<u32>(addr) else {
            return Outcome::Exception;
        };

        self.set_gpr(ins.gpr_d(), value.swap_bytes());
        Outcome::Continue
    }

    pub(crate) fn lhbrx(&mut self, ins: Ins) -> Outcome {
        let addr = self.ea_idx(ins, false);
        let Some(value) = self.read::<u16>(addr) else {
            return Outcome::Exception;
        };

        self.set_gpr(ins.gpr_d(), value.swap_bytes() as u32);
        Outcome::Continue
    }

    pub(crate) fn stwbrx(&mut self, ins: Ins) -> Outcome {
        let addr = self.ea_idx(ins, false);
        let value = self.gpr(ins.gpr_s()).swap_bytes();
        if self.write(addr, value) {
            Outcome::Continue
        } else {
            Outcome::Exception
        }
    }

    pub(crate) fn sthbrx(&mut self, ins: Ins) -> Outcome {
        let addr = self.ea_idx(ins, false);
        let value = (self.gpr(ins.gpr_s()) as u16).swap_bytes();
        if self.write(addr, value) {
            Outcome::Continue
        } else {
            Outcome::Exception
        }
    }

    /// Store conditional. There is a single CPU, so the reservation always holds.
    pub(crate) fn stwcx(&mut self, ins: Ins) -> Outcome {
        let addr = self.ea_idx(ins, false);
        let value = self.gpr(ins.gpr_s());
        if !self.write(addr, value) {
            return Outcome::Exception;
        }

        let cond = Cond {
            eq: true,
            so: self.cpu.user.xer.overflow_fuse(),
            ..Default::default()
        };

        self.cpu.user.cr.set_field(0, cond);
        Outcome::Continue
    }

    pub(crate) fn lmw(&mut self, ins: Ins) -> Outcome {
        let mut addr = self.ea_imm(ins, false);
        for index in ins.gpr_d().index()..32 {
            let Some(value) = self.read::<u32>(addr) else {
                return Outcome::Exception;
            };

            self.set_gpr(GPR::new(index as u8), value);
            addr += 4;
        }

        Outcome::Continue
    }

    pub(crate) fn stmw(&mut self, ins: Ins) -> Outcome {
        let mut addr = self.ea_imm(ins, false);
        for index in ins.gpr_s().index()..32 {
            let value = self.gpr(GPR::new(index as u8));
            if !self.write(addr, value) {
                return Outcome::Exception;
            }

            addr += 4;
        }

        Outcome::Continue
    }

    /// Zeroes the 32 byte cache block containing the effective address.
    pub(crate) fn dcbz(&mut self, ins: Ins) -> Outcome {
        let base = self.ea_idx(ins, false).align_down(32);
        for offset in (0..32).step_by(8) {
            if !self.write(base + offset, 0u64) {
                return Outcome::Exception;
            }
        }

        Outcome::Continue
    }

    fn load_float_single(&mut self, ins: Ins, addr: Address, update: bool) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let Some(word) = self.read::<u32>(addr) else {
            return Outcome::Exception;
        };

        let value = load_single(word);
        self.set_fpr(ins.fpr_d(), [value, value]);
        if update {
            self.set_gpr(ins.gpr_a(), addr.value());
        }

        Outcome::Continue
    }

    fn load_float_double(&mut self, ins: Ins, addr: Address, update: bool) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let Some(bits) = self.read::<u64>(addr) else {
            return Outcome::Exception;
        };

        self.set_ps0(ins.fpr_d(), f64::from_bits(bits));
        if update {
            self.set_gpr(ins.gpr_a(), addr.value());
        }

        Outcome::Continue
    }

    fn store_float<P: Primitive>(
        &mut self,
        ins: Ins,
        addr: Address,
        update: bool,
        convert: impl FnOnce(f64) -> P,
    ) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let value = convert(self.fpr(ins.fpr_s())[0]);
        if !self.write(addr, value) {
            return Outcome::Exception;
        }

        if update {
            self.set_gpr(ins.gpr_a(), addr.value());
        }

        Outcome::Continue
    }

    pub(crate) fn lfs(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_imm(ins, update);
        self.load_float_single(ins, addr, update)
    }

    pub(crate) fn lfsx(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_idx(ins, update);
        self.load_float_single(ins, addr, update)
    }

    pub(crate) fn lfd(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_imm(ins, update);
        self.load_float_double(ins, addr, update)
    }

    pub(crate) fn lfdx(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_idx(ins, update);
        self.load_float_double(ins, addr, update)
    }

    pub(crate) fn stfs(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_imm(ins, update);
        self.store_float(ins, addr, update, store_single)
    }

    pub(crate) fn stfsx(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_idx(ins, update);
        self.store_float(ins, addr, update, store_single)
    }

    pub(crate) fn stfd(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_imm(ins, update);
        self.store_float(ins, addr, update, f64::to_bits)
    }

    pub(crate) fn stfdx(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_idx(ins, update);
        self.store_float(ins, addr, update, f64::to_bits)
    }

    pub(crate) fn stfiwx(&mut self, ins: Ins) -> Outcome {
        let addr = self.ea_idx(ins, false);
        self.store_float(ins, addr, false, |value| value.to_bits() as u32)
    }

    /// Reads a quantized value, returning the dequantized value.
    fn read_quantized(&mut self, addr: Address, gqr: QuantReg) -> Option<f64> {
        let ty = gqr.load_type();
        let scale = DEQUANTIZATION_LUT[(gqr.load_scale().value() as usize) & 0b0011_1111];

        let value = match ty {
            QuantizedType::U8 => self.read::<u8>(addr)? as f64 * scale,
            QuantizedType::U16 => self.read::<u16>(addr)? as f64 * scale,
            QuantizedType::I8 => self.read::<i8>(addr)? as f64 * scale,
            QuantizedType::I16 => self.read::<i16>(addr)? as f64 * scale,
            _ => load_single(self.read::<u32>(addr)?),
        };

        Some(value)
    }

    /// Quantizes and writes a value. Integer conversions saturate.
    fn write_quantized(&mut self, addr: Address, gqr: QuantReg, value: f64) -> bool {
        let ty = gqr.store_type();
        let scale = QUANTIZATION_LUT[(gqr.store_scale().value() as usize) & 0b0011_1111];
        let scaled = value * scale;

        match ty {
            QuantizedType::U8 => self.write(addr, scaled as u8),
            QuantizedType::U16 => self.write(addr, scaled as u16),
            QuantizedType::I8 => self.write(addr, scaled as i8),
            QuantizedType::I16 => self.write(addr, scaled as i16),
            _ => self.write(addr, store_single(value)),
        }
    }

    fn quantized_load(
        &mut self,
        ins: Ins,
        addr: Address,
        single: bool,
        gqr: usize,
        update: bool,
    ) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let gqr = self.cpu.supervisor.gqr[gqr];
        let Some(ps0) = self.read_quantized(addr, gqr) else {
            return Outcome::Exception;
        };

        let ps1 = if single {
            1.0
        } else {
            let Some(ps1) = self.read_quantized(addr + gqr.load_type().size(), gqr) else {
                return Outcome::Exception;
            };

            ps1
        };

        self.set_fpr(ins.fpr_d(), [ps0, ps1]);
        if update {
            self.set_gpr(ins.gpr_a(), addr.value());
        }

        Outcome::Continue
    }

    fn quantized_store(
        &mut self,
        ins: Ins,
        addr: Address,
        single: bool,
        gqr: usize,
        update: bool,
    ) -> Outcome {
        if !self.check_fpu() {
            return Outcome::Exception;
        }

        let gqr = self.cpu.supervisor.gqr[gqr];
        let [ps0, ps1] = self.fpr(ins.fpr_s());

        if !self.write_quantized(addr, gqr, ps0) {
            return Outcome::Exception;
        }

        if !single && !self.write_quantized(addr + gqr.store_type().size(), gqr, ps1) {
            return Outcome::Exception;
        }

        if update {
            self.set_gpr(ins.gpr_a(), addr.value());
        }

        Outcome::Continue
    }

    fn ea_psq(&self, ins: Ins, update: bool) -> Address {
        let base = if update {
            self.gpr(ins.gpr_a())
        } else {
            self.gpr_or_zero(ins.gpr_a())
        };

        Address(base.wrapping_add_signed(ins.psq_offset() as i32))
    }

    pub(crate) fn psq_l(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_psq(ins, update);
        self.quantized_load(ins, addr, ins.psq_w(), ins.psq_i(), update)
    }

    pub(crate) fn psq_st(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_psq(ins, update);
        self.quantized_store(ins, addr, ins.psq_w(), ins.psq_i(), update)
    }

    pub(crate) fn psq_lx(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_idx(ins, update);
        self.quantized_load(ins, addr, ins.psq_x_w(), ins.psq_x_i(), update)
    }

    pub(crate) fn psq_stx(&mut self, ins: Ins, update: bool) -> Outcome {
        let addr = self.ea_idx(ins, update);
        self.quantized_store(ins, addr, ins.psq_x_w(), ins.psq_x_i(), update)
    }
}
