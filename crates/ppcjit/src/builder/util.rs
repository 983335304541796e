use cranelift::codegen::ir;
use cranelift::prelude::{FunctionBuilder, InstBuilder};
use gekko::Reg;

use super::BlockBuilder;

/// Trait for transforming values into an IR value in a function.
pub trait IntoIrValue {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value;
}

impl IntoIrValue for ir::Value {
    fn into_value(self, _: &mut FunctionBuilder<'_>) -> ir::Value {
        self
    }
}

impl IntoIrValue for bool {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I8, self as i64)
    }
}

impl IntoIrValue for u8 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I8, self as u64 as i64)
    }
}

impl IntoIrValue for u16 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I16, self as u64 as i64)
    }
}

impl IntoIrValue for u32 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I32, self as u64 as i64)
    }
}

impl IntoIrValue for u64 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I64, self as i64)
    }
}

impl IntoIrValue for f64 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().f64const(self)
    }
}

impl BlockBuilder<'_> {
    /// Creates an IR value from the given `value`.
    pub fn ir_value(&mut self, value: impl IntoIrValue) -> ir::Value {
        value.into_value(&mut self.bd)
    }

    /// Gets bit `index` (LSB numbering) of the `value` (must be an I32) as a boolean (I8).
    pub fn get_bit(&mut self, value: ir::Value, index: u32) -> ir::Value {
        let shifted = self.bd.ins().ushr_imm(value, index as i64);
        let bit = self.bd.ins().band_imm(shifted, 0b1);

        self.bd.ins().ireduce(ir::types::I8, bit)
    }

    /// Replaces field CR`index` with the given nibble (an I8, LT in bit 3 down to SO in bit 0).
    pub fn set_cr_field(&mut self, index: u8, nibble: ir::Value) {
        let cr = self.get(Reg::CR);

        let base = 4 * (7 - index as u32);
        let nibble = self.bd.ins().uextend(ir::types::I32, nibble);
        let nibble = self.bd.ins().band_imm(nibble, 0b1111);
        let value = self.bd.ins().ishl_imm(nibble, base as i64);

        let mask = self.ir_value(0b1111u32 << base);
        let updated = self.bd.ins().band_not(cr, mask);
        let updated = self.bd.ins().bor(updated, value);

        self.set(Reg::CR, updated);
    }

    /// Updates field CR`index` from its four flags. All IR values must be booleans (I8).
    pub fn update_cr(
        &mut self,
        index: u8,
        lt: ir::Value,
        gt: ir::Value,
        eq: ir::Value,
        so: ir::Value,
    ) {
        let lt = self.bd.ins().ishl_imm(lt, 3);
        let gt = self.bd.ins().ishl_imm(gt, 2);
        let eq = self.bd.ins().ishl_imm(eq, 1);

        let nibble = self.bd.ins().bor(lt, gt);
        let nibble = self.bd.ins().bor(nibble, eq);
        let nibble = self.bd.ins().bor(nibble, so);

        self.set_cr_field(index, nibble);
    }
}
