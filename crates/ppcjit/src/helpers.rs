//! Runtime helpers called by compiled blocks.
//!
//! Floating point status updates all go through [`gekko::fpu`], the same code the interpreter
//! uses. Helpers receive the register file directly and never touch cached registers other than
//! the ones they are documented to access (PC, MSR, SRRs, DAR, DSISR and FPSCR), none of which
//! live in the register cache.
use cranelift::codegen::ir;
use cranelift::codegen::isa::CallConv;
use gekko::fpu::{self, ArithKind, QNAN};
use gekko::{Address, CondReg, Cpu, Exception, FloatRounding};
use strum::FromRepr;

/// A runtime helper, identified by its index in the internals namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum Internal {
    RaiseException,
    RaiseDsi,
    FpuArith,
    FpuRoundSingle,
    FpuConvert,
    FpuCompare,
    FpuRecord,
    Mtfsf,
    Mtfsfi,
    Mtfsb,
    Mcrfs,
    LoadSingle,
    StoreSingle,
}

extern "C-unwind" fn raise_exception(regs: &mut Cpu, exception: Exception) {
    regs.raise_exception(exception);
}

extern "C-unwind" fn raise_dsi(regs: &mut Cpu, addr: Address, store: bool) {
    regs.raise_dsi(addr, store);
}

extern "C-unwind" fn fpu_arith(regs: &mut Cpu, kind: u32, a: f64, b: f64, c: f64) -> f64 {
    let Some(kind) = ArithKind::from_bits(kind) else {
        tracing::error!("invalid arithmetic kind {kind:#X}");
        return f64::from_bits(QNAN);
    };

    regs.user.fpscr.arith(kind, a, b, c)
}

extern "C-unwind" fn fpu_round_single(regs: &mut Cpu, value: f64) -> f64 {
    regs.user.fpscr.round_to_single(value)
}

extern "C-unwind" fn fpu_convert(regs: &mut Cpu, value: f64, towards_zero: bool) -> u64 {
    let mode = if towards_zero {
        FloatRounding::TowardsZero
    } else {
        regs.user.fpscr.rounding()
    };

    regs.user.fpscr.convert_to_int(value, mode)
}

extern "C-unwind" fn fpu_compare(regs: &mut Cpu, a: f64, b: f64, ordered: bool) -> u8 {
    regs.user.fpscr.compare(a, b, ordered) as u8
}

/// Returns the CR1 nibble of a recording floating point instruction.
extern "C-unwind" fn fpu_record(regs: &mut Cpu) -> u8 {
    let mut cr = CondReg::default();
    fpu::update_record_bits(&mut cr, &regs.user.fpscr);
    cr.field(1).to_nibble()
}

extern "C-unwind" fn mtfsf(regs: &mut Cpu, mask: u8, value: u32) {
    regs.user.fpscr.mtfsf(mask, value);
}

extern "C-unwind" fn mtfsfi(regs: &mut Cpu, field: u8, imm: u8) {
    regs.user.fpscr.mtfsfi(field, imm);
}

extern "C-unwind" fn mtfsb(regs: &mut Cpu, bit: u8, set: bool) {
    if set {
        regs.user.fpscr.mtfsb1(bit);
    } else {
        regs.user.fpscr.mtfsb0(bit);
    }
}

/// Returns the copied FPSCR nibble.
extern "C-unwind" fn mcrfs(regs: &mut Cpu, field: u8) -> u8 {
    regs.user.fpscr.mcrfs(field)
}

extern "C-unwind" fn load_single(word: u32) -> f64 {
    fpu::load_single(word)
}

extern "C-unwind" fn store_single(value: f64) -> u32 {
    fpu::store_single(value)
}

impl Internal {
    /// Address of the helper.
    pub fn address(self) -> usize {
        match self {
            Self::RaiseException => raise_exception as extern "C-unwind" fn(_, _) as usize,
            Self::RaiseDsi => raise_dsi as extern "C-unwind" fn(_, _, _) as usize,
            Self::FpuArith => fpu_arith as extern "C-unwind" fn(_, _, _, _, _) -> _ as usize,
            Self::FpuRoundSingle => fpu_round_single as extern "C-unwind" fn(_, _) -> _ as usize,
            Self::FpuConvert => fpu_convert as extern "C-unwind" fn(_, _, _) -> _ as usize,
            Self::FpuCompare => fpu_compare as extern "C-unwind" fn(_, _, _, _) -> _ as usize,
            Self::FpuRecord => fpu_record as extern "C-unwind" fn(_) -> _ as usize,
            Self::Mtfsf => mtfsf as extern "C-unwind" fn(_, _, _) as usize,
            Self::Mtfsfi => mtfsfi as extern "C-unwind" fn(_, _, _) as usize,
            Self::Mtfsb => mtfsb as extern "C-unwind" fn(_, _, _) as usize,
            Self::Mcrfs => mcrfs as extern "C-unwind" fn(_, _) -> _ as usize,
            Self::LoadSingle => load_single as extern "C-unwind" fn(_) -> _ as usize,
            Self::StoreSingle => store_single as extern "C-unwind" fn(_) -> _ as usize,
        }
    }

    /// Signature of the helper.
    pub fn signature(self, ptr_type: ir::Type, call_conv: CallConv) -> ir::Signature {
        use ir::types::{F64, I8, I16, I32, I64};

        let regs = ir::AbiParam::new(ptr_type);
        let (params, returns) = match self {
            Self::RaiseException => (vec![regs, ir::AbiParam::new(I16)], vec![]),
            Self::RaiseDsi => (
                vec![regs, ir::AbiParam::new(I32), ir::AbiParam::new(I8)],
                vec![],
            ),
            Self::FpuArith => (
                vec![
                    regs,
                    ir::AbiParam::new(I32),
                    ir::AbiParam::new(F64),
                    ir::AbiParam::new(F64),
                    ir::AbiParam::new(F64),
                ],
                vec![ir::AbiParam::new(F64)],
            ),
            Self::FpuRoundSingle => (
                vec![regs, ir::AbiParam::new(F64)],
                vec![ir::AbiParam::new(F64)],
            ),
            Self::FpuConvert => (
                vec![regs, ir::AbiParam::new(F64), ir::AbiParam::new(I8)],
                vec![ir::AbiParam::new(I64)],
            ),
            Self::FpuCompare => (
                vec![
                    regs,
                    ir::AbiParam::new(F64),
                    ir::AbiParam::new(F64),
                    ir::AbiParam::new(I8),
                ],
                vec![ir::AbiParam::new(I8)],
            ),
            Self::FpuRecord => (vec![regs], vec![ir::AbiParam::new(I8)]),
            Self::Mtfsf => (
                vec![regs, ir::AbiParam::new(I8), ir::AbiParam::new(I32)],
                vec![],
            ),
            Self::Mtfsfi | Self::Mtfsb => (
                vec![regs, ir::AbiParam::new(I8), ir::AbiParam::new(I8)],
                vec![],
            ),
            Self::Mcrfs => (
                vec![regs, ir::AbiParam::new(I8)],
                vec![ir::AbiParam::new(I8)],
            ),
            Self::LoadSingle => (vec![ir::AbiParam::new(I32)], vec![ir::AbiParam::new(F64)]),
            Self::StoreSingle => (vec![ir::AbiParam::new(F64)], vec![ir::AbiParam::new(I32)]),
        };

        ir::Signature {
            params,
            returns,
            call_conv,
        }
    }
}

#[cfg(test)]
mod tests {
    use gekko::fpu::FpOp;

    use super::*;

    #[test]
    fn invalid_kind_yields_qnan() {
        let mut cpu = Cpu::default();
        let result = fpu_arith(&mut cpu, 0xFF, 1.0, 2.0, 3.0);

        assert_eq!(result.to_bits(), QNAN);
        assert_eq!(cpu.user.fpscr, Default::default());
    }

    #[test]
    fn arith_goes_through_fpscr() {
        let mut cpu = Cpu::default();
        let kind = ArithKind {
            op: FpOp::Div,
            single: false,
            fprf: true,
        };

        let result = fpu_arith(&mut cpu, kind.to_bits(), 1.0, 0.0, 0.0);

        assert_eq!(result, f64::INFINITY);
        assert!(cpu.user.fpscr.zero_divide_exception());
        assert!(cpu.user.fpscr.exception_summary());
    }

    #[test]
    fn record_mirrors_summary_bits() {
        let mut cpu = Cpu::default();
        cpu.user.fpscr.mtfsb1(3);

        // FX was set by mtfsb1 on an exception bit
        assert_eq!(fpu_record(&mut cpu) & 0b1000, 0b1000);
    }

    #[test]
    fn conversion_modes() {
        let mut cpu = Cpu::default();
        cpu.user.fpscr.set_rounding(FloatRounding::TowardsPosInf);

        assert_eq!(fpu_convert(&mut cpu, 1.25, false) as u32, 2);
        assert_eq!(fpu_convert(&mut cpu, 1.75, true) as u32, 1);
    }

    #[test]
    fn every_helper_has_a_signature() {
        let mut index = 0;
        while let Some(internal) = Internal::from_repr(index) {
            let sig = internal.signature(ir::types::I64, CallConv::SystemV);
            assert!(!sig.params.is_empty());
            assert_ne!(internal.address(), 0);
            index += 1;
        }

        assert_eq!(index, Internal::StoreSingle as u32 + 1);
    }
}
