//! Guest model of the Gekko PowerPC CPU: the canonical register file, the layout of its status
//! registers, the FPU status emulation in [`fpu`] and the guest memory interface in [`mem`].
//!
//! The `powerpc` crate, which is a disassembler of PowerPC instructions, is re-exported under
//! [`disasm`].

pub mod fpu;
pub mod mem;

use std::mem::offset_of;

use bitos::integer::{i6, u5, u7};
use bitos::{BitUtils, bitos};
use strum::{FromRepr, VariantArray};
use zerocopy::{FromBytes, Immutable, IntoBytes};

#[rustfmt::skip]
pub use crate::mem::{Memory, Primitive, Ram};

/// Disassembling of PowerPC instructions. Re-export of the [`powerpc`] crate.
#[rustfmt::skip]
pub use powerpc as disasm;

/// An address in the Gekko's memory address space. This is a thin wrapper around an [`u32`].
#[repr(transparent)]
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash, IntoBytes, FromBytes, Immutable,
)]
pub struct Address(pub u32);

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "0x{:04X}_{:04X}",
            (self.0 & 0xFFFF_0000) >> 16,
            self.0 & 0xFFFF
        )
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Address {
    /// Returns the value of this address. Equivalent to `self.0`.
    #[inline(always)]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Aligns this address down to the given alignment.
    pub const fn align_down(self, alignment: u32) -> Self {
        let rem = self.0 % alignment;
        Self(self.0 - rem)
    }
}

impl std::ops::Add<u32> for Address {
    type Output = Self;

    #[inline(always)]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Add<i32> for Address {
    type Output = Self;

    #[inline(always)]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0.wrapping_add_signed(rhs))
    }
}

impl std::ops::AddAssign<u32> for Address {
    #[inline(always)]
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<Address> for Address {
    type Output = i64;

    #[inline(always)]
    fn sub(self, rhs: Address) -> Self::Output {
        self.0 as i64 - rhs.0 as i64
    }
}

impl PartialEq<u32> for Address {
    #[inline(always)]
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl From<u32> for Address {
    #[inline(always)]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Address> for u32 {
    #[inline(always)]
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Extension trait for [`Ins`](disasm::Ins) which decodes the instruction fields straight from
/// the instruction word. Bit numbers in the docs follow PowerPC numbering (bit 0 is the MSB).
pub trait InsExt {
    /// Primary opcode, bits 0..6.
    fn primary(&self) -> u8;
    /// Extended opcode, bits 21..31.
    fn subop10(&self) -> u16;
    /// Extended opcode of A-form instructions, bits 26..31.
    fn subop5(&self) -> u8;

    /// GPR indicated by field rA.
    fn gpr_a(&self) -> GPR;
    /// GPR indicated by field rB.
    fn gpr_b(&self) -> GPR;
    /// GPR indicated by field rS.
    fn gpr_s(&self) -> GPR;
    /// GPR indicated by field rD.
    fn gpr_d(&self) -> GPR;
    /// FPR indicated by field frA.
    fn fpr_a(&self) -> FPR;
    /// FPR indicated by field frB.
    fn fpr_b(&self) -> FPR;
    /// FPR indicated by field frC.
    fn fpr_c(&self) -> FPR;
    /// FPR indicated by field frS.
    fn fpr_s(&self) -> FPR;
    /// FPR indicated by field frD.
    fn fpr_d(&self) -> FPR;
    /// SPR indicated by field SPR, if it is a known one.
    fn spr(&self) -> Option<SPR>;

    /// Record bit (Rc), bit 31.
    fn rc(&self) -> bool;
    /// Overflow enable bit (OE), bit 21.
    fn oe(&self) -> bool;
    /// Link bit (LK), bit 31.
    fn lk(&self) -> bool;
    /// Absolute address bit (AA), bit 30.
    fn aa(&self) -> bool;

    /// Signed immediate (SIMM or d), bits 16..32.
    fn simm(&self) -> i16;
    /// Unsigned immediate (UIMM), bits 16..32.
    fn uimm(&self) -> u16;

    /// CR field crfD, bits 6..9.
    fn crf_d(&self) -> u8;
    /// CR field crfS, bits 11..14.
    fn crf_s(&self) -> u8;
    /// CR bit crbD, bits 6..11.
    fn crb_d(&self) -> u8;
    /// CR bit crbA, bits 11..16.
    fn crb_a(&self) -> u8;
    /// CR bit crbB, bits 16..21.
    fn crb_b(&self) -> u8;

    /// Branch options (BO), bits 6..11.
    fn bo(&self) -> u8;
    /// Branch condition bit (BI), bits 11..16.
    fn bi(&self) -> u8;
    /// Sign extended byte offset of I-form branches (LI || 0b00).
    fn branch_offset(&self) -> i32;
    /// Sign extended byte offset of B-form branches (BD || 0b00).
    fn cond_offset(&self) -> i32;

    /// Shift amount (SH), bits 16..21.
    fn sh(&self) -> u8;
    /// Mask begin (MB), bits 21..26.
    fn mb(&self) -> u8;
    /// Mask end (ME), bits 26..31.
    fn me(&self) -> u8;
    /// Byte count (NB), bits 16..21.
    fn nb(&self) -> u8;
    /// Trap options (TO), bits 6..11.
    fn to(&self) -> u8;

    /// CR field mask of `mtcrf` (CRM), bits 12..20.
    fn crm(&self) -> u8;
    /// FPSCR field mask of `mtfsf` (FM), bits 7..15.
    fn fm(&self) -> u8;
    /// Immediate of `mtfsfi` (IMM), bits 16..20.
    fn fpscr_imm(&self) -> u8;

    /// Sign extended 12-bit displacement of quantized loads and stores.
    fn psq_offset(&self) -> i16;
    /// W bit of immediate-form quantized loads and stores, bit 16.
    fn psq_w(&self) -> bool;
    /// GQR index of immediate-form quantized loads and stores, bits 17..20.
    fn psq_i(&self) -> usize;
    /// W bit of indexed quantized loads and stores, bit 21.
    fn psq_x_w(&self) -> bool;
    /// GQR index of indexed quantized loads and stores, bits 22..25.
    fn psq_x_i(&self) -> usize;
}

impl InsExt for disasm::Ins {
    #[inline(always)]
    fn primary(&self) -> u8 {
        self.code.bits(26, 32) as u8
    }

    #[inline(always)]
    fn subop10(&self) -> u16 {
        self.code.bits(1, 11) as u16
    }

    #[inline(always)]
    fn subop5(&self) -> u8 {
        self.code.bits(1, 6) as u8
    }

    #[inline(always)]
    fn gpr_a(&self) -> GPR {
        GPR::new(self.code.bits(16, 21) as u8)
    }

    #[inline(always)]
    fn gpr_b(&self) -> GPR {
        GPR::new(self.code.bits(11, 16) as u8)
    }

    #[inline(always)]
    fn gpr_s(&self) -> GPR {
        GPR::new(self.code.bits(21, 26) as u8)
    }

    #[inline(always)]
    fn gpr_d(&self) -> GPR {
        GPR::new(self.code.bits(21, 26) as u8)
    }

    #[inline(always)]
    fn fpr_a(&self) -> FPR {
        FPR::new(self.code.bits(16, 21) as u8)
    }

    #[inline(always)]
    fn fpr_b(&self) -> FPR {
        FPR::new(self.code.bits(11, 16) as u8)
    }

    #[inline(always)]
    fn fpr_c(&self) -> FPR {
        FPR::new(self.code.bits(6, 11) as u8)
    }

    #[inline(always)]
    fn fpr_s(&self) -> FPR {
        FPR::new(self.code.bits(21, 26) as u8)
    }

    #[inline(always)]
    fn fpr_d(&self) -> FPR {
        FPR::new(self.code.bits(21, 26) as u8)
    }

    #[inline(always)]
    fn spr(&self) -> Option<SPR> {
        // the two halves of the SPR field are swapped
        let index = self.code.bits(16, 21) | (self.code.bits(11, 16) << 5);
        SPR::from_repr(index as u16)
    }

    #[inline(always)]
    fn rc(&self) -> bool {
        self.code.bit(0)
    }

    #[inline(always)]
    fn oe(&self) -> bool {
        self.code.bit(10)
    }

    #[inline(always)]
    fn lk(&self) -> bool {
        self.code.bit(0)
    }

    #[inline(always)]
    fn aa(&self) -> bool {
        self.code.bit(1)
    }

    #[inline(always)]
    fn simm(&self) -> i16 {
        self.code as u16 as i16
    }

    #[inline(always)]
    fn uimm(&self) -> u16 {
        self.code as u16
    }

    #[inline(always)]
    fn crf_d(&self) -> u8 {
        self.code.bits(23, 26) as u8
    }

    #[inline(always)]
    fn crf_s(&self) -> u8 {
        self.code.bits(18, 21) as u8
    }

    #[inline(always)]
    fn crb_d(&self) -> u8 {
        self.code.bits(21, 26) as u8
    }

    #[inline(always)]
    fn crb_a(&self) -> u8 {
        self.code.bits(16, 21) as u8
    }

    #[inline(always)]
    fn crb_b(&self) -> u8 {
        self.code.bits(11, 16) as u8
    }

    #[inline(always)]
    fn bo(&self) -> u8 {
        self.code.bits(21, 26) as u8
    }

    #[inline(always)]
    fn bi(&self) -> u8 {
        self.code.bits(16, 21) as u8
    }

    #[inline(always)]
    fn branch_offset(&self) -> i32 {
        ((self.code & 0x03FF_FFFC) << 6) as i32 >> 6
    }

    #[inline(always)]
    fn cond_offset(&self) -> i32 {
        (self.code & 0xFFFC) as u16 as i16 as i32
    }

    #[inline(always)]
    fn sh(&self) -> u8 {
        self.code.bits(11, 16) as u8
    }

    #[inline(always)]
    fn mb(&self) -> u8 {
        self.code.bits(6, 11) as u8
    }

    #[inline(always)]
    fn me(&self) -> u8 {
        self.code.bits(1, 6) as u8
    }

    #[inline(always)]
    fn nb(&self) -> u8 {
        self.code.bits(11, 16) as u8
    }

    #[inline(always)]
    fn to(&self) -> u8 {
        self.code.bits(21, 26) as u8
    }

    #[inline(always)]
    fn crm(&self) -> u8 {
        self.code.bits(12, 20) as u8
    }

    #[inline(always)]
    fn fm(&self) -> u8 {
        self.code.bits(17, 25) as u8
    }

    #[inline(always)]
    fn fpscr_imm(&self) -> u8 {
        self.code.bits(12, 16) as u8
    }

    #[inline(always)]
    fn psq_offset(&self) -> i16 {
        ((self.code.bits(0, 12) as u16) << 4) as i16 >> 4
    }

    #[inline(always)]
    fn psq_w(&self) -> bool {
        self.code.bit(15)
    }

    #[inline(always)]
    fn psq_i(&self) -> usize {
        self.code.bits(12, 15) as usize
    }

    #[inline(always)]
    fn psq_x_w(&self) -> bool {
        self.code.bit(10)
    }

    #[inline(always)]
    fn psq_x_i(&self) -> usize {
        self.code.bits(7, 10) as usize
    }
}

/// An exception which can be generated by the Gekko CPU. The variants have the lower 16 bits of the
/// exception vector as their values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum Exception {
    Reset              = 0x0100,
    MachineCheck       = 0x0200,
    DSI                = 0x0300,
    ISI                = 0x0400,
    Interrupt          = 0x0500,
    Alignment          = 0x0600,
    Program            = 0x0700,
    FloatUnavailable   = 0x0800,
    Decrementer        = 0x0900,
    Syscall            = 0x0C00,
    Trace              = 0x0D00,
    PerformanceMonitor = 0x0F00,
    Breakpoint         = 0x1300,
}

impl Exception {
    pub const SPECIAL_SRR1_BITS_MASK: u32 = 0b0111_1000_0011_1100_0000_0000_0000_0000_u32;
    pub const MSR_TO_SRR1_MASK: u32 = 0b0000_0111_1100_0000_1111_1111_1111_1111_u32;
    pub const SRR1_TO_MSR_MASK: u32 = 0b1000_0111_1100_0000_1111_1111_0111_0011_u32;

    pub fn srr0_skip(self) -> bool {
        matches!(self, Self::Syscall)
    }
}

/// Reason of a [`Exception::Program`], recorded in SRR1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramReason {
    /// An enabled floating point exception occurred.
    FloatEnabled,
    /// The instruction is not a valid instruction.
    Illegal,
    /// A privileged instruction was executed in user mode.
    Privileged,
    /// A trap condition was met.
    Trap,
}

impl ProgramReason {
    /// The SRR1 bit associated with this reason.
    pub const fn srr1_bit(self) -> u32 {
        match self {
            Self::FloatEnabled => 1 << 20,
            Self::Illegal => 1 << 19,
            Self::Privileged => 1 << 18,
            Self::Trap => 1 << 17,
        }
    }
}

/// A condition group field in the [`CondReg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cond {
    /// Whether the first operand is less than the second.
    pub lt: bool,
    /// Whether the first operand is greater than the second.
    pub gt: bool,
    /// Whether the operands are equal.
    pub eq: bool,
    /// Summary overflow, or unordered for floating point comparisons.
    pub so: bool,
}

impl Cond {
    /// Builds a field from its 4 bit encoding (LT is the most significant bit).
    pub const fn from_nibble(nibble: u8) -> Self {
        Self {
            lt: nibble & 0b1000 != 0,
            gt: nibble & 0b0100 != 0,
            eq: nibble & 0b0010 != 0,
            so: nibble & 0b0001 != 0,
        }
    }

    /// The 4 bit encoding of this field.
    pub const fn to_nibble(self) -> u8 {
        (self.lt as u8) << 3 | (self.gt as u8) << 2 | (self.eq as u8) << 1 | self.so as u8
    }
}

/// The condition register (CR) contains 8 fields, named CR0-CR7, each containing flags
/// corresponding to some comparison operation.
///
/// There are two special cases:
/// - CR0: Integer instructions which have the `Rc` flag set update CR0 to contain comparisons to
///   zero and an overflow bit.
/// - CR1: Floating point instructions which have the `Rc` flag set update CR1 to contain a copy of
///   bits 0..4 of the FPSCR, indicating floating point exception status.
///
/// Other than that, comparison instructions specify one of the fields to receive the results of
/// the comparison.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoBytes, FromBytes, Immutable)]
pub struct CondReg(pub u32);

impl CondReg {
    // NOTE: CR0 is the most significant nibble! PPC bit order is big endian
    #[inline(always)]
    const fn shift(index: usize) -> u32 {
        4 * (7 - index as u32)
    }

    /// Returns field CR`index`.
    pub fn field(self, index: usize) -> Cond {
        let shift = Self::shift(index);
        Cond::from_nibble(self.0.bits(shift, shift + 4) as u8)
    }

    /// Sets field CR`index`.
    pub fn set_field(&mut self, index: usize, cond: Cond) {
        let shift = Self::shift(index);
        self.0 = self.0.with_bits(shift, shift + 4, cond.to_nibble() as u32);
    }

    /// Returns CR bit `index`, in PowerPC numbering.
    pub fn bit(self, index: u8) -> bool {
        self.0.bit(31 - index as u32)
    }

    /// Sets CR bit `index`, in PowerPC numbering.
    pub fn set_bit(&mut self, index: u8, value: bool) {
        self.0 = self.0.with_bit(31 - index as u32, value);
    }
}

/// The Machine State register.
#[bitos(32)]
#[derive(Debug, Clone, PartialEq)]
pub struct MachineState {
    /// Whether little endian mode is turned on. Not supported.
    #[bits(0)]
    pub little_endian: bool,
    /// Whether the last exception is recoverable.
    #[bits(1)]
    pub recoverable_exception: bool,
    /// Whether data address translation is enabled.
    #[bits(4)]
    pub data_addr_translation: bool,
    /// Whether instruction address translation is enabled.
    #[bits(5)]
    pub instr_addr_translation: bool,
    /// Whether exception vectors are at 0x0000_nnnn (off) or 0xFFF0_nnnn (on).
    #[bits(6)]
    pub exception_prefix: bool,
    #[bits(8)]
    pub float_exception_mode_1: bool,
    #[bits(11)]
    pub float_exception_mode_0: bool,
    /// Whether machine check exceptions are enabled. Not supported.
    #[bits(12)]
    pub machine_check: bool,
    /// Whether floating point instructions can be used.
    #[bits(13)]
    pub float_available: bool,
    /// Whether the processor is running in user mode.
    #[bits(14)]
    pub user_mode: bool,
    /// Whether external exceptions are enabled.
    #[bits(15)]
    pub interrupts: bool,
    /// Whether the CPU should be set to little endian mode after an exception occurs. Not
    /// supported.
    #[bits(16)]
    pub exception_little_endian: bool,
}

impl Default for MachineState {
    fn default() -> Self {
        Self(0).with_exception_prefix(true)
    }
}

impl MachineState {
    pub fn enter_exception_mode(&mut self) {
        let prev = self.clone();
        *self = MachineState::from_bits(0)
            .with_little_endian(prev.exception_little_endian())
            .with_exception_prefix(prev.exception_prefix())
            .with_machine_check(prev.machine_check())
            .with_exception_little_endian(prev.exception_little_endian());
    }
}

/// The XER register contains information about overflow and carry operations, and is also used by
/// the load/store string indexed instructions.
#[bitos(32)]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XerReg {
    /// The number of bytes to be transferred by a lswx or stswx.
    #[bits(0..7)]
    pub byte_count: u7,
    /// Used by carrying instructions, contains the carry bit of the result.
    #[bits(29)]
    pub carry: bool,
    /// Whether an overflow has occured.
    #[bits(30)]
    pub overflow: bool,
    /// Set whenever the overflow bit is set and stays set until cleared by specific instructions.
    #[bits(31)]
    pub overflow_fuse: bool,
}

/// Result of a floating point comparison, encoded the same way as a CR field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum FloatCond {
    Unordered   = 0b0001,
    Equal       = 0b0010,
    GreaterThan = 0b0100,
    LessThan    = 0b1000,
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatRounding {
    Nearest       = 0b00,
    TowardsZero   = 0b01,
    TowardsPosInf = 0b10,
    TowardsNegInf = 0b11,
}

/// The Floating Point Status and Control Register. Status updates must go through the
/// operations in [`fpu`], which keep the summary bits consistent.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FloatControlReg {
    /// Floating-point rounding mode.
    #[bits(0..2)]
    pub rounding: FloatRounding,
    /// Whether IEEE conformance is disabled.
    #[bits(2)]
    pub ieee_disabled: bool,
    /// Whether inexact exceptions are enabled.
    #[bits(3)]
    pub inexact_exception_enabled: bool,
    /// Whether zero divide exceptions are enabled.
    #[bits(4)]
    pub zero_divide_exception_enabled: bool,
    /// Whether underflow exceptions are enabled.
    #[bits(5)]
    pub underflow_exception_enabled: bool,
    /// Whether overflow exceptions are enabled.
    #[bits(6)]
    pub overflow_exception_enabled: bool,
    /// Whether invalid operation exceptions are enabled.
    #[bits(7)]
    pub invalid_exception_enabled: bool,
    /// Invalid operation exception for invalid integer conversion.
    #[bits(8)]
    pub invalid_conversion_exception: bool,
    /// Invalid operation exception for invalid square root.
    #[bits(9)]
    pub invalid_sqrt_exception: bool,
    /// Invalid operation exception for software request.
    #[bits(10)]
    pub invalid_soft_exception: bool,
    /// Result flags (class bit followed by the FPCC). See [`fpu::classify`].
    #[bits(12..17)]
    pub fprf: u5,
    /// Whether the last arithmethic or rounding and conversion instruction rounded an intermediate
    /// result or caused a disabled overflow exception.
    #[bits(17)]
    pub fraction_inexact: bool,
    /// Whether the last arithmethic or rounding and conversion instruction that rounded an
    /// intermediate result incremented the fraction.
    #[bits(18)]
    pub fraction_rounded: bool,
    /// Invalid operation exception for invalid comparison.
    #[bits(19)]
    pub invalid_compare_exception: bool,
    /// Invalid operation exception for `inf * zero`.
    #[bits(20)]
    pub invalid_inf_mul_zero_exception: bool,
    /// Invalid operation exception for `zero / zero`.
    #[bits(21)]
    pub invalid_zero_div_zero_exception: bool,
    /// Invalid operation exception for `inf / inf`.
    #[bits(22)]
    pub invalid_inf_div_inf_exception: bool,
    /// Invalid operation exception for `inf - inf`.
    #[bits(23)]
    pub invalid_inf_sub_inf_exception: bool,
    /// Invalid operation exception for signaling NaN.
    #[bits(24)]
    pub invalid_snan_exception: bool,
    /// Inexact exception.
    #[bits(25)]
    pub inexact_exception: bool,
    /// Zero divide exception.
    #[bits(26)]
    pub zero_divide_exception: bool,
    /// Underflow exception.
    #[bits(27)]
    pub underflow_exception: bool,
    /// Overflow exception.
    #[bits(28)]
    pub overflow_exception: bool,
    /// Floating-point exception summary, i.e. whether any of the invalid operation exception bits
    /// have been set. This bit cannot be changed by software.
    #[bits(29)]
    pub invalid_op_exception_summary: bool,
    /// Same as the floating-point exception summary, except it only considers enabled exceptions.
    /// This bit cannot be changed by software.
    #[bits(30)]
    pub enabled_exception_summary: bool,
    /// Floating-point exception summary, i.e. whether any of the exception bits have been set.
    #[bits(31)]
    pub exception_summary: bool,
}

/// A pair of double precision floating point numbers, used by the paired singles extension.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(transparent)]
pub struct FloatPair(pub [f64; 2]);

impl std::ops::Deref for FloatPair {
    type Target = [f64; 2];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for FloatPair {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// User level registers.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct User {
    /// General Purpose Registers
    pub gpr: [u32; 32],
    /// Floating Point Registers
    pub fpr: [FloatPair; 32],
    /// Condition Register
    pub cr: CondReg,
    /// Floating Point Status and Condition Register
    pub fpscr: FloatControlReg,

    /// XER Register
    pub xer: XerReg,
    /// Link Register
    pub lr: u32,
    /// Count Register
    pub ctr: u32,
}

/// A quantized type.
#[bitos(3)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantizedType {
    #[default]
    Float,
    Reserved0,
    Reserved1,
    Reserved2,
    U8,
    U16,
    I8,
    I16,
}

impl QuantizedType {
    /// Size of this type in memory. Reserved types behave like floats.
    pub fn size(&self) -> u32 {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            _ => 4,
        }
    }
}

/// A graphics quantization register.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuantReg {
    /// Type of operand resulting from a conversion by a store instruction
    #[bits(0..3)]
    pub store_type: QuantizedType,
    /// Scale used by a store instruction
    #[bits(8..14)]
    pub store_scale: i6,
    /// Type of operand resulting from a conversion by a load instruction
    #[bits(16..19)]
    pub load_type: QuantizedType,
    /// Scale used by a load instruction
    #[bits(24..30)]
    pub load_scale: i6,
}

pub static DEQUANTIZATION_LUT: [f64; 1 << 6] = {
    let mut result = [0.0; 1 << 6];

    let mut i = 0;
    loop {
        let scale = ((i as i8) << 2) >> 2;
        let exp = scale.unsigned_abs();
        let factor = if scale >= 0 {
            1.0 / ((1u64 << exp) as f64)
        } else {
            (1u64 << exp) as f64
        };

        result[i as usize] = factor;

        i += 1;
        if i >= (1 << 6) {
            break;
        }
    }

    result
};

pub static QUANTIZATION_LUT: [f64; 1 << 6] = {
    let mut result = DEQUANTIZATION_LUT;

    let mut i = 0;
    loop {
        result[i] = 1.0 / result[i];

        i += 1;
        if i >= (1 << 6) {
            break;
        }
    }

    result
};

/// Supervisor level registers.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Supervisor {
    /// Machine State Register
    pub msr: MachineState,
    /// Save and Restore Registers
    pub srr: [u32; 2],
    /// Registers provided for the use of the operating system
    pub sprg: [u32; 4],
    /// Data Address Register
    pub dar: u32,
    /// Data Storage Interrupt Status Register
    pub dsisr: u32,
    /// Graphics Quantization registers
    pub gqr: [QuantReg; 8],
    /// Hardware Implementation Dependent register 2, controls the paired singles extension
    pub hid2: u32,
}

/// Structure of all the registers in the PowerPC Gekko CPU.
///
/// This is the canonical register file: its layout is part of the contract with JIT compiled
/// code, which addresses registers through [`Reg::offset`].
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cpu {
    /// Program Counter
    pub pc: Address,
    /// User level registers
    pub user: User,
    /// Supervisor level registers
    pub supervisor: Supervisor,
}

impl Cpu {
    /// Takes an exception.
    pub fn raise_exception(&mut self, exception: Exception) {
        if exception == Exception::Decrementer {
            tracing::trace!("raised exception {exception:?} at {}", self.pc);
        } else {
            tracing::debug!("raised exception {exception:?} at {}", self.pc);
        }

        // save PC into SRR0
        self.supervisor.srr[0] = self.pc.value();
        if exception.srr0_skip() {
            self.supervisor.srr[0] += 4;
        }

        // save MSR into SRR1
        let mask = Exception::MSR_TO_SRR1_MASK;
        self.supervisor.srr[1] &= !mask;
        self.supervisor.srr[1] |= self.supervisor.msr.to_bits() & mask;

        // exception specific bits are set by the callers that know them
        self.supervisor.srr[1] &= !Exception::SPECIAL_SRR1_BITS_MASK;

        // update MSR
        self.supervisor.msr.enter_exception_mode();

        // jump to exception vector
        let base = if self.supervisor.msr.exception_prefix() {
            0xFFF0_0000
        } else {
            0x0000_0000
        };

        self.pc = Address(base | exception as u32);
    }

    /// Takes a program exception with the given reason.
    pub fn raise_program(&mut self, reason: ProgramReason) {
        self.raise_exception(Exception::Program);
        self.supervisor.srr[1] |= reason.srr1_bit();
    }

    /// Takes a data storage exception caused by an access to `addr`.
    pub fn raise_dsi(&mut self, addr: Address, store: bool) {
        self.supervisor.dar = addr.value();
        self.supervisor.dsisr = if store { 1 << 25 } else { 0 } | 1 << 30;
        self.raise_exception(Exception::DSI);
    }
}

/// A General Purpose Register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, VariantArray)]
#[repr(u8)]
pub enum GPR {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    R16,
    R17,
    R18,
    R19,
    R20,
    R21,
    R22,
    R23,
    R24,
    R25,
    R26,
    R27,
    R28,
    R29,
    R30,
    R31,
}

impl GPR {
    /// Creates a new GPR with the given index. Only the lower 5 bits are considered.
    #[inline(always)]
    pub fn new(index: u8) -> Self {
        Self::VARIANTS[(index & 0x1F) as usize]
    }

    /// Index of this GPR.
    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Offset of this GPR in the [`Cpu`] struct.
    #[inline(always)]
    pub fn offset(self) -> usize {
        offset_of!(Cpu, user.gpr) + size_of::<u32>() * (self as usize)
    }
}

/// A Floating Point Register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, VariantArray)]
#[repr(u8)]
pub enum FPR {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    R16,
    R17,
    R18,
    R19,
    R20,
    R21,
    R22,
    R23,
    R24,
    R25,
    R26,
    R27,
    R28,
    R29,
    R30,
    R31,
}

impl FPR {
    /// Creates a new FPR with the given index. Only the lower 5 bits are considered.
    #[inline(always)]
    pub fn new(index: u8) -> Self {
        Self::VARIANTS[(index & 0x1F) as usize]
    }

    /// Index of this FPR.
    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Offset of this FPR (i.e. of its first lane, ps0) in the [`Cpu`] struct.
    #[inline(always)]
    pub fn offset(self) -> usize {
        offset_of!(Cpu, user.fpr) + size_of::<FloatPair>() * (self as usize)
    }

    /// Offset of lane `lane` (0 for ps0, 1 for ps1) of this FPR in the [`Cpu`] struct.
    #[inline(always)]
    pub fn lane_offset(self, lane: usize) -> usize {
        self.offset() + size_of::<f64>() * lane
    }
}

/// A Special Purpose Register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, VariantArray)]
#[repr(u16)]
pub enum SPR {
    XER    = 1,
    LR     = 8,
    CTR    = 9,
    DSISR  = 18,
    DAR    = 19,
    SRR0   = 26,
    SRR1   = 27,
    SPRG0  = 272,
    SPRG1  = 273,
    SPRG2  = 274,
    SPRG3  = 275,
    GQR0   = 912,
    GQR1   = 913,
    GQR2   = 914,
    GQR3   = 915,
    GQR4   = 916,
    GQR5   = 917,
    GQR6   = 918,
    GQR7   = 919,
    HID2   = 920,
}

impl SPR {
    pub const GQR: [Self; 8] = [
        Self::GQR0,
        Self::GQR1,
        Self::GQR2,
        Self::GQR3,
        Self::GQR4,
        Self::GQR5,
        Self::GQR6,
        Self::GQR7,
    ];

    /// Offset of this SPR in the [`Cpu`] struct.
    pub fn offset(self) -> usize {
        let word = size_of::<u32>();
        match self {
            Self::XER => offset_of!(Cpu, user.xer),
            Self::LR => offset_of!(Cpu, user.lr),
            Self::CTR => offset_of!(Cpu, user.ctr),
            Self::DSISR => offset_of!(Cpu, supervisor.dsisr),
            Self::DAR => offset_of!(Cpu, supervisor.dar),
            Self::SRR0 => offset_of!(Cpu, supervisor.srr),
            Self::SRR1 => offset_of!(Cpu, supervisor.srr) + word,
            Self::SPRG0 | Self::SPRG1 | Self::SPRG2 | Self::SPRG3 => {
                offset_of!(Cpu, supervisor.sprg) + word * (self as usize - Self::SPRG0 as usize)
            }
            Self::HID2 => offset_of!(Cpu, supervisor.hid2),
            gqr => {
                debug_assert!(gqr.is_gqr());
                offset_of!(Cpu, supervisor.gqr) + word * (gqr as usize - Self::GQR0 as usize)
            }
        }
    }

    pub fn is_gqr(&self) -> bool {
        matches!(
            self,
            Self::GQR0
                | Self::GQR1
                | Self::GQR2
                | Self::GQR3
                | Self::GQR4
                | Self::GQR5
                | Self::GQR6
                | Self::GQR7
        )
    }

    /// Whether this register can only be accessed in supervisor mode.
    pub fn is_privileged(&self) -> bool {
        !matches!(self, Self::XER | Self::LR | Self::CTR)
    }
}

/// A register in the Gekko CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    GPR(GPR),
    FPR(FPR),
    SPR(SPR),
    PC,
    MSR,
    CR,
    FPSCR,
}

impl Reg {
    /// Offset of this register in the [`Cpu`] struct.
    #[inline(always)]
    pub fn offset(self) -> usize {
        match self {
            Self::GPR(gpr) => gpr.offset(),
            Self::FPR(fpr) => fpr.offset(),
            Self::SPR(spr) => spr.offset(),
            Self::PC => offset_of!(Cpu, pc),
            Self::MSR => offset_of!(Cpu, supervisor.msr),
            Self::CR => offset_of!(Cpu, user.cr),
            Self::FPSCR => offset_of!(Cpu, user.fpscr),
        }
    }
}

impl From<GPR> for Reg {
    #[inline(always)]
    fn from(value: GPR) -> Self {
        Self::GPR(value)
    }
}

impl From<FPR> for Reg {
    #[inline(always)]
    fn from(value: FPR) -> Self {
        Self::FPR(value)
    }
}

impl From<SPR> for Reg {
    #[inline(always)]
    fn from(value: SPR) -> Self {
        Self::SPR(value)
    }
}
