//! FPU status emulation.
//!
//! Every floating point operation whose result or status is guest visible goes through this
//! module, both from JIT compiled code (through runtime helpers) and from the interpreter. This
//! keeps the FPSCR semantics in a single place: sticky exception bits, the FX/FEX/VX summaries,
//! FPRF, FI and FR, rounding modes, NaN canonicalisation and integer conversion saturation.
//!
//! Arithmetic is computed with the host in its default round-to-nearest mode together with an
//! error-free residual (the difference between the exact result and the rounded one). Directed
//! rounding is then applied in software from the sign of the residual, so the host floating point
//! environment is never modified.

use bitos::integer::u5;
use strum::FromRepr;

use crate::{CondReg, Cond, FloatCond, FloatControlReg, FloatRounding};

/// The canonical quiet NaN produced by invalid operations.
pub const QNAN: u64 = 0x7FF8_0000_0000_0000;

const FX: u32 = 1 << 31;
const FEX: u32 = 1 << 30;
const VX: u32 = 1 << 29;

/// Every invalid operation exception bit.
const INVALID: u32 = 0x01F8_0700;
/// Every exception bit, including FX but not the VX and FEX summaries.
const ANY_EXCEPTION: u32 = 0x9FF8_0700;

/// A floating point exception, with the value of its bit in the FPSCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum FpException {
    /// Overflow (OX)
    Overflow           = 1 << 28,
    /// Underflow (UX)
    Underflow          = 1 << 27,
    /// Zero divide (ZX)
    ZeroDivide         = 1 << 26,
    /// Inexact (XX)
    Inexact            = 1 << 25,
    /// Invalid operation: signaling NaN (VXSNAN)
    InvalidSNaN        = 1 << 24,
    /// Invalid operation: `inf - inf` (VXISI)
    InvalidInfSubInf   = 1 << 23,
    /// Invalid operation: `inf / inf` (VXIDI)
    InvalidInfDivInf   = 1 << 22,
    /// Invalid operation: `0 / 0` (VXZDZ)
    InvalidZeroDivZero = 1 << 21,
    /// Invalid operation: `inf * 0` (VXIMZ)
    InvalidInfMulZero  = 1 << 20,
    /// Invalid operation: ordered comparison involving a NaN (VXVC)
    InvalidCompare     = 1 << 19,
    /// Invalid operation: software request (VXSOFT)
    InvalidSoft        = 1 << 10,
    /// Invalid operation: square root of a negative number (VXSQRT)
    InvalidSqrt        = 1 << 9,
    /// Invalid operation: integer conversion (VXCVI)
    InvalidConversion  = 1 << 8,
}

impl FpException {
    /// The FPSCR bit of this exception.
    #[inline(always)]
    pub const fn mask(self) -> u32 {
        self as u32
    }
}

/// A floating point arithmetic operation. Operand roles follow the PowerPC instructions: products
/// are `a * c`, the addend of fused operations is `b` and reciprocal estimates use `b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum FpOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * c`
    Mul,
    /// `a / b`
    Div,
    /// `a * c + b`
    MulAdd,
    /// `a * c - b`
    MulSub,
    /// `-(a * c + b)`
    NegMulAdd,
    /// `-(a * c - b)`
    NegMulSub,
    /// `1 / b`
    Reciprocal,
    /// `1 / sqrt(b)`
    ReciprocalSqrt,
}

impl FpOp {
    /// The operation of an A-form arithmetic instruction of tables 4, 59 and 63, given its 5-bit
    /// extended opcode.
    pub const fn from_extended(subop5: u8) -> Option<Self> {
        Some(match subop5 {
            18 => Self::Div,
            20 => Self::Sub,
            21 => Self::Add,
            24 => Self::Reciprocal,
            25 => Self::Mul,
            26 => Self::ReciprocalSqrt,
            28 => Self::MulSub,
            29 => Self::MulAdd,
            30 => Self::NegMulSub,
            31 => Self::NegMulAdd,
            _ => return None,
        })
    }

    fn operands(self, a: f64, b: f64, c: f64) -> ([f64; 3], usize) {
        match self {
            Self::Add | Self::Sub | Self::Div => ([a, b, 0.0], 2),
            Self::Mul => ([a, c, 0.0], 2),
            Self::MulAdd | Self::MulSub | Self::NegMulAdd | Self::NegMulSub => ([a, b, c], 3),
            Self::Reciprocal | Self::ReciprocalSqrt => ([b, 0.0, 0.0], 1),
        }
    }

    fn negated(self) -> bool {
        matches!(self, Self::NegMulAdd | Self::NegMulSub)
    }

    /// Returns the invalid operation exception raised by this operation on non-NaN operands, if
    /// any.
    fn invalid_operation(self, a: f64, b: f64, c: f64) -> Option<FpException> {
        let inf_mul_zero = |x: f64, y: f64| {
            (x.is_infinite() && y == 0.0) || (x == 0.0 && y.is_infinite())
        };

        match self {
            Self::Add | Self::Sub => {
                let b = if self == Self::Sub { -b } else { b };
                (a.is_infinite() && b.is_infinite() && a.is_sign_negative() != b.is_sign_negative())
                    .then_some(FpException::InvalidInfSubInf)
            }
            Self::Mul => inf_mul_zero(a, c).then_some(FpException::InvalidInfMulZero),
            Self::Div => {
                if a.is_infinite() && b.is_infinite() {
                    Some(FpException::InvalidInfDivInf)
                } else if a == 0.0 && b == 0.0 {
                    Some(FpException::InvalidZeroDivZero)
                } else {
                    None
                }
            }
            Self::MulAdd | Self::MulSub | Self::NegMulAdd | Self::NegMulSub => {
                if inf_mul_zero(a, c) {
                    return Some(FpException::InvalidInfMulZero);
                }

                let product_inf = a.is_infinite() || c.is_infinite();
                let product_negative = a.is_sign_negative() != c.is_sign_negative();
                let addend_negative = match self {
                    Self::MulAdd | Self::NegMulAdd => b.is_sign_negative(),
                    _ => !b.is_sign_negative(),
                };

                (product_inf && b.is_infinite() && product_negative != addend_negative)
                    .then_some(FpException::InvalidInfSubInf)
            }
            Self::Reciprocal => None,
            Self::ReciprocalSqrt => {
                (b < 0.0).then_some(FpException::InvalidSqrt)
            }
        }
    }

    /// The two terms summed by additive operations, as whether each is zero and whether it is
    /// negative. Products are described by the signs of their factors.
    fn addends(self, a: f64, b: f64, c: f64) -> Option<[(bool, bool); 2]> {
        let term = |x: f64| (x == 0.0, x.is_sign_negative());
        let product = (a == 0.0 || c == 0.0, a.is_sign_negative() != c.is_sign_negative());

        match self {
            Self::Add => Some([term(a), term(b)]),
            Self::Sub => Some([term(a), term(-b)]),
            Self::MulAdd | Self::NegMulAdd => Some([product, term(b)]),
            Self::MulSub | Self::NegMulSub => Some([product, term(-b)]),
            _ => None,
        }
    }

    /// Computes the round-to-nearest result of this operation along with a residual whose sign is
    /// the sign of `exact - result` (zero if the result is exact).
    fn compute(self, a: f64, b: f64, c: f64) -> (f64, f64) {
        let (value, residual) = match self {
            Self::Add => two_sum(a, b),
            Self::Sub => two_sum(a, -b),
            Self::Mul => two_product(a, c),
            Self::Div => quotient(a, b),
            Self::MulAdd | Self::NegMulAdd => fused(a, c, b),
            Self::MulSub | Self::NegMulSub => fused(a, c, -b),
            Self::Reciprocal => quotient(1.0, b),
            Self::ReciprocalSqrt => reciprocal_sqrt(b),
        };

        if value.is_finite() && residual.is_finite() {
            (value, residual)
        } else {
            (value, 0.0)
        }
    }
}

fn two_sum(a: f64, b: f64) -> (f64, f64) {
    let sum = a + b;
    let b_virtual = sum - a;
    let a_virtual = sum - b_virtual;
    let residual = (a - a_virtual) + (b - b_virtual);
    (sum, residual)
}

fn two_product(a: f64, b: f64) -> (f64, f64) {
    let product = a * b;
    (product, a.mul_add(b, -product))
}

/// Keeps the sign of `exact - rounded` when the residual underflows.
fn nonzero_residual(remainder: f64, residual: f64) -> f64 {
    if remainder != 0.0 && residual == 0.0 {
        f64::from_bits(1).copysign(remainder)
    } else {
        residual
    }
}

fn quotient(a: f64, b: f64) -> (f64, f64) {
    let quotient = a / b;
    let remainder = (-quotient).mul_add(b, a);
    let residual = remainder / b;
    let sign = if b.is_sign_negative() { -remainder } else { remainder };
    (quotient, nonzero_residual(sign, residual))
}

fn fused(a: f64, c: f64, b: f64) -> (f64, f64) {
    let value = a.mul_add(c, b);
    let (product, product_err) = two_product(a, c);
    let (sum, sum_err) = two_sum(product, b);

    // the unfused sum approximates the exact result up to the product error
    let residual = (sum - value) + sum_err + product_err;
    (value, residual)
}

fn reciprocal_sqrt(b: f64) -> (f64, f64) {
    let value = 1.0 / b.sqrt();
    // sign of 1 - value^2 * b is the sign of exact - value
    let (square, square_err) = two_product(value, value);
    let remainder = (-square).mul_add(b, 1.0) - square_err * b;
    (value, nonzero_residual(remainder, remainder * value))
}

/// Whether `value` is a signaling NaN.
#[inline(always)]
pub fn is_snan(value: f64) -> bool {
    value.is_nan() && (value.to_bits() & (1 << 51)) == 0
}

/// Forces NaNs into the canonical quiet NaN bit pattern.
#[inline(always)]
pub fn canonicalize_nan(value: f64) -> f64 {
    if value.is_nan() {
        f64::from_bits(QNAN)
    } else {
        value
    }
}

/// Returns the FPRF code (class bit followed by FPCC) of a result.
pub fn classify(value: f64, single: bool) -> u8 {
    let negative = value.is_sign_negative();
    if value.is_nan() {
        0b1_0001
    } else if value.is_infinite() {
        if negative { 0b0_1001 } else { 0b0_0101 }
    } else if value == 0.0 {
        if negative { 0b1_0010 } else { 0b0_0010 }
    } else {
        let min_normal = if single {
            f32::MIN_POSITIVE as f64
        } else {
            f64::MIN_POSITIVE
        };

        match (negative, value.abs() < min_normal) {
            (true, true) => 0b1_1000,
            (true, false) => 0b0_1000,
            (false, true) => 0b1_0100,
            (false, false) => 0b0_0100,
        }
    }
}

/// Mirrors the exception summary of the FPSCR (FX, FEX, VX, OX) into CR1.
pub fn update_record_bits(cr: &mut CondReg, fpscr: &FloatControlReg) {
    cr.set_field(1, Cond::from_nibble((fpscr.to_bits() >> 28) as u8));
}

/// Recomputes the VX and FEX summaries of raw FPSCR bits.
fn summarize(bits: u32) -> u32 {
    let bits = if bits & INVALID != 0 {
        bits | VX
    } else {
        bits & !VX
    };

    // VX, OX, UX, ZX, XX (bits 29..25) line up with VE, OE, UE, ZE, XE (bits 7..3)
    if (bits >> 22) & bits & 0xF8 != 0 {
        bits | FEX
    } else {
        bits & !FEX
    }
}

/// The outcome of rounding a result to its destination precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rounded {
    /// The rounded value.
    pub value: f64,
    /// Whether the rounded value differs from the exact result.
    pub inexact: bool,
    /// Whether the magnitude of the rounded value is greater than that of the exact result.
    pub increased: bool,
    /// Whether the exact result was too large for the destination precision.
    pub overflow: bool,
}

impl Rounded {
    fn exact(value: f64) -> Self {
        Self {
            value,
            inexact: false,
            increased: false,
            overflow: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    None,
    Up,
    Down,
}

/// Host rounding control equivalent to a guest rounding mode.
///
/// The host environment always stays in round-to-nearest. Rounding to the guest mode happens in
/// [`HostRounding::round`], so there is nothing to restore once the operation is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRounding {
    mode: FloatRounding,
}

/// Translates a guest rounding mode to the host rounding control used by this module.
pub fn apply_rounding_mode(mode: FloatRounding) -> HostRounding {
    HostRounding { mode }
}

impl HostRounding {
    /// The guest rounding mode this control implements.
    pub fn mode(self) -> FloatRounding {
        self.mode
    }

    fn directed_step(self, negative: bool, residual: f64) -> Step {
        match self.mode {
            FloatRounding::Nearest => Step::None,
            FloatRounding::TowardsZero => {
                if residual > 0.0 && negative {
                    Step::Up
                } else if residual < 0.0 && !negative {
                    Step::Down
                } else {
                    Step::None
                }
            }
            FloatRounding::TowardsPosInf if residual > 0.0 => Step::Up,
            FloatRounding::TowardsNegInf if residual < 0.0 => Step::Down,
            _ => Step::None,
        }
    }

    /// Result of an overflow with the given sign, where `max` is the largest finite value of the
    /// destination precision.
    fn overflow(self, negative: bool, max: f64) -> Rounded {
        let infinite = match self.mode {
            FloatRounding::Nearest => true,
            FloatRounding::TowardsZero => false,
            FloatRounding::TowardsPosInf => !negative,
            FloatRounding::TowardsNegInf => negative,
        };

        let magnitude = if infinite { f64::INFINITY } else { max };
        Rounded {
            value: if negative { -magnitude } else { magnitude },
            inexact: true,
            increased: infinite,
            overflow: true,
        }
    }

    fn finish(value: f64, stepped: f64, step: Step, residual: f64, inexact: bool) -> Rounded {
        let negative = value.is_sign_negative();
        let increased = match step {
            Step::Up => !negative,
            Step::Down => negative,
            Step::None => value != 0.0 && inexact && (residual < 0.0) != negative,
        };

        Rounded {
            value: stepped,
            inexact,
            increased,
            overflow: false,
        }
    }

    fn round_double(self, value: f64, residual: f64) -> Rounded {
        if value.is_infinite() {
            return self.overflow(value.is_sign_negative(), f64::MAX);
        }

        let step = self.directed_step(value.is_sign_negative(), residual);
        let stepped = match step {
            Step::None => value,
            Step::Up => value.next_up(),
            Step::Down => value.next_down(),
        };

        if stepped.is_infinite() {
            return self.overflow(stepped.is_sign_negative(), f64::MAX);
        }

        Self::finish(value, stepped, step, residual, residual != 0.0)
    }

    fn round_single(self, value: f64, residual: f64) -> Rounded {
        const MAX: f64 = f32::MAX as f64;

        let nearest = value as f32;
        if nearest.is_infinite() {
            return self.overflow(value.is_sign_negative(), MAX);
        }

        // exact in double precision
        let diff = value - nearest as f64;
        let total = if diff == 0.0 { residual } else { diff + residual };
        let inexact = diff != 0.0 || residual != 0.0;

        let step = match self.mode {
            FloatRounding::Nearest => {
                // the double result may sit exactly between two singles while the exact result
                // does not, in which case the residual decides
                let toward = if diff > 0.0 {
                    nearest.next_up()
                } else {
                    nearest.next_down()
                };

                let tie = diff != 0.0 && (toward as f64 - value).abs() == diff.abs();
                if tie && residual != 0.0 && (residual > 0.0) == (diff > 0.0) {
                    if diff > 0.0 { Step::Up } else { Step::Down }
                } else {
                    Step::None
                }
            }
            _ => self.directed_step(nearest.is_sign_negative(), total),
        };

        let stepped = match step {
            Step::None => nearest,
            Step::Up => nearest.next_up(),
            Step::Down => nearest.next_down(),
        };

        if stepped.is_infinite() {
            return self.overflow(stepped.is_sign_negative(), MAX);
        }

        Self::finish(nearest as f64, stepped as f64, step, total, inexact)
    }

    /// Rounds `value`, the round-to-nearest double precision result of an operation whose exact
    /// result is `value + residual`, to the given precision in this rounding mode.
    pub fn round(self, value: f64, residual: f64, single: bool) -> Rounded {
        if single {
            self.round_single(value, residual)
        } else {
            self.round_double(value, residual)
        }
    }
}

/// Rounds `value` to an integral value in the given rounding mode.
fn round_integral(value: f64, mode: FloatRounding) -> f64 {
    match mode {
        FloatRounding::Nearest => value.round_ties_even(),
        FloatRounding::TowardsZero => value.trunc(),
        FloatRounding::TowardsPosInf => value.ceil(),
        FloatRounding::TowardsNegInf => value.floor(),
    }
}

/// Converts `value` to a 32-bit integer in the given rounding mode, saturating at the bounds.
/// Returns the converted value and whether the conversion was invalid (out of range or NaN).
pub fn clamp_for_integer_conversion(value: f64, mode: FloatRounding) -> (i32, bool) {
    if value.is_nan() {
        return (i32::MIN, true);
    }

    let rounded = round_integral(value, mode);
    if rounded > i32::MAX as f64 {
        (i32::MAX, true)
    } else if rounded < i32::MIN as f64 {
        (i32::MIN, true)
    } else {
        (rounded as i32, false)
    }
}

/// Describes an arithmetic lane: the operation, the destination precision and whether the
/// non-sticky status (FPRF, FI, FR) is updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithKind {
    pub op: FpOp,
    pub single: bool,
    pub fprf: bool,
}

impl ArithKind {
    /// Lane kinds of a paired single operation. Only ps0 updates FPRF, FI and FR.
    pub const fn paired(op: FpOp) -> [Self; 2] {
        [
            Self {
                op,
                single: true,
                fprf: true,
            },
            Self {
                op,
                single: true,
                fprf: false,
            },
        ]
    }

    /// Packs this kind into an integer, used to pass it to runtime helpers.
    pub const fn to_bits(self) -> u32 {
        self.op as u32 | (self.single as u32) << 8 | (self.fprf as u32) << 9
    }

    /// Unpacks a kind packed with [`ArithKind::to_bits`].
    pub fn from_bits(bits: u32) -> Option<Self> {
        Some(Self {
            op: FpOp::from_repr(bits as u8)?,
            single: bits & (1 << 8) != 0,
            fprf: bits & (1 << 9) != 0,
        })
    }
}

impl FloatControlReg {
    /// Sets the sticky bit of an exception. If the bit transitions from clear to set, FX is set
    /// too. Returns whether the transition happened.
    pub fn set_exception(&mut self, exception: FpException) -> bool {
        let bits = self.to_bits();
        let transition = bits & exception.mask() == 0;

        let mut bits = bits | exception.mask();
        if transition {
            bits |= FX;
        }

        *self = Self::from_bits(summarize(bits));
        transition
    }

    /// Recomputes the VX and FEX summaries.
    pub fn update_summaries(&mut self) {
        *self = Self::from_bits(summarize(self.to_bits()));
    }

    fn set_status(&mut self, kind: ArithKind, result: f64, rounded: &Rounded) {
        if kind.fprf {
            self.set_fraction_inexact(rounded.inexact);
            self.set_fraction_rounded(rounded.inexact && rounded.increased);
            self.set_fprf(u5::new(classify(result, kind.single)));
        }
    }

    fn invalid_result(&mut self, kind: ArithKind) -> f64 {
        let result = f64::from_bits(QNAN);
        self.set_status(kind, result, &Rounded::exact(result));
        result
    }

    /// The sign of an exactly zero sum. Cancelling terms and zeros of opposite signs give -0 when
    /// rounding towards -inf and +0 otherwise. Zeros of the same sign keep it, which the host
    /// already does.
    fn exact_zero_sum(&self, op: FpOp, a: f64, b: f64, c: f64) -> Option<f64> {
        let [(x_zero, x_negative), (y_zero, y_negative)] = op.addends(a, b, c)?;
        if x_zero != y_zero || (x_zero && x_negative == y_negative) {
            return None;
        }

        Some(if self.rounding() == FloatRounding::TowardsNegInf {
            -0.0
        } else {
            0.0
        })
    }

    /// Performs one arithmetic lane, updating the status bits and returning the result.
    ///
    /// Invalid operations and NaN operands produce the canonical quiet NaN. The result is always
    /// written, i.e. the trapping behaviour of enabled invalid operation and zero divide
    /// exceptions is not emulated, FEX is set instead.
    pub fn arith(&mut self, kind: ArithKind, a: f64, b: f64, c: f64) -> f64 {
        let op = kind.op;
        let (operands, count) = op.operands(a, b, c);
        let operands = &operands[..count];

        if operands.iter().any(|x| is_snan(*x)) {
            self.set_exception(FpException::InvalidSNaN);
        }

        if operands.iter().any(|x| x.is_nan()) {
            return self.invalid_result(kind);
        }

        if let Some(exception) = op.invalid_operation(a, b, c) {
            self.set_exception(exception);
            return self.invalid_result(kind);
        }

        // an infinite dividend gives an exact infinity
        let divisor_zero = match op {
            FpOp::Div => a.is_finite() && b == 0.0,
            FpOp::Reciprocal | FpOp::ReciprocalSqrt => b == 0.0,
            _ => false,
        };

        if divisor_zero {
            self.set_exception(FpException::ZeroDivide);
            let result = match op {
                FpOp::Div => a / b,
                FpOp::Reciprocal => 1.0 / b,
                _ => f64::INFINITY.copysign(b),
            };

            self.set_status(kind, result, &Rounded::exact(result));
            return result;
        }

        let (mut value, residual) = op.compute(a, b, c);
        if value == 0.0 && residual == 0.0 {
            value = self.exact_zero_sum(op, a, b, c).unwrap_or(value);
        }

        let rounded = if operands.iter().all(|x| x.is_finite()) {
            apply_rounding_mode(self.rounding()).round(value, residual, kind.single)
        } else {
            // infinite operands produce exact results
            Rounded::exact(value)
        };

        if rounded.overflow {
            self.set_exception(FpException::Overflow);
        }

        if rounded.inexact {
            self.set_exception(FpException::Inexact);
        }

        let min_normal = if kind.single {
            f32::MIN_POSITIVE as f64
        } else {
            f64::MIN_POSITIVE
        };

        let mut result = canonicalize_nan(rounded.value);
        if result.abs() < min_normal && rounded.inexact {
            self.set_exception(FpException::Underflow);
        }

        if self.ieee_disabled() && result != 0.0 && result.abs() < min_normal {
            result = 0.0f64.copysign(result);
        }

        if op.negated() {
            result = -result;
        }

        self.set_status(kind, result, &rounded);
        result
    }

    /// Rounds a double precision value to single precision (`frsp`).
    pub fn round_to_single(&mut self, value: f64) -> f64 {
        let kind = ArithKind {
            op: FpOp::Add,
            single: true,
            fprf: true,
        };

        if value.is_nan() {
            if is_snan(value) {
                self.set_exception(FpException::InvalidSNaN);
            }

            return self.invalid_result(kind);
        }

        let rounded = if value.is_finite() {
            apply_rounding_mode(self.rounding()).round(value, 0.0, true)
        } else {
            Rounded::exact(value)
        };

        if rounded.overflow {
            self.set_exception(FpException::Overflow);
        }

        if rounded.inexact {
            self.set_exception(FpException::Inexact);
        }

        if rounded.value.abs() < f32::MIN_POSITIVE as f64 && rounded.inexact {
            self.set_exception(FpException::Underflow);
        }

        self.set_status(kind, rounded.value, &rounded);
        rounded.value
    }

    /// Converts a value to a 32-bit integer in the given rounding mode (`fctiw`, `fctiwz`).
    /// Returns the 64-bit pattern written to the destination FPR.
    pub fn convert_to_int(&mut self, value: f64, mode: FloatRounding) -> u64 {
        if is_snan(value) {
            self.set_exception(FpException::InvalidSNaN);
        }

        let (int, invalid) = clamp_for_integer_conversion(value, mode);
        if invalid {
            self.set_exception(FpException::InvalidConversion);
            self.set_fraction_inexact(false);
            self.set_fraction_rounded(false);
        } else {
            let rounded = round_integral(value, mode);
            let inexact = rounded != value;
            if inexact {
                self.set_exception(FpException::Inexact);
            }

            self.set_fraction_inexact(inexact);
            self.set_fraction_rounded(rounded.abs() > value.abs());
        }

        let mut bits = 0xFFF8_0000_0000_0000 | int as u32 as u64;
        if int == 0 && value.is_sign_negative() {
            bits |= 1 << 32;
        }

        bits
    }

    /// Compares two values (`fcmpu`, `fcmpo`, `ps_cmp*`), updating FPCC and the invalid operation
    /// bits.
    pub fn compare(&mut self, a: f64, b: f64, ordered: bool) -> FloatCond {
        let cond = if a.is_nan() || b.is_nan() {
            FloatCond::Unordered
        } else if a < b {
            FloatCond::LessThan
        } else if a > b {
            FloatCond::GreaterThan
        } else {
            FloatCond::Equal
        };

        let fprf = (self.fprf().value() & 0b1_0000) | cond as u8;
        self.set_fprf(u5::new(fprf));

        if cond == FloatCond::Unordered {
            if is_snan(a) || is_snan(b) {
                self.set_exception(FpException::InvalidSNaN);
                if ordered && !self.invalid_exception_enabled() {
                    self.set_exception(FpException::InvalidCompare);
                }
            } else if ordered {
                self.set_exception(FpException::InvalidCompare);
            }
        }

        cond
    }

    /// Moves fields of `value` into the FPSCR (`mtfsf`). Bit `i` of `mask` selects the nibble at
    /// bits `4 * i..4 * i + 4`. VX and FEX are always recomputed.
    pub fn mtfsf(&mut self, mask: u8, value: u32) {
        let mut bits_mask = 0u32;
        for i in 0..8 {
            if mask & (1 << i) != 0 {
                bits_mask |= 0xF << (4 * i);
            }
        }

        *self = Self::from_bits((self.to_bits() & !bits_mask) | (value & bits_mask));
        self.update_summaries();
    }

    /// Moves an immediate into FPSCR field `field` (`mtfsfi`). Field 0 is the most significant
    /// nibble.
    pub fn mtfsfi(&mut self, field: u8, imm: u8) {
        let shift = 4 * (7 - (field as u32 & 7));
        let bits = (self.to_bits() & !(0xF << shift)) | ((imm as u32 & 0xF) << shift);
        *self = Self::from_bits(bits);
        self.update_summaries();
    }

    /// Clears FPSCR bit `crbd`, in PowerPC numbering (`mtfsb0`).
    pub fn mtfsb0(&mut self, crbd: u8) {
        let bit = 31 - (crbd as u32 & 31);
        *self = Self::from_bits(self.to_bits() & !(1 << bit));
        self.update_summaries();
    }

    /// Sets FPSCR bit `crbd`, in PowerPC numbering (`mtfsb1`). Setting an exception bit behaves
    /// like raising that exception.
    pub fn mtfsb1(&mut self, crbd: u8) {
        let bit = 1u32 << (31 - (crbd as u32 & 31));
        match FpException::from_repr(bit) {
            Some(exception) => {
                self.set_exception(exception);
            }
            None => {
                *self = Self::from_bits(self.to_bits() | bit);
                self.update_summaries();
            }
        }
    }

    /// Returns FPSCR field `field` (`mcrfs`), clearing the exception bits it contains.
    pub fn mcrfs(&mut self, field: u8) -> u8 {
        let shift = 4 * (7 - (field as u32 & 7));
        let bits = self.to_bits();
        let nibble = (bits >> shift) & 0xF;

        *self = Self::from_bits(bits & !(ANY_EXCEPTION & (0xF << shift)));
        self.update_summaries();

        nibble as u8
    }
}

/// Converts the bits of a single precision value into a double precision value, preserving
/// signaling NaNs (`lfs`).
pub fn load_single(word: u32) -> f64 {
    let word = word as u64;
    let exp = (word >> 23) & 0xFF;
    let frac = word & 0x7F_FFFF;

    let bits = if exp == 0 && frac != 0 {
        // denormal, normalize it
        let mut exp = 1023 - 126;
        let mut frac = frac;
        while frac & 0x80_0000 == 0 {
            frac <<= 1;
            exp -= 1;
        }

        ((word >> 31) << 63) | (exp << 52) | ((frac & 0x7F_FFFF) << 29)
    } else {
        let high = if exp > 0 && exp < 255 {
            (!word >> 30) & 1
        } else {
            (word >> 30) & 1
        };

        let fill = high << 61 | high << 60 | high << 59;
        ((word & 0xC000_0000) << 32) | fill | ((word & 0x3FFF_FFFF) << 29)
    };

    f64::from_bits(bits)
}

/// Converts a double precision value into the bits of a single precision value, preserving
/// signaling NaNs and producing denormals where needed (`stfs`).
pub fn store_single(value: f64) -> u32 {
    let bits = value.to_bits();
    let exp = (bits >> 52) & 0x7FF;
    let sign = ((bits >> 32) & 0x8000_0000) as u32;

    if exp > 896 || bits & !(1 << 63) == 0 {
        (((bits >> 32) & 0xC000_0000) | ((bits >> 29) & 0x3FFF_FFFF)) as u32
    } else if exp >= 874 {
        let frac = (1u64 << 52) | (bits & 0xF_FFFF_FFFF_FFFF);
        let shift = (-126 - (exp as i64 - 1023)) as u32;
        sign | ((frac >> shift) >> 29) as u32 & 0x7F_FFFF
    } else {
        sign
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fpscr(mode: FloatRounding) -> FloatControlReg {
        FloatControlReg::default().with_rounding(mode)
    }

    const DOUBLE: ArithKind = ArithKind {
        op: FpOp::Add,
        single: false,
        fprf: true,
    };

    fn kind(op: FpOp, single: bool) -> ArithKind {
        ArithKind {
            op,
            single,
            fprf: true,
        }
    }

    #[test]
    fn directed_rounding() {
        let tiny = 2.0f64.powi(-60);
        let cases = [
            (FloatRounding::Nearest, 1.0, -1.0),
            (FloatRounding::TowardsZero, 1.0, -1.0),
            (FloatRounding::TowardsPosInf, 1.0f64.next_up(), -1.0),
            (FloatRounding::TowardsNegInf, 1.0, -1.0f64.next_down()),
        ];

        for (mode, positive, negative) in cases {
            let mut status = fpscr(mode);
            assert_eq!(status.arith(DOUBLE, 1.0, tiny, 0.0), positive, "{mode:?}");
            assert!(status.inexact_exception());
            assert!(status.fraction_inexact());

            let mut status = fpscr(mode);
            assert_eq!(status.arith(DOUBLE, -1.0, -tiny, 0.0), negative, "{mode:?}");
        }

        let mut status = fpscr(FloatRounding::TowardsPosInf);
        status.arith(DOUBLE, 1.0, tiny, 0.0);
        assert!(status.fraction_rounded());

        let mut status = fpscr(FloatRounding::TowardsZero);
        status.arith(DOUBLE, 1.0, tiny, 0.0);
        assert!(!status.fraction_rounded());
    }

    #[test]
    fn exact_results_are_not_inexact() {
        let mut status = fpscr(FloatRounding::Nearest);
        assert_eq!(status.arith(kind(FpOp::Mul, false), 3.0, 0.0, 0.5), 1.5);
        assert!(!status.inexact_exception());
        assert_eq!(status.fprf().value(), 0b0_0100);

        assert_eq!(status.arith(kind(FpOp::Div, false), 1.0, 3.0, 0.0), 1.0 / 3.0);
        assert!(status.inexact_exception());
    }

    #[test]
    fn fx_only_on_transition() {
        let mut status = FloatControlReg::default();
        assert!(status.set_exception(FpException::ZeroDivide));
        assert!(status.exception_summary());

        status.mtfsb0(0);
        assert!(!status.exception_summary());

        assert!(!status.set_exception(FpException::ZeroDivide));
        assert!(!status.exception_summary());
        assert!(status.zero_divide_exception());
    }

    #[test]
    fn summaries_cannot_be_set_directly() {
        let mut status = FloatControlReg::default();
        status.mtfsb1(1);
        status.mtfsb1(2);
        assert!(!status.enabled_exception_summary());
        assert!(!status.invalid_op_exception_summary());

        status.mtfsf(0xFF, 0x6000_0000);
        assert_eq!(status.to_bits(), 0);

        // mtfsb1 on an exception bit raises it
        status.mtfsb1(5);
        assert!(status.zero_divide_exception());
        assert!(status.exception_summary());

        // enabling it sets FEX
        status.mtfsb1(27);
        assert!(status.zero_divide_exception_enabled());
        assert!(status.enabled_exception_summary());
    }

    #[test]
    fn summaries_follow_restored_state() {
        // VXSNAN with VE enabled, as restored from a saved FPSCR
        let mut status = FloatControlReg::from_bits(0x0100_0080);
        status.update_summaries();
        assert!(status.invalid_op_exception_summary());
        assert!(status.enabled_exception_summary());

        let mut status = FloatControlReg::from_bits(0x6000_0000);
        status.update_summaries();
        assert_eq!(status.to_bits(), 0);
    }

    #[test]
    fn canonical_nan() {
        let nan = f64::from_bits(0xFFF8_0000_DEAD_BEEF);
        assert_eq!(canonicalize_nan(nan).to_bits(), QNAN);
        assert_eq!(canonicalize_nan(-0.0).to_bits(), (-0.0f64).to_bits());
    }

    #[test]
    fn mcrfs_clears_copied_exceptions() {
        let mut status = FloatControlReg::default();
        status.set_exception(FpException::Overflow);
        status.set_exception(FpException::InvalidSNaN);

        // field 0: FX FEX VX OX
        assert_eq!(status.mcrfs(0), 0b1011);
        assert!(!status.exception_summary());
        assert!(!status.overflow_exception());
        // VX is still the summary of VXSNAN, which lives in field 1
        assert!(status.invalid_op_exception_summary());

        // field 1: UX ZX XX VXSNAN
        assert_eq!(status.mcrfs(1), 0b0001);
        assert!(!status.invalid_snan_exception());
        assert!(!status.invalid_op_exception_summary());
    }

    #[test]
    fn mtfsfi_fields() {
        let mut status = FloatControlReg::default();
        status.mtfsfi(7, 0b0011);
        assert_eq!(status.rounding(), FloatRounding::TowardsNegInf);

        status.mtfsfi(7, 0);
        status.mtfsfi(6, 0b1000);
        assert!(status.invalid_exception_enabled());
    }

    #[test]
    fn nan_propagation() {
        let snan = f64::from_bits(0x7FF0_0000_0000_0001);
        let mut status = FloatControlReg::default();

        let first = status.arith(DOUBLE, snan, 2.0, 0.0);
        assert_eq!(first.to_bits(), QNAN);
        assert!(status.invalid_snan_exception());
        assert!(status.invalid_op_exception_summary());

        let second = status.arith(DOUBLE, first, 3.0, 0.0);
        assert_eq!(second.to_bits(), QNAN);
        assert!(status.invalid_op_exception_summary());
        assert_eq!(status.fprf().value(), 0b1_0001);

        // host NaNs with other payloads are canonicalized too
        let mut status = FloatControlReg::default();
        let quiet = f64::from_bits(0xFFF8_0000_DEAD_BEEF);
        assert_eq!(status.arith(DOUBLE, quiet, 1.0, 0.0).to_bits(), QNAN);
        assert!(!status.invalid_op_exception_summary());
    }

    #[test]
    fn invalid_operations() {
        let inf = f64::INFINITY;
        let cases = [
            (FpOp::Add, inf, -inf, 0.0, FpException::InvalidInfSubInf),
            (FpOp::Sub, inf, inf, 0.0, FpException::InvalidInfSubInf),
            (FpOp::Mul, inf, 0.0, 0.0, FpException::InvalidInfMulZero),
            (FpOp::Div, inf, inf, 0.0, FpException::InvalidInfDivInf),
            (FpOp::Div, 0.0, 0.0, 0.0, FpException::InvalidZeroDivZero),
            (FpOp::MulAdd, inf, -inf, 1.0, FpException::InvalidInfSubInf),
            (FpOp::MulSub, 0.0, 1.0, inf, FpException::InvalidInfMulZero),
            (FpOp::ReciprocalSqrt, 0.0, -4.0, 0.0, FpException::InvalidSqrt),
        ];

        for (op, a, b, c, exception) in cases {
            let mut status = FloatControlReg::default();
            let result = status.arith(kind(op, false), a, b, c);
            assert_eq!(result.to_bits(), QNAN, "{op:?}");
            assert_ne!(status.to_bits() & exception.mask(), 0, "{op:?}");
            assert!(status.invalid_op_exception_summary());
        }
    }

    #[test]
    fn zero_divide() {
        let mut status = FloatControlReg::default().with_zero_divide_exception_enabled(true);
        let result = status.arith(kind(FpOp::Div, false), -1.0, 0.0, 0.0);
        assert_eq!(result, f64::NEG_INFINITY);
        assert!(status.zero_divide_exception());
        assert!(status.enabled_exception_summary());
        assert_eq!(status.fprf().value(), 0b0_1001);
    }

    #[test]
    fn infinite_dividend_is_exact() {
        let mut status = FloatControlReg::default().with_zero_divide_exception_enabled(true);
        let result = status.arith(kind(FpOp::Div, false), f64::INFINITY, -0.0, 0.0);
        assert_eq!(result, f64::NEG_INFINITY);
        assert!(!status.zero_divide_exception());
        assert!(!status.enabled_exception_summary());
        assert!(!status.exception_summary());
        assert_eq!(status.fprf().value(), 0b0_1001);
    }

    #[test]
    fn exact_zero_signs() {
        let sub = kind(FpOp::Sub, false);

        let mut status = fpscr(FloatRounding::TowardsNegInf);
        let result = status.arith(sub, 1.0, 1.0, 0.0);
        assert_eq!(result.to_bits(), (-0.0f64).to_bits());
        assert_eq!(status.fprf().value(), 0b1_0010);
        assert!(!status.inexact_exception());

        for mode in [
            FloatRounding::Nearest,
            FloatRounding::TowardsZero,
            FloatRounding::TowardsPosInf,
        ] {
            let mut status = fpscr(mode);
            let result = status.arith(sub, 1.0, 1.0, 0.0);
            assert_eq!(result.to_bits(), 0, "{mode:?}");
            assert_eq!(status.fprf().value(), 0b0_0010, "{mode:?}");
        }

        // opposite signed zeros follow the mode, same signed zeros keep their sign
        let mut status = fpscr(FloatRounding::TowardsNegInf);
        assert_eq!(status.arith(DOUBLE, 0.0, -0.0, 0.0).to_bits(), (-0.0f64).to_bits());
        let mut status = fpscr(FloatRounding::Nearest);
        assert_eq!(status.arith(DOUBLE, 0.0, -0.0, 0.0).to_bits(), 0);
        assert_eq!(status.arith(DOUBLE, -0.0, -0.0, 0.0).to_bits(), (-0.0f64).to_bits());
        let mut status = fpscr(FloatRounding::TowardsNegInf);
        assert_eq!(status.arith(DOUBLE, 0.0, 0.0, 0.0).to_bits(), 0);

        // fused: 2 * 3 - 6
        let mut status = fpscr(FloatRounding::TowardsNegInf);
        let result = status.arith(kind(FpOp::MulSub, false), 2.0, 6.0, 3.0);
        assert_eq!(result.to_bits(), (-0.0f64).to_bits());

        let mut status = fpscr(FloatRounding::TowardsNegInf);
        let result = status.arith(kind(FpOp::NegMulSub, false), 2.0, 6.0, 3.0);
        assert_eq!(result.to_bits(), 0);

        let mut status = fpscr(FloatRounding::Nearest);
        let result = status.arith(kind(FpOp::NegMulSub, false), 2.0, 6.0, 3.0);
        assert_eq!(result.to_bits(), (-0.0f64).to_bits());

        // single precision keeps the sign
        let mut status = fpscr(FloatRounding::TowardsNegInf);
        let result = status.arith(kind(FpOp::Add, true), 0.5, -0.5, 0.0);
        assert_eq!(result.to_bits(), (-0.0f64).to_bits());
    }

    #[test]
    fn overflow_clamps_by_mode() {
        let mut status = fpscr(FloatRounding::TowardsZero);
        assert_eq!(status.arith(DOUBLE, f64::MAX, f64::MAX, 0.0), f64::MAX);
        assert!(status.overflow_exception());
        assert!(status.inexact_exception());

        let mut status = fpscr(FloatRounding::Nearest);
        assert_eq!(status.arith(DOUBLE, f64::MAX, f64::MAX, 0.0), f64::INFINITY);

        let mut status = fpscr(FloatRounding::TowardsPosInf);
        assert_eq!(
            status.arith(DOUBLE, -f64::MAX, -f64::MAX, 0.0),
            -f64::MAX
        );

        let mut status = fpscr(FloatRounding::TowardsNegInf);
        let single = status.arith(kind(FpOp::Mul, true), f32::MAX as f64, 0.0, 2.0);
        assert_eq!(single, f32::MAX as f64);
        assert!(status.overflow_exception());
    }

    #[test]
    fn single_precision() {
        let mut status = FloatControlReg::default();
        let result = status.arith(kind(FpOp::Add, true), 1.0, 2.0f64.powi(-30), 0.0);
        assert_eq!(result, 1.0);
        assert!(status.inexact_exception());

        let mut status = fpscr(FloatRounding::TowardsPosInf);
        let result = status.arith(kind(FpOp::Add, true), 1.0, 2.0f64.powi(-30), 0.0);
        assert_eq!(result, 1.0f32.next_up() as f64);

        let mut status = FloatControlReg::default();
        assert_eq!(status.round_to_single(0.1), 0.1f32 as f64);
        assert!(status.fraction_inexact());
    }

    #[test]
    fn negated_fused_ops() {
        let mut status = FloatControlReg::default();
        assert_eq!(status.arith(kind(FpOp::NegMulAdd, false), 2.0, 1.0, 3.0), -7.0);
        assert_eq!(status.arith(kind(FpOp::NegMulSub, false), 2.0, 1.0, 3.0), -5.0);
        assert_eq!(status.fprf().value(), 0b0_1000);

        let zero = status.arith(kind(FpOp::NegMulSub, false), 1.0, 1.0, 1.0);
        assert!(zero == 0.0 && zero.is_sign_negative());
    }

    #[test]
    fn integer_conversion() {
        let mut status = FloatControlReg::default();
        assert_eq!(
            status.convert_to_int(3e9, FloatRounding::Nearest),
            0xFFF8_0000_7FFF_FFFF
        );
        assert!(status.invalid_conversion_exception());
        assert!(status.invalid_op_exception_summary());

        let mut status = FloatControlReg::default();
        assert_eq!(
            status.convert_to_int(-3e9, FloatRounding::TowardsZero),
            0xFFF8_0000_8000_0000
        );

        let mut status = FloatControlReg::default();
        assert_eq!(
            status.convert_to_int(f64::NAN, FloatRounding::Nearest),
            0xFFF8_0000_8000_0000
        );
        assert!(status.invalid_conversion_exception());

        let mut status = FloatControlReg::default();
        assert_eq!(
            status.convert_to_int(2.5, FloatRounding::Nearest),
            0xFFF8_0000_0000_0002
        );
        assert!(status.fraction_inexact());
        assert!(!status.invalid_conversion_exception());

        assert_eq!(
            status.convert_to_int(-0.5, FloatRounding::TowardsZero),
            0xFFF8_0001_0000_0000
        );

        assert_eq!(
            status.convert_to_int(-7.0, FloatRounding::TowardsZero) as u32,
            -7i32 as u32
        );

        assert_eq!(
            clamp_for_integer_conversion(1e20, FloatRounding::Nearest),
            (i32::MAX, true)
        );
        assert_eq!(
            clamp_for_integer_conversion(-1.5, FloatRounding::TowardsNegInf),
            (-2, false)
        );
    }

    #[test]
    fn comparisons() {
        let mut status = FloatControlReg::default();
        assert_eq!(status.compare(1.0, 2.0, false), FloatCond::LessThan);
        assert_eq!(status.fprf().value(), 0b1000);

        assert_eq!(status.compare(f64::NAN, 2.0, false), FloatCond::Unordered);
        assert!(!status.invalid_compare_exception());

        assert_eq!(status.compare(f64::NAN, 2.0, true), FloatCond::Unordered);
        assert!(status.invalid_compare_exception());
        assert!(status.invalid_op_exception_summary());
    }

    #[test]
    fn record_bits() {
        let mut status = FloatControlReg::default();
        status.set_exception(FpException::Overflow);

        let mut cr = CondReg::default();
        update_record_bits(&mut cr, &status);
        assert_eq!(cr.field(1).to_nibble(), 0b1001);
        assert_eq!(cr.0, 0x0900_0000);
    }

    #[test]
    fn classification() {
        assert_eq!(classify(f64::MIN_POSITIVE / 2.0, false), 0b1_0100);
        assert_eq!(classify(1e-40, true), 0b1_0100);
        assert_eq!(classify(1e-40, false), 0b0_0100);
        assert_eq!(classify(-0.0, false), 0b1_0010);
        assert_eq!(classify(f64::NEG_INFINITY, true), 0b0_1001);
    }

    #[test]
    fn single_conversions() {
        // signaling NaNs survive a load and store
        assert_eq!(store_single(load_single(0x7F80_0001)), 0x7F80_0001);
        assert!(is_snan(load_single(0x7F80_0001)));

        assert_eq!(load_single(0x3F80_0000), 1.0);
        assert_eq!(load_single(0x0000_0001), 2.0f64.powi(-149));
        assert_eq!(load_single(0x8000_0000).to_bits(), 0x8000_0000_0000_0000);

        assert_eq!(store_single(1.0), 0x3F80_0000);
        assert_eq!(store_single(2.0f64.powi(-149)), 0x0000_0001);
        assert_eq!(store_single(-2.0f64.powi(-127)), 0x8040_0000);
        assert_eq!(store_single(f64::NEG_INFINITY), 0xFF80_0000);
    }

    #[test]
    fn arith_kind_packing() {
        let kind = ArithKind {
            op: FpOp::NegMulSub,
            single: true,
            fprf: false,
        };

        assert_eq!(ArithKind::from_bits(kind.to_bits()), Some(kind));
        assert_eq!(ArithKind::from_bits(0xFF), None);
    }
}
