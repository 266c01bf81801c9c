// BSD 2-Clause License
//
// Copyright (c) 2020 Alasdair Armstrong
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! This module defines the expression trees the symbolic execution
//! engine hands to the solver backend. Expressions are immutable DAGs
//! of reference-counted nodes; the engine hash-conses them on its side,
//! so node identity (the `Rc` pointer) is what the translation caches
//! key on. Symbolic memory is represented by [Array] roots layered with
//! [UpdateList] write chains, which the backend lowers to store chains.

use std::rc::Rc;

/// Width of the Boolean encoding. Any expression of width 1 is
/// translated to a Z3 Bool rather than a bitvector.
pub const BOOL: u32 = 1;
/// Widths of the floating-point formats the engine produces. Whether a
/// node of width 32 or 64 denotes a float or a bitvector is decided by
/// its operator kind, not by the width alone.
pub const FL32: u32 = 32;
pub const FL64: u32 = 64;
pub const FL80: u32 = 80;
pub const FL128: u32 = 128;

/// Results of the `fpclassify` operation, with the values the C
/// library headers give them.
pub const FP_NAN: i64 = 0;
pub const FP_INFINITE: i64 = 1;
pub const FP_ZERO: i64 = 2;
pub const FP_SUBNORMAL: i64 = 3;
pub const FP_NORMAL: i64 = 4;

/// One of the five IEEE 754 rounding directions. Rounded operations in
/// the expression tree carry the mode the program was executing under.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RoundingMode {
    NearestTiesToEven,
    NearestTiesToAway,
    TowardPositive,
    TowardNegative,
    TowardZero,
}

impl Default for RoundingMode {
    fn default() -> Self {
        RoundingMode::NearestTiesToEven
    }
}

/// A floating-point constant as a raw bit pattern, so NaN payloads and
/// x87 encodings that have no `f32`/`f64` counterpart survive
/// unchanged. Width 80 patterns keep the explicit hidden bit at bit 63.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FpValue {
    width: u32,
    bits: u128,
}

impl FpValue {
    pub fn from_f32(v: f32) -> Self {
        FpValue { width: FL32, bits: v.to_bits() as u128 }
    }

    pub fn from_f64(v: f64) -> Self {
        FpValue { width: FL64, bits: v.to_bits() as u128 }
    }

    /// An 80-bit x87 value from its raw bit pattern
    /// (sign | 15-bit exponent | explicit hidden bit | 63-bit fraction).
    pub fn from_f80_bits(bits: u128) -> Self {
        FpValue { width: FL80, bits: bits & ((1u128 << 80) - 1) }
    }

    pub fn width(self) -> u32 {
        self.width
    }

    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.bits as u32)
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.bits as u64)
    }

    pub fn f80_sign(self) -> u32 {
        (self.bits >> 79) as u32 & 1
    }

    pub fn f80_exponent(self) -> u32 {
        (self.bits >> 64) as u32 & 0x7FFF
    }

    pub fn f80_hidden_bit(self) -> u32 {
        (self.bits >> 63) as u32 & 1
    }

    pub fn f80_fraction(self) -> u64 {
        self.bits as u64 & 0x7FFF_FFFF_FFFF_FFFF
    }

    /// True when the explicit hidden bit agrees with the exponent
    /// field, i.e. the pattern is a legal x87 encoding rather than an
    /// unnormal one.
    pub fn f80_hidden_bit_consistent(self) -> bool {
        (self.f80_exponent() == 0) == (self.f80_hidden_bit() == 0)
    }
}

/// A symbolic array: the unit of symbolic memory. Arrays are compared
/// by identity (the `Rc` pointer), never by name; the backend mints a
/// unique solver-level name per identity. An array with
/// `constant_values` is a concrete region whose initial contents are
/// known.
#[derive(Clone, Debug)]
pub struct Array {
    pub name: String,
    /// Width in bits of the index sort
    pub domain: u32,
    /// Width in bits of the value sort
    pub range: u32,
    pub size: u32,
    pub constant_values: Option<Vec<ExprRef>>,
}

pub type ArrayRef = Rc<Array>;

impl Array {
    pub fn new(name: &str, domain: u32, range: u32, size: u32) -> ArrayRef {
        Rc::new(Array { name: name.to_string(), domain, range, size, constant_values: None })
    }

    pub fn constant(name: &str, domain: u32, range: u32, values: Vec<ExprRef>) -> ArrayRef {
        let size = values.len() as u32;
        Rc::new(Array { name: name.to_string(), domain, range, size, constant_values: Some(values) })
    }

    pub fn is_constant_array(&self) -> bool {
        self.constant_values.is_some()
    }
}

/// A single symbolic write `array[index] := value`. Writes form a
/// singly-linked chain whose tail is the root array.
#[derive(Clone, Debug)]
pub struct UpdateNode {
    pub index: ExprRef,
    pub value: ExprRef,
    pub next: Option<UpdateNodeRef>,
}

pub type UpdateNodeRef = Rc<UpdateNode>;

/// A root array together with the chain of writes layered on top of
/// it. Cloning an update list shares the chain, so forked execution
/// paths extending the same prefix still hit the translation caches.
#[derive(Clone, Debug)]
pub struct UpdateList {
    pub root: ArrayRef,
    pub head: Option<UpdateNodeRef>,
}

impl UpdateList {
    pub fn new(root: ArrayRef) -> Self {
        UpdateList { root, head: None }
    }

    pub fn write(&mut self, index: ExprRef, value: ExprRef) {
        self.head = Some(Rc::new(UpdateNode { index, value, next: self.head.take() }))
    }

    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut next = self.head.as_ref();
        while let Some(un) = next {
            n += 1;
            next = un.next.as_ref();
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

pub type ExprRef = Rc<Expr>;

/// An expression tree node. Every node has a width in bits, computed
/// by [Expr::width]; width 1 is the Boolean encoding. The engine
/// canonicalises `Ne`/`Ugt`/`Uge`/`Sgt`/`Sge` away before anything
/// reaches the backend, so those kinds exist only to fail loudly.
#[derive(Clone, Debug)]
pub enum Expr {
    /// Bitvector constant of 1 to 128 bits
    Constant { bits: u128, width: u32 },
    /// Floating-point constant (32, 64, or 80 bits)
    FConstant(FpValue),
    /// Marker wrapping expressions the engine's optimiser must not
    /// touch; translated as its child
    NotOptimized { src: ExprRef },
    /// Read of a symbolic array at a (possibly symbolic) index
    Read { updates: UpdateList, index: ExprRef },
    /// If-then-else over bitvector or floating-point values
    Select { cond: ExprRef, true_expr: ExprRef, false_expr: ExprRef },
    /// Concatenation of two or more children, most significant first
    Concat { kids: Vec<ExprRef> },
    /// Extraction of `width` bits starting at `offset`
    Extract { expr: ExprRef, offset: u32, width: u32 },

    ZExt { src: ExprRef, width: u32 },
    SExt { src: ExprRef, width: u32 },
    /// Round a float to a different floating-point width
    FExt { src: ExprRef, width: u32, rm: RoundingMode },
    FToU { src: ExprRef, width: u32, rm: RoundingMode },
    FToS { src: ExprRef, width: u32, rm: RoundingMode },
    UToF { src: ExprRef, width: u32, rm: RoundingMode },
    SToF { src: ExprRef, width: u32, rm: RoundingMode },
    /// Reinterpret the bits of an integer as a float of the same width
    ExplicitFloat { src: ExprRef },
    /// Reinterpret the bits of a float as an integer of the same width
    ExplicitInt { src: ExprRef },

    Add { left: ExprRef, right: ExprRef },
    Sub { left: ExprRef, right: ExprRef },
    Mul { left: ExprRef, right: ExprRef },
    UDiv { left: ExprRef, right: ExprRef },
    SDiv { left: ExprRef, right: ExprRef },
    URem { left: ExprRef, right: ExprRef },
    SRem { left: ExprRef, right: ExprRef },

    Not { expr: ExprRef },
    And { left: ExprRef, right: ExprRef },
    Or { left: ExprRef, right: ExprRef },
    Xor { left: ExprRef, right: ExprRef },

    Shl { left: ExprRef, right: ExprRef },
    LShr { left: ExprRef, right: ExprRef },
    AShr { left: ExprRef, right: ExprRef },

    Eq { left: ExprRef, right: ExprRef },
    Ne { left: ExprRef, right: ExprRef },
    Ult { left: ExprRef, right: ExprRef },
    Ule { left: ExprRef, right: ExprRef },
    Ugt { left: ExprRef, right: ExprRef },
    Uge { left: ExprRef, right: ExprRef },
    Slt { left: ExprRef, right: ExprRef },
    Sle { left: ExprRef, right: ExprRef },
    Sgt { left: ExprRef, right: ExprRef },
    Sge { left: ExprRef, right: ExprRef },

    FOeq { left: ExprRef, right: ExprRef },
    FOne { left: ExprRef, right: ExprRef },
    FOlt { left: ExprRef, right: ExprRef },
    FOle { left: ExprRef, right: ExprRef },
    FOgt { left: ExprRef, right: ExprRef },
    FOge { left: ExprRef, right: ExprRef },
    FUeq { left: ExprRef, right: ExprRef },
    FUne { left: ExprRef, right: ExprRef },
    FUlt { left: ExprRef, right: ExprRef },
    FUle { left: ExprRef, right: ExprRef },
    FUgt { left: ExprRef, right: ExprRef },
    FUge { left: ExprRef, right: ExprRef },
    FOrd { left: ExprRef, right: ExprRef },
    FUno { left: ExprRef, right: ExprRef },

    FAdd { left: ExprRef, right: ExprRef, rm: RoundingMode },
    FSub { left: ExprRef, right: ExprRef, rm: RoundingMode },
    FMul { left: ExprRef, right: ExprRef, rm: RoundingMode },
    FDiv { left: ExprRef, right: ExprRef, rm: RoundingMode },
    /// IEEE remainder; Z3's counterpart takes no rounding mode
    FRem { left: ExprRef, right: ExprRef },
    FSqrt { expr: ExprRef, rm: RoundingMode },
    FNearbyInt { expr: ExprRef, rm: RoundingMode },

    FAbs { expr: ExprRef },
    FpClassify { expr: ExprRef },
    FIsFinite { expr: ExprRef },
    FIsNan { expr: ExprRef },
    FIsInf { expr: ExprRef },
    FMin { left: ExprRef, right: ExprRef },
    FMax { left: ExprRef, right: ExprRef },
}

impl Expr {
    /// The width in bits of the value this expression denotes.
    pub fn width(&self) -> u32 {
        use Expr::*;
        match self {
            Constant { width, .. } => *width,
            FConstant(v) => v.width(),
            NotOptimized { src } => src.width(),
            Read { updates, .. } => updates.root.range,
            Select { true_expr, .. } => true_expr.width(),
            Concat { kids } => kids.iter().map(|kid| kid.width()).sum(),
            Extract { width, .. } => *width,

            ZExt { width, .. }
            | SExt { width, .. }
            | FExt { width, .. }
            | FToU { width, .. }
            | FToS { width, .. }
            | UToF { width, .. }
            | SToF { width, .. } => *width,
            ExplicitFloat { src } | ExplicitInt { src } => src.width(),

            Add { left, .. }
            | Sub { left, .. }
            | Mul { left, .. }
            | UDiv { left, .. }
            | SDiv { left, .. }
            | URem { left, .. }
            | SRem { left, .. }
            | And { left, .. }
            | Or { left, .. }
            | Xor { left, .. }
            | Shl { left, .. }
            | LShr { left, .. }
            | AShr { left, .. } => left.width(),
            Not { expr } => expr.width(),

            Eq { .. } | Ne { .. } | Ult { .. } | Ule { .. } | Ugt { .. } | Uge { .. } | Slt { .. }
            | Sle { .. } | Sgt { .. } | Sge { .. } => BOOL,

            FOeq { .. } | FOne { .. } | FOlt { .. } | FOle { .. } | FOgt { .. } | FOge { .. }
            | FUeq { .. } | FUne { .. } | FUlt { .. } | FUle { .. } | FUgt { .. } | FUge { .. }
            | FOrd { .. } | FUno { .. } => BOOL,

            FAdd { left, .. }
            | FSub { left, .. }
            | FMul { left, .. }
            | FDiv { left, .. }
            | FRem { left, .. }
            | FMin { left, .. }
            | FMax { left, .. } => left.width(),
            FSqrt { expr, .. } | FNearbyInt { expr, .. } | FAbs { expr } => expr.width(),

            FpClassify { .. } | FIsFinite { .. } | FIsNan { .. } | FIsInf { .. } => 32,
        }
    }

    /// Bitvector constants are rebuilt on every reference rather than
    /// memoised by the construct cache.
    pub fn is_constant(&self) -> bool {
        matches!(self, Expr::Constant { .. })
    }
}

/// Shorthand for a bitvector constant node.
pub fn bv(bits: u64, width: u32) -> ExprRef {
    assert!(width >= 1 && width <= 128);
    Rc::new(Expr::Constant { bits: bits as u128, width })
}

/// Shorthand for a Boolean (width 1) constant node.
pub fn bool_const(b: bool) -> ExprRef {
    bv(b as u64, BOOL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expr_widths() {
        let x = bv(0xFF, 8);
        let y = bv(1, 8);
        assert!(Expr::Add { left: x.clone(), right: y.clone() }.width() == 8);
        assert!(Expr::Eq { left: x.clone(), right: y.clone() }.width() == 1);
        assert!(Expr::Concat { kids: vec![x.clone(), y.clone(), x.clone()] }.width() == 24);
        assert!(Expr::ZExt { src: x.clone(), width: 32 }.width() == 32);
        assert!(Expr::Extract { expr: x.clone(), offset: 3, width: 2 }.width() == 2);
        assert!(Expr::FpClassify { expr: Rc::new(Expr::FConstant(FpValue::from_f32(1.0))) }.width() == 32);
        assert!(Expr::FAdd {
            left: Rc::new(Expr::FConstant(FpValue::from_f64(1.0))),
            right: Rc::new(Expr::FConstant(FpValue::from_f64(2.0))),
            rm: RoundingMode::default(),
        }
        .width()
            == 64);
    }

    #[test]
    fn f80_fields() {
        // 1.0 as x87 extended: biased exponent 0x3FFF, hidden bit set
        let one = FpValue::from_f80_bits((0x3FFF << 64) | (1 << 63));
        assert!(one.f80_sign() == 0);
        assert!(one.f80_exponent() == 0x3FFF);
        assert!(one.f80_hidden_bit() == 1);
        assert!(one.f80_fraction() == 0);
        assert!(one.f80_hidden_bit_consistent());

        // Unnormal: zero exponent with the hidden bit set
        let unnormal = FpValue::from_f80_bits(1 << 63);
        assert!(!unnormal.f80_hidden_bit_consistent());

        // Pseudo-denormal the other way round: non-zero exponent,
        // hidden bit clear
        let pseudo = FpValue::from_f80_bits(0x0001 << 64);
        assert!(!pseudo.f80_hidden_bit_consistent());

        let neg = FpValue::from_f80_bits((1 << 79) | (0x3FFF << 64) | (1 << 63) | 42);
        assert!(neg.f80_sign() == 1);
        assert!(neg.f80_fraction() == 42);
    }

    #[test]
    fn fp_value_roundtrips() {
        assert!(FpValue::from_f32(1.5).as_f32() == 1.5);
        assert!(FpValue::from_f64(-2.25).as_f64() == -2.25);
        assert!(FpValue::from_f32(f32::NAN).as_f32().is_nan());
        // NaN payload bits survive
        let payload = f32::from_bits(0x7FC0_0001);
        assert!(FpValue::from_f32(payload).as_f32().to_bits() == 0x7FC0_0001);
    }

    #[test]
    fn update_list_chain() {
        let root = Array::new("mem", 32, 8, 16);
        let mut updates = UpdateList::new(root);
        assert!(updates.is_empty());
        updates.write(bv(0, 32), bv(0xAA, 8));
        updates.write(bv(1, 32), bv(0xBB, 8));
        assert!(updates.len() == 2);
        // Head is the most recent write, tail order is preserved
        let head = updates.head.as_ref().unwrap();
        match &*head.value {
            Expr::Constant { bits, .. } => assert!(*bits == 0xBB),
            _ => panic!("unexpected update value"),
        }
        let tail = head.next.as_ref().unwrap();
        assert!(tail.next.is_none());
    }
}
