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

//! This module lowers the engine's expression trees into Z3's AST,
//! providing a safe abstraction over the [z3_sys] crate. The main
//! entry point is [Builder::construct], which translates one
//! expression DAG into a Z3 term in the combined theory of fixed-width
//! bitvectors, arrays, and floating point. The builder memoises
//! subterm translations keyed on expression identity so shared
//! subtrees are lowered exactly once, and it keeps per-array and
//! per-update caches so symbolic memory lowered as store chains is
//! shared between queries.
//!
//! Z3 is used with external reference counting (`Z3_mk_context_rc`) so
//! the caches can legally hold AST handles across queries; every
//! handle type here owns exactly one reference, acquired on
//! construction and released on drop. Handles borrow the [Context]
//! they were made under, so no handle can outlive it, and the
//! [Builder]'s caches are dropped field by field (construct cache,
//! then update nodes, then arrays) before the borrow ends.

use ahash;
use libc::c_uint;
use z3_sys::*;

use std::collections::HashMap;
use std::convert::TryFrom;
use std::ffi::{CStr, CString};
use std::hash::{Hash, Hasher};
use std::process;
use std::rc::Rc;

use crate::error::Error;
use crate::log;

pub mod expr;
use expr::*;

/// Config is a wrapper around the `Z3_config` type from the C
/// API. `Z3_del_config` is called when it is dropped.
pub struct Config {
    z3_cfg: Z3_config,
}

impl Config {
    pub fn new() -> Self {
        unsafe { Config { z3_cfg: Z3_mk_config().unwrap() } }
    }

    pub fn set_param_value(&mut self, id: &str, value: &str) {
        let id = CString::new(id).unwrap();
        let value = CString::new(value).unwrap();
        unsafe { Z3_set_param_value(self.z3_cfg, id.as_ptr(), value.as_ptr()) }
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        unsafe { Z3_del_config(self.z3_cfg) }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Solver timeouts arrive as Z3 errors with this message rather than
/// through a dedicated error code.
const CANCELED_MSG: &[u8] = b"canceled";

extern "C" fn translation_error_handler(ctx: Z3_context, ec: ErrorCode) {
    unsafe {
        let msg = CStr::from_ptr(Z3_get_error_msg(ctx, ec));
        if msg.to_bytes() == CANCELED_MSG {
            // Timeout. Not fatal; the solver driver observes it
            // through its own query status.
            return;
        }
        eprintln!("Error: incorrect use of Z3. [{}] {}", ec as u32, msg.to_string_lossy());
        process::abort()
    }
}

/// Context is a wrapper around `Z3_context`, created in external
/// reference counting mode. Creating a context registers the error
/// handler that separates solver cancellation from fatal misuse, and
/// switches AST printing to SMT-LIBv2 compliant output.
pub struct Context {
    z3_ctx: Z3_context,
}

impl Context {
    pub fn new(cfg: Config) -> Self {
        unsafe {
            let z3_ctx = Z3_mk_context_rc(cfg.z3_cfg).unwrap();
            Z3_set_error_handler(z3_ctx, Some(translation_error_handler));
            Z3_set_ast_print_mode(z3_ctx, AstPrintMode::Smtlib2Compliant);
            Context { z3_ctx }
        }
    }

    pub fn error(&self) -> Error {
        unsafe {
            let code = Z3_get_error_code(self.z3_ctx);
            let msg = Z3_get_error_msg(self.z3_ctx, code);
            Error::Z3Error(CStr::from_ptr(msg).to_string_lossy().to_string())
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { Z3_del_context(self.z3_ctx) }
    }
}

struct Sort<'ctx> {
    z3_sort: Z3_sort,
    ctx: &'ctx Context,
}

impl<'ctx> Sort<'ctx> {
    fn bitvec(ctx: &'ctx Context, sz: u32) -> Self {
        assert!(sz >= 1);

        unsafe {
            let z3_sort = Z3_mk_bv_sort(ctx.z3_ctx, sz as c_uint).unwrap();
            Z3_inc_ref(ctx.z3_ctx, Z3_sort_to_ast(ctx.z3_ctx, z3_sort).unwrap());
            Sort { z3_sort, ctx }
        }
    }

    fn float(ctx: &'ctx Context, ebits: u32, sbits: u32) -> Self {
        assert!(ebits > 1 && sbits > 2);

        unsafe {
            let z3_sort = Z3_mk_fpa_sort(ctx.z3_ctx, ebits as c_uint, sbits as c_uint).unwrap();
            Z3_inc_ref(ctx.z3_ctx, Z3_sort_to_ast(ctx.z3_ctx, z3_sort).unwrap());
            Sort { z3_sort, ctx }
        }
    }

    fn array(ctx: &'ctx Context, dom: &Sort<'ctx>, codom: &Sort<'ctx>) -> Self {
        unsafe {
            let z3_sort = Z3_mk_array_sort(ctx.z3_ctx, dom.z3_sort, codom.z3_sort).unwrap();
            Z3_inc_ref(ctx.z3_ctx, Z3_sort_to_ast(ctx.z3_ctx, z3_sort).unwrap());
            Sort { z3_sort, ctx }
        }
    }

    fn of_ast(ast: &Ast<'ctx>) -> Self {
        unsafe {
            let z3_sort = Z3_get_sort(ast.ctx.z3_ctx, ast.z3_ast).unwrap();
            Z3_inc_ref(ast.ctx.z3_ctx, Z3_sort_to_ast(ast.ctx.z3_ctx, z3_sort).unwrap());
            Sort { z3_sort, ctx: ast.ctx }
        }
    }

    fn kind(&self) -> SortKind {
        unsafe { Z3_get_sort_kind(self.ctx.z3_ctx, self.z3_sort) }
    }

    fn bv_size(&self) -> u32 {
        unsafe { Z3_get_bv_sort_size(self.ctx.z3_ctx, self.z3_sort) }
    }
}

impl Drop for Sort<'_> {
    fn drop(&mut self) {
        unsafe {
            let ctx = self.ctx.z3_ctx;
            Z3_dec_ref(ctx, Z3_sort_to_ast(ctx, self.z3_sort).unwrap())
        }
    }
}

/// A term in Z3's AST. Owns a single Z3-side reference; cloning
/// acquires another, dropping releases.
pub struct Ast<'ctx> {
    z3_ast: Z3_ast,
    ctx: &'ctx Context,
}

impl Clone for Ast<'_> {
    fn clone(&self) -> Self {
        unsafe {
            let z3_ast = self.z3_ast;
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }
}

macro_rules! z3_nullary_op {
    ($i:ident, $ctx:ident) => {
        unsafe {
            let z3_ast = $i($ctx.z3_ctx);
            Z3_inc_ref($ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: $ctx }
        }
    };
}

macro_rules! z3_unary_op {
    ($i:ident, $arg:ident) => {
        unsafe {
            let z3_ast = $i($arg.ctx.z3_ctx, $arg.z3_ast);
            Z3_inc_ref($arg.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: $arg.ctx }
        }
    };
}

macro_rules! z3_binary_op {
    ($i:ident, $lhs:ident, $rhs:ident) => {
        unsafe {
            let z3_ast = $i($lhs.ctx.z3_ctx, $lhs.z3_ast, $rhs.z3_ast);
            Z3_inc_ref($lhs.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: $lhs.ctx }
        }
    };
}

macro_rules! z3_float_binary_op {
    ($i:ident, $rm:ident, $lhs:ident, $rhs:ident) => {
        unsafe {
            let z3_ast = $i($lhs.ctx.z3_ctx, $rm.z3_ast, $lhs.z3_ast, $rhs.z3_ast);
            Z3_inc_ref($lhs.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: $rm.ctx }
        }
    };
}

impl<'ctx> Ast<'ctx> {
    fn mk_bool(ctx: &'ctx Context, b: bool) -> Self {
        unsafe {
            let z3_ast = if b { Z3_mk_true(ctx.z3_ctx) } else { Z3_mk_false(ctx.z3_ctx) };
            Z3_inc_ref(ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx }
        }
    }

    fn mk_const(ctx: &'ctx Context, name: &str, sort: &Sort<'ctx>) -> Self {
        let name = CString::new(name).unwrap();
        unsafe {
            let symbol = Z3_mk_string_symbol(ctx.z3_ctx, name.as_ptr());
            let z3_ast = Z3_mk_const(ctx.z3_ctx, symbol, sort.z3_sort);
            Z3_inc_ref(ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx }
        }
    }

    fn mk_not(&self) -> Self {
        z3_unary_op!(Z3_mk_not, self)
    }

    fn mk_eq(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_eq, self, rhs)
    }

    fn mk_iff(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_iff, self, rhs)
    }

    fn mk_and(&self, rhs: &Ast<'ctx>) -> Self {
        unsafe {
            let z3_ast = Z3_mk_and(self.ctx.z3_ctx, 2, &[self.z3_ast, rhs.z3_ast] as *const Z3_ast);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn mk_or(&self, rhs: &Ast<'ctx>) -> Self {
        unsafe {
            let z3_ast = Z3_mk_or(self.ctx.z3_ctx, 2, &[self.z3_ast, rhs.z3_ast] as *const Z3_ast);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn mk_or3(&self, second: &Ast<'ctx>, third: &Ast<'ctx>) -> Self {
        unsafe {
            let z3_ast =
                Z3_mk_or(self.ctx.z3_ctx, 3, &[self.z3_ast, second.z3_ast, third.z3_ast] as *const Z3_ast);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn ite(&self, true_exp: &Ast<'ctx>, false_exp: &Ast<'ctx>) -> Self {
        unsafe {
            let z3_ast = Z3_mk_ite(self.ctx.z3_ctx, self.z3_ast, true_exp.z3_ast, false_exp.z3_ast);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn extract(&self, hi: u32, lo: u32) -> Self {
        unsafe {
            let z3_ast = Z3_mk_extract(self.ctx.z3_ctx, hi as c_uint, lo as c_uint, self.z3_ast);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn sign_extend(&self, i: u32) -> Self {
        unsafe {
            let z3_ast = Z3_mk_sign_ext(self.ctx.z3_ctx, i as c_uint, self.z3_ast);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn mk_concat(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_concat, self, rhs)
    }

    fn mk_bvnot(&self) -> Self {
        z3_unary_op!(Z3_mk_bvnot, self)
    }

    fn mk_bvand(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvand, self, rhs)
    }

    fn mk_bvor(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvor, self, rhs)
    }

    fn mk_bvxor(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvxor, self, rhs)
    }

    fn mk_bvredor(&self) -> Self {
        z3_unary_op!(Z3_mk_bvredor, self)
    }

    fn mk_bvadd(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvadd, self, rhs)
    }

    fn mk_bvsub(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvsub, self, rhs)
    }

    fn mk_bvmul(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvmul, self, rhs)
    }

    fn mk_bvudiv(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvudiv, self, rhs)
    }

    fn mk_bvsdiv(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvsdiv, self, rhs)
    }

    fn mk_bvurem(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvurem, self, rhs)
    }

    fn mk_bvsrem(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvsrem, self, rhs)
    }

    fn mk_bvult(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvult, self, rhs)
    }

    fn mk_bvule(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvule, self, rhs)
    }

    fn mk_bvslt(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvslt, self, rhs)
    }

    fn mk_bvsle(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_bvsle, self, rhs)
    }

    fn mk_select(&self, index: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_select, self, index)
    }

    fn mk_store(&self, index: &Ast<'ctx>, val: &Ast<'ctx>) -> Self {
        unsafe {
            let z3_ast = Z3_mk_store(self.ctx.z3_ctx, self.z3_ast, index.z3_ast, val.z3_ast);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn mk_fpa_abs(&self) -> Self {
        z3_unary_op!(Z3_mk_fpa_abs, self)
    }

    fn mk_fpa_is_nan(&self) -> Self {
        z3_unary_op!(Z3_mk_fpa_is_nan, self)
    }

    fn mk_fpa_is_infinite(&self) -> Self {
        z3_unary_op!(Z3_mk_fpa_is_infinite, self)
    }

    fn mk_fpa_is_zero(&self) -> Self {
        z3_unary_op!(Z3_mk_fpa_is_zero, self)
    }

    fn mk_fpa_is_subnormal(&self) -> Self {
        z3_unary_op!(Z3_mk_fpa_is_subnormal, self)
    }

    fn mk_fpa_is_negative(&self) -> Self {
        z3_unary_op!(Z3_mk_fpa_is_negative, self)
    }

    fn mk_fpa_eq(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_fpa_eq, self, rhs)
    }

    fn mk_fpa_lt(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_fpa_lt, self, rhs)
    }

    fn mk_fpa_leq(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_fpa_leq, self, rhs)
    }

    fn mk_fpa_gt(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_fpa_gt, self, rhs)
    }

    fn mk_fpa_geq(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_fpa_geq, self, rhs)
    }

    fn mk_fpa_min(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_fpa_min, self, rhs)
    }

    fn mk_fpa_max(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_fpa_max, self, rhs)
    }

    fn mk_fpa_rem(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_fpa_rem, self, rhs)
    }

    // For the rounded operations `self` is the rounding mode term

    fn mk_fpa_add(&self, lhs: &Ast<'ctx>, rhs: &Ast<'ctx>) -> Self {
        z3_float_binary_op!(Z3_mk_fpa_add, self, lhs, rhs)
    }

    fn mk_fpa_sub(&self, lhs: &Ast<'ctx>, rhs: &Ast<'ctx>) -> Self {
        z3_float_binary_op!(Z3_mk_fpa_sub, self, lhs, rhs)
    }

    fn mk_fpa_mul(&self, lhs: &Ast<'ctx>, rhs: &Ast<'ctx>) -> Self {
        z3_float_binary_op!(Z3_mk_fpa_mul, self, lhs, rhs)
    }

    fn mk_fpa_div(&self, lhs: &Ast<'ctx>, rhs: &Ast<'ctx>) -> Self {
        z3_float_binary_op!(Z3_mk_fpa_div, self, lhs, rhs)
    }

    fn mk_fpa_sqrt(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_fpa_sqrt, self, rhs)
    }

    fn mk_fpa_round_to_integral(&self, rhs: &Ast<'ctx>) -> Self {
        z3_binary_op!(Z3_mk_fpa_round_to_integral, self, rhs)
    }

    fn mk_fpa_to_fp_float(&self, t: &Ast<'ctx>, sort: &Sort<'ctx>) -> Self {
        unsafe {
            let z3_ast = Z3_mk_fpa_to_fp_float(self.ctx.z3_ctx, self.z3_ast, t.z3_ast, sort.z3_sort);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn mk_fpa_to_fp_signed(&self, t: &Ast<'ctx>, sort: &Sort<'ctx>) -> Self {
        unsafe {
            let z3_ast = Z3_mk_fpa_to_fp_signed(self.ctx.z3_ctx, self.z3_ast, t.z3_ast, sort.z3_sort);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn mk_fpa_to_fp_unsigned(&self, t: &Ast<'ctx>, sort: &Sort<'ctx>) -> Self {
        unsafe {
            let z3_ast = Z3_mk_fpa_to_fp_unsigned(self.ctx.z3_ctx, self.z3_ast, t.z3_ast, sort.z3_sort);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn mk_fpa_to_ubv(&self, t: &Ast<'ctx>, sz: u32) -> Self {
        unsafe {
            let z3_ast = Z3_mk_fpa_to_ubv(self.ctx.z3_ctx, self.z3_ast, t.z3_ast, sz as c_uint);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn mk_fpa_to_sbv(&self, t: &Ast<'ctx>, sz: u32) -> Self {
        unsafe {
            let z3_ast = Z3_mk_fpa_to_sbv(self.ctx.z3_ctx, self.z3_ast, t.z3_ast, sz as c_uint);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn mk_fpa_to_fp_bv(&self, sort: &Sort<'ctx>) -> Self {
        unsafe {
            let z3_ast = Z3_mk_fpa_to_fp_bv(self.ctx.z3_ctx, self.z3_ast, sort.z3_sort);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn mk_fpa_to_ieee_bv(&self) -> Self {
        z3_unary_op!(Z3_mk_fpa_to_ieee_bv, self)
    }
}

impl Drop for Ast<'_> {
    fn drop(&mut self) {
        unsafe { Z3_dec_ref(self.ctx.z3_ctx, self.z3_ast) }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtResult {
    Sat,
    Unsat,
    Unknown,
}

use SmtResult::*;

impl SmtResult {
    pub fn is_sat(self) -> Result<bool, Error> {
        match self {
            Sat => Ok(true),
            Unsat => Ok(false),
            Unknown => Err(Error::Z3Unknown),
        }
    }

    pub fn is_unsat(self) -> Result<bool, Error> {
        match self {
            Sat => Ok(false),
            Unsat => Ok(true),
            Unknown => Err(Error::Z3Unknown),
        }
    }

    pub fn is_unknown(self) -> bool {
        self == Unknown
    }
}

/// Options understood by [Builder]. The only one the engine exposes to
/// users is `use_construct_hash`.
#[derive(Clone, Copy, Debug)]
pub struct BuilderOpts {
    /// Memoise subterm translations keyed on expression identity.
    pub use_construct_hash: bool,
    /// Drop the memoisation table at the start of every top-level
    /// [Builder::construct] call.
    pub auto_clear_construct_cache: bool,
}

impl Default for BuilderOpts {
    fn default() -> Self {
        BuilderOpts { use_construct_hash: true, auto_clear_construct_cache: false }
    }
}

// Cache keys compare and hash by node identity. The engine hash-conses
// expressions, so structurally equal but distinct nodes are distinct
// keys on purpose. Holding the Rc keeps a cached node's address stable
// for the lifetime of the cache entry.
macro_rules! identity_key {
    ($name:ident, $node:ty) => {
        struct $name(Rc<$node>);

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                Rc::ptr_eq(&self.0, &other.0)
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                (Rc::as_ptr(&self.0) as usize).hash(state)
            }
        }
    };
}

identity_key!(ExprKey, Expr);
identity_key!(ArrayKey, Array);
identity_key!(UpdateKey, UpdateNode);

/// The symbol every 80-bit shim array is declared under. Sharing one
/// name lets Z3 share structure between shims; distinct values are
/// distinguished purely by their stored contents.
const F80_SHIM_NAME: &str = "[F80, unnormal]";

/// The Builder translates expression trees into Z3 terms.
///
/// A width accompanies every translated term: width 1 means the term
/// has Z3's Bool sort, anything larger is a bitvector, and for
/// floating-point operator kinds the widths 16/32/64/128 denote the
/// IEEE formats. 80-bit x87 values have no Z3 counterpart and
/// translate to a two-slot array from `bv(1)` to `fp(15, 64)`: slot 0
/// holds the value as a 79-bit float, and slot 1 holds `fp.zero` when
/// the source bit pattern was a legal x87 encoding or NaN when it was
/// an "unnormal" (hidden bit disagreeing with the exponent). Each
/// operation consuming 80-bit values consults the sentinel to
/// reproduce what the hardware does with unnormals.
///
/// For example:
/// ```
/// # use kelpie_smt::smt::expr::*;
/// # use kelpie_smt::smt::*;
/// # use std::rc::Rc;
/// let cfg = Config::new();
/// let ctx = Context::new(cfg);
/// let mut builder = Builder::new(&ctx);
/// let solver = Solver::new(&ctx);
/// // (assert (= (bvadd #x03 #x04) #x07))
/// let sum = Rc::new(Expr::Add { left: bv(3, 8), right: bv(4, 8) });
/// let eq = Rc::new(Expr::Eq { left: sum, right: bv(7, 8) });
/// let ast = builder.construct(&eq);
/// solver.assert(&ast);
/// assert!(solver.check_sat() == SmtResult::Sat)
/// ```
pub struct Builder<'ctx> {
    // Field order matters here: the caches hold AST handles that must
    // release their references while the context is still alive, and
    // the construct cache may reference arrays via store chains.
    constructed: HashMap<ExprKey, (Ast<'ctx>, u32), ahash::RandomState>,
    update_node_hash: HashMap<UpdateKey, Ast<'ctx>, ahash::RandomState>,
    array_hash: HashMap<ArrayKey, Ast<'ctx>, ahash::RandomState>,
    use_construct_hash: bool,
    auto_clear_construct_cache: bool,
    ctx: &'ctx Context,
}

impl<'ctx> Builder<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        Self::with_opts(ctx, BuilderOpts::default())
    }

    pub fn with_opts(ctx: &'ctx Context, opts: BuilderOpts) -> Self {
        Builder {
            constructed: HashMap::default(),
            update_node_hash: HashMap::default(),
            array_hash: HashMap::default(),
            use_construct_hash: opts.use_construct_hash,
            auto_clear_construct_cache: opts.auto_clear_construct_cache,
            ctx,
        }
    }

    pub fn context(&self) -> &'ctx Context {
        self.ctx
    }

    /// Translate one expression tree, returning the Z3 term for its
    /// root. See [Builder::construct_with_width].
    pub fn construct(&mut self, e: &ExprRef) -> Ast<'ctx> {
        self.construct_with_width(e).0
    }

    /// Translate one expression tree, returning the Z3 term for its
    /// root together with its width. A width of 1 means the term is a
    /// Bool, otherwise it is a bitvector (or, for floating-point
    /// kinds, a float or 80-bit shim of that width).
    pub fn construct_with_width(&mut self, e: &ExprRef) -> (Ast<'ctx>, u32) {
        if self.auto_clear_construct_cache {
            self.clear_construct_cache()
        }
        self.construct_expr(e)
    }

    pub fn clear_construct_cache(&mut self) {
        log!(log::CACHE, &format!("clearing construct cache ({} entries)", self.constructed.len()));
        self.constructed.clear()
    }

    fn construct_expr(&mut self, e: &ExprRef) -> (Ast<'ctx>, u32) {
        if !self.use_construct_hash || e.is_constant() {
            return self.construct_actual(e);
        }
        if let Some((ast, width)) = self.constructed.get(&ExprKey(e.clone())) {
            return (ast.clone(), *width);
        }
        let (ast, width) = self.construct_actual(e);
        self.constructed.insert(ExprKey(e.clone()), (ast.clone(), width));
        (ast, width)
    }

    // Sorts

    fn bv_sort(&self, width: u32) -> Sort<'ctx> {
        Sort::bitvec(self.ctx, width)
    }

    fn array_sort(&self, dom: &Sort<'ctx>, codom: &Sort<'ctx>) -> Sort<'ctx> {
        Sort::array(self.ctx, dom, codom)
    }

    fn fp_sort(&self, width: u32) -> Sort<'ctx> {
        match width {
            16 => Sort::float(self.ctx, 5, 11),
            FL32 => Sort::float(self.ctx, 8, 24),
            FL64 => Sort::float(self.ctx, 11, 53),
            FL128 => Sort::float(self.ctx, 15, 113),
            _ => panic!("no floating-point sort of width {}", width),
        }
    }

    /// The sort 80-bit values are modelled at: 15 exponent bits and a
    /// 64-bit significand, one bit of which Z3 treats as hidden. The
    /// explicit hidden bit of the x87 format is dealt with separately
    /// by the shim.
    fn f80_sort(&self) -> Sort<'ctx> {
        Sort::float(self.ctx, 15, 64)
    }

    // Bitvector constants

    fn bv_const32(&self, width: u32, value: u32) -> Ast<'ctx> {
        let sort = self.bv_sort(width);
        unsafe {
            let z3_ast = Z3_mk_unsigned_int(self.ctx.z3_ctx, value as c_uint, sort.z3_sort);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn bv_const64(&self, width: u32, value: u64) -> Ast<'ctx> {
        let sort = self.bv_sort(width);
        unsafe {
            let z3_ast = Z3_mk_unsigned_int64(self.ctx.z3_ctx, value, sort.z3_sort);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn bv_int64(&self, width: u32, value: i64) -> Ast<'ctx> {
        let sort = self.bv_sort(width);
        unsafe {
            let z3_ast = Z3_mk_int64(self.ctx.z3_ctx, value, sort.z3_sort);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    /// A constant of any width from a zero-extended 64-bit payload.
    /// Widths past 64 are assembled from 64-bit chunks, since the
    /// direct constructors stop there.
    fn bv_zext_const(&self, width: u32, value: u64) -> Ast<'ctx> {
        if width <= 64 {
            return self.bv_const64(width, value);
        }

        let zero = self.bv_const64(64, 0);
        let mut expr = self.bv_const64(64, value);
        let mut width = width - 64;
        while width > 64 {
            expr = zero.mk_concat(&expr);
            width -= 64
        }
        self.bv_const64(width, 0).mk_concat(&expr)
    }

    /// A constant of any width from a sign-extended 64-bit payload.
    /// The top bit of the payload picks an all-ones or all-zeros high
    /// part.
    fn bv_sext_const(&self, width: u32, value: u64) -> Ast<'ctx> {
        if width <= 64 {
            return self.bv_const64(width, value);
        }

        let high = if value >> 63 != 0 { self.bv_int64(width - 64, -1) } else { self.bv_int64(width - 64, 0) };
        high.mk_concat(&self.bv_const64(64, value))
    }

    fn bv_zero(&self, width: u32) -> Ast<'ctx> {
        self.bv_zext_const(width, 0)
    }

    fn bv_one(&self, width: u32) -> Ast<'ctx> {
        self.bv_zext_const(width, 1)
    }

    fn bv_minus_one(&self, width: u32) -> Ast<'ctx> {
        self.bv_sext_const(width, -1i64 as u64)
    }

    // Bitvector operations

    fn bv_length(&self, e: &Ast<'ctx>) -> u32 {
        Sort::of_ast(e).bv_size()
    }

    /// A single bit as a Bool
    fn bv_bool_extract(&self, e: &Ast<'ctx>, bit: u32) -> Ast<'ctx> {
        e.extract(bit, bit).mk_eq(&self.bv_one(1))
    }

    fn bv_sign_extend(&self, src: &Ast<'ctx>, width: u32) -> Ast<'ctx> {
        let src_width = self.bv_length(src);
        assert!(src_width <= width, "attempted to extend longer data");
        src.sign_extend(width - src_width)
    }

    fn iff(&self, lhs: &Ast<'ctx>, rhs: &Ast<'ctx>) -> Ast<'ctx> {
        let lhs_sort = Sort::of_ast(lhs);
        let rhs_sort = Sort::of_ast(rhs);
        assert!(lhs_sort.kind() == rhs_sort.kind(), "lhs and rhs sorts must match");
        assert!(lhs_sort.kind() == SortKind::Bool, "args must have Bool sort");
        lhs.mk_iff(rhs)
    }

    fn concat3(&self, first: &Ast<'ctx>, second: &Ast<'ctx>, third: &Ast<'ctx>) -> Ast<'ctx> {
        first.mk_concat(second).mk_concat(third)
    }

    fn concat4(
        &self,
        first: &Ast<'ctx>,
        second: &Ast<'ctx>,
        third: &Ast<'ctx>,
        fourth: &Ast<'ctx>,
    ) -> Ast<'ctx> {
        first.mk_concat(second).mk_concat(third).mk_concat(fourth)
    }

    // Shifts by a constant amount

    fn bv_right_shift(&self, e: &Ast<'ctx>, shift: u32) -> Ast<'ctx> {
        let width = self.bv_length(e);

        if shift == 0 {
            e.clone()
        } else if shift >= width {
            // Overshift to zero
            self.bv_zero(width)
        } else {
            self.bv_zero(shift).mk_concat(&e.extract(width - 1, shift))
        }
    }

    fn bv_left_shift(&self, e: &Ast<'ctx>, shift: u32) -> Ast<'ctx> {
        let width = self.bv_length(e);

        if shift == 0 {
            e.clone()
        } else if shift >= width {
            // Overshift to zero
            self.bv_zero(width)
        } else {
            e.extract(width - shift - 1, 0).mk_concat(&self.bv_zero(shift))
        }
    }

    /// Arithmetic right shift by a constant, with the sign bit
    /// supplied as a Bool. Overshifting gives zero here too, matching
    /// the engine's established semantics rather than saturating to
    /// the sign bit.
    fn ashr_by_constant(&self, e: &Ast<'ctx>, shift: u32, is_signed: &Ast<'ctx>) -> Ast<'ctx> {
        let width = self.bv_length(e);

        if shift == 0 {
            e.clone()
        } else if shift >= width {
            // Overshift to zero
            self.bv_zero(width)
        } else {
            is_signed.ite(
                &self.bv_minus_one(shift).mk_concat(&e.extract(width - 1, shift)),
                &self.bv_right_shift(e, shift),
            )
        }
    }

    // Shifts by a variable amount. These build an if-then-else ladder
    // with one case per possible shift, which behaved better than the
    // native variable shifts on the solver versions the engine grew up
    // with, and lets AShr reuse the constant-amount encoding per case.

    fn bv_var_left_shift(&self, e: &Ast<'ctx>, shift: &Ast<'ctx>) -> Ast<'ctx> {
        let width = self.bv_length(e);
        let mut res = self.bv_zero(width);

        for i in (0..width).rev() {
            res = shift.mk_eq(&self.bv_const32(width, i)).ite(&self.bv_left_shift(e, i), &res)
        }

        // If overshifting, shift to zero
        let in_bounds = shift.mk_bvult(&self.bv_const32(self.bv_length(shift), width));
        in_bounds.ite(&res, &self.bv_zero(width))
    }

    fn bv_var_right_shift(&self, e: &Ast<'ctx>, shift: &Ast<'ctx>) -> Ast<'ctx> {
        let width = self.bv_length(e);
        let mut res = self.bv_zero(width);

        for i in (0..width).rev() {
            res = shift.mk_eq(&self.bv_const32(width, i)).ite(&self.bv_right_shift(e, i), &res)
        }

        // If overshifting, shift to zero
        let in_bounds = shift.mk_bvult(&self.bv_const32(self.bv_length(shift), width));
        in_bounds.ite(&res, &self.bv_zero(width))
    }

    fn bv_var_arith_right_shift(&self, e: &Ast<'ctx>, shift: &Ast<'ctx>) -> Ast<'ctx> {
        let width = self.bv_length(e);
        let is_signed = self.bv_bool_extract(e, width - 1);

        let mut res = self.ashr_by_constant(e, width - 1, &is_signed);
        for i in (0..width - 1).rev() {
            res = shift.mk_eq(&self.bv_const32(width, i)).ite(&self.ashr_by_constant(e, i, &is_signed), &res)
        }

        // If overshifting, shift to zero
        let in_bounds = shift.mk_bvult(&self.bv_const32(self.bv_length(shift), width));
        in_bounds.ite(&res, &self.bv_zero(width))
    }

    // Floating point

    fn rounding_mode(&self, rm: RoundingMode) -> Ast<'ctx> {
        let ctx = self.ctx;
        match rm {
            RoundingMode::NearestTiesToEven => z3_nullary_op!(Z3_mk_fpa_round_nearest_ties_to_even, ctx),
            RoundingMode::NearestTiesToAway => z3_nullary_op!(Z3_mk_fpa_round_nearest_ties_to_away, ctx),
            RoundingMode::TowardPositive => z3_nullary_op!(Z3_mk_fpa_round_toward_positive, ctx),
            RoundingMode::TowardNegative => z3_nullary_op!(Z3_mk_fpa_round_toward_negative, ctx),
            RoundingMode::TowardZero => z3_nullary_op!(Z3_mk_fpa_round_toward_zero, ctx),
        }
    }

    fn fp_nan(&self, sort: &Sort<'ctx>) -> Ast<'ctx> {
        unsafe {
            let z3_ast = Z3_mk_fpa_nan(self.ctx.z3_ctx, sort.z3_sort);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn fp_zero(&self, sort: &Sort<'ctx>, negative: bool) -> Ast<'ctx> {
        unsafe {
            let z3_ast = Z3_mk_fpa_zero(self.ctx.z3_ctx, sort.z3_sort, negative);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn fp_numeral_f32(&self, value: f32) -> Ast<'ctx> {
        let sort = self.fp_sort(FL32);
        unsafe {
            let z3_ast = Z3_mk_fpa_numeral_float(self.ctx.z3_ctx, value, sort.z3_sort);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    fn fp_numeral_f64(&self, value: f64) -> Ast<'ctx> {
        let sort = self.fp_sort(FL64);
        unsafe {
            let z3_ast = Z3_mk_fpa_numeral_double(self.ctx.z3_ctx, value, sort.z3_sort);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    /// A float assembled from separate sign, exponent, and significand
    /// bitvectors.
    fn fp_from_fields(&self, sign: &Ast<'ctx>, exp: &Ast<'ctx>, mnt: &Ast<'ctx>) -> Ast<'ctx> {
        unsafe {
            let z3_ast = Z3_mk_fpa_fp(self.ctx.z3_ctx, sign.z3_ast, exp.z3_ast, mnt.z3_ast);
            Z3_inc_ref(self.ctx.z3_ctx, z3_ast);
            Ast { z3_ast, ctx: self.ctx }
        }
    }

    // The 80-bit shim

    /// Wrap a 79-bit float and a sentinel into the two-slot array
    /// representing an x87 80-bit value.
    fn f80_shim(&self, value: &Ast<'ctx>, sentinel: &Ast<'ctx>) -> Ast<'ctx> {
        let sort = self.array_sort(&self.bv_sort(1), &self.f80_sort());
        let array = Ast::mk_const(self.ctx, F80_SHIM_NAME, &sort);
        array.mk_store(&self.bv_zero(1), value).mk_store(&self.bv_one(1), sentinel)
    }

    /// Wrap a value produced by an 80-bit operation; results always
    /// carry the legal-encoding sentinel.
    fn f80_legal_shim(&self, value: &Ast<'ctx>) -> Ast<'ctx> {
        let sentinel = self.fp_zero(&self.f80_sort(), false);
        self.f80_shim(value, &sentinel)
    }

    fn f80_value(&self, shim: &Ast<'ctx>) -> Ast<'ctx> {
        shim.mk_select(&self.bv_zero(1))
    }

    /// True when the shim's sentinel records an unnormal source
    /// encoding.
    fn f80_wrong_hidden_bit(&self, shim: &Ast<'ctx>) -> Ast<'ctx> {
        shim.mk_select(&self.bv_one(1)).mk_fpa_is_nan()
    }

    // Arrays

    fn build_array(&self, name: &str, index_width: u32, value_width: u32) -> Ast<'ctx> {
        let domain_sort = self.bv_sort(index_width);
        let range_sort = self.bv_sort(value_width);
        let sort = self.array_sort(&domain_sort, &range_sort);
        Ast::mk_const(self.ctx, name, &sort)
    }

    /// The Z3 array for a root with no updates applied. Constant
    /// arrays get their initial values folded in as a store chain the
    /// first time they are seen.
    fn initial_array(&mut self, root: &ArrayRef) -> Ast<'ctx> {
        if let Some(array) = self.array_hash.get(&ArrayKey(root.clone())) {
            return array.clone();
        }

        // Z3 identifies constants by name, so make the name unique by
        // appending the current size of the array cache as a counter
        let unique_id = self.array_hash.len().to_string();
        let mut space = std::cmp::min(root.name.len(), 32 - unique_id.len());
        // The cut must not split a multi-byte character
        while !root.name.is_char_boundary(space) {
            space -= 1
        }
        let unique_name = format!("{}{}", &root.name[..space], unique_id);
        log!(
            log::ARRAY,
            &format!("declaring array {} : bv({}) -> bv({})", unique_name, root.domain, root.range)
        );

        let mut array = self.build_array(&unique_name, root.domain, root.range);

        if let Some(values) = &root.constant_values {
            for (i, value) in values.iter().enumerate() {
                let index = if root.domain <= 32 {
                    self.bv_const32(root.domain, i as u32)
                } else {
                    self.bv_const64(root.domain, i as u64)
                };
                let (value, _) = self.construct_expr(value);
                array = array.mk_store(&index, &value)
            }
        }

        self.array_hash.insert(ArrayKey(root.clone()), array.clone());
        array
    }

    /// Read of a root array at a concrete index, before any symbolic
    /// updates.
    pub fn initial_read(&mut self, root: &ArrayRef, index: u32) -> Ast<'ctx> {
        self.initial_array(root).mk_select(&self.bv_const32(32, index))
    }

    /// The Z3 array for a root with the given update chain applied:
    /// one store per update node, tail first. Each node's store chain
    /// is memoised, so chains extended across forked paths only pay
    /// for their new head.
    fn array_for_update(&mut self, root: &ArrayRef, un: Option<&UpdateNodeRef>) -> Ast<'ctx> {
        match un {
            None => self.initial_array(root),
            Some(un) => {
                if let Some(ast) = self.update_node_hash.get(&UpdateKey(un.clone())) {
                    return ast.clone();
                }
                let array = self.array_for_update(root, un.next.as_ref());
                let (index, _) = self.construct_expr(&un.index);
                let (value, _) = self.construct_expr(&un.value);
                let ast = array.mk_store(&index, &value);
                self.update_node_hash.insert(UpdateKey(un.clone()), ast.clone());
                ast
            }
        }
    }

    /// Lowers both operands of a floating-point operation. For 80-bit
    /// shims this unpacks slot 0 of each side and also returns the
    /// combined unnormal test.
    fn fp_operands(
        &mut self,
        left: &ExprRef,
        right: &ExprRef,
        op: &str,
    ) -> (Ast<'ctx>, Ast<'ctx>, u32, Option<Ast<'ctx>>) {
        let (left, width) = self.construct_expr(left);
        let (right, _) = self.construct_expr(right);
        assert!(width == FL32 || width == FL64 || width == FL80, "non-float argument to {}", op);

        if width == FL80 {
            let wrong = self.f80_wrong_hidden_bit(&left).mk_or(&self.f80_wrong_hidden_bit(&right));
            (self.f80_value(&left), self.f80_value(&right), width, Some(wrong))
        } else {
            (left, right, width, None)
        }
    }

    fn construct_actual(&mut self, e: &ExprRef) -> (Ast<'ctx>, u32) {
        use Expr::*;
        match &**e {
            Constant { bits, width } => {
                // Coerce to Bool if necessary
                if *width == BOOL {
                    return (Ast::mk_bool(self.ctx, bits & 1 == 1), BOOL);
                }

                // Fast paths
                if *width <= 32 {
                    return (self.bv_const32(*width, *bits as u32), *width);
                }
                if *width <= 64 {
                    return (self.bv_const64(*width, *bits as u64), *width);
                }

                let mut res = self.bv_const64(64, *bits as u64);
                let mut rest = bits >> 64;
                let mut left = width - 64;
                while left > 64 {
                    res = self.bv_const64(64, rest as u64).mk_concat(&res);
                    rest >>= 64;
                    left -= 64;
                }
                (self.bv_const64(left, rest as u64).mk_concat(&res), *width)
            }

            FConstant(value) => match value.width() {
                FL32 => (self.fp_numeral_f32(value.as_f32()), FL32),
                FL64 => (self.fp_numeral_f64(value.as_f64()), FL64),
                FL80 => {
                    let sign = self.bv_const32(1, value.f80_sign());
                    let exp = self.bv_const32(15, value.f80_exponent());
                    let mnt = self.bv_const64(63, value.f80_fraction());
                    let conv = self.fp_from_fields(&sign, &exp, &mnt);

                    let sort = self.f80_sort();
                    let sentinel = if value.f80_hidden_bit_consistent() {
                        self.fp_zero(&sort, false)
                    } else {
                        self.fp_nan(&sort)
                    };
                    (self.f80_shim(&conv, &sentinel), FL80)
                }
                width => panic!("no floating-point constant of width {}", width),
            },

            NotOptimized { src } => self.construct_expr(src),

            Read { updates, index } => {
                let array = self.array_for_update(&updates.root, updates.head.as_ref());
                let (index, _) = self.construct_expr(index);
                (array.mk_select(&index), updates.root.range)
            }

            Select { cond, true_expr, false_expr } => {
                let (cond, _) = self.construct_expr(cond);
                let (t, width) = self.construct_expr(true_expr);
                let (f, _) = self.construct_expr(false_expr);
                (cond.ite(&t, &f), width)
            }

            Concat { kids } => {
                let last = kids.last().expect("concat requires at least one child");
                let (mut res, mut width) = self.construct_expr(last);
                for kid in kids.iter().rev().skip(1) {
                    let (kid, kid_width) = self.construct_expr(kid);
                    res = kid.mk_concat(&res);
                    width += kid_width
                }
                (res, width)
            }

            Extract { expr, offset, width } => {
                let (src, _) = self.construct_expr(expr);
                if *width == BOOL {
                    (self.bv_bool_extract(&src, *offset), BOOL)
                } else {
                    (src.extract(offset + width - 1, *offset), *width)
                }
            }

            // Casts

            ZExt { src, width } => {
                let (src, src_width) = self.construct_expr(src);
                if src_width == BOOL {
                    (src.ite(&self.bv_one(*width), &self.bv_zero(*width)), *width)
                } else {
                    (self.bv_zero(width - src_width).mk_concat(&src), *width)
                }
            }

            SExt { src, width } => {
                let (src, src_width) = self.construct_expr(src);
                if src_width == BOOL {
                    (src.ite(&self.bv_minus_one(*width), &self.bv_zero(*width)), *width)
                } else {
                    (self.bv_sign_extend(&src, *width), *width)
                }
            }

            FExt { src, width, rm } => {
                let (src, src_width) = self.construct_expr(src);
                let rm = self.rounding_mode(*rm);

                if *width == FL80 {
                    let conv = rm.mk_fpa_to_fp_float(&src, &self.f80_sort());
                    return (self.f80_legal_shim(&conv), FL80);
                }

                let sort = self.fp_sort(*width);
                if src_width == FL80 {
                    // Rounding an unnormal gives NaN
                    let wrong = self.f80_wrong_hidden_bit(&src);
                    let value = self.f80_value(&src);
                    let conv = rm.mk_fpa_to_fp_float(&value, &sort);
                    (wrong.ite(&self.fp_nan(&sort), &conv), *width)
                } else {
                    (rm.mk_fpa_to_fp_float(&src, &sort), *width)
                }
            }

            FToU { src, width, rm } => {
                let (src, src_width) = self.construct_expr(src);
                let rm = self.rounding_mode(*rm);

                if src_width == FL80 {
                    // Converting an unnormal gives 0
                    let wrong = self.f80_wrong_hidden_bit(&src);
                    let value = self.f80_value(&src);
                    (wrong.ite(&self.bv_zero(*width), &rm.mk_fpa_to_ubv(&value, *width)), *width)
                } else {
                    (rm.mk_fpa_to_ubv(&src, *width), *width)
                }
            }

            FToS { src, width, rm } => {
                let (src, src_width) = self.construct_expr(src);
                let rm = self.rounding_mode(*rm);

                if src_width == FL80 {
                    // Converting an unnormal gives 0 for narrow
                    // destinations and the least value for int and
                    // long long, which is what the hardware does
                    let wrong = self.f80_wrong_hidden_bit(&src);
                    let value = self.f80_value(&src);
                    let fallback = match *width {
                        32 => self.bv_sext_const(32, i32::MIN as i64 as u64),
                        64 => self.bv_sext_const(64, i64::MIN as u64),
                        _ => self.bv_zero(*width),
                    };
                    (wrong.ite(&fallback, &rm.mk_fpa_to_sbv(&value, *width)), *width)
                } else {
                    (rm.mk_fpa_to_sbv(&src, *width), *width)
                }
            }

            UToF { src, width, rm } => {
                let (src, _) = self.construct_expr(src);
                let rm = self.rounding_mode(*rm);

                if *width == FL80 {
                    let conv = rm.mk_fpa_to_fp_unsigned(&src, &self.f80_sort());
                    (self.f80_legal_shim(&conv), FL80)
                } else {
                    (rm.mk_fpa_to_fp_unsigned(&src, &self.fp_sort(*width)), *width)
                }
            }

            SToF { src, width, rm } => {
                let (src, _) = self.construct_expr(src);
                let rm = self.rounding_mode(*rm);

                if *width == FL80 {
                    let conv = rm.mk_fpa_to_fp_signed(&src, &self.f80_sort());
                    (self.f80_legal_shim(&conv), FL80)
                } else {
                    (rm.mk_fpa_to_fp_signed(&src, &self.fp_sort(*width)), *width)
                }
            }

            ExplicitFloat { src } => {
                let (src, width) = self.construct_expr(src);

                if width == FL80 {
                    let sort = self.f80_sort();
                    let sign = src.extract(79, 79);
                    let exp = src.extract(78, 64);
                    let hidden_bit = src.extract(63, 63);
                    let mnt = src.extract(62, 0);

                    // The hidden bit must be 0 exactly when the
                    // exponent field is all zeros; any other
                    // combination is an unnormal encoding
                    let correct_hidden_bit = hidden_bit.mk_eq(
                        &exp.mk_bvredor().mk_eq(&self.bv_zero(1)).ite(&self.bv_zero(1), &self.bv_one(1)),
                    );

                    // The 79-bit value simply drops the hidden bit
                    let conv = self.concat3(&sign, &exp, &mnt).mk_fpa_to_fp_bv(&sort);
                    let sentinel = correct_hidden_bit.ite(&self.fp_zero(&sort, false), &self.fp_nan(&sort));
                    (self.f80_shim(&conv, &sentinel), FL80)
                } else {
                    (src.mk_fpa_to_fp_bv(&self.fp_sort(width)), width)
                }
            }

            ExplicitInt { src } => {
                let (src, width) = self.construct_expr(src);

                if width == FL80 {
                    let ieee = self.f80_value(&src).mk_fpa_to_ieee_bv();
                    let sign = ieee.extract(78, 78);
                    let exp = ieee.extract(77, 63);
                    let mnt = ieee.extract(62, 0);

                    // Splice the hidden bit back in: 1 exactly when
                    // the exponent is non-zero, giving the canonical
                    // legal 80-bit pattern
                    let hidden_bit =
                        exp.mk_bvredor().mk_eq(&self.bv_zero(1)).ite(&self.bv_zero(1), &self.bv_one(1));
                    (self.concat4(&sign, &exp, &hidden_bit, &mnt), FL80)
                } else {
                    (src.mk_fpa_to_ieee_bv(), width)
                }
            }

            // Arithmetic

            Add { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                assert!(width != BOOL, "uncanonicalized add");
                let result = l.mk_bvadd(&r);
                assert!(self.bv_length(&result) == width, "width mismatch");
                (result, width)
            }

            Sub { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                assert!(width != BOOL, "uncanonicalized sub");
                let result = l.mk_bvsub(&r);
                assert!(self.bv_length(&result) == width, "width mismatch");
                (result, width)
            }

            Mul { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                assert!(width != BOOL, "uncanonicalized mul");
                let result = l.mk_bvmul(&r);
                assert!(self.bv_length(&result) == width, "width mismatch");
                (result, width)
            }

            UDiv { left, right } => {
                let (l, width) = self.construct_expr(left);
                assert!(width != BOOL, "uncanonicalized udiv");

                // Division by a constant power of two is a shift
                if let Constant { bits, width: divisor_width } = &**right {
                    if *divisor_width <= 64 {
                        let divisor = *bits as u64;
                        if divisor.is_power_of_two() {
                            return (self.bv_right_shift(&l, divisor.trailing_zeros()), width);
                        }
                    }
                }

                let (r, _) = self.construct_expr(right);
                let result = l.mk_bvudiv(&r);
                assert!(self.bv_length(&result) == width, "width mismatch");
                (result, width)
            }

            SDiv { left, right } => {
                let (l, width) = self.construct_expr(left);
                assert!(width != BOOL, "uncanonicalized sdiv");
                let (r, _) = self.construct_expr(right);
                let result = l.mk_bvsdiv(&r);
                assert!(self.bv_length(&result) == width, "width mismatch");
                (result, width)
            }

            URem { left, right } => {
                let (l, width) = self.construct_expr(left);
                assert!(width != BOOL, "uncanonicalized urem");

                // Remainder by a constant power of two keeps the low
                // bits
                if let Constant { bits, width: divisor_width } = &**right {
                    if *divisor_width <= 64 {
                        let divisor = *bits as u64;
                        if divisor.is_power_of_two() {
                            let bits = divisor.trailing_zeros();
                            // Special case for modding by 1, which
                            // would otherwise extract bits -1..0
                            return if bits == 0 {
                                (self.bv_zero(width), width)
                            } else {
                                (self.bv_zero(width - bits).mk_concat(&l.extract(bits - 1, 0)), width)
                            };
                        }
                    }
                }

                let (r, _) = self.construct_expr(right);
                let result = l.mk_bvurem(&r);
                assert!(self.bv_length(&result) == width, "width mismatch");
                (result, width)
            }

            SRem { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                assert!(width != BOOL, "uncanonicalized srem");
                // The engine's srem follows the sign of the dividend,
                // as does Z3's bvsrem
                let result = l.mk_bvsrem(&r);
                assert!(self.bv_length(&result) == width, "width mismatch");
                (result, width)
            }

            // Bitwise

            Not { expr } => {
                let (e, width) = self.construct_expr(expr);
                if width == BOOL {
                    (e.mk_not(), BOOL)
                } else {
                    (e.mk_bvnot(), width)
                }
            }

            And { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                if width == BOOL {
                    (l.mk_and(&r), BOOL)
                } else {
                    (l.mk_bvand(&r), width)
                }
            }

            Or { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                if width == BOOL {
                    (l.mk_or(&r), BOOL)
                } else {
                    (l.mk_bvor(&r), width)
                }
            }

            Xor { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                if width == BOOL {
                    (l.ite(&r.mk_not(), &r), BOOL)
                } else {
                    (l.mk_bvxor(&r), width)
                }
            }

            // Shifts

            Shl { left, right } => {
                let (l, width) = self.construct_expr(left);
                assert!(width != BOOL, "uncanonicalized shl");

                if let Constant { bits, .. } = &**right {
                    let shift = u32::try_from(*bits).unwrap_or(u32::MAX);
                    (self.bv_left_shift(&l, shift), width)
                } else {
                    let (amount, _) = self.construct_expr(right);
                    (self.bv_var_left_shift(&l, &amount), width)
                }
            }

            LShr { left, right } => {
                let (l, width) = self.construct_expr(left);
                assert!(width != BOOL, "uncanonicalized lshr");

                if let Constant { bits, .. } = &**right {
                    let shift = u32::try_from(*bits).unwrap_or(u32::MAX);
                    (self.bv_right_shift(&l, shift), width)
                } else {
                    let (amount, _) = self.construct_expr(right);
                    (self.bv_var_right_shift(&l, &amount), width)
                }
            }

            AShr { left, right } => {
                let (l, width) = self.construct_expr(left);
                assert!(width != BOOL, "uncanonicalized ashr");

                if let Constant { bits, .. } = &**right {
                    let shift = u32::try_from(*bits).unwrap_or(u32::MAX);
                    let is_signed = self.bv_bool_extract(&l, width - 1);
                    (self.ashr_by_constant(&l, shift, &is_signed), width)
                } else {
                    let (amount, _) = self.construct_expr(right);
                    (self.bv_var_arith_right_shift(&l, &amount), width)
                }
            }

            // Comparison

            Eq { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                if width == BOOL {
                    if let Constant { bits, .. } = &**left {
                        if bits & 1 == 1 {
                            (r, BOOL)
                        } else {
                            (r.mk_not(), BOOL)
                        }
                    } else {
                        (self.iff(&l, &r), BOOL)
                    }
                } else {
                    (l.mk_eq(&r), BOOL)
                }
            }

            Ult { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                assert!(width != BOOL, "uncanonicalized ult");
                (l.mk_bvult(&r), BOOL)
            }

            Ule { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                assert!(width != BOOL, "uncanonicalized ule");
                (l.mk_bvule(&r), BOOL)
            }

            Slt { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                assert!(width != BOOL, "uncanonicalized slt");
                (l.mk_bvslt(&r), BOOL)
            }

            Sle { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                assert!(width != BOOL, "uncanonicalized sle");
                (l.mk_bvsle(&r), BOOL)
            }

            // Floating-point arithmetic

            FAdd { left, right, rm } => {
                let (l, r, width, wrong) = self.fp_operands(left, right, "FAdd");
                let rm = self.rounding_mode(*rm);
                match wrong {
                    Some(wrong) => {
                        let sort = self.f80_sort();
                        let result = wrong.ite(&self.fp_nan(&sort), &rm.mk_fpa_add(&l, &r));
                        (self.f80_legal_shim(&result), FL80)
                    }
                    None => (rm.mk_fpa_add(&l, &r), width),
                }
            }

            FSub { left, right, rm } => {
                let (l, r, width, wrong) = self.fp_operands(left, right, "FSub");
                let rm = self.rounding_mode(*rm);
                match wrong {
                    Some(wrong) => {
                        let sort = self.f80_sort();
                        let result = wrong.ite(&self.fp_nan(&sort), &rm.mk_fpa_sub(&l, &r));
                        (self.f80_legal_shim(&result), FL80)
                    }
                    None => (rm.mk_fpa_sub(&l, &r), width),
                }
            }

            FMul { left, right, rm } => {
                let (l, r, width, wrong) = self.fp_operands(left, right, "FMul");
                let rm = self.rounding_mode(*rm);
                match wrong {
                    Some(wrong) => {
                        let sort = self.f80_sort();
                        let result = wrong.ite(&self.fp_nan(&sort), &rm.mk_fpa_mul(&l, &r));
                        (self.f80_legal_shim(&result), FL80)
                    }
                    None => (rm.mk_fpa_mul(&l, &r), width),
                }
            }

            FDiv { left, right, rm } => {
                let (l, r, width, wrong) = self.fp_operands(left, right, "FDiv");
                let rm = self.rounding_mode(*rm);
                match wrong {
                    Some(wrong) => {
                        let sort = self.f80_sort();
                        let result = wrong.ite(&self.fp_nan(&sort), &rm.mk_fpa_div(&l, &r));
                        (self.f80_legal_shim(&result), FL80)
                    }
                    None => (rm.mk_fpa_div(&l, &r), width),
                }
            }

            FRem { left, right } => {
                // Z3's fp.rem takes no rounding mode
                let (l, r, width, wrong) = self.fp_operands(left, right, "FRem");
                match wrong {
                    Some(wrong) => {
                        let sort = self.f80_sort();
                        let result = wrong.ite(&self.fp_nan(&sort), &l.mk_fpa_rem(&r));
                        (self.f80_legal_shim(&result), FL80)
                    }
                    None => (l.mk_fpa_rem(&r), width),
                }
            }

            FSqrt { expr, rm } => {
                let (e, width) = self.construct_expr(expr);
                assert!(width == FL32 || width == FL64 || width == FL80, "non-float argument to FSqrt");
                let rm = self.rounding_mode(*rm);

                if width == FL80 {
                    let sort = self.f80_sort();
                    let wrong = self.f80_wrong_hidden_bit(&e);
                    let value = self.f80_value(&e);
                    let result = wrong.ite(&self.fp_nan(&sort), &rm.mk_fpa_sqrt(&value));
                    (self.f80_legal_shim(&result), FL80)
                } else {
                    (rm.mk_fpa_sqrt(&e), width)
                }
            }

            FNearbyInt { expr, rm } => {
                let (e, width) = self.construct_expr(expr);
                assert!(width == FL32 || width == FL64 || width == FL80, "non-float argument to FNearbyInt");
                let rm = self.rounding_mode(*rm);

                if width == FL80 {
                    let sort = self.f80_sort();
                    let wrong = self.f80_wrong_hidden_bit(&e);
                    let value = self.f80_value(&e);
                    let result = wrong.ite(&self.fp_nan(&sort), &rm.mk_fpa_round_to_integral(&value));
                    (self.f80_legal_shim(&result), FL80)
                } else {
                    (rm.mk_fpa_round_to_integral(&e), width)
                }
            }

            // Floating-point special functions

            FAbs { expr } => {
                let (e, width) = self.construct_expr(expr);
                assert!(width == FL32 || width == FL64 || width == FL80, "non-float argument to FAbs");

                if width == FL80 {
                    // fabs only touches the sign bit, so unnormal
                    // inputs pass straight through: overwrite slot 0
                    // and keep the sentinel
                    let value = self.f80_value(&e);
                    (e.mk_store(&self.bv_zero(1), &value.mk_fpa_abs()), FL80)
                } else {
                    (e.mk_fpa_abs(), width)
                }
            }

            FpClassify { expr } => {
                let (e, width) = self.construct_expr(expr);
                assert!(width == FL32 || width == FL64 || width == FL80, "non-float argument to FpClassify");

                // Classification ignores the unnormal sentinel, which
                // is what compiled classification code does
                let e = if width == FL80 { self.f80_value(&e) } else { e };

                let result = e.mk_fpa_is_nan().ite(
                    &self.bv_sext_const(32, FP_NAN as u64),
                    &e.mk_fpa_is_infinite().ite(
                        &self.bv_sext_const(32, FP_INFINITE as u64),
                        &e.mk_fpa_is_zero().ite(
                            &self.bv_sext_const(32, FP_ZERO as u64),
                            &e.mk_fpa_is_subnormal().ite(
                                &self.bv_sext_const(32, FP_SUBNORMAL as u64),
                                &self.bv_sext_const(32, FP_NORMAL as u64),
                            ),
                        ),
                    ),
                );
                (result, 32)
            }

            FIsFinite { expr } => {
                let (e, width) = self.construct_expr(expr);
                assert!(width == FL32 || width == FL64 || width == FL80, "non-float argument to FIsFinite");

                let e = if width == FL80 { self.f80_value(&e) } else { e };

                let finite = e.mk_fpa_is_nan().mk_or(&e.mk_fpa_is_infinite());
                (finite.ite(&self.bv_zero(32), &self.bv_one(32)), 32)
            }

            FIsNan { expr } => {
                let (e, width) = self.construct_expr(expr);
                assert!(width == FL32 || width == FL64 || width == FL80, "non-float argument to FIsNan");

                let e = if width == FL80 { self.f80_value(&e) } else { e };

                (e.mk_fpa_is_nan().ite(&self.bv_one(32), &self.bv_zero(32)), 32)
            }

            FIsInf { expr } => {
                let (e, width) = self.construct_expr(expr);
                assert!(width == FL32 || width == FL64 || width == FL80, "non-float argument to FIsInf");

                // Unlike the other classifiers, isinf does consult the
                // sentinel: an unnormal is never infinite
                if width == FL80 {
                    let wrong = self.f80_wrong_hidden_bit(&e);
                    let value = self.f80_value(&e);
                    let signed = value
                        .mk_fpa_is_infinite()
                        .ite(
                            &value.mk_fpa_is_negative().ite(&self.bv_minus_one(32), &self.bv_one(32)),
                            &self.bv_zero(32),
                        );
                    (wrong.ite(&self.bv_zero(32), &signed), 32)
                } else {
                    let signed = e.mk_fpa_is_infinite().ite(
                        &e.mk_fpa_is_negative().ite(&self.bv_minus_one(32), &self.bv_one(32)),
                        &self.bv_zero(32),
                    );
                    (signed, 32)
                }
            }

            FMin { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                assert!(width == FL32 || width == FL64 || width == FL80, "non-float argument to FMin");

                if width == FL80 {
                    let wrong_left = self.f80_wrong_hidden_bit(&l);
                    let wrong_right = self.f80_wrong_hidden_bit(&r);
                    let l = self.f80_value(&l);
                    let r = self.f80_value(&r);
                    // An unnormal operand loses: the other side is
                    // returned, and the left side wins when both are
                    // unnormal
                    let result = wrong_left
                        .ite(&wrong_right.ite(&l, &r), &wrong_right.ite(&l, &l.mk_fpa_min(&r)));
                    (self.f80_legal_shim(&result), FL80)
                } else {
                    (l.mk_fpa_min(&r), width)
                }
            }

            FMax { left, right } => {
                let (l, width) = self.construct_expr(left);
                let (r, _) = self.construct_expr(right);
                assert!(width == FL32 || width == FL64 || width == FL80, "non-float argument to FMax");

                if width == FL80 {
                    let wrong_left = self.f80_wrong_hidden_bit(&l);
                    let wrong_right = self.f80_wrong_hidden_bit(&r);
                    let l = self.f80_value(&l);
                    let r = self.f80_value(&r);
                    let result = wrong_left
                        .ite(&wrong_right.ite(&l, &r), &wrong_right.ite(&l, &l.mk_fpa_max(&r)));
                    (self.f80_legal_shim(&result), FL80)
                } else {
                    (l.mk_fpa_max(&r), width)
                }
            }

            // Floating-point comparison

            FOrd { left, right } => {
                // Behaves like isnan on the raw value; the unnormal
                // sentinel is not consulted
                let (l, r, _, _) = self.fp_operands(left, right, "FOrd");
                (l.mk_fpa_is_nan().mk_not().mk_and(&r.mk_fpa_is_nan().mk_not()), BOOL)
            }

            FUno { left, right } => {
                let (l, r, _, _) = self.fp_operands(left, right, "FUno");
                (l.mk_fpa_is_nan().mk_or(&r.mk_fpa_is_nan()), BOOL)
            }

            FOeq { left, right } => {
                let (l, r, _, wrong) = self.fp_operands(left, right, "FOeq");
                let eq = l.mk_fpa_eq(&r);
                match wrong {
                    Some(wrong) => (wrong.mk_not().mk_and(&eq), BOOL),
                    None => (eq, BOOL),
                }
            }

            FUeq { left, right } => {
                let (l, r, _, wrong) = self.fp_operands(left, right, "FUeq");
                let ueq = l.mk_fpa_is_nan().mk_or3(&r.mk_fpa_is_nan(), &l.mk_fpa_eq(&r));
                match wrong {
                    Some(wrong) => (wrong.mk_not().mk_and(&ueq), BOOL),
                    None => (ueq, BOOL),
                }
            }

            FOne { left, right } => {
                // Inequality is the only comparison that holds for
                // unnormal operands
                let (l, r, _, wrong) = self.fp_operands(left, right, "FOne");
                let one = l.mk_fpa_is_nan().mk_or3(&r.mk_fpa_is_nan(), &l.mk_fpa_eq(&r)).mk_not();
                match wrong {
                    Some(wrong) => (wrong.mk_or(&one), BOOL),
                    None => (one, BOOL),
                }
            }

            FUne { left, right } => {
                let (l, r, _, wrong) = self.fp_operands(left, right, "FUne");
                let une = l.mk_fpa_eq(&r).mk_not();
                match wrong {
                    Some(wrong) => (wrong.mk_or(&une), BOOL),
                    None => (une, BOOL),
                }
            }

            FOlt { left, right } => {
                let (l, r, _, wrong) = self.fp_operands(left, right, "FOlt");
                let lt = l.mk_fpa_lt(&r);
                match wrong {
                    Some(wrong) => (wrong.mk_not().mk_and(&lt), BOOL),
                    None => (lt, BOOL),
                }
            }

            FUlt { left, right } => {
                let (l, r, _, wrong) = self.fp_operands(left, right, "FUlt");
                let ult = l.mk_fpa_is_nan().mk_or3(&r.mk_fpa_is_nan(), &l.mk_fpa_lt(&r));
                match wrong {
                    Some(wrong) => (wrong.mk_not().mk_and(&ult), BOOL),
                    None => (ult, BOOL),
                }
            }

            FOle { left, right } => {
                let (l, r, _, wrong) = self.fp_operands(left, right, "FOle");
                let le = l.mk_fpa_leq(&r);
                match wrong {
                    Some(wrong) => (wrong.mk_not().mk_and(&le), BOOL),
                    None => (le, BOOL),
                }
            }

            FUle { left, right } => {
                let (l, r, _, wrong) = self.fp_operands(left, right, "FUle");
                let ule = l.mk_fpa_is_nan().mk_or3(&r.mk_fpa_is_nan(), &l.mk_fpa_leq(&r));
                match wrong {
                    Some(wrong) => (wrong.mk_not().mk_and(&ule), BOOL),
                    None => (ule, BOOL),
                }
            }

            FOgt { left, right } => {
                let (l, r, _, wrong) = self.fp_operands(left, right, "FOgt");
                let gt = l.mk_fpa_gt(&r);
                match wrong {
                    Some(wrong) => (wrong.mk_not().mk_and(&gt), BOOL),
                    None => (gt, BOOL),
                }
            }

            FUgt { left, right } => {
                let (l, r, _, wrong) = self.fp_operands(left, right, "FUgt");
                let ugt = l.mk_fpa_is_nan().mk_or3(&r.mk_fpa_is_nan(), &l.mk_fpa_gt(&r));
                match wrong {
                    Some(wrong) => (wrong.mk_not().mk_and(&ugt), BOOL),
                    None => (ugt, BOOL),
                }
            }

            FOge { left, right } => {
                let (l, r, _, wrong) = self.fp_operands(left, right, "FOge");
                let ge = l.mk_fpa_geq(&r);
                match wrong {
                    Some(wrong) => (wrong.mk_not().mk_and(&ge), BOOL),
                    None => (ge, BOOL),
                }
            }

            FUge { left, right } => {
                let (l, r, _, wrong) = self.fp_operands(left, right, "FUge");
                let uge = l.mk_fpa_is_nan().mk_or3(&r.mk_fpa_is_nan(), &l.mk_fpa_geq(&r));
                match wrong {
                    Some(wrong) => (wrong.mk_not().mk_and(&uge), BOOL),
                    None => (uge, BOOL),
                }
            }

            // The engine rewrites these comparisons into the handled
            // ones before constraints ever reach the backend
            Ne { .. } | Ugt { .. } | Uge { .. } | Sgt { .. } | Sge { .. } => {
                panic!("unhandled expression kind reached the solver backend: {:?}", e)
            }
        }
    }
}

/// A thin wrapper over a Z3 solver so path constraints built by
/// [Builder] can be asserted and checked. Incremental solving, models,
/// and timeouts belong to the solver driver, not here.
pub struct Solver<'ctx> {
    z3_solver: Z3_solver,
    ctx: &'ctx Context,
}

impl<'ctx> Solver<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        unsafe {
            let z3_solver = Z3_mk_simple_solver(ctx.z3_ctx);
            Z3_solver_inc_ref(ctx.z3_ctx, z3_solver);
            Solver { z3_solver, ctx }
        }
    }

    pub fn assert(&self, ast: &Ast<'ctx>) {
        unsafe { Z3_solver_assert(self.ctx.z3_ctx, self.z3_solver, ast.z3_ast) }
    }

    pub fn check_sat(&self) -> SmtResult {
        unsafe {
            let result = Z3_solver_check(self.ctx.z3_ctx, self.z3_solver);
            if result == Z3_L_TRUE {
                Sat
            } else if result == Z3_L_FALSE {
                Unsat
            } else {
                Unknown
            }
        }
    }
}

impl Drop for Solver<'_> {
    fn drop(&mut self) {
        unsafe { Z3_solver_dec_ref(self.ctx.z3_ctx, self.z3_solver) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fc32(v: f32) -> ExprRef {
        Rc::new(Expr::FConstant(FpValue::from_f32(v)))
    }

    fn fc64(v: f64) -> ExprRef {
        Rc::new(Expr::FConstant(FpValue::from_f64(v)))
    }

    fn fc80(bits: u128) -> ExprRef {
        Rc::new(Expr::FConstant(FpValue::from_f80_bits(bits)))
    }

    fn bv128(bits: u128, width: u32) -> ExprRef {
        Rc::new(Expr::Constant { bits, width })
    }

    /// A fresh symbolic byte, as the engine would produce one: a read
    /// of a symbolic array
    fn symbolic_byte(name: &str) -> ExprRef {
        Rc::new(Expr::Read { updates: UpdateList::new(Array::new(name, 32, 8, 1)), index: bv(0, 32) })
    }

    /// A fresh symbolic Boolean (the low bit of a symbolic byte)
    fn symbolic_bit(name: &str) -> ExprRef {
        Rc::new(Expr::Extract { expr: symbolic_byte(name), offset: 0, width: 1 })
    }

    fn eq(left: ExprRef, right: ExprRef) -> ExprRef {
        Rc::new(Expr::Eq { left, right })
    }

    fn not(expr: ExprRef) -> ExprRef {
        Rc::new(Expr::Not { expr })
    }

    fn add(left: ExprRef, right: ExprRef) -> ExprRef {
        Rc::new(Expr::Add { left, right })
    }

    /// Assert every expression on a fresh solver and check
    /// satisfiability
    fn check(exprs: &[ExprRef], expected: SmtResult) {
        let cfg = Config::new();
        let ctx = Context::new(cfg);
        let mut builder = Builder::new(&ctx);
        let solver = Solver::new(&ctx);
        for e in exprs {
            let ast = builder.construct(e);
            solver.assert(&ast)
        }
        assert!(solver.check_sat() == expected)
    }

    /// The expression must hold in every model
    fn check_valid(e: ExprRef) {
        check(&[e.clone()], Sat);
        check(&[not(e)], Unsat)
    }

    // An unnormal 80-bit pattern: zero exponent but the hidden bit set
    const UNNORMAL: u128 = 1 << 63;
    // 1.0 and 2.0 as legal x87 extended values
    const F80_ONE: u128 = (0x3FFF << 64) | (1 << 63);
    const F80_TWO: u128 = (0x4000 << 64) | (1 << 63);

    #[test]
    fn add_constants() {
        check(&[eq(add(bv(3, 32), bv(4, 32)), bv(7, 32))], Sat);
        check(&[eq(add(bv(3, 32), bv(4, 32)), bv(8, 32))], Unsat);
    }

    #[test]
    fn unsigned_comparison_bottom() {
        let x = symbolic_byte("x");
        check(&[Rc::new(Expr::Ult { left: x, right: bv(0, 8) })], Unsat);
        check(&[Rc::new(Expr::Ule { left: bv(1, 8), right: bv(0, 8) })], Unsat);
        // -1 <= 0 signed
        check(&[Rc::new(Expr::Sle { left: bv(0xFF, 8), right: bv(0, 8) })], Sat);
        check(&[Rc::new(Expr::Slt { left: bv(0, 8), right: bv(0xFF, 8) })], Unsat);
    }

    #[test]
    fn select_on_symbolic_bit() {
        let x = symbolic_bit("x");
        let cond = eq(bool_const(true), x.clone());
        let sel = Rc::new(Expr::Select { cond, true_expr: bv(1, 32), false_expr: bv(2, 32) });
        let picked_one = eq(sel, bv(1, 32));
        check(&[picked_one.clone()], Sat);
        // Forcing the bit low contradicts having picked the true branch
        check(&[picked_one, eq(bool_const(false), x)], Unsat)
    }

    #[test]
    fn read_constant_array() {
        let root = Array::constant("buf", 32, 8, vec![bv(0x41, 8), bv(0x42, 8), bv(0x43, 8)]);
        let updates = UpdateList::new(root);
        let read = Rc::new(Expr::Read { updates: updates.clone(), index: bv(1, 32) });
        check_valid(eq(read, bv(0x42, 8)));

        // A write shadows the constant initialiser at its index only
        let mut updated = updates;
        updated.write(bv(1, 32), bv(0x59, 8));
        check_valid(eq(Rc::new(Expr::Read { updates: updated.clone(), index: bv(1, 32) }), bv(0x59, 8)));
        check_valid(eq(Rc::new(Expr::Read { updates: updated, index: bv(2, 32) }), bv(0x43, 8)))
    }

    #[test]
    fn update_chain_last_write_wins() {
        let root = Array::new("mem", 32, 8, 4);
        let mut updates = UpdateList::new(root);
        updates.write(bv(0, 32), bv(1, 8));
        updates.write(bv(0, 32), bv(2, 8));
        check_valid(eq(Rc::new(Expr::Read { updates: updates.clone(), index: bv(0, 32) }), bv(2, 8)));

        // One store per update node, plus the root symbol
        let cfg = Config::new();
        let ctx = Context::new(cfg);
        let mut builder = Builder::new(&ctx);
        builder.construct(&Rc::new(Expr::Read { updates, index: bv(0, 32) }));
        assert!(builder.update_node_hash.len() == 2);
        assert!(builder.array_hash.len() == 1)
    }

    #[test]
    fn arrays_are_uniqued_by_identity() {
        // Two arrays that happen to share a name are still distinct
        // symbols
        let a = Array::new("buf", 32, 8, 1);
        let b = Array::new("buf", 32, 8, 1);
        let read_a = Rc::new(Expr::Read { updates: UpdateList::new(a), index: bv(0, 32) });
        let read_b = Rc::new(Expr::Read { updates: UpdateList::new(b), index: bv(0, 32) });
        check(&[not(eq(read_a, read_b))], Sat)
    }

    #[test]
    fn initial_read_of_constant_array() {
        let root = Array::constant("buf", 32, 8, vec![bv(9, 8)]);
        let cfg = Config::new();
        let ctx = Context::new(cfg);
        let mut builder = Builder::new(&ctx);
        let solver = Solver::new(&ctx);
        let read = builder.initial_read(&root, 0);
        let nine = builder.construct(&bv(9, 8));
        solver.assert(&read.mk_eq(&nine).mk_not());
        assert!(solver.check_sat() == Unsat)
    }

    #[test]
    fn construct_cache_returns_identical_terms() {
        let cfg = Config::new();
        let ctx = Context::new(cfg);
        let mut builder = Builder::new(&ctx);
        let e = add(symbolic_byte("x"), bv(1, 8));
        let first = builder.construct(&e);
        let second = builder.construct(&e);
        assert!(first.z3_ast == second.z3_ast);
        // The add and the read are cached; the constant is not
        assert!(builder.constructed.len() == 2);

        let opts = BuilderOpts { use_construct_hash: false, auto_clear_construct_cache: false };
        let mut uncached = Builder::with_opts(&ctx, opts);
        uncached.construct(&e);
        assert!(uncached.constructed.is_empty())
    }

    #[test]
    fn auto_clear_construct_cache() {
        let cfg = Config::new();
        let ctx = Context::new(cfg);
        let opts = BuilderOpts { use_construct_hash: true, auto_clear_construct_cache: true };
        let mut builder = Builder::with_opts(&ctx, opts);
        let e = add(symbolic_byte("x"), bv(1, 8));
        builder.construct(&e);
        assert!(builder.constructed.len() == 2);
        builder.construct(&e);
        assert!(builder.constructed.len() == 2);
        builder.clear_construct_cache();
        assert!(builder.constructed.is_empty())
    }

    #[test]
    fn not_optimized_passthrough() {
        let cfg = Config::new();
        let ctx = Context::new(cfg);
        let mut builder = Builder::new(&ctx);
        let inner = add(symbolic_byte("x"), bv(1, 8));
        let wrapped = Rc::new(Expr::NotOptimized { src: inner.clone() });
        let direct = builder.construct(&inner);
        let via_marker = builder.construct(&wrapped);
        assert!(direct.z3_ast == via_marker.z3_ast)
    }

    #[test]
    fn division_strength_reduction() {
        let cfg = Config::new();
        let ctx = Context::new(cfg);
        let mut builder = Builder::new(&ctx);
        let x = symbolic_byte("x");

        // Division by a power of two builds the same term as the
        // logical shift, never bvudiv
        let udiv = builder.construct(&Rc::new(Expr::UDiv { left: x.clone(), right: bv(4, 8) }));
        let lshr = builder.construct(&Rc::new(Expr::LShr { left: x.clone(), right: bv(2, 8) }));
        assert!(udiv.z3_ast == lshr.z3_ast);

        // Remainder by a power of two keeps the low bits
        let urem = builder.construct(&Rc::new(Expr::URem { left: x.clone(), right: bv(8, 8) }));
        let low = Rc::new(Expr::Extract { expr: x.clone(), offset: 0, width: 3 });
        let zext = builder.construct(&Rc::new(Expr::ZExt { src: low, width: 8 }));
        assert!(urem.z3_ast == zext.z3_ast);

        // Remainder by one is just zero
        let by_one = builder.construct(&Rc::new(Expr::URem { left: x, right: bv(1, 8) }));
        let zero = builder.bv_zero(8);
        assert!(by_one.z3_ast == zero.z3_ast);

        // Non-powers of two take the solver opcode
        check_valid(eq(Rc::new(Expr::UDiv { left: bv(10, 8), right: bv(3, 8) }), bv(3, 8)));
        check_valid(eq(Rc::new(Expr::URem { left: bv(10, 8), right: bv(3, 8) }), bv(1, 8)))
    }

    #[test]
    fn signed_division_and_remainder() {
        // -7 / 2 truncates toward zero
        check_valid(eq(Rc::new(Expr::SDiv { left: bv(0xF9, 8), right: bv(2, 8) }), bv(0xFD, 8)));
        // The sign of srem follows the dividend
        check_valid(eq(Rc::new(Expr::SRem { left: bv(0xF9, 8), right: bv(4, 8) }), bv(0xFD, 8)));
        check_valid(eq(Rc::new(Expr::Sub { left: bv(10, 8), right: bv(3, 8) }), bv(7, 8)));
        check_valid(eq(Rc::new(Expr::Mul { left: bv(5, 8), right: bv(7, 8) }), bv(35, 8)))
    }

    #[test]
    fn bitwise_operators() {
        check_valid(eq(Rc::new(Expr::Xor { left: bv(0xF0, 8), right: bv(0x0F, 8) }), bv(0xFF, 8)));
        check_valid(eq(Rc::new(Expr::And { left: bv(0xF0, 8), right: bv(0x3C, 8) }), bv(0x30, 8)));
        check_valid(eq(Rc::new(Expr::Or { left: bv(0xA0, 8), right: bv(0x0A, 8) }), bv(0xAA, 8)));
        check_valid(eq(not(bv(0xAA, 8)), bv(0x55, 8)))
    }

    #[test]
    fn boolean_operators() {
        let x = symbolic_bit("x");
        let y = symbolic_bit("y");
        check(&[Rc::new(Expr::And { left: x.clone(), right: not(x.clone()) })], Unsat);
        check(&[Rc::new(Expr::Or { left: x.clone(), right: not(x.clone()) })], Sat);
        check(&[Rc::new(Expr::Xor { left: x.clone(), right: x.clone() })], Unsat);
        // Equality of two symbolic Booleans is an iff
        check(&[eq(x.clone(), y.clone()), x, not(y)], Unsat)
    }

    #[test]
    fn extract_concat_roundtrip() {
        let x = symbolic_byte("x");
        let hi = Rc::new(Expr::Extract { expr: x.clone(), offset: 5, width: 3 });
        let lo = Rc::new(Expr::Extract { expr: x.clone(), offset: 0, width: 5 });
        let concat = Rc::new(Expr::Concat { kids: vec![hi, lo] });
        check(&[not(eq(concat, x))], Unsat)
    }

    #[test]
    fn nary_concat() {
        let concat = Rc::new(Expr::Concat { kids: vec![bv(0x12, 8), bv(0x34, 8), bv(0x56, 8)] });
        check_valid(eq(concat, bv(0x123456, 24)))
    }

    #[test]
    fn extensions_of_booleans() {
        let x = symbolic_bit("x");
        let zext = Rc::new(Expr::ZExt { src: x.clone(), width: 32 });
        check(&[eq(zext.clone(), bv(1, 32)), x.clone()], Sat);
        check(&[eq(zext, bv(0, 32)), x.clone()], Unsat);

        let sext = Rc::new(Expr::SExt { src: x.clone(), width: 8 });
        check(&[eq(sext.clone(), bv(0xFF, 8)), x.clone()], Sat);
        check(&[eq(sext, bv(0xFF, 8)), not(x)], Unsat)
    }

    #[test]
    fn wide_constants() {
        // Constants past 64 bits are assembled from 64-bit chunks
        check_valid(eq(bv128((1u128 << 64) | 5, 96), Rc::new(Expr::Concat { kids: vec![bv(1, 32), bv(5, 64)] })));

        let cfg = Config::new();
        let ctx = Context::new(cfg);
        let builder = Builder::new(&ctx);
        let solver = Solver::new(&ctx);

        // A sign-extended constant with the payload's top bit set gets
        // an all-ones high part
        let negative = builder.bv_sext_const(100, 0x8000_0000_0000_0000);
        let ones = builder.bv_minus_one(36).mk_concat(&builder.bv_const64(64, 0x8000_0000_0000_0000));
        solver.assert(&negative.mk_eq(&ones).mk_not());
        assert!(solver.check_sat() == Unsat);

        let cfg = Config::new();
        let ctx = Context::new(cfg);
        let builder = Builder::new(&ctx);
        let solver = Solver::new(&ctx);

        // ... and an all-zeros high part otherwise
        let positive = builder.bv_sext_const(100, 42);
        let zeros = builder.bv_zero(36).mk_concat(&builder.bv_const64(64, 42));
        solver.assert(&positive.mk_eq(&zeros).mk_not());
        assert!(solver.check_sat() == Unsat)
    }

    #[test]
    fn constant_shifts() {
        let x = symbolic_byte("x");
        check(&[eq(x.clone(), bv(0x41, 8)), not(eq(Rc::new(Expr::Shl { left: x.clone(), right: bv(1, 8) }), bv(0x82, 8)))], Unsat);
        check(&[eq(x.clone(), bv(0xF0, 8)), not(eq(Rc::new(Expr::LShr { left: x.clone(), right: bv(4, 8) }), bv(0x0F, 8)))], Unsat);
        // Shift by zero is the identity
        check(&[not(eq(Rc::new(Expr::Shl { left: x.clone(), right: bv(0, 8) }), x.clone()))], Unsat);
        // Constant overshift goes to zero
        check(&[not(eq(Rc::new(Expr::Shl { left: x.clone(), right: bv(8, 8) }), bv(0, 8)))], Unsat);
        check(&[not(eq(Rc::new(Expr::LShr { left: x, right: bv(200, 8) }), bv(0, 8)))], Unsat)
    }

    #[test]
    fn variable_shift_ladder() {
        let x = symbolic_byte("x");
        let y = symbolic_byte("y");
        let shl = Rc::new(Expr::Shl { left: x.clone(), right: y.clone() });
        // In range the ladder behaves like the real shift
        check(&[eq(y.clone(), bv(1, 8)), eq(x.clone(), bv(0x41, 8)), not(eq(shl.clone(), bv(0x82, 8)))], Unsat);
        // Shift amounts >= the width give zero
        check(&[eq(y.clone(), bv(9, 8)), not(eq(shl, bv(0, 8)))], Unsat);

        let lshr = Rc::new(Expr::LShr { left: x.clone(), right: y.clone() });
        check(&[eq(y.clone(), bv(4, 8)), eq(x.clone(), bv(0xF0, 8)), not(eq(lshr.clone(), bv(0x0F, 8)))], Unsat);
        check(&[eq(y, bv(255, 8)), not(eq(lshr, bv(0, 8)))], Unsat)
    }

    #[test]
    fn arithmetic_right_shift() {
        let x = symbolic_byte("x");
        let y = symbolic_byte("y");

        // Sign bit replication for negative values
        check_valid(eq(Rc::new(Expr::AShr { left: bv(0x80, 8), right: bv(4, 8) }), bv(0xF8, 8)));
        check_valid(eq(Rc::new(Expr::AShr { left: bv(0x70, 8), right: bv(4, 8) }), bv(0x07, 8)));

        // Overshift gives zero even for negative values; the engine
        // has always encoded it that way, where the machine would
        // saturate to the sign
        check_valid(eq(Rc::new(Expr::AShr { left: bv(0x80, 8), right: bv(12, 8) }), bv(0, 8)));
        check(&[not(eq(Rc::new(Expr::AShr { left: x.clone(), right: bv(12, 8) }), bv(0, 8)))], Unsat);

        // The variable-amount ladder agrees with the constant cases
        let var = Rc::new(Expr::AShr { left: x.clone(), right: y.clone() });
        check(&[eq(x.clone(), bv(0x80, 8)), eq(y.clone(), bv(4, 8)), not(eq(var.clone(), bv(0xF8, 8)))], Unsat);
        check(&[eq(y, bv(9, 8)), not(eq(var, bv(0, 8)))], Unsat)
    }

    #[test]
    fn fp_ordered_unordered_eq() {
        check(&[Rc::new(Expr::FOeq { left: fc32(1.0), right: fc32(1.0) })], Sat);
        check(&[Rc::new(Expr::FOeq { left: fc32(f32::NAN), right: fc32(f32::NAN) })], Unsat);
        check(&[Rc::new(Expr::FUeq { left: fc32(f32::NAN), right: fc32(f32::NAN) })], Sat);
        check(&[Rc::new(Expr::FUne { left: fc32(1.0), right: fc32(1.0) })], Unsat);
        check(&[Rc::new(Expr::FOne { left: fc32(1.0), right: fc32(2.0) })], Sat);
        check(&[Rc::new(Expr::FOrd { left: fc32(1.0), right: fc32(f32::NAN) })], Unsat);
        check(&[Rc::new(Expr::FUno { left: fc32(1.0), right: fc32(f32::NAN) })], Sat)
    }

    #[test]
    fn fp_orderings() {
        check(&[Rc::new(Expr::FOlt { left: fc64(1.0), right: fc64(2.0) })], Sat);
        check(&[Rc::new(Expr::FOlt { left: fc64(2.0), right: fc64(1.0) })], Unsat);
        check(&[Rc::new(Expr::FOle { left: fc64(2.0), right: fc64(2.0) })], Sat);
        check(&[Rc::new(Expr::FOgt { left: fc64(1.0), right: fc64(f64::NAN) })], Unsat);
        // Unordered comparisons hold when either side is NaN
        check(&[Rc::new(Expr::FUgt { left: fc64(1.0), right: fc64(f64::NAN) })], Sat);
        check(&[Rc::new(Expr::FUge { left: fc64(f64::NAN), right: fc64(1.0) })], Sat);
        check(&[Rc::new(Expr::FUlt { left: fc64(2.0), right: fc64(1.0) })], Unsat);
        check(&[Rc::new(Expr::FUle { left: fc64(f64::NAN), right: fc64(f64::NAN) })], Sat)
    }

    #[test]
    fn fp_arithmetic() {
        let rm = RoundingMode::default();
        let sum = Rc::new(Expr::FAdd { left: fc32(1.0), right: fc32(2.0), rm });
        check(&[Rc::new(Expr::FOeq { left: sum, right: fc32(3.0) })], Sat);

        let quot = Rc::new(Expr::FDiv { left: fc64(1.0), right: fc64(4.0), rm });
        check(&[Rc::new(Expr::FOeq { left: quot, right: fc64(0.25) })], Sat);

        let root = Rc::new(Expr::FSqrt { expr: fc64(9.0), rm });
        check(&[Rc::new(Expr::FOeq { left: root, right: fc64(3.0) })], Sat);

        // 5.5 rem 2.0 rounds the quotient to even, leaving -0.5
        let rem = Rc::new(Expr::FRem { left: fc32(5.5), right: fc32(2.0) });
        check(&[Rc::new(Expr::FOeq { left: rem, right: fc32(-0.5) })], Sat);

        let nearby = Rc::new(Expr::FNearbyInt { expr: fc64(2.5), rm });
        check(&[Rc::new(Expr::FOeq { left: nearby, right: fc64(2.0) })], Sat);

        check(&[Rc::new(Expr::FOeq {
            left: Rc::new(Expr::FMin { left: fc32(1.0), right: fc32(2.0) }),
            right: fc32(1.0),
        })], Sat);
        check(&[Rc::new(Expr::FOeq {
            left: Rc::new(Expr::FAbs { expr: fc32(-1.5) }),
            right: fc32(1.5),
        })], Sat)
    }

    #[test]
    fn fp_classification() {
        check_valid(eq(Rc::new(Expr::FpClassify { expr: fc32(0.0) }), bv(FP_ZERO as u64, 32)));
        check_valid(eq(Rc::new(Expr::FpClassify { expr: fc64(1.0) }), bv(FP_NORMAL as u64, 32)));
        check_valid(eq(Rc::new(Expr::FpClassify { expr: fc32(f32::NAN) }), bv(FP_NAN as u64, 32)));
        check_valid(eq(Rc::new(Expr::FIsNan { expr: fc32(f32::NAN) }), bv(1, 32)));
        check_valid(eq(Rc::new(Expr::FIsFinite { expr: fc32(1.0) }), bv(1, 32)));
        check_valid(eq(Rc::new(Expr::FIsFinite { expr: fc32(f32::INFINITY) }), bv(0, 32)));
        // isinf signs its result
        check_valid(eq(Rc::new(Expr::FIsInf { expr: fc32(f32::NEG_INFINITY) }), bv(0xFFFF_FFFF, 32)));
        check_valid(eq(Rc::new(Expr::FIsInf { expr: fc32(f32::INFINITY) }), bv(1, 32)))
    }

    #[test]
    fn fp_conversions() {
        let rm = RoundingMode::default();
        let widened = Rc::new(Expr::FExt { src: fc32(1.5), width: 64, rm });
        check(&[Rc::new(Expr::FOeq { left: widened, right: fc64(1.5) })], Sat);

        let rtz = RoundingMode::TowardZero;
        check_valid(eq(Rc::new(Expr::FToS { src: fc64(-2.5), width: 32, rm: rtz }), bv(0xFFFF_FFFE, 32)));
        check_valid(eq(Rc::new(Expr::FToU { src: fc32(3.75), width: 8, rm: rtz }), bv(3, 8)));

        let from_unsigned = Rc::new(Expr::UToF { src: bv(7, 32), width: 32, rm });
        check(&[Rc::new(Expr::FOeq { left: from_unsigned, right: fc32(7.0) })], Sat);

        let from_signed = Rc::new(Expr::SToF { src: bv(0xFFFF_FFF9, 32), width: 32, rm });
        check(&[Rc::new(Expr::FOeq { left: from_signed, right: fc32(-7.0) })], Sat);

        // Bit reinterpretation in both directions
        let as_float = Rc::new(Expr::ExplicitFloat { src: bv(0x3F80_0000, 32) });
        check(&[Rc::new(Expr::FOeq { left: as_float, right: fc32(1.0) })], Sat);
        check_valid(eq(Rc::new(Expr::ExplicitInt { src: fc32(1.0) }), bv(0x3F80_0000, 32)))
    }

    #[test]
    fn f80_unnormal_classification() {
        // Classification ignores the sentinel: an unnormal with all
        // other fields zero looks like zero
        check_valid(eq(Rc::new(Expr::FpClassify { expr: fc80(UNNORMAL) }), bv(FP_ZERO as u64, 32)));
        // ... but isinf consults it
        check_valid(eq(Rc::new(Expr::FIsInf { expr: fc80(UNNORMAL) }), bv(0, 32)));
        check_valid(eq(Rc::new(Expr::FpClassify { expr: fc80(F80_ONE) }), bv(FP_NORMAL as u64, 32)))
    }

    #[test]
    fn f80_unnormal_arithmetic() {
        let rm = RoundingMode::default();

        // Any unnormal operand poisons arithmetic to NaN
        let sum = Rc::new(Expr::FAdd { left: fc80(UNNORMAL), right: fc80(F80_TWO), rm });
        check_valid(eq(Rc::new(Expr::FIsNan { expr: sum }), bv(1, 32)));

        let sum = Rc::new(Expr::FAdd { left: fc80(F80_ONE), right: fc80(F80_ONE), rm });
        check(&[Rc::new(Expr::FOeq { left: sum, right: fc80(F80_TWO) })], Sat);

        // fabs keeps the sentinel, so the result still poisons
        let abs = Rc::new(Expr::FAbs { expr: fc80(UNNORMAL) });
        let sum = Rc::new(Expr::FAdd { left: abs, right: fc80(F80_TWO), rm });
        check_valid(eq(Rc::new(Expr::FIsNan { expr: sum }), bv(1, 32)))
    }

    #[test]
    fn f80_unnormal_min_max() {
        // One unnormal operand: the other side wins
        let min = Rc::new(Expr::FMin { left: fc80(UNNORMAL), right: fc80(F80_TWO) });
        check(&[Rc::new(Expr::FOeq { left: min, right: fc80(F80_TWO) })], Sat);
        let max = Rc::new(Expr::FMax { left: fc80(F80_ONE), right: fc80(UNNORMAL) });
        check(&[Rc::new(Expr::FOeq { left: max, right: fc80(F80_ONE) })], Sat);
        // Neither unnormal: the usual semantics
        let min = Rc::new(Expr::FMin { left: fc80(F80_TWO), right: fc80(F80_ONE) });
        check(&[Rc::new(Expr::FOeq { left: min, right: fc80(F80_ONE) })], Sat)
    }

    #[test]
    fn f80_unnormal_comparisons() {
        // Inequality is the only comparison that holds for unnormals
        check(&[Rc::new(Expr::FUne { left: fc80(UNNORMAL), right: fc80(UNNORMAL) })], Sat);
        check(&[Rc::new(Expr::FOne { left: fc80(UNNORMAL), right: fc80(UNNORMAL) })], Sat);
        check(&[Rc::new(Expr::FOeq { left: fc80(UNNORMAL), right: fc80(UNNORMAL) })], Unsat);
        check(&[Rc::new(Expr::FUeq { left: fc80(UNNORMAL), right: fc80(UNNORMAL) })], Unsat);
        check(&[Rc::new(Expr::FOlt { left: fc80(UNNORMAL), right: fc80(F80_TWO) })], Unsat);
        check(&[Rc::new(Expr::FOeq { left: fc80(F80_ONE), right: fc80(F80_ONE) })], Sat)
    }

    #[test]
    fn f80_unnormal_integer_conversions() {
        let rm = RoundingMode::default();
        // int and long long get the least value, narrower types zero
        check_valid(eq(
            Rc::new(Expr::FToS { src: fc80(UNNORMAL), width: 32, rm }),
            bv(0x8000_0000, 32),
        ));
        check_valid(eq(
            Rc::new(Expr::FToS { src: fc80(UNNORMAL), width: 64, rm }),
            bv(0x8000_0000_0000_0000, 64),
        ));
        check_valid(eq(Rc::new(Expr::FToS { src: fc80(UNNORMAL), width: 16, rm }), bv(0, 16)));
        check_valid(eq(Rc::new(Expr::FToU { src: fc80(UNNORMAL), width: 32, rm }), bv(0, 32)));
        // Legal values convert normally
        check_valid(eq(Rc::new(Expr::FToS { src: fc80(F80_TWO), width: 32, rm }), bv(2, 32)))
    }

    #[test]
    fn f80_rounding_casts() {
        let rm = RoundingMode::default();
        // Rounding an unnormal to a narrower format gives NaN
        let narrowed = Rc::new(Expr::FExt { src: fc80(UNNORMAL), width: 64, rm });
        check_valid(eq(Rc::new(Expr::FIsNan { expr: narrowed }), bv(1, 32)));

        let narrowed = Rc::new(Expr::FExt { src: fc80(F80_TWO), width: 32, rm });
        check(&[Rc::new(Expr::FOeq { left: narrowed, right: fc32(2.0) })], Sat);

        // Conversions into the 80-bit format carry the legal sentinel
        let widened = Rc::new(Expr::FExt { src: fc32(2.0), width: 80, rm });
        check(&[Rc::new(Expr::FOeq { left: widened, right: fc80(F80_TWO) })], Sat);

        let from_int = Rc::new(Expr::SToF { src: bv(2, 32), width: 80, rm });
        check(&[Rc::new(Expr::FOeq { left: from_int, right: fc80(F80_TWO) })], Sat)
    }

    #[test]
    fn f80_bitcast_roundtrip() {
        // Reinterpreting a legal pattern as a float and back is the
        // identity, with the hidden bit recomputed from the exponent
        let src = bv128(F80_ONE, 80);
        let roundtrip = Rc::new(Expr::ExplicitInt { src: Rc::new(Expr::ExplicitFloat { src: src.clone() }) });
        check(&[not(eq(roundtrip, src))], Unsat);

        // An unnormal pattern is detected by the bitcast
        let unnormal = Rc::new(Expr::ExplicitFloat { src: bv128(UNNORMAL, 80) });
        check_valid(eq(Rc::new(Expr::FIsInf { expr: unnormal.clone() }), bv(0, 32)));
        check_valid(eq(Rc::new(Expr::FpClassify { expr: unnormal }), bv(FP_ZERO as u64, 32)));

        // A legal bitcast value compares equal to the same constant
        let as_float = Rc::new(Expr::ExplicitFloat { src: bv128(F80_TWO, 80) });
        check(&[Rc::new(Expr::FOeq { left: as_float, right: fc80(F80_TWO) })], Sat)
    }
}
