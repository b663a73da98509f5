//! Expression module for representing rate-constant expressions.
//!
//! A reaction's rate constant is the part of its rate law left over once the
//! species placeholders are factored out. This module holds the typed tree for
//! that part:
//!
//! - `Expr`: An enum of arithmetic nodes over parameters and literals
//! - `VarRef`: A parameter reference carrying its slot in the parameter row
//! - `FlattenedExpr`: A linear stack program used by the interpreted evaluator
//!
//! The same tree is either lowered to Cranelift IR (`codegen`) or flattened and
//! interpreted (`flatten` + `FlattenedExpr::eval`), so both backends agree on
//! semantics by construction.

use cranelift::prelude::*;
use cranelift_codegen::ir::immediates::Offset32;
use cranelift_module::Module;

use crate::errors::BuilderError;
use crate::operators;

/// Represents a reference to a rate parameter in an expression.
///
/// `index` is the column of the parameter inside the rate-parameter row passed
/// to the evaluator, not its position in the full model parameter list.
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub index: u32,
}

/// An expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant floating point value
    Const(f64),
    /// A reference to a rate parameter
    Var(VarRef),
    /// Addition of two expressions
    Add(Box<Expr>, Box<Expr>),
    /// Multiplication of two expressions
    Mul(Box<Expr>, Box<Expr>),
    /// Subtraction of two expressions
    Sub(Box<Expr>, Box<Expr>),
    /// Division of two expressions
    Div(Box<Expr>, Box<Expr>),
    /// Absolute value of an expression
    Abs(Box<Expr>),
    /// Exponentiation of an expression by an integer constant
    Pow(Box<Expr>, i64),
    /// Exponentiation of an expression by a floating point constant
    PowFloat(Box<Expr>, f64),
    /// Exponential function of an expression
    Exp(Box<Expr>),
    /// Natural logarithm of an expression
    Ln(Box<Expr>),
    /// Square root of an expression
    Sqrt(Box<Expr>),
    /// Negation of an expression
    Neg(Box<Expr>),
}

/// Linear operation for flattened expression evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum LinearOp {
    /// Load constant value
    LoadConst(f64),
    /// Load parameter by slot
    LoadVar(u32),
    Add,
    Sub,
    Mul,
    Div,
    Abs,
    Neg,
    /// Power operation with integer exponent
    PowConst(i64),
    /// Power operation with floating point exponent
    PowFloat(f64),
    Exp,
    Ln,
    Sqrt,
}

/// Flattened expression representation for the interpreted backend
#[derive(Debug, Clone)]
pub struct FlattenedExpr {
    /// Linear sequence of operations in postfix order
    pub ops: Vec<LinearOp>,
    /// Maximum parameter slot accessed
    pub max_var_index: Option<u32>,
    /// Pre-computed constant result (if expression is constant)
    pub constant_result: Option<f64>,
}

impl Expr {
    /// Multiplies a list of factors into a single product, `1` for an empty list.
    pub fn product(factors: Vec<Expr>) -> Expr {
        factors
            .into_iter()
            .reduce(|acc, f| Expr::Mul(Box::new(acc), Box::new(f)))
            .unwrap_or(Expr::Const(1.0))
    }

    /// Folds constant subtrees and removes neutral elements.
    ///
    /// Only rewrites that preserve IEEE semantics for finite inputs are applied:
    /// - Constant folding (e.g. 2 * 3 → 6)
    /// - Identity rules (x * 1 → x, x + 0 → x, x / 1 → x)
    /// - Exponent rules (x^0 → 1, x^1 → x)
    /// - Double negation (--x → x)
    pub fn simplify(&self) -> Box<Expr> {
        if let Some(c) = self.try_evaluate_constant() {
            return Box::new(Expr::Const(c));
        }
        match self {
            Expr::Const(_) | Expr::Var(_) => Box::new(self.clone()),
            Expr::Add(left, right) => {
                let (l, r) = (left.simplify(), right.simplify());
                match (&*l, &*r) {
                    (e, Expr::Const(c)) | (Expr::Const(c), e) if *c == 0.0 => Box::new(e.clone()),
                    _ => Box::new(Expr::Add(l, r)),
                }
            }
            Expr::Sub(left, right) => {
                let (l, r) = (left.simplify(), right.simplify());
                match &*r {
                    Expr::Const(c) if *c == 0.0 => l,
                    _ => Box::new(Expr::Sub(l, r)),
                }
            }
            Expr::Mul(left, right) => {
                let (l, r) = (left.simplify(), right.simplify());
                match (&*l, &*r) {
                    (e, Expr::Const(c)) | (Expr::Const(c), e) if *c == 1.0 => Box::new(e.clone()),
                    (e, Expr::Const(c)) | (Expr::Const(c), e) if *c == -1.0 => {
                        Box::new(Expr::Neg(Box::new(e.clone())))
                    }
                    _ => Box::new(Expr::Mul(l, r)),
                }
            }
            Expr::Div(left, right) => {
                let (l, r) = (left.simplify(), right.simplify());
                match &*r {
                    Expr::Const(c) if *c == 1.0 => l,
                    _ => Box::new(Expr::Div(l, r)),
                }
            }
            Expr::Pow(base, exp) => match exp {
                0 => Box::new(Expr::Const(1.0)),
                1 => base.simplify(),
                _ => Box::new(Expr::Pow(base.simplify(), *exp)),
            },
            Expr::PowFloat(base, exp) => Box::new(Expr::PowFloat(base.simplify(), *exp)),
            Expr::Neg(inner) => {
                let simplified = inner.simplify();
                match *simplified {
                    Expr::Neg(e) => e,
                    e => Box::new(Expr::Neg(Box::new(e))),
                }
            }
            Expr::Abs(e) => Box::new(Expr::Abs(e.simplify())),
            Expr::Exp(e) => Box::new(Expr::Exp(e.simplify())),
            Expr::Ln(e) => Box::new(Expr::Ln(e.simplify())),
            Expr::Sqrt(e) => Box::new(Expr::Sqrt(e.simplify())),
        }
    }

    /// Tries to evaluate expression as constant
    pub fn try_evaluate_constant(&self) -> Option<f64> {
        match self {
            Expr::Const(val) => Some(*val),
            Expr::Var(_) => None,
            Expr::Add(l, r) => Some(l.try_evaluate_constant()? + r.try_evaluate_constant()?),
            Expr::Sub(l, r) => Some(l.try_evaluate_constant()? - r.try_evaluate_constant()?),
            Expr::Mul(l, r) => Some(l.try_evaluate_constant()? * r.try_evaluate_constant()?),
            Expr::Div(l, r) => Some(l.try_evaluate_constant()? / r.try_evaluate_constant()?),
            Expr::Abs(e) => Some(e.try_evaluate_constant()?.abs()),
            Expr::Neg(e) => Some(-e.try_evaluate_constant()?),
            Expr::Pow(b, exp) => Some(b.try_evaluate_constant()?.powi(*exp as i32)),
            Expr::PowFloat(b, exp) => Some(b.try_evaluate_constant()?.powf(*exp)),
            Expr::Exp(e) => Some(e.try_evaluate_constant()?.exp()),
            Expr::Ln(e) => Some(e.try_evaluate_constant()?.ln()),
            Expr::Sqrt(e) => Some(e.try_evaluate_constant()?.sqrt()),
        }
    }

    /// Flattens the tree into a postfix stack program.
    pub fn flatten(&self) -> FlattenedExpr {
        if let Some(constant) = self.try_evaluate_constant() {
            return FlattenedExpr {
                ops: vec![LinearOp::LoadConst(constant)],
                max_var_index: None,
                constant_result: Some(constant),
            };
        }

        let mut ops = Vec::new();
        let mut max_var_index = None;
        self.flatten_recursive(&mut ops, &mut max_var_index);

        FlattenedExpr {
            ops,
            max_var_index,
            constant_result: None,
        }
    }

    fn flatten_recursive(&self, ops: &mut Vec<LinearOp>, max_var_index: &mut Option<u32>) {
        let binary = |l: &Expr, r: &Expr, op: LinearOp, ops: &mut Vec<LinearOp>, mvi: &mut Option<u32>| {
            l.flatten_recursive(ops, mvi);
            r.flatten_recursive(ops, mvi);
            ops.push(op);
        };
        match self {
            Expr::Const(val) => ops.push(LinearOp::LoadConst(*val)),
            Expr::Var(var_ref) => {
                *max_var_index = Some(max_var_index.unwrap_or(0).max(var_ref.index));
                ops.push(LinearOp::LoadVar(var_ref.index));
            }
            Expr::Add(l, r) => binary(l, r, LinearOp::Add, ops, max_var_index),
            Expr::Sub(l, r) => binary(l, r, LinearOp::Sub, ops, max_var_index),
            Expr::Mul(l, r) => binary(l, r, LinearOp::Mul, ops, max_var_index),
            Expr::Div(l, r) => binary(l, r, LinearOp::Div, ops, max_var_index),
            Expr::Abs(e) => {
                e.flatten_recursive(ops, max_var_index);
                ops.push(LinearOp::Abs);
            }
            Expr::Neg(e) => {
                e.flatten_recursive(ops, max_var_index);
                ops.push(LinearOp::Neg);
            }
            Expr::Pow(b, exp) => {
                b.flatten_recursive(ops, max_var_index);
                ops.push(LinearOp::PowConst(*exp));
            }
            Expr::PowFloat(b, exp) => {
                b.flatten_recursive(ops, max_var_index);
                ops.push(LinearOp::PowFloat(*exp));
            }
            Expr::Exp(e) => {
                e.flatten_recursive(ops, max_var_index);
                ops.push(LinearOp::Exp);
            }
            Expr::Ln(e) => {
                e.flatten_recursive(ops, max_var_index);
                ops.push(LinearOp::Ln);
            }
            Expr::Sqrt(e) => {
                e.flatten_recursive(ops, max_var_index);
                ops.push(LinearOp::Sqrt);
            }
        }
    }

    /// Lowers the expression to Cranelift IR.
    ///
    /// `params_ptr` is the pointer to the rate-parameter row; each `Var` becomes
    /// an aligned load at `index * 8`.
    pub fn codegen(
        &self,
        builder: &mut FunctionBuilder,
        module: &mut dyn Module,
        params_ptr: Value,
    ) -> Result<Value, BuilderError> {
        Ok(match self {
            Expr::Const(val) => builder.ins().f64const(*val),
            Expr::Var(VarRef { index, .. }) => builder.ins().load(
                types::F64,
                MemFlags::trusted().with_readonly(),
                params_ptr,
                Offset32::new(*index as i32 * 8),
            ),
            Expr::Add(l, r) => {
                let l = l.codegen(builder, module, params_ptr)?;
                let r = r.codegen(builder, module, params_ptr)?;
                builder.ins().fadd(l, r)
            }
            Expr::Sub(l, r) => {
                let l = l.codegen(builder, module, params_ptr)?;
                let r = r.codegen(builder, module, params_ptr)?;
                builder.ins().fsub(l, r)
            }
            Expr::Mul(l, r) => {
                let l = l.codegen(builder, module, params_ptr)?;
                let r = r.codegen(builder, module, params_ptr)?;
                builder.ins().fmul(l, r)
            }
            Expr::Div(l, r) => {
                let l = l.codegen(builder, module, params_ptr)?;
                let r = r.codegen(builder, module, params_ptr)?;
                builder.ins().fdiv(l, r)
            }
            Expr::Abs(e) => {
                let v = e.codegen(builder, module, params_ptr)?;
                builder.ins().fabs(v)
            }
            Expr::Neg(e) => {
                let v = e.codegen(builder, module, params_ptr)?;
                builder.ins().fneg(v)
            }
            Expr::Pow(b, exp) => {
                let base = b.codegen(builder, module, params_ptr)?;
                generate_integer_power(builder, base, *exp)
            }
            Expr::PowFloat(b, exp) => {
                let base = b.codegen(builder, module, params_ptr)?;
                let exponent = builder.ins().f64const(*exp);
                operators::call_libm(builder, module, operators::LibmFn::Pow, &[base, exponent])?
            }
            Expr::Exp(e) => {
                let v = e.codegen(builder, module, params_ptr)?;
                operators::call_libm(builder, module, operators::LibmFn::Exp, &[v])?
            }
            Expr::Ln(e) => {
                let v = e.codegen(builder, module, params_ptr)?;
                operators::call_libm(builder, module, operators::LibmFn::Ln, &[v])?
            }
            Expr::Sqrt(e) => {
                let v = e.codegen(builder, module, params_ptr)?;
                builder.ins().sqrt(v)
            }
        })
    }
}

impl FlattenedExpr {
    /// Executes the stack program against a rate-parameter row.
    pub fn eval(&self, params: &[f64]) -> f64 {
        if let Some(c) = self.constant_result {
            return c;
        }
        let mut stack: Vec<f64> = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            match op {
                LinearOp::LoadConst(c) => stack.push(*c),
                LinearOp::LoadVar(i) => stack.push(params[*i as usize]),
                LinearOp::Add | LinearOp::Sub | LinearOp::Mul | LinearOp::Div => {
                    let (Some(r), Some(l)) = (stack.pop(), stack.pop()) else {
                        return f64::NAN;
                    };
                    stack.push(match op {
                        LinearOp::Add => l + r,
                        LinearOp::Sub => l - r,
                        LinearOp::Mul => l * r,
                        _ => l / r,
                    });
                }
                unary => {
                    let Some(v) = stack.pop() else {
                        return f64::NAN;
                    };
                    stack.push(match unary {
                        LinearOp::Abs => v.abs(),
                        LinearOp::Neg => -v,
                        LinearOp::PowConst(e) => v.powi(*e as i32),
                        LinearOp::PowFloat(e) => v.powf(*e),
                        LinearOp::Exp => v.exp(),
                        LinearOp::Ln => v.ln(),
                        _ => v.sqrt(),
                    });
                }
            }
        }
        stack.pop().unwrap_or(f64::NAN)
    }
}

/// Emits `base^exp` with square-and-multiply; negative exponents take the reciprocal.
fn generate_integer_power(builder: &mut FunctionBuilder, base: Value, exp: i64) -> Value {
    let mut result = builder.ins().f64const(1.0);
    let mut current = base;
    let mut remaining = exp.unsigned_abs();
    while remaining > 0 {
        if remaining & 1 == 1 {
            result = builder.ins().fmul(result, current);
        }
        remaining >>= 1;
        if remaining > 0 {
            current = builder.ins().fmul(current, current);
        }
    }
    if exp < 0 {
        let one = builder.ins().f64const(1.0);
        builder.ins().fdiv(one, result)
    } else {
        result
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const(val) => write!(f, "{val}"),
            Expr::Var(var_ref) => write!(f, "{}", var_ref.name),
            Expr::Add(left, right) => write!(f, "({left} + {right})"),
            Expr::Mul(left, right) => write!(f, "({left} * {right})"),
            Expr::Sub(left, right) => write!(f, "({left} - {right})"),
            Expr::Div(left, right) => write!(f, "({left} / {right})"),
            Expr::Abs(expr) => write!(f, "|{expr}|"),
            Expr::Pow(base, exp) => write!(f, "({base}^{exp})"),
            Expr::PowFloat(base, exp) => write!(f, "({base}^{exp})"),
            Expr::Exp(expr) => write!(f, "exp({expr})"),
            Expr::Ln(expr) => write!(f, "ln({expr})"),
            Expr::Sqrt(expr) => write!(f, "sqrt({expr})"),
            Expr::Neg(expr) => write!(f, "-({expr})"),
        }
    }
}
