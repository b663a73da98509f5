//! Rate-constant evaluation strategies.
//!
//! Every reaction's rate constant is an `Expr` over the rate parameters. A
//! `RateEvaluator` turns one rate-parameter row into one row of rate constants.
//! Two implementations exist:
//!
//! - `JitEvaluator`: all constants compiled into one native function with Cranelift
//! - `InterpretedEvaluator`: each constant run as a flattened stack program
//!
//! `build_evaluator` picks one according to `EvaluatorBackend`. With `Auto` the
//! host is checked first by building a real JIT module and the interpreter is
//! used when that or the compilation itself fails.

use log::{debug, warn};

use crate::{
    builder,
    config::EvaluatorBackend,
    errors::SimulatorError,
    expr::{Expr, FlattenedExpr},
    types::CombinedJITFunction,
};

/// Evaluates every rate constant for one parameter row.
pub trait RateEvaluator: Send + Sync {
    /// Writes one rate constant per reaction into `out`.
    fn eval_row(&self, params: &[f64], out: &mut [f64]);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Stack-machine evaluation of flattened expressions.
pub struct InterpretedEvaluator {
    programs: Vec<FlattenedExpr>,
}

impl InterpretedEvaluator {
    /// Flattens `exprs`, rejecting any that read past a row of `n_params` values.
    pub fn new(exprs: &[Expr], n_params: usize) -> Result<Self, SimulatorError> {
        let programs: Vec<FlattenedExpr> = exprs.iter().map(Expr::flatten).collect();
        for (j, program) in programs.iter().enumerate() {
            if let Some(index) = program.max_var_index.filter(|&i| i as usize >= n_params) {
                return Err(SimulatorError::Configuration(format!(
                    "rate constant of reaction {j} reads parameter slot {index}, but rows have {n_params}"
                )));
            }
        }
        Ok(Self { programs })
    }
}

impl RateEvaluator for InterpretedEvaluator {
    fn eval_row(&self, params: &[f64], out: &mut [f64]) {
        for (slot, program) in out.iter_mut().zip(&self.programs) {
            *slot = program.eval(params);
        }
    }

    fn name(&self) -> &'static str {
        "interpreted"
    }
}

/// Natively compiled evaluation of all rate constants at once.
pub struct JitEvaluator {
    function: CombinedJITFunction,
}

impl JitEvaluator {
    pub fn new(exprs: &[Expr], n_params: usize) -> Result<Self, SimulatorError> {
        Ok(Self {
            function: builder::build_combined_function(exprs, n_params)?,
        })
    }
}

impl RateEvaluator for JitEvaluator {
    fn eval_row(&self, params: &[f64], out: &mut [f64]) {
        (self.function)(params, out)
    }

    fn name(&self) -> &'static str {
        "jit"
    }
}

/// Builds the evaluator for `exprs` using the requested backend.
///
/// # Arguments
/// * `exprs` - One simplified rate-constant expression per reaction
/// * `n_params` - Width of the rate-parameter rows that will be evaluated
/// * `backend` - Which strategy to use
///
/// # Errors
/// Returns `Configuration` when an expression reads a parameter slot outside
/// `n_params`, or when `EvaluatorBackend::Jit` was requested explicitly and
/// compilation failed. `Auto` degrades to the interpreter.
pub fn build_evaluator(
    exprs: &[Expr],
    n_params: usize,
    backend: EvaluatorBackend,
) -> Result<Box<dyn RateEvaluator>, SimulatorError> {
    let evaluator: Box<dyn RateEvaluator> = match backend {
        EvaluatorBackend::Interpreted => Box::new(InterpretedEvaluator::new(exprs, n_params)?),
        EvaluatorBackend::Jit => Box::new(JitEvaluator::new(exprs, n_params)?),
        EvaluatorBackend::Auto => match builder::check_jit_support() {
            Ok(_) => match JitEvaluator::new(exprs, n_params) {
                Ok(jit) => Box::new(jit),
                Err(e) => {
                    warn!("JIT compilation of rate constants failed, using interpreter: {e}");
                    Box::new(InterpretedEvaluator::new(exprs, n_params)?)
                }
            },
            Err(e) => {
                warn!("Cranelift cannot target this host ({e}), using interpreter");
                Box::new(InterpretedEvaluator::new(exprs, n_params)?)
            }
        },
    };
    debug!(
        "Evaluating {} rate constants with the {} backend",
        exprs.len(),
        evaluator.name()
    );
    Ok(evaluator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::VarRef;

    fn var(name: &str, index: u32) -> Box<Expr> {
        Box::new(Expr::Var(VarRef {
            name: name.to_string(),
            index,
        }))
    }

    fn sample_exprs() -> Vec<Expr> {
        vec![
            Expr::Mul(var("kf", 0), Box::new(Expr::Const(6.02214076e23 * 1e-19))),
            Expr::Div(var("kr", 1), Box::new(Expr::Sqrt(var("kf", 0)))),
            Expr::Exp(Box::new(Expr::Neg(var("kr", 1)))),
            Expr::Const(1.0),
        ]
    }

    #[test]
    fn test_interpreted_row() {
        let evaluator = build_evaluator(&sample_exprs(), 2, EvaluatorBackend::Interpreted).unwrap();
        let mut out = vec![0.0; 4];
        evaluator.eval_row(&[4.0, 2.0], &mut out);
        assert_eq!(evaluator.name(), "interpreted");
        assert!((out[0] - 4.0 * 6.02214076e4).abs() < 1e-6);
        assert_eq!(out[1], 1.0);
        assert!((out[2] - (-2.0f64).exp()).abs() < 1e-15);
        assert_eq!(out[3], 1.0);
    }

    #[test]
    fn test_backends_agree() {
        let exprs = sample_exprs();
        let jit = build_evaluator(&exprs, 2, EvaluatorBackend::Jit).unwrap();
        let interp = build_evaluator(&exprs, 2, EvaluatorBackend::Interpreted).unwrap();
        for row in [[4.0, 2.0], [0.25, 7.5], [1e-3, 1e3]] {
            let mut a = vec![0.0; exprs.len()];
            let mut b = vec![0.0; exprs.len()];
            jit.eval_row(&row, &mut a);
            interp.eval_row(&row, &mut b);
            for (x, y) in a.iter().zip(&b) {
                assert!((x - y).abs() <= 1e-12 * y.abs().max(1.0), "{x} != {y}");
            }
        }
    }

    #[test]
    fn test_auto_uses_jit_on_supported_host() {
        let evaluator = build_evaluator(&sample_exprs(), 2, EvaluatorBackend::Auto).unwrap();
        assert_eq!(evaluator.name(), "jit");
    }

    #[test]
    fn test_slot_out_of_range() {
        let err = build_evaluator(&sample_exprs(), 1, EvaluatorBackend::Interpreted)
            .err()
            .unwrap();
        assert!(matches!(err, SimulatorError::Configuration(msg) if msg.contains("slot 1")));
    }

    #[test]
    fn test_empty_network() {
        let evaluator = build_evaluator(&[], 0, EvaluatorBackend::Auto).unwrap();
        let mut out: Vec<f64> = vec![];
        evaluator.eval_row(&[], &mut out);
        assert!(out.is_empty());
    }
}
