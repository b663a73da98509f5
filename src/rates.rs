//! Rate-matrix compilation.
//!
//! cupSODA takes one mass-action rate constant per reaction and simulation.
//! `RateCompiler` parses every reaction rate once, keeps only its rate-constant
//! factors, and builds an evaluator over the model's rate parameters. The
//! evaluator is then run for each row of the parameter matrix.

use std::collections::HashMap;

use evalexpr::{build_operator_tree, DefaultNumericTypes};
use log::debug;
use ndarray::Array2;
use rayon::prelude::*;

use crate::{
    config::EvaluatorBackend,
    convert::{build_ast, mass_action_factors},
    errors::SimulatorError,
    evaluator::{build_evaluator, RateEvaluator},
    expr::Expr,
    model::Model,
};

/// Avogadro's number, exact by SI definition.
pub const AVOGADRO: f64 = 6.02214076e23;

/// Extracts the rate-constant expression of one reaction rate.
///
/// `var_map` maps each rate parameter to its column in the rate-parameter row.
pub fn rate_constant(rate: &str, var_map: &HashMap<String, u32>) -> Result<Expr, SimulatorError> {
    let tree = build_operator_tree::<DefaultNumericTypes>(rate)?;
    let factors = mass_action_factors(&tree)?
        .into_iter()
        .map(|factor| build_ast(factor, var_map))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SimulatorError::Configuration(format!("reaction rate '{rate}': {e}")))?;
    Ok(*Expr::product(factors).simplify())
}

/// Volume correction applied to a reaction's rate constant.
///
/// Concentration-based rates of order `n` scale with `(N_A * vol)^(n - 1)`.
pub fn volume_factor(order: usize, vol: Option<f64>) -> f64 {
    match vol {
        Some(vol) => (AVOGADRO * vol).powi(order as i32 - 1),
        None => 1.0,
    }
}

/// Rate constants of every reaction, ready to be evaluated per simulation.
pub struct RateCompiler {
    rate_params: Vec<usize>,
    orders: Vec<usize>,
    evaluator: Box<dyn RateEvaluator>,
}

impl RateCompiler {
    /// Parses every reaction rate of `model` and builds the evaluator.
    ///
    /// # Errors
    /// Returns `Configuration` if a rate cannot be parsed, references an
    /// identifier that is neither a parameter nor a species placeholder, or is
    /// not a mass-action law.
    pub fn new(model: &Model, backend: EvaluatorBackend) -> Result<Self, SimulatorError> {
        let rate_params = model.rate_parameters()?;
        let var_map: HashMap<String, u32> = rate_params
            .iter()
            .enumerate()
            .map(|(slot, &p)| (model.parameters[p].name.clone(), slot as u32))
            .collect();

        let exprs = model
            .reactions
            .iter()
            .map(|rxn| rate_constant(&rxn.rate, &var_map))
            .collect::<Result<Vec<_>, _>>()?;
        let orders = (0..model.n_reactions())
            .map(|j| model.reaction_order(j))
            .collect();

        let evaluator = build_evaluator(&exprs, rate_params.len(), backend)?;

        Ok(Self {
            rate_params,
            orders,
            evaluator,
        })
    }

    /// Indices of the model parameters the rate constants read.
    pub fn rate_parameters(&self) -> &[usize] {
        &self.rate_params
    }

    /// Evaluates the `n_sims x n_reactions` rate matrix.
    ///
    /// # Arguments
    /// * `param_values` - One full model parameter row per simulation
    /// * `vol` - Reaction volume; enables the volume correction when set
    pub fn compute(
        &self,
        param_values: &[Vec<f64>],
        vol: Option<f64>,
    ) -> Result<Array2<f64>, SimulatorError> {
        let n_reactions = self.orders.len();
        let scale: Vec<f64> = self
            .orders
            .iter()
            .map(|&order| volume_factor(order, vol))
            .collect();

        let flat: Vec<f64> = param_values
            .par_iter()
            .flat_map_iter(|row| {
                let params: Vec<f64> = self.rate_params.iter().map(|&p| row[p]).collect();
                let mut out = vec![0.0; n_reactions];
                self.evaluator.eval_row(&params, &mut out);
                out.into_iter().zip(&scale).map(|(k, s)| k * s)
            })
            .collect();

        debug!(
            "Computed {}x{} rate matrix",
            param_values.len(),
            n_reactions
        );
        Array2::from_shape_vec((param_values.len(), n_reactions), flat)
            .map_err(|e| SimulatorError::Configuration(format!("rate matrix shape: {e}")))
    }
}
