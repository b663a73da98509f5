//! cupSODA input files.
//!
//! cupSODA reads its model from eleven plain-text files in one directory.
//! Columns are tab-separated and rows newline-separated, with no newline after
//! the last row. Floats are written in Rust's shortest round-trip form.

use std::fs;
use std::path::Path;

use itertools::Itertools;
use log::debug;
use ndarray::Array2;

use crate::{
    config::IntegratorOptions,
    errors::SimulatorError,
    model::{Model, Reaction},
    rates::AVOGADRO,
};

/// Model kind understood by cupSODA; only ODE integration is driven here.
pub const MODEL_KIND: &str = "deterministic";

/// Species whose trajectories cupSODA is asked to write, ascending and unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpecies(Vec<usize>);

impl OutputSpecies {
    /// Every species of the model, or only those referenced by an observable.
    pub fn select(model: &Model, obs_species_only: bool) -> Self {
        if obs_species_only {
            Self(
                model
                    .observables
                    .iter()
                    .flat_map(|obs| obs.species())
                    .sorted_unstable()
                    .dedup()
                    .collect(),
            )
        } else {
            Self((0..model.n_species()).collect())
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything needed to render the input files of one run.
pub struct EncoderInput<'a> {
    pub model: &'a Model,
    pub tspan: &'a [f64],
    pub initials: &'a [Vec<f64>],
    pub rates: &'a Array2<f64>,
    pub options: &'a IntegratorOptions,
    pub output: &'a OutputSpecies,
    pub vol: Option<f64>,
}

fn float(x: f64) -> String {
    format!("{x:?}")
}

fn rows<R, T>(rows: R) -> String
where
    R: IntoIterator,
    R::Item: IntoIterator<Item = T>,
    T: ToString,
{
    rows.into_iter()
        .map(|row| row.into_iter().map(|v| v.to_string()).join("\t"))
        .join("\n")
}

/// Initial values as sent to cupSODA: concentrations when a volume is set,
/// with the source pseudo-species pinned to 1.
pub fn scaled_initials(model: &Model, initials: &[Vec<f64>], vol: Option<f64>) -> Vec<Vec<f64>> {
    let Some(vol) = vol else {
        return initials.to_vec();
    };
    let source = model.source_species();
    initials
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(j, x)| {
                    if Some(j) == source {
                        1.0
                    } else {
                        x / (AVOGADRO * vol)
                    }
                })
                .collect()
        })
        .collect()
}

/// Renders the eleven input files as `(file name, contents)` pairs.
pub fn encode(input: &EncoderInput) -> Vec<(&'static str, String)> {
    let model = input.model;
    let n_species = model.n_species();

    let stoichiometry = |side: fn(&Reaction, usize) -> usize| {
        rows(
            model
                .reactions
                .iter()
                .map(|rxn| (0..n_species).map(move |s| side(rxn, s))),
        )
    };

    let mx0 = scaled_initials(model, input.initials, input.vol);

    vec![
        (
            "atol_vector",
            itertools::repeat_n(float(input.options.atol), n_species).join("\n"),
        ),
        (
            "c_matrix",
            rows(input.rates.rows().into_iter().map(|r| r.into_iter().map(|&k| float(k)))),
        ),
        ("cs_vector", input.output.indices().iter().join("\n")),
        (
            "left_side",
            stoichiometry(Reaction::reactant_stoichiometry),
        ),
        ("max_steps", input.options.max_steps.to_string()),
        ("modelkind", MODEL_KIND.to_string()),
        (
            "MX_0",
            rows(mx0.iter().map(|row| row.iter().map(|&x| float(x)))),
        ),
        (
            "right_side",
            stoichiometry(Reaction::product_stoichiometry),
        ),
        ("rtol", float(input.options.rtol)),
        ("t_vector", input.tspan.iter().map(|&t| float(t)).join("\n")),
        (
            "time_max",
            input.tspan.last().map(|&t| float(t)).unwrap_or_default(),
        ),
    ]
}

/// Writes the input files into `dir`.
pub fn write_input_files(dir: &Path, input: &EncoderInput) -> Result<(), SimulatorError> {
    for (name, contents) in encode(input) {
        fs::write(dir.join(name), contents)?;
    }
    debug!("Wrote cupSODA input files to {}", dir.display());
    Ok(())
}
