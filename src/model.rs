//! The expanded reaction network consumed by the simulator.
//!
//! A `Model` is the output of network generation: it is never expanded or
//! pattern-matched here, only read. Species, reactions, parameters and
//! observables are addressed by index, in the order they appear.
//!
//! # Example
//!
//! ```
//! use cupsoda_sim::model::{Model, Observable, Parameter, Reaction, Species};
//!
//! let model = Model {
//!     name: "decay".to_string(),
//!     species: vec![Species::new("A()"), Species::new("B()")],
//!     reactions: vec![Reaction::new(vec![0], vec![1], "k*__s0")],
//!     parameters: vec![Parameter::new("k", 0.5), Parameter::new("A_0", 100.0)],
//!     observables: vec![Observable::new("A_total", vec![(1.0, 0)])],
//!     initial_conditions: vec![],
//! };
//! assert!(model.validate().is_ok());
//! ```

use std::collections::HashSet;
use std::path::Path;

use colored::Colorize;
use evalexpr::{build_operator_tree, DefaultNumericTypes};
use serde::{Deserialize, Serialize};

use crate::{convert::extract_identifiers, errors::SimulatorError};

/// Canonical key of the unbounded-supply pseudo-species.
pub const SOURCE_SPECIES: &str = "__source()";

/// A molecular species, identified by its canonical structural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Species {
    pub name: String,
}

impl Species {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn is_source(&self) -> bool {
        self.name == SOURCE_SPECIES
    }
}

/// A reaction between species multisets.
///
/// `rate` is the full rate law in evalexpr syntax, e.g. `kf*__s0*__s1`, where
/// `__sN` stands for the population of species `N`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub reactants: Vec<usize>,
    pub products: Vec<usize>,
    pub rate: String,
}

impl Reaction {
    pub fn new(reactants: Vec<usize>, products: Vec<usize>, rate: impl Into<String>) -> Self {
        Self {
            reactants,
            products,
            rate: rate.into(),
        }
    }

    /// Occurrences of `species` among the reactants.
    pub fn reactant_stoichiometry(&self, species: usize) -> usize {
        self.reactants.iter().filter(|&&s| s == species).count()
    }

    /// Occurrences of `species` among the products.
    pub fn product_stoichiometry(&self, species: usize) -> usize {
        self.products.iter().filter(|&&s| s == species).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: f64,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A named linear combination of species, as `(coefficient, species index)` terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observable {
    pub name: String,
    pub terms: Vec<(f64, usize)>,
}

impl Observable {
    pub fn new(name: impl Into<String>, terms: Vec<(f64, usize)>) -> Self {
        Self {
            name: name.into(),
            terms,
        }
    }

    pub fn species(&self) -> impl Iterator<Item = usize> + '_ {
        self.terms.iter().map(|&(_, s)| s)
    }
}

/// Default initial amount of a species, taken from a parameter's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialCondition {
    pub species: usize,
    pub parameter: String,
}

/// An expanded reaction network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    pub species: Vec<Species>,
    pub reactions: Vec<Reaction>,
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub observables: Vec<Observable>,
    #[serde(default)]
    pub initial_conditions: Vec<InitialCondition>,
}

impl Model {
    /// Parses and validates a model from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self, SimulatorError> {
        let model: Model = serde_json::from_str(json)
            .map_err(|e| SimulatorError::Configuration(format!("invalid model JSON: {e}")))?;
        model.validate()?;
        Ok(model)
    }

    /// Reads a model file written in JSON.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SimulatorError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn n_species(&self) -> usize {
        self.species.len()
    }

    pub fn n_reactions(&self) -> usize {
        self.reactions.len()
    }

    pub fn n_params(&self) -> usize {
        self.parameters.len()
    }

    /// Index of the `__source()` pseudo-species, if the network has one.
    pub fn source_species(&self) -> Option<usize> {
        self.species.iter().position(Species::is_source)
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }

    /// Number of reactants of reaction `j` that are real species.
    pub fn reaction_order(&self, j: usize) -> usize {
        self.reactions[j]
            .reactants
            .iter()
            .filter(|&&s| !self.species[s].is_source())
            .count()
    }

    /// Indices of the parameters named in at least one rate expression, in
    /// parameter-list order.
    pub fn rate_parameters(&self) -> Result<Vec<usize>, SimulatorError> {
        let mut used = HashSet::new();
        for rxn in &self.reactions {
            let tree = build_operator_tree::<DefaultNumericTypes>(&rxn.rate)?;
            extract_identifiers(&tree, &mut used);
        }
        Ok(self
            .parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| used.contains(&p.name))
            .map(|(i, _)| i)
            .collect())
    }

    /// Parameter values as declared in the model.
    pub fn default_param_values(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.value).collect()
    }

    /// Initial species amounts as declared by the initial conditions; zero elsewhere.
    pub fn default_initials(&self) -> Vec<f64> {
        let mut initials = vec![0.0; self.n_species()];
        for ic in &self.initial_conditions {
            if let Some(p) = self.parameter_index(&ic.parameter) {
                initials[ic.species] = self.parameters[p].value;
            }
        }
        initials
    }

    /// Checks the index and naming invariants of the network.
    pub fn validate(&self) -> Result<(), SimulatorError> {
        let n_species = self.n_species();
        let bad = |msg: String| Err(SimulatorError::Configuration(msg));

        let mut names = HashSet::new();
        for p in &self.parameters {
            if !names.insert(p.name.as_str()) {
                return bad(format!("duplicate parameter name '{}'", p.name));
            }
        }

        for (j, rxn) in self.reactions.iter().enumerate() {
            if let Some(s) = rxn.reactants.iter().chain(&rxn.products).find(|&&s| s >= n_species) {
                return bad(format!("reaction {j} references species {s} of {n_species}"));
            }
        }

        for obs in &self.observables {
            let mut seen = HashSet::new();
            for s in obs.species() {
                if s >= n_species {
                    return bad(format!(
                        "observable '{}' references species {s} of {n_species}",
                        obs.name
                    ));
                }
                if !seen.insert(s) {
                    return bad(format!(
                        "observable '{}' lists species {s} more than once",
                        obs.name
                    ));
                }
            }
        }

        for ic in &self.initial_conditions {
            if ic.species >= n_species {
                return bad(format!("initial condition for species {} of {n_species}", ic.species));
            }
            if self.parameter_index(&ic.parameter).is_none() {
                return bad(format!(
                    "initial condition references unknown parameter '{}'",
                    ic.parameter
                ));
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} {}", "Model".cyan(), self.name)?;
        writeln!(f, "    {}: {}", "Species".cyan(), self.n_species())?;
        for (i, s) in self.species.iter().enumerate() {
            writeln!(f, "        s{i}: {}", s.name)?;
        }
        writeln!(f, "    {}: {}", "Reactions".cyan(), self.n_reactions())?;
        for rxn in &self.reactions {
            writeln!(
                f,
                "        {:?} -> {:?}  [{}]",
                rxn.reactants, rxn.products, rxn.rate
            )?;
        }
        writeln!(f, "    {}: {}", "Parameters".cyan(), self.n_params())?;
        for p in &self.parameters {
            writeln!(f, "        {} = {}", p.name, p.value)?;
        }
        writeln!(f, "    {}: {}", "Observables".cyan(), self.observables.len())?;
        for obs in &self.observables {
            writeln!(f, "        {}: {:?}", obs.name, obs.terms)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Enzyme E + substrate S ⇌ ES → E + P, plus a source-fed S influx.
    pub(crate) fn michaelis_menten() -> Model {
        Model {
            name: "pysb.examples.michment".to_string(),
            species: vec![
                Species::new("E(s=None)"),
                Species::new("S(e=None, state='0')"),
                Species::new("E(s=1) % S(e=1, state='0')"),
                Species::new("S(e=None, state='1')"),
                Species::new(SOURCE_SPECIES),
            ],
            reactions: vec![
                Reaction::new(vec![0, 1], vec![2], "kf*__s0*__s1"),
                Reaction::new(vec![2], vec![0, 1], "kr*__s2"),
                Reaction::new(vec![2], vec![0, 3], "kcat*__s2"),
                Reaction::new(vec![4], vec![4, 1], "kin*__s4"),
            ],
            parameters: vec![
                Parameter::new("kf", 1.0),
                Parameter::new("kr", 1000.0),
                Parameter::new("kcat", 100.0),
                Parameter::new("kin", 0.5),
                Parameter::new("Etot", 1.0),
                Parameter::new("S0", 10.0),
            ],
            observables: vec![
                Observable::new("E_free", vec![(1.0, 0)]),
                Observable::new("S_free", vec![(1.0, 1)]),
                Observable::new("Product", vec![(1.0, 3)]),
            ],
            initial_conditions: vec![
                InitialCondition {
                    species: 0,
                    parameter: "Etot".to_string(),
                },
                InitialCondition {
                    species: 1,
                    parameter: "S0".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_validate_example() {
        assert!(michaelis_menten().validate().is_ok());
    }

    #[test]
    fn test_source_and_order() {
        let model = michaelis_menten();
        assert_eq!(model.source_species(), Some(4));
        assert_eq!(model.reaction_order(0), 2);
        assert_eq!(model.reaction_order(1), 1);
        assert_eq!(model.reaction_order(3), 0);
    }

    #[test]
    fn test_stoichiometry_counts_duplicates() {
        let rxn = Reaction::new(vec![1, 1, 0], vec![2], "k*__s1^2*__s0");
        assert_eq!(rxn.reactant_stoichiometry(1), 2);
        assert_eq!(rxn.reactant_stoichiometry(0), 1);
        assert_eq!(rxn.product_stoichiometry(1), 0);
    }

    #[test]
    fn test_defaults() {
        let model = michaelis_menten();
        assert_eq!(model.default_initials(), vec![1.0, 10.0, 0.0, 0.0, 0.0]);
        assert_eq!(
            model.default_param_values(),
            vec![1.0, 1000.0, 100.0, 0.5, 1.0, 10.0]
        );
    }

    #[test]
    fn test_rate_parameters() {
        let model = michaelis_menten();
        assert_eq!(model.rate_parameters().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_validate_rejects_duplicate_observable_species() {
        let mut model = michaelis_menten();
        model.observables[0].terms.push((2.0, 0));
        assert!(matches!(
            model.validate(),
            Err(SimulatorError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range_species() {
        let mut model = michaelis_menten();
        model.reactions[0].products.push(9);
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let model = michaelis_menten();
        let json = serde_json::to_string(&model).unwrap();
        assert!(json.contains("\"__source()\""));
        let parsed = Model::from_json(&json).unwrap();
        assert_eq!(parsed, model);
    }

    #[test]
    fn test_from_json_missing_optional_sections() {
        let json = r#"{
            "name": "tiny",
            "species": ["A()"],
            "reactions": [],
            "parameters": [{"name": "k", "value": 1.0}]
        }"#;
        let model = Model::from_json(json).unwrap();
        assert!(model.observables.is_empty());
        assert!(model.initial_conditions.is_empty());
    }

    #[test]
    fn test_display() {
        let out = format!("{}", michaelis_menten());
        assert!(out.contains("michment"));
        assert!(out.contains("kf*__s0*__s1"));
    }
}
