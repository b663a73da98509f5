//! Run expanded reaction networks on the cupSODA GPU ODE solver.
//!
//! This crate takes a reaction network that has already been expanded into
//! species, reactions, parameters and observables, writes it out in cupSODA's
//! flat-file format, runs the `cupSODA` binary as a subprocess and reads the
//! trajectories back. Rate constants are extracted from the reaction rate
//! laws with [evalexpr](https://github.com/ISibboI/evalexpr) and evaluated per
//! simulation, JIT-compiled with
//! [Cranelift](https://github.com/bytecodealliance/wasmtime/tree/main/cranelift)
//! when the host supports it.
//!
//! # Features
//!
//! - Batches of simulations with per-simulation initial amounts and parameters
//! - Volume scaling between molecule counts and concentrations
//! - GPU block planning, with device introspection behind the `cuda` feature
//! - Observables computed from the decoded species trajectories
//!
//! # Example
//!
//! ```no_run
//! use cupsoda_sim::prelude::*;
//!
//! # fn main() -> Result<(), SimulatorError> {
//! let model = Model::from_json_file("michment.json")?;
//! let result = run_cupsoda(
//!     model,
//!     linspace(0.0, 100.0, 101),
//!     None,
//!     None,
//!     SimulatorOptions::default(),
//! )?;
//! for (name, series) in result.observables() {
//!     println!("{name}: {:?}", series[0]);
//! }
//! # Ok(())
//! # }
//! ```

pub use errors::SimulatorError;
pub use model::Model;
pub use result::SimulationResult;
pub use simulator::{run_cupsoda, CupSodaSimulator};

pub mod prelude {
    pub use crate::config::{
        linspace, EvaluatorBackend, IntegratorOptions, MemoryUsage, SimulatorOptions,
    };
    pub use crate::errors::SimulatorError;
    pub use crate::model::{InitialCondition, Model, Observable, Parameter, Reaction, Species};
    pub use crate::result::SimulationResult;
    pub use crate::simulator::{run_cupsoda, CupSodaSimulator, RunState};
}

/// JIT compilation of rate constants using Cranelift
pub mod builder;
/// Simulator options and simulation sets
pub mod config;
/// Conversion from parsed rate laws to rate-constant expressions
pub mod convert;
/// Reading cupSODA output files
pub mod decoder;
/// Writing cupSODA input files
pub mod encoder;
/// Error types for the various failure modes
pub mod errors;
/// Rate-constant evaluation strategies
pub mod evaluator;
/// Rate-constant expression tree
pub mod expr;
/// Reaction network data model
pub mod model;
mod operators;
/// GPU block planning
pub mod planner;
/// Rate-matrix compilation
pub mod rates;
/// Trajectories and observables
pub mod result;
/// The simulator and its run state machine
pub mod simulator;
/// Locating and running the cupSODA binary
pub mod solver;
/// Type definitions for JIT-compiled functions
pub mod types;
