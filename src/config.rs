//! Simulator configuration.
//!
//! Options are plain structs with `Default` values and `with_*` setters. The
//! per-run inputs (time points, initial amounts and parameter values) live in
//! `SimulationSet`, which also fills in model defaults for whatever the caller
//! left out.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::SimulatorError;
use crate::model::Model;

/// Name of the only integrator this simulator drives.
pub const CUPSODA_INTEGRATOR: &str = "cupsoda";

/// GPU memory placement of the solver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryUsage {
    Global,
    Shared,
    #[default]
    SharedConstant,
}

impl MemoryUsage {
    /// Numeric code passed to cupSODA on the command line.
    pub fn code(self) -> u8 {
        match self {
            MemoryUsage::Global => 0,
            MemoryUsage::Shared => 1,
            MemoryUsage::SharedConstant => 2,
        }
    }
}

impl FromStr for MemoryUsage {
    type Err = SimulatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(MemoryUsage::Global),
            "shared" => Ok(MemoryUsage::Shared),
            "sharedconstant" => Ok(MemoryUsage::SharedConstant),
            other => Err(SimulatorError::Configuration(format!(
                "memory_usage must be one of global, shared, sharedconstant; got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for MemoryUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryUsage::Global => "global",
            MemoryUsage::Shared => "shared",
            MemoryUsage::SharedConstant => "sharedconstant",
        };
        f.write_str(name)
    }
}

/// How rate constants are evaluated for each parameter row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvaluatorBackend {
    /// JIT when the host is supported, otherwise interpreted
    #[default]
    Auto,
    /// Cranelift JIT; fails if the host cannot be targeted
    Jit,
    /// Stack-machine interpreter
    Interpreted,
}

impl FromStr for EvaluatorBackend {
    type Err = SimulatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(EvaluatorBackend::Auto),
            "jit" => Ok(EvaluatorBackend::Jit),
            "interpreted" => Ok(EvaluatorBackend::Interpreted),
            other => Err(SimulatorError::Configuration(format!(
                "unknown evaluator backend '{other}'"
            ))),
        }
    }
}

/// Solver settings forwarded to cupSODA.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegratorOptions {
    /// Maximum number of internal integration steps (LSODA's MXSTEP)
    pub max_steps: u64,
    pub atol: f64,
    pub rtol: f64,
    /// Number of GPU blocks; planned from the device when `None`
    pub n_blocks: Option<usize>,
    pub memory_usage: MemoryUsage,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            max_steps: 20000,
            atol: 1e-8,
            rtol: 1e-8,
            n_blocks: None,
            memory_usage: MemoryUsage::SharedConstant,
        }
    }
}

/// Options of a `CupSodaSimulator`.
#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    /// Index of the GPU to run on
    pub gpu: usize,
    /// Reaction volume; when set, amounts are converted to concentrations and back
    pub vol: Option<f64>,
    /// Only request species that appear in an observable
    pub obs_species_only: bool,
    /// Remove the working directory after the run
    pub cleanup: bool,
    /// Output file prefix; defaults to the model name with '.' replaced by '_'
    pub prefix: Option<String>,
    /// Parent of the working directory; defaults to the system temp dir
    pub base_dir: Option<PathBuf>,
    pub integrator: String,
    pub integrator_options: IntegratorOptions,
    pub verbose: bool,
    /// Kill cupSODA if it runs longer than this
    pub timeout: Option<Duration>,
    pub evaluator: EvaluatorBackend,
    /// Directory containing the `cupSODA` binary, overriding discovery
    pub solver_path: Option<PathBuf>,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            gpu: 0,
            vol: None,
            obs_species_only: true,
            cleanup: true,
            prefix: None,
            base_dir: None,
            integrator: CUPSODA_INTEGRATOR.to_string(),
            integrator_options: IntegratorOptions::default(),
            verbose: false,
            timeout: None,
            evaluator: EvaluatorBackend::Auto,
            solver_path: None,
        }
    }
}

impl SimulatorOptions {
    pub fn with_gpu(mut self, gpu: usize) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_vol(mut self, vol: f64) -> Self {
        self.vol = Some(vol);
        self
    }

    pub fn with_obs_species_only(mut self, obs_species_only: bool) -> Self {
        self.obs_species_only = obs_species_only;
        self
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn with_integrator(mut self, integrator: impl Into<String>) -> Self {
        self.integrator = integrator.into();
        self
    }

    pub fn with_integrator_options(mut self, options: IntegratorOptions) -> Self {
        self.integrator_options = options;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_evaluator(mut self, evaluator: EvaluatorBackend) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_solver_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.solver_path = Some(dir.into());
        self
    }

    /// File prefix used for this model's output files.
    pub fn prefix_for(&self, model: &Model) -> String {
        self.prefix
            .clone()
            .unwrap_or_else(|| model.name.replace('.', "_"))
    }

    /// Rejects option combinations cupSODA cannot run with.
    pub fn validate(&self) -> Result<(), SimulatorError> {
        if self.integrator != CUPSODA_INTEGRATOR {
            return Err(SimulatorError::Configuration(format!(
                "Integrator type '{}' not recognized.",
                self.integrator
            )));
        }
        if let Some(vol) = self.vol {
            if !(vol.is_finite() && vol > 0.0) {
                return Err(SimulatorError::Configuration(format!(
                    "vol must be a positive number, got {vol}"
                )));
            }
        }
        let opts = &self.integrator_options;
        if !(opts.atol > 0.0 && opts.rtol > 0.0) {
            return Err(SimulatorError::Configuration(
                "atol and rtol must be positive".to_string(),
            ));
        }
        if opts.n_blocks == Some(0) {
            return Err(SimulatorError::Configuration(
                "n_blocks must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// `points` evenly spaced time values from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (points - 1) as f64;
            (0..points).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Checks that a time vector is usable as cupSODA sample points.
pub fn validate_tspan(tspan: &[f64]) -> Result<(), SimulatorError> {
    if tspan.is_empty() {
        return Err(SimulatorError::Configuration("tspan is empty".to_string()));
    }
    if tspan.iter().any(|t| !t.is_finite()) {
        return Err(SimulatorError::Configuration(
            "tspan contains non-finite values".to_string(),
        ));
    }
    if tspan.windows(2).any(|w| w[1] < w[0]) {
        return Err(SimulatorError::Configuration(
            "tspan must be non-decreasing".to_string(),
        ));
    }
    Ok(())
}

/// The simulations of one run: row `i` of both matrices describes simulation `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSet {
    pub initials: Vec<Vec<f64>>,
    pub param_values: Vec<Vec<f64>>,
}

impl SimulationSet {
    /// Builds the set, filling missing matrices from the model defaults.
    ///
    /// # Arguments
    /// * `model` - The network being simulated
    /// * `initials` - Optional `n_sims x n_species` initial amounts
    /// * `param_values` - Optional `n_sims x n_params` parameter values
    ///
    /// # Errors
    /// Returns `Configuration` when the two matrices disagree on the number of
    /// simulations, a row has the wrong width, or a matrix has no rows.
    pub fn resolve(
        model: &Model,
        initials: Option<Vec<Vec<f64>>>,
        param_values: Option<Vec<Vec<f64>>>,
    ) -> Result<Self, SimulatorError> {
        let (initials, param_values) = match (initials, param_values) {
            (None, None) => (
                vec![model.default_initials()],
                vec![model.default_param_values()],
            ),
            (Some(initials), None) => {
                let params = vec![model.default_param_values(); initials.len()];
                (initials, params)
            }
            (None, Some(params)) => {
                let initials = vec![model.default_initials(); params.len()];
                (initials, params)
            }
            (Some(initials), Some(params)) => (initials, params),
        };

        if initials.is_empty() {
            return Err(SimulatorError::Configuration(
                "at least one simulation is required".to_string(),
            ));
        }
        if initials.len() != param_values.len() {
            return Err(SimulatorError::Configuration(format!(
                "initials has {} rows but param_values has {}",
                initials.len(),
                param_values.len()
            )));
        }
        check_width("initials", &initials, model.n_species())?;
        check_width("param_values", &param_values, model.n_params())?;

        Ok(Self {
            initials,
            param_values,
        })
    }

    pub fn n_sims(&self) -> usize {
        self.initials.len()
    }
}

fn check_width(name: &str, rows: &[Vec<f64>], width: usize) -> Result<(), SimulatorError> {
    match rows.iter().position(|row| row.len() != width) {
        Some(i) => Err(SimulatorError::Configuration(format!(
            "{name} row {i} has {} columns, expected {width}",
            rows[i].len()
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::michaelis_menten;

    #[test]
    fn test_memory_usage_codes() {
        assert_eq!("global".parse::<MemoryUsage>().unwrap().code(), 0);
        assert_eq!("shared".parse::<MemoryUsage>().unwrap().code(), 1);
        assert_eq!("sharedconstant".parse::<MemoryUsage>().unwrap().code(), 2);
        assert!("texture".parse::<MemoryUsage>().is_err());
        assert_eq!(MemoryUsage::default().to_string(), "sharedconstant");
    }

    #[test]
    fn test_defaults() {
        let opts = SimulatorOptions::default();
        assert_eq!(opts.gpu, 0);
        assert!(opts.obs_species_only);
        assert!(opts.cleanup);
        assert_eq!(opts.integrator_options.max_steps, 20000);
        assert_eq!(opts.integrator_options.atol, 1e-8);
        assert_eq!(opts.integrator_options.rtol, 1e-8);
        assert_eq!(opts.integrator_options.n_blocks, None);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_prefix_defaults_to_model_name() {
        let model = michaelis_menten();
        assert_eq!(
            SimulatorOptions::default().prefix_for(&model),
            "pysb_examples_michment"
        );
        assert_eq!(
            SimulatorOptions::default().with_prefix("run").prefix_for(&model),
            "run"
        );
    }

    #[test]
    fn test_unknown_integrator() {
        let opts = SimulatorOptions::default().with_integrator("vode");
        assert!(matches!(
            opts.validate(),
            Err(SimulatorError::Configuration(msg)) if msg.contains("vode")
        ));
    }

    #[test]
    fn test_invalid_vol() {
        assert!(SimulatorOptions::default().with_vol(0.0).validate().is_err());
        assert!(SimulatorOptions::default().with_vol(1e-19).validate().is_ok());
    }

    #[test]
    fn test_linspace() {
        assert_eq!(linspace(0.0, 10.0, 3), vec![0.0, 5.0, 10.0]);
        assert_eq!(linspace(2.0, 4.0, 1), vec![2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_validate_tspan() {
        assert!(validate_tspan(&[0.0, 1.0, 2.0]).is_ok());
        assert!(validate_tspan(&[]).is_err());
        assert!(validate_tspan(&[0.0, 2.0, 1.0]).is_err());
        assert!(validate_tspan(&[0.0, f64::NAN]).is_err());
    }

    #[test]
    fn test_simulation_set_from_model() {
        let model = michaelis_menten();
        let set = SimulationSet::resolve(&model, None, None).unwrap();
        assert_eq!(set.n_sims(), 1);
        assert_eq!(set.initials[0], model.default_initials());
    }

    #[test]
    fn test_simulation_set_repeats_missing_matrix() {
        let model = michaelis_menten();
        let params = vec![model.default_param_values(); 3];
        let set = SimulationSet::resolve(&model, None, Some(params)).unwrap();
        assert_eq!(set.n_sims(), 3);
        assert_eq!(set.initials.len(), 3);
    }

    #[test]
    fn test_simulation_set_shape_errors() {
        let model = michaelis_menten();
        let initials = vec![model.default_initials(); 2];
        let params = vec![model.default_param_values(); 3];
        assert!(SimulationSet::resolve(&model, Some(initials), Some(params)).is_err());

        let narrow = vec![vec![1.0; model.n_species() - 1]];
        assert!(SimulationSet::resolve(&model, Some(narrow), None).is_err());

        assert!(SimulationSet::resolve(&model, Some(vec![]), None).is_err());
    }
}
