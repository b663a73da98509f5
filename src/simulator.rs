//! The cupSODA simulator.
//!
//! `CupSodaSimulator::run` drives one batch of simulations through these states:
//!
//! ```text
//! Configured -> DirectoriesCreated -> RatesCompiled -> InputsWritten
//!            -> SolverRunning -> OutputsLoaded -> CleanedUp -> Done
//! ```
//!
//! Any error moves the run to `Failed` and is returned unchanged. The working
//! directory lives in a `TempDir`, so with cleanup enabled it is removed on
//! every exit path, including failures.
//!
//! # Example
//!
//! ```no_run
//! use cupsoda_sim::prelude::*;
//!
//! # fn main() -> Result<(), SimulatorError> {
//! let model = Model::from_json_file("michment.json")?;
//! let options = SimulatorOptions::default().with_vol(1e-19);
//! let mut sim = CupSodaSimulator::new(model, options)?.with_tspan(linspace(0.0, 100.0, 101));
//! let result = sim.run(None, None, None)?;
//! println!("{:?}", result.observable("Product"));
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use tempfile::TempDir;

use crate::{
    config::{validate_tspan, SimulationSet, SimulatorOptions},
    decoder::Decoder,
    encoder::{write_input_files, EncoderInput, OutputSpecies},
    errors::SimulatorError,
    model::Model,
    planner::{default_device, plan_blocks, DeviceQuery},
    rates::RateCompiler,
    result::SimulationResult,
    solver::{SolverCommand, SolverLocator},
};

/// Progress of the most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Configured,
    DirectoriesCreated,
    RatesCompiled,
    InputsWritten,
    SolverRunning,
    OutputsLoaded,
    CleanedUp,
    Done,
    Failed,
}

/// Working directory of a run; removed on drop unless kept.
enum WorkDir {
    Scoped(TempDir),
    Kept(PathBuf),
}

impl WorkDir {
    fn create(prefix: &str, base_dir: Option<&Path>, keep: bool) -> Result<Self, SimulatorError> {
        let prefix = format!("{prefix}_");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match base_dir {
            Some(base) => builder.tempdir_in(base)?,
            None => builder.tempdir()?,
        };
        Ok(if keep {
            WorkDir::Kept(dir.keep())
        } else {
            WorkDir::Scoped(dir)
        })
    }

    fn path(&self) -> &Path {
        match self {
            WorkDir::Scoped(dir) => dir.path(),
            WorkDir::Kept(path) => path,
        }
    }

    /// Removes the directory if scoped and returns the path if kept.
    fn finish(self) -> Result<Option<PathBuf>, SimulatorError> {
        match self {
            WorkDir::Scoped(dir) => {
                dir.close()?;
                Ok(None)
            }
            WorkDir::Kept(path) => Ok(Some(path)),
        }
    }
}

/// Runs batches of simulations of one model on cupSODA.
pub struct CupSodaSimulator {
    model: Model,
    options: SimulatorOptions,
    prefix: String,
    tspan: Option<Vec<f64>>,
    initials: Option<Vec<Vec<f64>>>,
    param_values: Option<Vec<Vec<f64>>>,
    rates: RateCompiler,
    locator: SolverLocator,
    device: Box<dyn DeviceQuery>,
    state: RunState,
}

impl CupSodaSimulator {
    /// Validates the model and options and compiles the rate constants.
    ///
    /// # Errors
    /// `Configuration` for an invalid model, unknown integrator or option
    /// values, and for rate laws that are not mass-action or reference unknown
    /// identifiers.
    pub fn new(model: Model, options: SimulatorOptions) -> Result<Self, SimulatorError> {
        model.validate()?;
        options.validate()?;
        let rates = RateCompiler::new(&model, options.evaluator)?;
        let locator = match &options.solver_path {
            Some(dir) => SolverLocator::with_path(dir),
            None => SolverLocator::new(),
        };
        let prefix = options.prefix_for(&model);
        Ok(Self {
            model,
            options,
            prefix,
            tspan: None,
            initials: None,
            param_values: None,
            rates,
            locator,
            device: default_device(),
            state: RunState::Configured,
        })
    }

    pub fn with_tspan(mut self, tspan: Vec<f64>) -> Self {
        self.tspan = Some(tspan);
        self
    }

    pub fn with_initials(mut self, initials: Vec<Vec<f64>>) -> Self {
        self.initials = Some(initials);
        self
    }

    pub fn with_param_values(mut self, param_values: Vec<Vec<f64>>) -> Self {
        self.param_values = Some(param_values);
        self
    }

    /// Replaces the GPU query used for block planning.
    pub fn with_device(mut self, device: Box<dyn DeviceQuery>) -> Self {
        self.device = device;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn options(&self) -> &SimulatorOptions {
        &self.options
    }

    /// State reached by the most recent run.
    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, next: RunState) {
        debug!("cupSODA run: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Runs every simulation in one cupSODA invocation.
    ///
    /// Arguments override the values given at construction. Without initials
    /// or parameter values, the model defaults are used; when only one of them
    /// is given, the other is the model default repeated for every simulation.
    ///
    /// # Errors
    /// * `Configuration` if no tspan is available or the matrices have the wrong shape
    /// * `SolverNotFound` if the cupSODA binary cannot be located
    /// * `SolverExecution` if cupSODA fails or times out
    /// * `MissingOutput` if its output is incomplete
    /// * `Io` for filesystem failures
    pub fn run(
        &mut self,
        tspan: Option<Vec<f64>>,
        initials: Option<Vec<Vec<f64>>>,
        param_values: Option<Vec<Vec<f64>>>,
    ) -> Result<SimulationResult, SimulatorError> {
        self.state = RunState::Configured;
        match self.execute(tspan, initials, param_values) {
            Ok(result) => {
                self.transition(RunState::Done);
                Ok(result)
            }
            Err(e) => {
                self.transition(RunState::Failed);
                Err(e)
            }
        }
    }

    fn execute(
        &mut self,
        tspan: Option<Vec<f64>>,
        initials: Option<Vec<Vec<f64>>>,
        param_values: Option<Vec<Vec<f64>>>,
    ) -> Result<SimulationResult, SimulatorError> {
        let tspan = tspan.or_else(|| self.tspan.clone()).ok_or_else(|| {
            SimulatorError::Configuration(
                "tspan must be defined in either the constructor or run".to_string(),
            )
        })?;
        validate_tspan(&tspan)?;
        let set = SimulationSet::resolve(
            &self.model,
            initials.or_else(|| self.initials.clone()),
            param_values.or_else(|| self.param_values.clone()),
        )?;

        let workdir = WorkDir::create(
            &self.prefix,
            self.options.base_dir.as_deref(),
            !self.options.cleanup,
        )?;
        let input_dir = workdir.path().join("INPUT");
        let output_dir = workdir.path().join("OUTPUT");
        fs::create_dir(&input_dir)?;
        fs::create_dir(&output_dir)?;
        if self.options.verbose {
            info!("Output directory is {}", workdir.path().display());
        }
        self.transition(RunState::DirectoriesCreated);

        let binary = self.locator.locate()?;
        let n_blocks = plan_blocks(
            set.n_sims(),
            self.model.n_species(),
            self.options.integrator_options.n_blocks,
            self.options.gpu,
            self.device.as_ref(),
        );

        let rates = self.rates.compute(&set.param_values, self.options.vol)?;
        self.transition(RunState::RatesCompiled);

        let output = OutputSpecies::select(&self.model, self.options.obs_species_only);
        write_input_files(
            &input_dir,
            &EncoderInput {
                model: &self.model,
                tspan: &tspan,
                initials: &set.initials,
                rates: &rates,
                options: &self.options.integrator_options,
                output: &output,
                vol: self.options.vol,
            },
        )?;
        self.transition(RunState::InputsWritten);

        self.transition(RunState::SolverRunning);
        SolverCommand {
            binary,
            input_dir,
            n_blocks,
            output_dir: output_dir.clone(),
            prefix: self.prefix.clone(),
            gpu: self.options.gpu,
            memory_usage: self.options.integrator_options.memory_usage,
            verbose: self.options.verbose,
        }
        .run(self.options.timeout)?;

        let trajectories = Decoder {
            dir: &output_dir,
            prefix: &self.prefix,
            n_sims: set.n_sims(),
            n_timepoints: tspan.len(),
            n_species: self.model.n_species(),
            output: &output,
            vol: self.options.vol,
        }
        .decode()?;
        self.transition(RunState::OutputsLoaded);

        let kept = workdir.finish()?;
        if let Some(path) = &kept {
            info!("Keeping cupSODA working directory {}", path.display());
        }
        self.transition(RunState::CleanedUp);

        Ok(SimulationResult::new(
            trajectories,
            self.model.observables.clone(),
            kept,
        ))
    }
}

/// Builds a simulator and runs it once.
pub fn run_cupsoda(
    model: Model,
    tspan: Vec<f64>,
    initials: Option<Vec<Vec<f64>>>,
    param_values: Option<Vec<Vec<f64>>>,
    options: SimulatorOptions,
) -> Result<SimulationResult, SimulatorError> {
    CupSodaSimulator::new(model, options)?.run(Some(tspan), initials, param_values)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::{Observable, Parameter, Reaction, Species};
    use crate::planner::StaticDevice;
    use crate::solver::tests::fake_cupsoda;

    /// Writes one output file per MX_0 row, echoing t_vector with a constant
    /// `2` for every requested species.
    const WRITE_OUTPUTS: &str = r#"
echo "$@" > "$1/../args"
n=$(($(wc -l < "$1/MX_0") + 1))
cols=""
while read -r c || [ -n "$c" ]; do cols="$cols\t2"; done < "$1/cs_vector"
i=0
while [ $i -lt $n ]; do
  out="$3/${4}_${i}"
  : > "$out"
  while read -r t || [ -n "$t" ]; do printf "%s${cols}\n" "$t" >> "$out"; done < "$1/t_vector"
  i=$((i + 1))
done
"#;

    fn two_species() -> Model {
        Model {
            name: "test.ab".to_string(),
            species: vec![Species::new("A()"), Species::new("B()")],
            reactions: vec![Reaction::new(vec![0], vec![1], "k*__s0")],
            parameters: vec![Parameter::new("k", 0.1), Parameter::new("A_0", 100.0)],
            observables: vec![Observable::new("A_obs", vec![(1.0, 0)])],
            initial_conditions: vec![],
        }
    }

    struct Fixture {
        bin_dir: tempfile::TempDir,
        base_dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(script: &str) -> Self {
            let bin_dir = tempfile::tempdir().unwrap();
            fake_cupsoda(bin_dir.path(), script);
            Self {
                bin_dir,
                base_dir: tempfile::tempdir().unwrap(),
            }
        }

        fn options(&self) -> SimulatorOptions {
            SimulatorOptions::default()
                .with_solver_path(self.bin_dir.path())
                .with_base_dir(self.base_dir.path())
        }

        fn base_is_empty(&self) -> bool {
            fs::read_dir(self.base_dir.path()).unwrap().next().is_none()
        }
    }

    fn params(n: usize) -> Vec<Vec<f64>> {
        (0..n).map(|i| vec![0.1 * (i + 1) as f64, 100.0]).collect()
    }

    #[test]
    fn test_observed_species_only() {
        let fixture = Fixture::new(WRITE_OUTPUTS);
        let mut sim = CupSodaSimulator::new(two_species(), fixture.options().with_cleanup(false))
            .unwrap()
            .with_device(Box::new(StaticDevice));
        let result = sim
            .run(Some(vec![0.0, 5.0, 10.0]), None, Some(params(3)))
            .unwrap();
        assert_eq!(sim.state(), RunState::Done);

        assert_eq!(result.n_sims(), 3);
        for (tout, traj) in result.tout.iter().zip(&result.trajectories) {
            assert_eq!(tout.to_vec(), vec![0.0, 5.0, 10.0]);
            assert!(traj.column(0).iter().all(|&x| x == 2.0));
            assert!(traj.column(1).iter().all(|x| x.is_nan()));
        }

        let workdir = result.workdir().unwrap();
        assert!(workdir.starts_with(fixture.base_dir.path()));
        let name = workdir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("test_ab_"));
        let cs = fs::read_to_string(workdir.join("INPUT/cs_vector")).unwrap();
        assert_eq!(cs, "0");
        let args = fs::read_to_string(workdir.join("args")).unwrap();
        let args: Vec<&str> = args.split_whitespace().collect();
        assert_eq!(&args[1..], &["1", &*workdir.join("OUTPUT").to_string_lossy(), "test_ab", "0", "0", "2", "0"]);
        let c_matrix = fs::read_to_string(workdir.join("INPUT/c_matrix")).unwrap();
        assert_eq!(c_matrix, "0.1\n0.2\n0.30000000000000004");
    }

    #[test]
    fn test_cleanup_removes_workdir() {
        let fixture = Fixture::new(WRITE_OUTPUTS);
        let result = run_cupsoda(
            two_species(),
            vec![0.0, 1.0],
            None,
            None,
            fixture.options().with_obs_species_only(false),
        )
        .unwrap();
        assert!(result.workdir().is_none());
        assert!(fixture.base_is_empty());
        assert!(result.trajectories[0].iter().all(|&x| x == 2.0));
        let obs = result.observable("A_obs").unwrap();
        assert_eq!(obs[0].to_vec(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_volume_round_trip() {
        // cupSODA echoes the scaled initial amount; decoding must restore it.
        let script = r#"
read -r first rest < "$1/MX_0"
i=0
while [ $i -lt 2 ]; do
  printf "0.0\t%s\n1.0\t%s" "$first" "$first" > "$3/${4}_${i}"
  i=$((i + 1))
done
"#;
        let fixture = Fixture::new(script);
        let vol = 1e-19;
        let result = run_cupsoda(
            two_species(),
            vec![0.0, 1.0],
            Some(vec![vec![1234.0, 0.0]; 2]),
            None,
            fixture.options().with_vol(vol),
        )
        .unwrap();
        for traj in &result.trajectories {
            assert!((traj[[1, 0]] - 1234.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_solver_failure_is_reported_and_cleaned_up() {
        let fixture = Fixture::new("echo boom >&2\nexit 1");
        let mut sim = CupSodaSimulator::new(two_species(), fixture.options()).unwrap();
        let err = sim.run(Some(vec![0.0, 1.0]), None, None).unwrap_err();
        assert_eq!(sim.state(), RunState::Failed);
        match err {
            SimulatorError::SolverExecution { output, .. } => assert!(output.contains("boom")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(fixture.base_is_empty());
    }

    #[test]
    fn test_missing_output_file() {
        let script = r#"printf "0.0\t1.0" > "$3/${4}_0"; printf "0.0\t1.0" > "$3/${4}_1""#;
        let fixture = Fixture::new(script);
        let mut sim = CupSodaSimulator::new(two_species(), fixture.options())
            .unwrap()
            .with_tspan(vec![0.0]);
        let err = sim.run(None, None, Some(params(3))).unwrap_err();
        assert!(matches!(err, SimulatorError::MissingOutput(_)));
        assert!(fixture.base_is_empty());
    }

    #[test]
    fn test_failed_run_keeps_workdir_without_cleanup() {
        let fixture = Fixture::new("exit 3");
        let mut sim =
            CupSodaSimulator::new(two_species(), fixture.options().with_cleanup(false)).unwrap();
        assert!(sim.run(Some(vec![0.0]), None, None).is_err());
        assert!(!fixture.base_is_empty());
    }

    #[test]
    fn test_missing_tspan() {
        let fixture = Fixture::new(WRITE_OUTPUTS);
        let mut sim = CupSodaSimulator::new(two_species(), fixture.options()).unwrap();
        assert!(matches!(
            sim.run(None, None, None),
            Err(SimulatorError::Configuration(_))
        ));
        assert_eq!(sim.state(), RunState::Failed);
        assert!(fixture.base_is_empty());
    }

    #[test]
    fn test_solver_not_found() {
        let empty = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let options = SimulatorOptions::default()
            .with_solver_path(empty.path())
            .with_base_dir(base.path());
        let err = run_cupsoda(two_species(), vec![0.0], None, None, options).unwrap_err();
        assert!(matches!(err, SimulatorError::SolverNotFound(_)));
    }

    #[test]
    fn test_non_mass_action_rejected_at_construction() {
        let mut model = two_species();
        model.reactions[0].rate = "k*__s0/(1 + __s0)".to_string();
        assert!(matches!(
            CupSodaSimulator::new(model, SimulatorOptions::default()),
            Err(SimulatorError::Configuration(_))
        ));
    }
}
