//! cupSODA output files.
//!
//! cupSODA writes one file `<prefix>_<n>` per simulation. Each row is a time
//! point: column 0 is the time and the remaining columns are the requested
//! output species, in `cs_vector` order.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::debug;
use ndarray::{Array1, Array2};

use crate::{encoder::OutputSpecies, errors::SimulatorError, rates::AVOGADRO};

/// How output files are read. Picked once per run by timing both on the first file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Buffered line-by-line reading, split on whitespace
    Lines,
    /// Tab-separated records read with the `csv` crate
    Tabular,
}

impl LoadStrategy {
    pub fn load(self, path: &Path) -> Result<Array2<f64>, SimulatorError> {
        match self {
            LoadStrategy::Lines => load_lines(path),
            LoadStrategy::Tabular => load_tabular(path),
        }
    }
}

fn parse_value(token: &str, path: &Path) -> Result<f64, SimulatorError> {
    token.parse().map_err(|_| {
        SimulatorError::MissingOutput(format!(
            "malformed value '{token}' in {}",
            path.display()
        ))
    })
}

fn ragged(path: &Path) -> SimulatorError {
    SimulatorError::MissingOutput(format!("rows of unequal width in {}", path.display()))
}

fn load_lines(path: &Path) -> Result<Array2<f64>, SimulatorError> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut flat = Vec::new();
    let mut n_rows = 0;
    let mut n_cols = None;
    for line in reader.lines() {
        let line = line?;
        let before = flat.len();
        for token in line.split_whitespace() {
            flat.push(parse_value(token, path)?);
        }
        let width = flat.len() - before;
        if width == 0 {
            continue;
        }
        if *n_cols.get_or_insert(width) != width {
            return Err(ragged(path));
        }
        n_rows += 1;
    }
    Array2::from_shape_vec((n_rows, n_cols.unwrap_or(0)), flat).map_err(|_| ragged(path))
}

fn load_tabular(path: &Path) -> Result<Array2<f64>, SimulatorError> {
    let unreadable = |e: csv::Error| {
        SimulatorError::MissingOutput(format!("cannot read {}: {e}", path.display()))
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(unreadable)?;

    let mut record = csv::StringRecord::new();
    let mut flat = Vec::new();
    let mut n_rows = 0;
    let mut n_cols = None;
    while reader.read_record(&mut record).map_err(unreadable)? {
        if *n_cols.get_or_insert(record.len()) != record.len() {
            return Err(ragged(path));
        }
        for token in record.iter() {
            flat.push(parse_value(token, path)?);
        }
        n_rows += 1;
    }
    Array2::from_shape_vec((n_rows, n_cols.unwrap_or(0)), flat).map_err(|_| ragged(path))
}

/// Times both strategies on `path`; returns the parsed data and the faster strategy.
pub fn choose_strategy(path: &Path) -> Result<(Array2<f64>, LoadStrategy), SimulatorError> {
    let start = Instant::now();
    let data = load_lines(path)?;
    let lines_time = start.elapsed();

    let start = Instant::now();
    let tabular = load_tabular(path);
    let tabular_time = start.elapsed();

    // Only switch when both readers agree on this file.
    let strategy = match tabular {
        Ok(other) if other == data && tabular_time < lines_time => LoadStrategy::Tabular,
        _ => LoadStrategy::Lines,
    };
    debug!("Loading cupSODA output with {strategy:?} ({lines_time:?} lines, {tabular_time:?} tabular)");
    Ok((data, strategy))
}

/// Whether `name` is an output file of `prefix`, i.e. `<prefix>_<digits>`.
pub fn is_output_file(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Decoded trajectories of every simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectories {
    pub tout: Vec<Array1<f64>>,
    /// `n_timepoints x n_species` per simulation; unrequested species are NaN
    pub species: Vec<Array2<f64>>,
}

/// Reads the output directory of one run.
pub struct Decoder<'a> {
    pub dir: &'a Path,
    pub prefix: &'a str,
    pub n_sims: usize,
    pub n_timepoints: usize,
    pub n_species: usize,
    pub output: &'a OutputSpecies,
    pub vol: Option<f64>,
}

impl Decoder<'_> {
    fn output_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("{}_{n}", self.prefix))
    }

    fn count_output_files(&self) -> Result<usize, SimulatorError> {
        let mut count = 0;
        for entry in fs::read_dir(self.dir)? {
            if is_output_file(&entry?.file_name().to_string_lossy(), self.prefix) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn validate(&self, data: &Array2<f64>, path: &Path) -> Result<(), SimulatorError> {
        let expected = (self.n_timepoints, self.output.len() + 1);
        if data.dim() != expected {
            return Err(SimulatorError::MissingOutput(format!(
                "{} has {} rows x {} columns, expected {} x {}",
                path.display(),
                data.nrows(),
                data.ncols(),
                expected.0,
                expected.1
            )));
        }
        Ok(())
    }

    /// Loads, validates and rescales every simulation's output.
    ///
    /// # Errors
    /// `MissingOutput` if the number of output files differs from the number
    /// of simulations, a `<prefix>_<n>` file is absent, or a file does not
    /// have one row per time point and one column per requested species plus time.
    pub fn decode(&self) -> Result<Trajectories, SimulatorError> {
        let found = self.count_output_files()?;
        if found == 0 {
            return Err(SimulatorError::MissingOutput(
                "cannot find any output files to load data from".to_string(),
            ));
        }
        if found != self.n_sims {
            return Err(SimulatorError::MissingOutput(format!(
                "number of output files ({found}) does not match number of requested simulations ({})",
                self.n_sims
            )));
        }

        let scale = self.vol.map(|vol| AVOGADRO * vol);
        let mut strategy = None;
        let mut tout = Vec::with_capacity(self.n_sims);
        let mut species = Vec::with_capacity(self.n_sims);

        for n in 0..self.n_sims {
            let path = self.output_path(n);
            if !path.is_file() {
                return Err(SimulatorError::MissingOutput(format!(
                    "cannot find output file {}",
                    path.display()
                )));
            }
            let data = match strategy {
                Some(strategy) => LoadStrategy::load(strategy, &path)?,
                None => {
                    let (data, chosen) = choose_strategy(&path)?;
                    strategy = Some(chosen);
                    data
                }
            };
            self.validate(&data, &path)?;

            let mut traj = Array2::from_elem((self.n_timepoints, self.n_species), f64::NAN);
            for (col, &s) in self.output.indices().iter().enumerate() {
                let mut target = traj.column_mut(s);
                target.assign(&data.column(col + 1));
                if let Some(scale) = scale {
                    target *= scale;
                }
            }
            tout.push(data.column(0).to_owned());
            species.push(traj);
        }

        debug!("Loaded {} trajectories from {}", self.n_sims, self.dir.display());
        Ok(Trajectories { tout, species })
    }
}
