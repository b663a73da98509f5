//! Simulation results: species trajectories plus derived observables.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};

use crate::{decoder::Trajectories, model::Observable};

/// Output of one `CupSodaSimulator::run`.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Sample times reported by cupSODA, one vector per simulation
    pub tout: Vec<Array1<f64>>,
    /// `n_timepoints x n_species` amounts per simulation; NaN where a species was not requested
    pub trajectories: Vec<Array2<f64>>,
    observables: Vec<Observable>,
    workdir: Option<PathBuf>,
}

impl SimulationResult {
    pub fn new(
        trajectories: Trajectories,
        observables: Vec<Observable>,
        workdir: Option<PathBuf>,
    ) -> Self {
        Self {
            tout: trajectories.tout,
            trajectories: trajectories.species,
            observables,
            workdir,
        }
    }

    pub fn n_sims(&self) -> usize {
        self.trajectories.len()
    }

    /// Working directory, when it was kept after the run.
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Time course of species `index` in every simulation.
    pub fn species(&self, index: usize) -> Vec<Array1<f64>> {
        self.trajectories
            .iter()
            .map(|traj| traj.column(index).to_owned())
            .collect()
    }

    /// Time course of the named observable in every simulation, or `None` for an unknown name.
    pub fn observable(&self, name: &str) -> Option<Vec<Array1<f64>>> {
        let obs = self.observables.iter().find(|o| o.name == name)?;
        Some(self.trajectories.iter().map(|traj| evaluate(obs, traj)).collect())
    }

    /// Every observable in model order, as `(name, one series per simulation)`.
    pub fn observables(&self) -> Vec<(&str, Vec<Array1<f64>>)> {
        self.observables
            .iter()
            .map(|obs| {
                let series = self.trajectories.iter().map(|traj| evaluate(obs, traj)).collect();
                (obs.name.as_str(), series)
            })
            .collect()
    }
}

fn evaluate(obs: &Observable, traj: &Array2<f64>) -> Array1<f64> {
    obs.terms
        .iter()
        .fold(Array1::zeros(traj.nrows()), |acc, &(coeff, s)| {
            acc + &traj.column(s) * coeff
        })
}
