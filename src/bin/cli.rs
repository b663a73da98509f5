use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cupsoda_sim::prelude::*;
use log::info;

#[derive(Parser)]
#[command(name = "cupsoda-sim")]
#[command(about = "Simulate an expanded reaction network with cupSODA")]
#[command(version)]
struct Args {
    /// Model file (JSON)
    #[arg(long)]
    model: PathBuf,

    /// Sample times as start:stop:points
    #[arg(long, value_parser = parse_tspan)]
    tspan: Tspan,

    /// Reaction volume; converts between molecule counts and concentrations
    #[arg(long)]
    vol: Option<f64>,

    /// GPU index
    #[arg(long, default_value_t = 0)]
    gpu: usize,

    /// Request every species, not only those in observables
    #[arg(long)]
    all_species: bool,

    /// Keep the working directory after the run
    #[arg(long)]
    keep: bool,

    /// Parent directory of the working directory
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Output file prefix (defaults to the model name)
    #[arg(long)]
    prefix: Option<String>,

    /// Directory containing the cupSODA binary
    #[arg(long)]
    cupsoda_path: Option<PathBuf>,

    /// Number of GPU blocks (planned from the device when omitted)
    #[arg(long)]
    n_blocks: Option<usize>,

    /// global, shared or sharedconstant
    #[arg(long, default_value = "sharedconstant")]
    memory_usage: MemoryUsage,

    #[arg(long, default_value_t = 1e-8)]
    atol: f64,

    #[arg(long, default_value_t = 1e-8)]
    rtol: f64,

    #[arg(long, default_value_t = 20000)]
    max_steps: u64,

    /// auto, jit or interpreted
    #[arg(long, default_value = "auto")]
    evaluator: EvaluatorBackend,

    /// Kill cupSODA after this many seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Stream cupSODA output to the log
    #[arg(long, short)]
    verbose: bool,

    /// Write observables here instead of stdout
    #[arg(long, short)]
    output: Option<PathBuf>,
}

#[derive(Clone)]
struct Tspan(Vec<f64>);

fn parse_tspan(s: &str) -> Result<Tspan, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [start, stop, points] = parts.as_slice() else {
        return Err(format!("expected start:stop:points, got '{s}'"));
    };
    let start: f64 = start.parse().map_err(|e| format!("start: {e}"))?;
    let stop: f64 = stop.parse().map_err(|e| format!("stop: {e}"))?;
    let points: usize = points.parse().map_err(|e| format!("points: {e}"))?;
    Ok(Tspan(linspace(start, stop, points)))
}

fn options(args: &Args) -> SimulatorOptions {
    let mut options = SimulatorOptions::default()
        .with_gpu(args.gpu)
        .with_obs_species_only(!args.all_species)
        .with_cleanup(!args.keep)
        .with_verbose(args.verbose)
        .with_evaluator(args.evaluator)
        .with_integrator_options(IntegratorOptions {
            max_steps: args.max_steps,
            atol: args.atol,
            rtol: args.rtol,
            n_blocks: args.n_blocks,
            memory_usage: args.memory_usage,
        });
    options.vol = args.vol;
    options.prefix = args.prefix.clone();
    options.base_dir = args.base_dir.clone();
    options.solver_path = args.cupsoda_path.clone();
    options.timeout = args.timeout.map(Duration::from_secs_f64);
    options
}

fn write_observables(result: &SimulationResult, out: &mut dyn Write) -> Result<()> {
    let observables = result.observables();
    let header: Vec<&str> = std::iter::once("time")
        .chain(observables.iter().map(|(name, _)| *name))
        .collect();
    writeln!(out, "{}", header.join("\t"))?;

    let Some(tout) = result.tout.first() else {
        return Ok(());
    };
    for (i, t) in tout.iter().enumerate() {
        let mut row = vec![t.to_string()];
        row.extend(observables.iter().map(|(_, series)| series[0][i].to_string()));
        writeln!(out, "{}", row.join("\t"))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let model = Model::from_json_file(&args.model)
        .with_context(|| format!("Failed to load model {}", args.model.display()))?;
    info!(
        "Loaded model '{}': {} species, {} reactions",
        model.name,
        model.n_species(),
        model.n_reactions()
    );

    let options = options(&args);
    let result = run_cupsoda(model, args.tspan.0.clone(), None, None, options)
        .context("cupSODA simulation failed")?;
    if let Some(dir) = result.workdir() {
        info!("Working directory kept at {}", dir.display());
    }

    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let mut out = BufWriter::new(file);
            write_observables(&result, &mut out)?;
            out.flush()?;
            info!("Wrote observables to {}", path.display());
        }
        None => write_observables(&result, &mut io::stdout().lock())?,
    }
    Ok(())
}
