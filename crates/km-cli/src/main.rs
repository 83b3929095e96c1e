//! kmband CLI

mod input;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use km_core::{Mode, ModeFlags};
use km_inference::{
    CandidateGrid, ExactSolver, ExactSolverConfig, KaplanMeierLikelihood, LikelihoodConfig,
    NominalCurve, ParameterRange, StratifiedCurves, times_for_plot,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "kmband")]
#[command(about = "kmband - Kaplan-Meier confidence bands under stratification uncertainty")]
#[command(version = km_core::VERSION)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum GridArg {
    Ratios,
    Achievable,
}

/// Arguments shared by the likelihood commands.
#[derive(clap::Args, Debug, Clone)]
struct LikelihoodArgs {
    /// Cohort JSON (patient array, or `{"patients": [...], "config": {...}}`)
    #[arg(short, long)]
    input: PathBuf,

    /// Lower edge of the parameter range (inclusive). Accepts `-inf`.
    #[arg(long, default_value = "-inf", allow_hyphen_values = true)]
    range_min: f64,

    /// Upper edge of the parameter range (exclusive). Accepts `inf`.
    #[arg(long, default_value = "inf", allow_hyphen_values = true)]
    range_max: f64,

    /// Binomial term only; every patient keeps its observed membership.
    #[arg(long)]
    binomial_only: bool,

    /// Patient-wise term only.
    #[arg(long)]
    patient_wise_only: bool,

    /// Wall-clock limit per solve, in seconds.
    #[arg(long)]
    time_limit: Option<f64>,

    /// Refuse exact solves above this many count combinations.
    #[arg(long)]
    max_combinations: Option<u64>,

    /// Candidate grid for the patient-wise sweep.
    #[arg(long, value_enum)]
    grid: Option<GridArg>,
}

#[derive(Subcommand)]
enum Commands {
    /// Best fits and confidence bands over time
    Band {
        #[command(flatten)]
        likelihood: LikelihoodArgs,

        /// Confidence level (repeatable)
        #[arg(long = "cl", default_values_t = [0.68, 0.95])]
        cls: Vec<f64>,

        /// Time points (comma-separated). Defaults to 0, every patient time and 1.1x the last.
        #[arg(long, value_delimiter = ',')]
        times: Option<Vec<f64>>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Nominal curves on observed parameters
    Nominal {
        /// Cohort JSON
        #[arg(short, long)]
        input: PathBuf,

        /// Parameter threshold splitting the cohort (repeatable)
        #[arg(long = "threshold", allow_hyphen_values = true)]
        thresholds: Vec<f64>,

        /// Time points (comma-separated). Defaults to 0, every patient time and 1.1x the last.
        #[arg(long, value_delimiter = ',')]
        times: Option<Vec<f64>>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Deviance scan at one time point
    Scan {
        #[command(flatten)]
        likelihood: LikelihoodArgs,

        /// Time point
        #[arg(long)]
        time: f64,

        /// Scan start (probability)
        #[arg(long, default_value = "0.05")]
        start: f64,

        /// Scan stop (probability)
        #[arg(long, default_value = "0.95")]
        stop: f64,

        /// Number of points (inclusive)
        #[arg(long, default_value = "19")]
        points: usize,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print version
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Band { likelihood, cls, times, output } => {
            cmd_band(&likelihood, &cls, times, output.as_ref())
        }
        Commands::Nominal { input, thresholds, times, output } => {
            cmd_nominal(&input, &thresholds, times, output.as_ref())
        }
        Commands::Scan { likelihood, time, start, stop, points, output } => {
            cmd_scan(&likelihood, time, start, stop, points, output.as_ref())
        }
        Commands::Version => {
            println!("kmband {}", km_core::VERSION);
            Ok(())
        }
    }
}

struct Prepared {
    likelihood: KaplanMeierLikelihood<ExactSolver>,
    mode: Mode,
    range: ParameterRange,
}

fn prepare(args: &LikelihoodArgs) -> Result<Prepared> {
    let mode = ModeFlags {
        binomial_only: args.binomial_only,
        patient_wise_only: args.patient_wise_only,
    }
    .resolve()?;
    let range = ParameterRange::new(args.range_min, args.range_max)?;
    let cohort = input::load_cohort(&args.input)?;

    let mut config: LikelihoodConfig = cohort.config;
    if args.time_limit.is_some() {
        config.time_limit = args.time_limit;
    }
    if let Some(grid) = args.grid {
        config.candidate_grid = match grid {
            GridArg::Ratios => CandidateGrid::Ratios,
            GridArg::Achievable => CandidateGrid::Achievable,
        };
    }
    let mut exact = ExactSolverConfig::default();
    if let Some(m) = args.max_combinations {
        exact.max_combinations = m;
    }

    tracing::info!(
        "{} patients, range [{}, {}), mode {mode}",
        cohort.patients.len(),
        range.min,
        range.max
    );
    let likelihood =
        KaplanMeierLikelihood::new(cohort.patients, range, config, ExactSolver::new(exact))?;
    Ok(Prepared { likelihood, mode, range })
}

fn default_times(likelihood: &KaplanMeierLikelihood<ExactSolver>) -> Result<Vec<f64>> {
    let times: Vec<f64> = likelihood.patients().iter().map(|p| p.time).collect();
    Ok(times_for_plot(&times)?)
}

fn cmd_band(
    args: &LikelihoodArgs,
    cls: &[f64],
    times: Option<Vec<f64>>,
    output: Option<&PathBuf>,
) -> Result<()> {
    let Prepared { likelihood, mode, range } = prepare(args)?;
    let times = match times {
        Some(t) => t,
        None => default_times(&likelihood)?,
    };

    let start = std::time::Instant::now();
    let band = likelihood.survival_probabilities_likelihood(cls, &times, mode)?;
    tracing::info!("band over {} time points in {:.2?}", times.len(), start.elapsed());

    let nominal = NominalCurve::new(likelihood.patients(), range).series(&times);
    let bands: serde_json::Map<String, serde_json::Value> = band
        .bands
        .iter()
        .map(|b| (b.cl.to_string(), serde_json::json!(b.intervals)))
        .collect();

    let out = serde_json::json!({
        "tool": "kmband",
        "version": km_core::VERSION,
        "command": "band",
        "mode": mode.to_string(),
        "range": { "min": range.min, "max": range.max },
        "times": band.times,
        "best_probabilities": band.best_probabilities,
        "bands": bands,
        "nominal": nominal.survival,
    });
    write_json(output, out)
}

fn cmd_nominal(
    input: &Path,
    thresholds: &[f64],
    times: Option<Vec<f64>>,
    output: Option<&PathBuf>,
) -> Result<()> {
    let cohort = input::load_cohort(input)?;
    let curves = StratifiedCurves::new(&cohort.patients, thresholds)?;
    let times = match times {
        Some(t) => t,
        None => curves.times_for_plot()?,
    };
    let series: Vec<_> = curves.curves().iter().map(|c| c.series(&times)).collect();
    let out = serde_json::json!({
        "tool": "kmband",
        "command": "nominal",
        "times": times,
        "curves": series,
    });
    write_json(output, out)
}

fn cmd_scan(
    args: &LikelihoodArgs,
    time: f64,
    start: f64,
    stop: f64,
    points: usize,
    output: Option<&PathBuf>,
) -> Result<()> {
    if points < 2 {
        anyhow::bail!("--points must be at least 2");
    }
    let Prepared { likelihood, mode, .. } = prepare(args)?;
    let curve = likelihood.deviance_curve(time, mode);

    let step = (stop - start) / (points - 1) as f64;
    let mut rows = Vec::with_capacity(points);
    for i in 0..points {
        let p = start + step * i as f64;
        let fit = curve.fit(p)?;
        rows.push(serde_json::json!({
            "p": p,
            "twice_nll": fit.twice_nll,
            "success": fit.success,
            "status": fit.status.to_string(),
            "n_total": fit.n_total,
            "n_alive": fit.n_alive,
            "binomial_2nll": fit.binomial_2nll,
            "patient_2nll": fit.patient_2nll,
        }));
    }

    let observed = curve.problem().observed_km_probability()?;
    let out = serde_json::json!({
        "tool": "kmband",
        "command": "scan",
        "mode": mode.to_string(),
        "time": time,
        "observed_probability": observed,
        "points": rows,
    });
    write_json(output, out)
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
