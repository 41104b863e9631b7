//! State-space estimation CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nalgebra::{DMatrix, DVector};
use serde::Deserialize;
use ssm_core::Observations;
use ssm_inference::diagnostics::{DiagnosticsConfig, assemble, assemble_em};
use ssm_inference::em::{EmConfig, EmResult, fit_em};
use ssm_inference::forecast::forecast;
use ssm_inference::kalman::{NumericalOptions, kalman_filter};
use ssm_inference::models;
use ssm_inference::multistart::{Candidate, best_by_aicc, fit_candidates, jittered_starts};
use ssm_inference::simulate::simulate;
use ssm_inference::smoother::rts_smoother;
use ssm_inference::spec::{ModelDeclaration, ModelSpec};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ssm")]
#[command(about = "Kalman filtering, smoothing and EM estimation for linear-Gaussian state-space models")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Kalman filter under the declared starting values
    Filter {
        /// Input JSON (`model` or a builder, plus `ys`)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the filter and the RTS smoother
    Smooth {
        /// Input JSON (`model` or a builder, plus `ys`)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also compute the diagnostics table (residuals, AIC, standard errors)
        #[arg(long)]
        diagnostics: bool,
    },

    /// Estimate the free parameters by EM
    Fit {
        /// Input JSON (`model` or a builder, plus `ys`)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// EM configuration JSON; flags below override its fields
        #[arg(long)]
        config: Option<PathBuf>,

        /// Maximum number of EM iterations
        #[arg(long)]
        max_iter: Option<usize>,

        /// Relative log-likelihood tolerance
        #[arg(long)]
        tol: Option<f64>,

        /// Floor for free variance parameters
        #[arg(long)]
        min_variance: Option<f64>,

        /// Number of jittered starts (1 = the declared start only)
        #[arg(long, default_value = "1")]
        starts: usize,

        /// Relative jitter scale for additional starts
        #[arg(long, default_value = "0.1")]
        jitter: f64,

        /// Seed for the jittered starts
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Skip the finite-difference standard errors
        #[arg(long)]
        no_std_errors: bool,
    },

    /// Forecast `steps` ahead from the last filtered state
    Forecast {
        /// Input JSON (`model` or a builder, plus `ys`)
        #[arg(short, long)]
        input: PathBuf,

        /// Forecast horizon
        #[arg(long, default_value = "10")]
        steps: usize,

        /// Two-sided interval level (0.05 gives 95% intervals)
        #[arg(long, default_value = "0.05")]
        alpha: f64,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Simulate states and observations from the declared values
    Simulate {
        /// Input JSON (`model` or a builder; `ys` is ignored)
        #[arg(short, long)]
        input: PathBuf,

        /// Number of time steps
        #[arg(long)]
        t_max: usize,

        /// RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Filter { input, output } => cmd_filter(&input, output.as_ref()),
        Commands::Smooth { input, output, diagnostics } => cmd_smooth(&input, output.as_ref(), diagnostics),
        Commands::Fit {
            input,
            output,
            config,
            max_iter,
            tol,
            min_variance,
            starts,
            jitter,
            seed,
            no_std_errors,
        } => {
            let mut cfg = load_em_config(config.as_ref())?;
            if let Some(v) = max_iter {
                cfg.max_iter = v;
            }
            if let Some(v) = tol {
                cfg.tol = v;
            }
            if let Some(v) = min_variance {
                cfg.min_variance = v;
            }
            let starts = MultiStart { n: starts, jitter, seed };
            cmd_fit(&input, output.as_ref(), &cfg, starts, !no_std_errors)
        }
        Commands::Forecast { input, steps, alpha, output } => {
            cmd_forecast(&input, steps, alpha, output.as_ref())
        }
        Commands::Simulate { input, t_max, seed, output } => {
            cmd_simulate(&input, t_max, seed, output.as_ref())
        }
    }
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
struct V0Json {
    #[serde(default = "default_v0")]
    v0: f64,
}

fn default_v0() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
struct InputJson {
    #[serde(default)]
    model: Option<ModelDeclaration>,
    #[serde(default)]
    local_level: Option<V0Json>,
    #[serde(default)]
    local_linear_trend: Option<V0Json>,
    #[serde(default)]
    ar1: Option<V0Json>,
    #[serde(default)]
    ys: Vec<Vec<Option<f64>>>,
}

fn dvector_to_vec(v: &DVector<f64>) -> Vec<f64> {
    v.iter().copied().collect()
}

fn dmatrix_to_nested(m: &DMatrix<f64>) -> Vec<Vec<f64>> {
    (0..m.nrows()).map(|i| m.row(i).iter().copied().collect()).collect()
}

fn load_input(path: &PathBuf) -> Result<(ModelSpec, Vec<Vec<Option<f64>>>)> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let input: InputJson = serde_json::from_slice(&bytes)?;

    let model_count = input.model.is_some() as usize
        + input.local_level.is_some() as usize
        + input.local_linear_trend.is_some() as usize
        + input.ar1.is_some() as usize;
    if model_count != 1 {
        anyhow::bail!("expected exactly one of: model, local_level, local_linear_trend, ar1");
    }

    let decl = if let Some(decl) = input.model {
        decl
    } else if let Some(ll) = input.local_level {
        models::local_level(ll.v0).map_err(|e| anyhow::anyhow!("invalid local_level model: {e}"))?
    } else if let Some(lt) = input.local_linear_trend {
        models::local_linear_trend(lt.v0)
            .map_err(|e| anyhow::anyhow!("invalid local_linear_trend model: {e}"))?
    } else if let Some(ar) = input.ar1 {
        models::ar1(ar.v0).map_err(|e| anyhow::anyhow!("invalid ar1 model: {e}"))?
    } else {
        anyhow::bail!("unreachable: model spec missing");
    };

    let spec = decl.build().map_err(|e| anyhow::anyhow!("invalid model: {e}"))?;
    tracing::debug!(
        n_state = spec.n_state(),
        n_obs = spec.n_obs(),
        n_parameters = spec.n_parameters(),
        "loaded model"
    );
    Ok((spec, input.ys))
}

fn load_observations(rows: &[Vec<Option<f64>>]) -> Result<Observations> {
    Observations::from_optional_rows(rows).map_err(|e| anyhow::anyhow!("invalid ys: {e}"))
}

fn load_em_config(path: Option<&PathBuf>) -> Result<EmConfig> {
    match path {
        Some(p) => {
            EmConfig::from_json_file(p).with_context(|| format!("failed to load EM config {}", p.display()))
        }
        None => Ok(EmConfig::default()),
    }
}

fn cmd_filter(input: &PathBuf, output: Option<&PathBuf>) -> Result<()> {
    let (spec, rows) = load_input(input)?;
    let ys = load_observations(&rows)?;
    let fr = kalman_filter(&spec, &ys, &NumericalOptions::default())
        .map_err(|e| anyhow::anyhow!("kalman_filter failed: {e}"))?;

    let output_json = serde_json::json!({
        "log_likelihood": fr.log_likelihood,
        "predicted_means": fr.predicted_means.iter().map(dvector_to_vec).collect::<Vec<_>>(),
        "predicted_covs": fr.predicted_covs.iter().map(dmatrix_to_nested).collect::<Vec<_>>(),
        "filtered_means": fr.filtered_means.iter().map(dvector_to_vec).collect::<Vec<_>>(),
        "filtered_covs": fr.filtered_covs.iter().map(dmatrix_to_nested).collect::<Vec<_>>(),
    });

    write_json(output, output_json)
}

fn cmd_smooth(input: &PathBuf, output: Option<&PathBuf>, diagnostics: bool) -> Result<()> {
    let (spec, rows) = load_input(input)?;
    let ys = load_observations(&rows)?;
    let opts = NumericalOptions::default();
    let fr = kalman_filter(&spec, &ys, &opts).map_err(|e| anyhow::anyhow!("kalman_filter failed: {e}"))?;
    let sr = rts_smoother(&spec, &fr, &opts).map_err(|e| anyhow::anyhow!("rts_smoother failed: {e}"))?;

    let mut output_json = serde_json::json!({
        "log_likelihood": fr.log_likelihood,
        "filtered_means": fr.filtered_means.iter().map(dvector_to_vec).collect::<Vec<_>>(),
        "filtered_covs": fr.filtered_covs.iter().map(dmatrix_to_nested).collect::<Vec<_>>(),
        "smoothed_means": sr.smoothed_means.iter().map(dvector_to_vec).collect::<Vec<_>>(),
        "smoothed_covs": sr.smoothed_covs.iter().map(dmatrix_to_nested).collect::<Vec<_>>(),
        "lag_one_covs": sr.lag_one_covs.iter().map(dmatrix_to_nested).collect::<Vec<_>>(),
    });
    if diagnostics {
        let diag = assemble(&spec, &ys, &fr, &sr, &DiagnosticsConfig::default())
            .map_err(|e| anyhow::anyhow!("diagnostics failed: {e}"))?;
        output_json["diagnostics"] = serde_json::to_value(&diag)?;
    }

    write_json(output, output_json)
}

struct MultiStart {
    n: usize,
    jitter: f64,
    seed: u64,
}

fn run_fit(spec: &ModelSpec, ys: &Observations, cfg: &EmConfig, starts: &MultiStart) -> Result<EmResult> {
    if starts.n <= 1 {
        return fit_em(spec, ys, cfg).map_err(|e| anyhow::anyhow!("EM failed: {e}"));
    }
    let mut specs = vec![spec.clone()];
    specs.extend(
        jittered_starts(spec, starts.n - 1, starts.jitter, starts.seed)
            .map_err(|e| anyhow::anyhow!("invalid jitter: {e}"))?,
    );
    let candidates: Vec<Candidate> =
        specs.into_iter().enumerate().map(|(i, s)| Candidate::new(format!("start_{i}"), s)).collect();
    let mut fits = fit_candidates(&candidates, ys, cfg);
    let best = best_by_aicc(&fits, ys).context("every start failed or diverged")?;
    tracing::info!(start = %best.label, "selected start by AICc");
    let idx = fits.iter().position(|f| f.label == best.label).context("selected start missing")?;
    match fits.swap_remove(idx).result {
        Ok(res) => Ok(res),
        Err(e) => Err(anyhow::anyhow!("EM failed: {e}")),
    }
}

fn cmd_fit(
    input: &PathBuf,
    output: Option<&PathBuf>,
    cfg: &EmConfig,
    starts: MultiStart,
    std_errors: bool,
) -> Result<()> {
    let (spec, rows) = load_input(input)?;
    let ys = load_observations(&rows)?;

    let res = run_fit(&spec, &ys, cfg, &starts)?;
    if res.status.is_warning() {
        tracing::warn!(status = ?res.status, n_iter = res.n_iter, "EM did not converge");
    } else {
        tracing::info!(n_iter = res.n_iter, log_likelihood = res.log_likelihood(), "EM converged");
    }

    let dcfg = DiagnosticsConfig { std_errors, numerical: cfg.numerical, ..DiagnosticsConfig::default() };
    let diag = assemble_em(&res, &ys, &dcfg).map_err(|e| anyhow::anyhow!("diagnostics failed: {e}"))?;

    let output_json = serde_json::json!({
        "status": res.status,
        "converged": res.converged(),
        "n_iter": res.n_iter,
        "log_likelihood": res.log_likelihood(),
        "trace": res.trace,
        "model": res.spec.to_declaration(),
        "diagnostics": diag,
    });

    write_json(output, output_json)
}

fn cmd_forecast(input: &PathBuf, steps: usize, alpha: f64, output: Option<&PathBuf>) -> Result<()> {
    let (spec, rows) = load_input(input)?;
    let ys = load_observations(&rows)?;
    let fr = kalman_filter(&spec, &ys, &NumericalOptions::default())
        .map_err(|e| anyhow::anyhow!("kalman_filter failed: {e}"))?;
    let fc = forecast(&spec, &fr, steps).map_err(|e| anyhow::anyhow!("forecast failed: {e}"))?;
    let iv = fc.intervals(alpha).map_err(|e| anyhow::anyhow!("forecast intervals failed: {e}"))?;

    let output_json = serde_json::json!({
        "state_means": fc.state_means.iter().map(dvector_to_vec).collect::<Vec<_>>(),
        "state_covs": fc.state_covs.iter().map(dmatrix_to_nested).collect::<Vec<_>>(),
        "obs_means": fc.obs_means.iter().map(dvector_to_vec).collect::<Vec<_>>(),
        "obs_covs": fc.obs_covs.iter().map(dmatrix_to_nested).collect::<Vec<_>>(),
        "intervals": iv,
    });

    write_json(output, output_json)
}

fn cmd_simulate(input: &PathBuf, t_max: usize, seed: u64, output: Option<&PathBuf>) -> Result<()> {
    let (spec, _rows) = load_input(input)?;
    let sim = simulate(&spec, t_max, seed).map_err(|e| anyhow::anyhow!("simulate failed: {e}"))?;

    let output_json = serde_json::json!({
        "xs": sim.xs.iter().map(dvector_to_vec).collect::<Vec<_>>(),
        "ys": sim.ys.iter().map(dvector_to_vec).collect::<Vec<_>>(),
    });
    write_json(output, output_json)
}
