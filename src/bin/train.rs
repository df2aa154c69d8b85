//! RBM training binary.
//!
//! Trains an RBM or GRBM on a synthetic dataset of correlated units and
//! writes a JSON checkpoint. Type `q` and Enter to abort a running
//! optimization; the parameters reached so far are kept.

use clap::{Parser, ValueEnum};
use ndarray::{Array2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rbm::checkpoint::{load_checkpoint, save_checkpoint};
use rbm::{
    CancellationToken, ConfigOverrides, LogObserver, MemoryDataset, ModelKind, Rbm, RbmResult,
    Schedule, Topology,
};
use std::fs;
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModelArg {
    /// Binary visible units
    Rbm,
    /// Gaussian visible units
    Grbm,
}

impl From<ModelArg> for ModelKind {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Rbm => ModelKind::Rbm,
            ModelArg::Grbm => ModelKind::Grbm,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "rbm-train",
    about = "Train an RBM with contrastive divergence on synthetic data"
)]
struct Args {
    /// Model type
    #[arg(long, value_enum, default_value_t = ModelArg::Rbm)]
    model: ModelArg,

    /// Number of independent latent factors in the synthetic data
    #[arg(long, default_value_t = 4)]
    factors: usize,

    /// Visible units generated per latent factor
    #[arg(long, default_value_t = 2)]
    copies: usize,

    /// Hidden layer size
    #[arg(long, default_value_t = 4)]
    hidden_size: usize,

    /// Number of synthetic samples
    #[arg(long, default_value_t = 1000)]
    samples: usize,

    /// Number of updates (overrides model defaults)
    #[arg(long, default_value_t = 1000)]
    updates: usize,

    /// Update rate (overrides model defaults)
    #[arg(long)]
    rate: Option<f32>,

    /// Optimization schedule (JSON)
    #[arg(long)]
    schedule: Option<PathBuf>,

    /// Output checkpoint file
    #[arg(long, default_value = "data/checkpoints/rbm.json")]
    checkpoint: PathBuf,

    /// Resume from checkpoint file
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Random seed for data, initialization and sampling
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> RbmResult<()> {
    let kind = ModelKind::from(args.model);
    let visible: Vec<String> = (0..args.factors)
        .flat_map(|f| (0..args.copies).map(move |c| format!("v:f{f}c{c}")))
        .collect();
    let data = synthetic_data(kind, args.samples, args.factors, args.copies, args.seed);
    let mut dataset = MemoryDataset::new(visible.clone(), data, args.seed)?;

    let mut model = match &args.resume {
        Some(path) => {
            log::info!("resuming from checkpoint: {}", path.display());
            let (model, checkpoint) = load_checkpoint(path, Some(args.seed))?;
            log::info!("checkpoint has {} epochs", checkpoint.epochs);
            model
        }
        None => {
            let topology = Topology::layered(visible, args.hidden_size);
            let mut model = Rbm::configure(kind, &topology, &dataset, args.seed)?;
            model.init_params(&mut dataset)?;
            model
        }
    };
    model.set_config(ConfigOverrides {
        updates: Some(args.updates),
        update_rate: args.rate,
        ..ConfigOverrides::default()
    });

    let schedule = match &args.schedule {
        Some(path) => Schedule::from_json(&fs::read_to_string(path)?)?,
        None => Schedule::trivial("default"),
    };

    let token = CancellationToken::new();
    spawn_abort_listener(token.clone());

    let start = Instant::now();
    let mut signal = token.clone();
    let mut observer = LogObserver;
    let report = model.try_optimize(&mut dataset, &schedule, &mut signal, &mut observer)?;
    log::info!(
        "{} updates in {:.1}s{}; final rate {}, skipped updates {}",
        report.epochs,
        start.elapsed().as_secs_f64(),
        if report.aborted { " (aborted)" } else { "" },
        report.final_rate,
        report.skipped_updates
    );

    if let Some(parent) = args.checkpoint.parent() {
        fs::create_dir_all(parent)?;
    }
    save_checkpoint(&model, &args.checkpoint, report.epochs, report.reconstruction_error)?;
    log::info!("checkpoint written to {}", args.checkpoint.display());
    Ok(())
}

/// Cancel `token` when a line `q` is read from stdin.
fn spawn_abort_listener(token: CancellationToken) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            if line.trim() == "q" {
                token.cancel();
                break;
            }
        }
    });
}

/// Samples of independent latent factors, each copied to `copies` visible units.
///
/// RBM data is binary; GRBM data adds gaussian noise to the factors and is
/// normalized to zero mean and unit variance per column.
fn synthetic_data(
    kind: ModelKind,
    samples: usize,
    factors: usize,
    copies: usize,
    seed: u64,
) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    match kind {
        ModelKind::Rbm => {
            let latent = Array2::from_shape_fn((samples, factors), |_| {
                if rng.gen::<bool>() {
                    1.0
                } else {
                    0.0
                }
            });
            Array2::from_shape_fn((samples, factors * copies), |(i, j)| latent[[i, j / copies]])
        }
        ModelKind::Grbm => {
            let latent = Array2::<f32>::random_using((samples, factors), StandardNormal, &mut rng);
            let noise =
                Array2::<f32>::random_using((samples, factors * copies), StandardNormal, &mut rng);
            let raw = Array2::from_shape_fn((samples, factors * copies), |(i, j)| {
                latent[[i, j / copies]] + 0.3 * noise[[i, j]]
            });
            let mean = raw.mean_axis(Axis(0)).unwrap_or_else(|| ndarray::Array1::zeros(raw.ncols()));
            let sdev = raw.std_axis(Axis(0), 0.0).mapv(|s| s.max(f32::EPSILON));
            (raw - &mean) / &sdev
        }
    }
}
