use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{ensure, Context};
use candle_core::Device;
use clap::{Parser, Subcommand};
use rand::{rngs::StdRng, Rng, SeedableRng};

use moe_core::experts::build_provider;
use moe_core::moe::{deserialize_config, serialize_config, LayoutParams, RegionKind, WorkspaceLayout};
use moe_core::{InputShape, MoELayer, MoELayerConfig, Workspace};

mod config;
mod logging;

use config::LayerFile;

#[derive(Parser)]
#[command(name = "moe-dispatch", about = "Top-1 mixture-of-experts dispatch driver")]
struct Cli {
    /// Fallback log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the workspace bytes a dispatch needs, region by region
    WorkspaceSize {
        /// TOML layer description
        #[arg(long)]
        config: PathBuf,

        #[arg(long, default_value_t = 1)]
        batch: usize,

        #[arg(long, default_value_t = 128)]
        seq: usize,
    },

    /// Initialize the layer and dispatch random tokens through it
    Run {
        /// TOML layer description
        #[arg(long)]
        config: PathBuf,

        #[arg(long, default_value_t = 1)]
        batch: usize,

        #[arg(long, default_value_t = 128)]
        seq: usize,

        /// Timed dispatches after one warm-up call
        #[arg(long, default_value_t = 5)]
        iterations: usize,

        /// Seed for the random input tokens
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Run the router on this CUDA device instead of the CPU (needs the
        /// `cuda` feature)
        #[arg(long)]
        cuda: Option<usize>,
    },

    /// Write the binary layer configuration
    Pack {
        /// TOML layer description
        #[arg(long)]
        config: PathBuf,

        /// Destination file
        #[arg(long)]
        output: PathBuf,
    },

    /// Decode and print a binary layer configuration
    Inspect {
        /// File written by `pack`
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_with_level(&cli.log_level);

    match cli.command {
        Command::WorkspaceSize { config, batch, seq } => workspace_size(&config, batch, seq),
        Command::Run {
            config,
            batch,
            seq,
            iterations,
            seed,
            cuda,
        } => run(&config, batch, seq, iterations, seed, cuda),
        Command::Pack { config, output } => pack(&config, &output),
        Command::Inspect { path } => inspect(&path),
    }
}

fn load_config(path: &Path) -> anyhow::Result<MoELayerConfig> {
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let config = LayerFile::load_from(path)
        .and_then(|file| file.into_layer_config(base_dir))
        .with_context(|| format!("failed to load layer file {}", path.display()))?;
    tracing::debug!(
        experts = config.expert_count,
        embedding = config.embedding_size(),
        sublayer = %config.sublayer_type,
        "loaded layer file"
    );
    Ok(config)
}

fn workspace_size(path: &Path, batch: usize, seq: usize) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let shape = InputShape::new(batch, seq, config.embedding_size());
    let provider = build_provider(&config);
    let layout = WorkspaceLayout::plan(
        LayoutParams {
            token_capacity: shape.token_count(),
            embedding_size: shape.embedding_size,
            expert_count: config.expert_count,
            concurrency: config.max_concurrency,
        },
        provider.as_ref(),
    );

    println!("input shape    {:?}", shape.dims());
    for kind in RegionKind::ALL {
        let region = layout.region(kind);
        println!("{:<22} {:>12} @ {}", format!("{kind:?}"), region.len, region.offset);
    }
    for (i, slot) in layout.slots().iter().enumerate() {
        println!(
            "{:<22} {:>12} @ {} (weights {}, working {})",
            format!("Slot{i}"),
            slot.span().len,
            slot.span().offset,
            slot.weights.len,
            slot.working.len
        );
    }
    println!("{:<22} {:>12}", "total", layout.total_size());
    Ok(())
}

fn run(
    path: &Path,
    batch: usize,
    seq: usize,
    iterations: usize,
    seed: u64,
    cuda: Option<usize>,
) -> anyhow::Result<()> {
    ensure!(iterations > 0, "--iterations must be at least 1");
    let config = load_config(path)?;
    let device = select_device(cuda)?;

    let mut layer = MoELayer::with_device(config, device)?;
    layer.initialize().context("failed to initialize layer")?;
    let shape = layer.configure(&[batch, seq, layer.embedding_size()])?;

    let mut workspace = Workspace::with_size(layer.compute_workspace_size(&shape))?;
    let mut rng = StdRng::seed_from_u64(seed);
    let input: Vec<f32> = (0..shape.numel()).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let mut output = vec![0.0; shape.numel()];

    // Warm-up also mirrors the centroids.
    layer.dispatch(&shape, &input, &mut output, &mut workspace)?;

    let mut timings = Vec::with_capacity(iterations);
    let mut report = None;
    for _ in 0..iterations {
        let start = Instant::now();
        report = Some(layer.dispatch(&shape, &input, &mut output, &mut workspace)?);
        timings.push(start.elapsed());
    }
    layer.terminate();

    let Some(report) = report else {
        return Ok(());
    };
    let widest = report.bucket_counts.iter().copied().max().unwrap_or(0).max(1);
    println!("tokens {}  workspace {} bytes", report.token_count, workspace.size_bytes());
    for (expert, &count) in report.bucket_counts.iter().enumerate() {
        let bar = "#".repeat(count * 40 / widest);
        println!("expert {expert:>4} {count:>8} {bar}");
    }
    println!(
        "experts run {}  weight loads {}",
        report.experts_run.len(),
        report.weight_loads
    );

    let total: Duration = timings.iter().sum();
    let best = timings.iter().min().copied().unwrap_or_default();
    println!(
        "dispatch mean {:.3} ms  best {:.3} ms over {} iterations",
        total.as_secs_f64() * 1e3 / iterations as f64,
        best.as_secs_f64() * 1e3,
        iterations
    );
    Ok(())
}

fn select_device(cuda: Option<usize>) -> anyhow::Result<Device> {
    let Some(ordinal) = cuda else {
        return Ok(Device::Cpu);
    };
    ensure!(
        cfg!(feature = "cuda"),
        "--cuda needs moe-dispatch built with the `cuda` feature"
    );
    Device::new_cuda(ordinal).context("failed to open CUDA device")
}

fn pack(path: &Path, output: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let bytes = serialize_config(&config)?;
    std::fs::write(output, &bytes).with_context(|| format!("failed to write {}", output.display()))?;
    tracing::info!(bytes = bytes.len(), path = %output.display(), "wrote layer configuration");
    println!("{} bytes -> {}", bytes.len(), output.display());
    Ok(())
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let config = deserialize_config(&bytes)
        .with_context(|| format!("{} is not a serialized layer configuration", path.display()))?;

    println!("expert_count    {}", config.expert_count);
    println!("hidden_size     {}", config.hidden_size);
    println!("max_concurrency {}", config.max_concurrency);
    println!("sublayer_type   {}", config.sublayer_type);
    println!("weight_file     {}", config.weight_file.display());
    println!(
        "centroids       {} values ({} x {})",
        config.centroids.len(),
        config.expert_count,
        config.embedding_size()
    );
    if !config.centroids.is_empty() {
        let min = config.centroids.iter().copied().fold(f32::INFINITY, f32::min);
        let max = config.centroids.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        println!("centroid range  [{min}, {max}]");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_accepts_cuda_ordinal() {
        let cli = Cli::try_parse_from(["moe-dispatch", "run", "--config", "layer.toml", "--cuda", "1"])
            .unwrap();
        match cli.command {
            Command::Run { cuda, .. } => assert_eq!(cuda, Some(1)),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_select_device_defaults_to_cpu() {
        assert!(select_device(None).unwrap().is_cpu());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_flag_reports_missing_feature() {
        let err = select_device(Some(0)).unwrap_err();
        assert!(err.to_string().contains("`cuda` feature"));
    }
}
