use glitcher_core::config::GlitchConfig;
use glitcher_core::input::SourceAsset;
use glitcher_core::observer::BatchObserver;
use glitcher_core::orchestrator::{BatchOrchestrator, BatchReport};
use glitcher_core::packager::VariantBundle;
use glitcher_core::store::OutputStore;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Seeded glitch variants of TIFF images", long_about = None)]
struct Cli {
    /// TIFF file to corrupt.
    #[clap(value_parser)]
    input: PathBuf,
    #[clap(short = 'n', long)]
    variants: Option<usize>,
    #[clap(short, long, allow_negative_numbers = true)]
    seed_base: Option<i64>,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short, long, value_parser)]
    output_dir: Option<PathBuf>,
    /// Worker threads; 1 runs sequentially, 0 uses every core.
    #[clap(long)]
    threads: Option<usize>,
    #[clap(long)]
    severity: Option<f64>,
    /// Keep results in memory and only print the summary.
    #[clap(long)]
    no_persist: bool,
}

/// Prints one line per finished variant.
struct ProgressPrinter {
    started: Instant,
}

impl BatchObserver for ProgressPrinter {
    fn name(&self) -> &'static str {
        "ProgressPrinter"
    }

    fn attempt_failed(&self, seed: i64, attempt: u32, reason: &str) {
        tracing::warn!(seed, attempt, reason, "decode attempt failed");
    }

    fn variant_finished(&self, bundle: &VariantBundle) {
        println!(
            "seed {:>8}: {:>9} bytes, {} attempt(s), preview {} [{:.2?}]",
            bundle.seed,
            bundle.container_bytes.len(),
            bundle.attempts,
            bundle.preview_source,
            self.started.elapsed()
        );
    }
}

fn load_config(cli: &Cli) -> Result<GlitchConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            GlitchConfig::load_from_file(config_path)?
        }
        None => {
            // No config file specified via CLI, load default
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}",
                );
                GlitchConfig::load_from_file(&default_config_path)?
            } else {
                GlitchConfig::default()
            }
        }
    };

    if let Some(variants) = cli.variants {
        config.batch.variant_count = variants;
    }
    if let Some(seed_base) = cli.seed_base {
        config.batch.seed_base = seed_base;
    }
    if let Some(threads) = cli.threads {
        config.batch.threads = threads;
    }
    if let Some(severity) = cli.severity {
        config.planner.severity = severity;
    }
    if let Some(output_dir) = &cli.output_dir {
        config.output.root = output_dir.clone();
    }
    if cli.no_persist {
        config.output.persist = false;
    }

    config.validate()?;
    Ok(config)
}

fn print_summary(report: &BatchReport) {
    let fallbacks = report
        .bundles
        .iter()
        .filter(|b| b.preview_source == glitcher_core::PreviewSource::Fallback)
        .count();
    println!(
        "Produced {}/{} variant(s), {} with fallback preview{}",
        report.bundles.len(),
        report.requested,
        fallbacks,
        if report.partial { " (cancelled early)" } else { "" }
    );
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    tracing::debug!("effective configuration:\n{}", toml::to_string_pretty(&config)?);

    let asset = SourceAsset::from_path(&cli.input)
        .map_err(|e| anyhow::anyhow!("Failed to read input {:?}: {}", cli.input, e))?;
    println!(
        "Glitching {} ({} bytes), seeds {}.. x{}",
        asset.filename(),
        asset.len(),
        config.batch.seed_base,
        config.batch.variant_count
    );

    let seed_base = config.batch.seed_base;
    let variant_count = config.batch.variant_count;
    let persist = config.output.persist;
    let store = OutputStore::new(config.output.root.clone());
    let orchestrator = BatchOrchestrator::new(config).with_observer(Arc::new(ProgressPrinter {
        started: Instant::now(),
    }));

    let start_time = Instant::now();
    if persist {
        let persisted = orchestrator.run_persisted(&asset, seed_base, variant_count, &store)?;
        print_summary(&persisted.report);
        println!("Output directory: {}", persisted.batch.dir.display());
    } else {
        let report = orchestrator.run(&asset, seed_base, variant_count)?;
        print_summary(&report);
    }
    println!("Finished in {:.2?}.", start_time.elapsed());

    Ok(())
}
