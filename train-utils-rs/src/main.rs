//! CLI entry point for train-utils.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use train_utils_rs::{
    assemble, load_runs, CurveForm, EpochExtrapolator, Extrapolation, MetricHistory, Result,
    TrainUtilsConfig, TrainUtilsError,
};

#[derive(Parser)]
#[command(name = "train-utils")]
#[command(about = "Learning-curve extrapolation and image dataset assembly for training runs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a learning curve to a metric history and project it forward
    Extrapolate {
        /// JSON file: an array of per-epoch values or an object of named runs
        #[arg(long)]
        history: PathBuf,
        /// Only extrapolate this run
        #[arg(long)]
        run: Option<String>,
        /// Number of epochs to predict (overrides the config)
        #[arg(long)]
        horizon: Option<usize>,
        /// Curve form: log or gp (overrides the config)
        #[arg(long)]
        form: Option<String>,
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the results as JSON
        #[arg(long)]
        output: Option<PathBuf>,
        /// Fit every curve form and rank them
        #[arg(long)]
        compare: bool,
    },
    /// Split and concatenate the configured image directories
    Dataset {
        /// Path to configuration file
        #[arg(long)]
        config: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: PathBuf,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "train-utils.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Extrapolate {
            history,
            run,
            horizon,
            form,
            config,
            output,
            compare,
        } => {
            let mut config = match config {
                Some(path) => TrainUtilsConfig::from_file(path)?.extrapolation,
                None => TrainUtilsConfig::default().extrapolation,
            };
            if let Some(horizon) = horizon {
                config.horizon = horizon;
            }
            if let Some(form) = form {
                config.form = form.parse::<CurveForm>()?;
            }
            let horizon = config.horizon;
            let extrapolator = EpochExtrapolator::new(config)?;

            let runs = select_runs(load_runs(&history)?, run.as_deref())?;
            let mut report = serde_json::Map::new();
            for (name, history) in &runs {
                tracing::info!("Extrapolating run {} ({} epochs)", name, history.len());
                if compare {
                    let comparison = extrapolator.compare_forms(history, horizon)?;
                    println!("run {name}:");
                    for (rank, result) in comparison.ranked.iter().enumerate() {
                        println!(
                            "  {}. {} rmse={:.6} params={}",
                            rank + 1,
                            result.form,
                            result.rmse,
                            result.params
                        );
                    }
                    for (form, error) in &comparison.failed {
                        println!("  {form} failed: {error}");
                    }
                    if let Some(best) = comparison.best() {
                        print_predictions(best);
                    }
                    report.insert(name.clone(), serde_json::to_value(&comparison)?);
                } else {
                    let result = extrapolator.extrapolate(history, horizon)?;
                    println!("run {name}: {} params={}", result.form, result.params);
                    print_predictions(&result);
                    report.insert(name.clone(), serde_json::to_value(&result)?);
                }
            }

            if let Some(output) = output {
                std::fs::write(&output, serde_json::to_string_pretty(&report)?)?;
                println!("✓ Results written to: {}", output.display());
            }
        }
        Commands::Dataset { config } => {
            tracing::info!("Assembling dataset from config: {}", config.display());
            let config = TrainUtilsConfig::from_file(&config)?;
            let dataset = assemble(&config.dataset)?;

            println!("Classes: {}", dataset.num_classes());
            for source in &dataset.sources {
                println!(
                    "  {}: {} classes, {} train, {} validation{}",
                    source.path.display(),
                    source.classes,
                    source.train,
                    source.validation,
                    if source.special { " (special)" } else { "" }
                );
            }
            println!(
                "Train: {} samples in {} batches",
                dataset.train.len(),
                dataset.train.num_batches(config.dataset.batch_size)
            );
            println!(
                "Validation: {} samples in {} batches",
                dataset.validation.len(),
                dataset.validation.num_batches(config.dataset.batch_size)
            );
            println!("Special classes: {:?}", dataset.special_classes.indices());
        }
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = TrainUtilsConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Curve form: {}", config.extrapolation.form);
            println!("  Horizon: {}", config.extrapolation.horizon);
            println!("  Primary dataset: {}", config.dataset.primary.path.display());
            println!("  Extra sources: {}", config.dataset.sources.len());
        }
        Commands::Init { output } => {
            tracing::info!("Generating sample config: {}", output.display());
            TrainUtilsConfig::sample().to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
    }

    Ok(())
}

/// Keep the requested run, or every non-empty run.
fn select_runs(
    runs: Vec<(String, MetricHistory)>,
    wanted: Option<&str>,
) -> Result<Vec<(String, MetricHistory)>> {
    if let Some(wanted) = wanted {
        return runs
            .into_iter()
            .find(|(name, _)| name == wanted)
            .map(|run| vec![run])
            .ok_or_else(|| TrainUtilsError::Config(format!("run '{wanted}' not found in history")));
    }
    let (kept, empty): (Vec<_>, Vec<_>) = runs.into_iter().partition(|(_, h)| !h.is_empty());
    for (name, _) in &empty {
        tracing::warn!("Skipping run {} with no recorded epochs", name);
    }
    if kept.is_empty() {
        return Err(TrainUtilsError::EmptyInput(
            "history file has no recorded epochs".into(),
        ));
    }
    Ok(kept)
}

fn print_predictions(result: &Extrapolation) {
    for (epoch, value) in result.predicted.iter().enumerate() {
        match result.observed.get(epoch) {
            Some(observed) => println!("  epoch {epoch:>3}: {value:.4} (observed {observed:.4})"),
            None => println!("  epoch {epoch:>3}: {value:.4}"),
        }
    }
}
