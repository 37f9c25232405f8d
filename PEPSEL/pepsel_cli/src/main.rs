use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use pepsel_selection::{
    cascade_cross_validate, write_predictions, CascadePlan, CascadePredictor, CrossValidator, Dataset,
    FittedPipeline, ForwardSelector, GridSearch, KernelTrainer, ModelFamily, PredictConfig, ScoringTable,
    SelectionConfig, SelectionSession, SelectionTelemetry, StageSpec, TargetTransform,
};
use serde::Serialize;
use serde_json::json;
use shared_logging::LogLevel;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "pepsel", version, about = "Peptide descriptor selection and MBIC/MBEC modelling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs forward selection, resuming from existing artifacts.
    Select(SelectArgs),
    /// Prints the recorded subset and trace of a selection run.
    Status {
        #[arg(long)]
        config: PathBuf,
        /// Print the session as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Grid-searches the first `top_k` recorded descriptors.
    Evaluate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        top_k: usize,
    },
    /// Fits the final model and scores the held-out table.
    Predict {
        #[arg(long)]
        config: PathBuf,
        /// Mirror log records to stderr.
        #[arg(long)]
        verbose: bool,
    },
    /// Cross-validates the classifier-gated regression cascade.
    CascadeCv {
        #[arg(long)]
        config: PathBuf,
        /// Mirror log records to stderr.
        #[arg(long)]
        verbose: bool,
    },
}

#[derive(Args, Debug)]
struct SelectArgs {
    #[arg(long)]
    config: PathBuf,
    /// Delete existing artifacts before the first round.
    #[arg(long)]
    fresh: bool,
    /// Override the configured round budget.
    #[arg(long)]
    rounds: Option<usize>,
    /// Override the configured seed.
    #[arg(long)]
    seed: Option<u64>,
    /// Mirror log records to stderr.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    seed: u64,
    metric: String,
    committed: Vec<String>,
    final_score: Option<f64>,
    trace: PathBuf,
    features: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Select(args) => handle_select(args),
        Commands::Status { config, json } => handle_status(&config, json),
        Commands::Evaluate { config, top_k } => handle_evaluate(&config, top_k),
        Commands::Predict { config, verbose } => handle_predict(&config, verbose),
        Commands::CascadeCv { config, verbose } => handle_cascade_cv(&config, verbose),
    }
}

fn handle_select(args: SelectArgs) -> Result<()> {
    let mut config = SelectionConfig::load(&args.config)?;
    if let Some(rounds) = args.rounds {
        anyhow::ensure!(rounds > 0, "--rounds must be at least 1");
        config.selection.rounds = rounds;
    }
    let configured_seed = args.seed.or(config.cv.seed);
    let seed = configured_seed.unwrap_or_else(rand::random);
    let telemetry = build_telemetry(
        "pepsel.select",
        config.artifacts.log.as_deref(),
        config.artifacts.level()?,
        args.verbose,
    )?;

    let dataset = load_training(&config)?;
    let store = config.store();
    if args.fresh {
        store.clear()?;
    }
    let stored = store.repair()?;
    if stored.repaired {
        telemetry.log(
            LogLevel::Warn,
            "selection.store_repaired",
            json!({ "trace": store.trace_path(), "rounds": stored.trace.len() }),
        )?;
    }
    telemetry.log(
        LogLevel::Info,
        "selection.seed",
        json!({ "seed": seed, "configured": configured_seed.is_some() }),
    )?;

    let trainer = config.model.trainer();
    let validator = CrossValidator::new(config.cv.split(seed))?;
    let search = GridSearch::new(&dataset, &trainer, &config.grid, &validator)?.parallel(config.selection.parallel);
    let metric = search.metric();
    let selector = ForwardSelector::new(search, config.selection.selector())?
        .with_store(&store)
        .telemetry(Some(&telemetry));

    let started_at = Utc::now();
    let session = selector.run(SelectionSession::resume(stored))?;
    let summary = RunSummary {
        run_id: telemetry.run_id(),
        started_at,
        finished_at: Utc::now(),
        seed,
        metric: metric.to_string(),
        committed: session.committed().to_vec(),
        final_score: session.trace().last().map(|entry| entry.score),
        trace: store.trace_path().to_path_buf(),
        features: store.features_path().to_path_buf(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn handle_status(config_path: &Path, as_json: bool) -> Result<()> {
    let config = SelectionConfig::load(config_path)?;
    let stored = config.store().load()?;
    let session = SelectionSession::resume(stored);
    if as_json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }
    if session.trace().is_empty() {
        println!("no rounds committed yet");
        return Ok(());
    }
    for entry in session.trace() {
        println!("{:>4} | {:<24} | {:.3}", entry.round, entry.feature, entry.score);
    }
    println!("next round: {}", session.next_round());
    Ok(())
}

fn handle_evaluate(config_path: &Path, top_k: usize) -> Result<()> {
    let config = SelectionConfig::load(config_path)?;
    let stored = config.store().load()?;
    if top_k == 0 || top_k > stored.features.len() {
        bail!(
            "--top-k {top_k} outside 1..={} recorded descriptors",
            stored.features.len()
        );
    }
    let subset = &stored.features[..top_k];
    let seed = config.cv.seed.unwrap_or_else(rand::random);
    let dataset = load_training(&config)?;
    let trainer = config.model.trainer();
    let validator = CrossValidator::new(config.cv.split(seed))?;
    let search = GridSearch::new(&dataset, &trainer, &config.grid, &validator)?.parallel(config.selection.parallel);
    let outcome = search.evaluate(subset)?;
    let Some(best) = outcome.best else {
        bail!(
            "every combination was skipped for the first {top_k} descriptors ({} skipped)",
            outcome.skipped
        );
    };
    println!(
        "{} | top_k={top_k} | {} | {}={:.3} | evaluated={} skipped={} unconverged={} | seed={seed}",
        subset.join(","),
        best.params,
        search.metric(),
        best.score,
        outcome.evaluated,
        outcome.skipped,
        outcome.unconverged
    );
    Ok(())
}

fn handle_predict(config_path: &Path, verbose: bool) -> Result<()> {
    let config = PredictConfig::load(config_path)?;
    let telemetry = build_telemetry("pepsel.predict", config.log.as_deref(), LogLevel::Info, verbose)?;
    let scoring = config
        .scoring
        .as_ref()
        .context("predict needs a [scoring] table")?;
    let output = config
        .output
        .as_ref()
        .context("predict needs an [output] section")?;
    let raw = Dataset::from_csv(&config.training.path, &config.training.schema)
        .with_context(|| format!("loading training table {}", config.training.path.display()))?
        .with_target(config.training.target)?;

    let gate = match (&config.classifier, config.gate_threshold()) {
        (Some(stage), Some(threshold)) => {
            let labeled = raw.clone().with_target(TargetTransform::Binarize { threshold })?;
            let trainer = KernelTrainer::new(ModelFamily::Classifier, config.solver);
            Some(fit_stage(&labeled, &trainer, &stage.spec()?, "classifier", &telemetry)?)
        }
        _ => None,
    };
    let regression_rows = match config.regressor.threshold {
        Some(threshold) => raw.with_target(TargetTransform::AtMost { threshold })?,
        None => raw,
    };
    let trainer = KernelTrainer::new(ModelFamily::Regressor, config.solver);
    let regressor = fit_stage(
        &regression_rows,
        &trainer,
        &config.regressor.spec()?,
        "regressor",
        &telemetry,
    )?;

    let table = ScoringTable::from_csv(
        &scoring.path,
        &scoring.id_column,
        &scoring.passthrough_column,
        &scoring.drop_columns,
    )
    .with_context(|| format!("loading scoring table {}", scoring.path.display()))?;
    let rows = CascadePredictor::new(gate, regressor).predict(&table, Some(&telemetry))?;
    write_predictions(&output.path, &rows, &output.columns)?;
    println!(
        "{} of {} rows predicted -> {}",
        rows.len(),
        table.len(),
        output.path.display()
    );
    Ok(())
}

fn handle_cascade_cv(config_path: &Path, verbose: bool) -> Result<()> {
    let config = PredictConfig::load(config_path)?;
    let telemetry = build_telemetry("pepsel.cascade_cv", config.log.as_deref(), LogLevel::Info, verbose)?;
    let (Some(classifier), Some(threshold)) = (&config.classifier, config.gate_threshold()) else {
        bail!("cascade-cv needs a [classifier] stage with a threshold");
    };
    let dataset = Dataset::from_csv(&config.training.path, &config.training.schema)
        .with_context(|| format!("loading training table {}", config.training.path.display()))?
        .with_target(config.training.target)?;
    let plan = CascadePlan {
        classifier: classifier.spec()?,
        regressor: config.regressor.spec()?,
        threshold,
    };
    let seed = config.cascade_cv.cv.seed.unwrap_or_else(rand::random);
    telemetry.log(
        LogLevel::Info,
        "cascade.seed",
        json!({ "seed": seed, "configured": config.cascade_cv.cv.seed.is_some() }),
    )?;
    let validator = CrossValidator::new(config.cascade_cv.cv.split(seed))?;
    let report = cascade_cross_validate(
        &dataset,
        &KernelTrainer::new(ModelFamily::Classifier, config.solver),
        &KernelTrainer::new(ModelFamily::Regressor, config.solver),
        &plan,
        &validator,
        config.cascade_cv.results.as_deref(),
        Some(&telemetry),
    )?;
    match report.mean_rmse {
        Some(mean) => println!(
            "mean RMSE {mean:.3} over {} folds ({} skipped)",
            report.folds.len(),
            report.skipped
        ),
        None => println!("no fold could be scored ({} skipped)", report.skipped),
    }
    Ok(())
}

fn load_training(config: &SelectionConfig) -> Result<Dataset> {
    let path = &config.dataset.path;
    let dataset = Dataset::from_csv(path, &config.dataset.schema)
        .with_context(|| format!("loading training table {}", path.display()))?
        .with_target(config.dataset.target)?;
    Ok(dataset)
}

fn fit_stage(
    dataset: &Dataset,
    trainer: &KernelTrainer,
    spec: &StageSpec,
    stage: &str,
    telemetry: &SelectionTelemetry,
) -> Result<FittedPipeline> {
    let pipeline = FittedPipeline::fit(dataset, trainer, spec).with_context(|| format!("fitting {stage} stage"))?;
    telemetry.log(
        if pipeline.converged() {
            LogLevel::Info
        } else {
            LogLevel::Warn
        },
        "inference.stage_fitted",
        json!({
            "stage": stage,
            "features": pipeline.features(),
            "rows": dataset.len(),
            "converged": pipeline.converged(),
            "components": spec.params.components,
            "c": spec.params.c,
            "gamma": spec.params.gamma,
        }),
    )?;
    Ok(pipeline)
}

fn build_telemetry(module: &str, log: Option<&Path>, level: LogLevel, echo: bool) -> Result<SelectionTelemetry> {
    let mut builder = SelectionTelemetry::builder(module).min_level(level).echo(echo);
    if let Some(path) = log {
        builder = builder.log_path(path);
    }
    builder.build()
}
