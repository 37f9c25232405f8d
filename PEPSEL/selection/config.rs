use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use shared_logging::LogLevel;

use crate::dataset::{TableSchema, TargetTransform};
use crate::grid::HyperparameterDomain;
use crate::inference::{OutputColumns, StageSpec};
use crate::model::svm::SolverConfig;
use crate::model::trainer::{KernelTrainer, ModelFamily};
use crate::model::Hyperparameters;
use crate::selector::{SelectorConfig, DEFAULT_ROUNDS};
use crate::splitter::SplitConfig;
use crate::store::{read_features, SelectionStore};

/// Training table location, column roles and target derivation.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetSection {
    /// Delimited table path.
    pub path: PathBuf,
    /// Column roles.
    #[serde(flatten)]
    pub schema: TableSchema,
    /// Target derivation; continuous by default.
    #[serde(default)]
    pub target: TargetTransform,
}

/// Kernel model family and solver settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    /// Classifier or regressor.
    pub family: ModelFamily,
    /// Solver stopping rules.
    #[serde(flatten)]
    pub solver: SolverConfig,
}

impl ModelSection {
    /// Trainer built from this section.
    #[must_use]
    pub const fn trainer(&self) -> KernelTrainer {
        KernelTrainer::new(self.family, self.solver)
    }
}

/// Cross-validation shape.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CvSection {
    /// Folds per repeat.
    #[serde(default = "default_folds")]
    pub folds: usize,
    /// Repeats.
    #[serde(default = "default_repeats")]
    pub repeats: usize,
    /// Fixed seed; drawn at random once per run when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for CvSection {
    fn default() -> Self {
        Self {
            folds: default_folds(),
            repeats: default_repeats(),
            seed: None,
        }
    }
}

impl CvSection {
    /// Split configuration using `seed` when none is configured.
    #[must_use]
    pub fn split(&self, fallback_seed: u64) -> SplitConfig {
        SplitConfig {
            folds: self.folds,
            repeats: self.repeats,
            seed: self.seed.unwrap_or(fallback_seed),
        }
    }
}

/// Round budget, stopping rule and parallelism.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SelectionSection {
    /// Maximum committed rounds.
    #[serde(default = "default_rounds")]
    pub rounds: usize,
    /// Evaluate grid combinations on the rayon pool.
    #[serde(default)]
    pub parallel: bool,
    /// Stop after a non-improving round.
    #[serde(default)]
    pub stop_on_plateau: bool,
}

impl Default for SelectionSection {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            parallel: false,
            stop_on_plateau: false,
        }
    }
}

impl SelectionSection {
    /// Selector settings.
    #[must_use]
    pub const fn selector(&self) -> SelectorConfig {
        SelectorConfig {
            rounds: self.rounds,
            stop_on_plateau: self.stop_on_plateau,
        }
    }
}

/// Artifact and log locations.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsSection {
    /// Trace file (`<round>\t<score>` lines).
    pub trace: PathBuf,
    /// Feature subset JSON file.
    pub features: PathBuf,
    /// Optional JSON-lines log.
    #[serde(default)]
    pub log: Option<PathBuf>,
    /// Minimum logged level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ArtifactsSection {
    /// Parsed minimum level.
    pub fn level(&self) -> Result<LogLevel> {
        LogLevel::parse(&self.log_level)
            .with_context(|| format!("unknown log level `{}`", self.log_level))
    }
}

/// Complete configuration of a selection run.
#[derive(Debug, Clone)]
pub struct SelectionConfig {
    /// Training table.
    pub dataset: DatasetSection,
    /// Kernel model.
    pub model: ModelSection,
    /// Hyperparameter grid.
    pub grid: HyperparameterDomain,
    /// Cross-validation.
    pub cv: CvSection,
    /// Selector behaviour.
    pub selection: SelectionSection,
    /// Output artifacts.
    pub artifacts: ArtifactsSection,
    source_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct SelectionConfigSerde {
    dataset: DatasetSection,
    model: ModelSection,
    #[serde(default)]
    grid: HyperparameterDomain,
    #[serde(default)]
    cv: CvSection,
    #[serde(default)]
    selection: SelectionSection,
    artifacts: ArtifactsSection,
}

impl SelectionConfig {
    /// Loads and validates a TOML file; relative paths resolve against its
    /// directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading selection config {}", path.display()))?;
        Self::from_toml_str(&raw, source_dir(path)).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses a TOML document, resolving relative paths against `source_dir`.
    pub fn from_toml_str(raw: &str, source_dir: impl Into<PathBuf>) -> Result<Self> {
        let document: SelectionConfigSerde = toml::from_str(raw)?;
        let source_dir = source_dir.into();
        if document.selection.rounds == 0 {
            bail!("selection.rounds must be at least 1");
        }
        if document.cv.folds < 2 {
            bail!("cv.folds must be at least 2");
        }
        if document.cv.repeats == 0 {
            bail!("cv.repeats must be at least 1");
        }
        document.grid.validate()?;
        if document.model.family == ModelFamily::Classifier
            && !matches!(document.dataset.target, TargetTransform::Binarize { .. })
        {
            bail!("a classifier run needs dataset.target = {{ kind = \"binarize\", threshold = ... }}");
        }
        let resolve = |candidate: PathBuf| resolve_against(&source_dir, candidate);
        let mut dataset = document.dataset;
        dataset.path = resolve(dataset.path);
        let mut artifacts = document.artifacts;
        artifacts.trace = resolve(artifacts.trace);
        artifacts.features = resolve(artifacts.features);
        artifacts.log = artifacts.log.map(resolve);
        artifacts.level()?;
        Ok(Self {
            dataset,
            model: document.model,
            grid: document.grid,
            cv: document.cv,
            selection: document.selection,
            artifacts,
            source_dir,
        })
    }

    /// Artifact store for this run.
    #[must_use]
    pub fn store(&self) -> SelectionStore {
        SelectionStore::new(&self.artifacts.trace, &self.artifacts.features)
    }

    /// Resolves a path relative to the configuration file.
    #[must_use]
    pub fn resolve_path(&self, candidate: impl AsRef<Path>) -> PathBuf {
        resolve_against(&self.source_dir, candidate.as_ref().to_path_buf())
    }
}

/// Held-out table to score.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringSection {
    /// Delimited table path.
    pub path: PathBuf,
    /// Identifier column.
    pub id_column: String,
    /// Column copied to the output unchanged.
    pub passthrough_column: String,
    /// Non-descriptor columns to ignore.
    #[serde(default)]
    pub drop_columns: Vec<String>,
}

/// One fitted stage of the final model.
#[derive(Debug, Clone, Deserialize)]
pub struct StageSection {
    /// Feature subset file written by a selection run.
    pub features: PathBuf,
    /// Prefix length of the recorded subset.
    pub top_k: usize,
    /// Principal components.
    pub components: usize,
    /// Penalty parameter.
    pub c: f64,
    /// RBF width.
    pub gamma: f64,
    /// Positive class bound for a gate; row filter for a regressor.
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl StageSection {
    /// Reads the subset file and builds the stage spec.
    pub fn spec(&self) -> Result<StageSpec> {
        let features = read_features(&self.features)
            .with_context(|| format!("reading feature subset {}", self.features.display()))?;
        Ok(StageSpec {
            features,
            top_k: self.top_k,
            params: Hyperparameters {
                components: self.components,
                c: self.c,
                gamma: self.gamma,
            },
        })
    }
}

/// Prediction output.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputSection {
    /// Prediction CSV path.
    pub path: PathBuf,
    /// Header names.
    #[serde(default)]
    pub columns: OutputColumns,
}

/// Cascade cross-validation settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CascadeCvSection {
    /// Cross-validation shape.
    #[serde(flatten)]
    pub cv: CvSection,
    /// File receiving one RMSE line per scored fold.
    #[serde(default)]
    pub results: Option<PathBuf>,
}

/// Complete configuration of the final model and its evaluation.
#[derive(Debug, Clone)]
pub struct PredictConfig {
    /// Training table (raw target).
    pub training: DatasetSection,
    /// Held-out table.
    pub scoring: Option<ScoringSection>,
    /// Optional gate stage.
    pub classifier: Option<StageSection>,
    /// Regression stage.
    pub regressor: StageSection,
    /// Solver settings shared by both stages.
    pub solver: SolverConfig,
    /// Prediction output.
    pub output: Option<OutputSection>,
    /// Cascade cross-validation.
    pub cascade_cv: CascadeCvSection,
    /// Optional JSON-lines log.
    pub log: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct PredictConfigSerde {
    training: DatasetSection,
    #[serde(default)]
    scoring: Option<ScoringSection>,
    #[serde(default)]
    classifier: Option<StageSection>,
    regressor: StageSection,
    #[serde(default)]
    solver: SolverConfig,
    #[serde(default)]
    output: Option<OutputSection>,
    #[serde(default)]
    cascade_cv: CascadeCvSection,
    #[serde(default)]
    log: Option<PathBuf>,
}

impl PredictConfig {
    /// Loads and validates a TOML file; relative paths resolve against its
    /// directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading predict config {}", path.display()))?;
        Self::from_toml_str(&raw, source_dir(path)).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses a TOML document, resolving relative paths against `source_dir`.
    pub fn from_toml_str(raw: &str, source_dir: impl Into<PathBuf>) -> Result<Self> {
        let document: PredictConfigSerde = toml::from_str(raw)?;
        let source_dir = source_dir.into();
        let resolve = |candidate: PathBuf| resolve_against(&source_dir, candidate);
        if let Some(classifier) = &document.classifier {
            if classifier.threshold.is_none() {
                bail!("classifier.threshold is required for a gate stage");
            }
        }
        let mut training = document.training;
        training.path = resolve(training.path);
        let scoring = document.scoring.map(|mut scoring| {
            scoring.path = resolve(scoring.path);
            scoring
        });
        let classifier = document.classifier.map(|mut stage| {
            stage.features = resolve(stage.features);
            stage
        });
        let mut regressor = document.regressor;
        regressor.features = resolve(regressor.features);
        let output = document.output.map(|mut output| {
            output.path = resolve(output.path);
            output
        });
        let mut cascade_cv = document.cascade_cv;
        cascade_cv.results = cascade_cv.results.map(resolve);
        Ok(Self {
            training,
            scoring,
            classifier,
            regressor,
            solver: document.solver,
            output,
            cascade_cv,
            log: document.log.map(resolve),
        })
    }

    /// Gate threshold, when a gate is configured.
    #[must_use]
    pub fn gate_threshold(&self) -> Option<f64> {
        self.classifier.as_ref().and_then(|stage| stage.threshold)
    }
}

fn source_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn resolve_against(base: &Path, candidate: PathBuf) -> PathBuf {
    if candidate.is_absolute() {
        candidate
    } else {
        base.join(candidate)
    }
}

const fn default_folds() -> usize {
    5
}

const fn default_repeats() -> usize {
    20
}

const fn default_rounds() -> usize {
    DEFAULT_ROUNDS
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, ScoringTable};
    use std::io::Write as _;
    use tempfile::tempdir;

    const SELECTION: &str = r#"
[dataset]
path = "data/mbic_training_data.csv"
id_column = "Name"
target_column = "MBIC"
drop_columns = ["Pathogen", "Type", "Seq"]
target = { kind = "binarize", threshold = 64.0 }

[model]
family = "classifier"

[cv]
seed = 42

[artifacts]
trace = "out/trace.txt"
features = "out/features.json"
"#;

    #[test]
    fn selection_defaults_follow_the_reference_grid() {
        let config = SelectionConfig::from_toml_str(SELECTION, "/runs").unwrap();
        assert_eq!(config.grid.c_values.len(), 16);
        assert_eq!(config.grid.gamma_values.len(), 15);
        assert_eq!(config.selection.rounds, 200);
        assert_eq!((config.cv.folds, config.cv.repeats), (5, 20));
        assert_eq!(config.cv.split(7).seed, 42);
        assert_eq!(config.model.solver, SolverConfig::default());
        assert_eq!(config.dataset.path, PathBuf::from("/runs/data/mbic_training_data.csv"));
        assert_eq!(config.store().trace_path(), Path::new("/runs/out/trace.txt"));
        assert_eq!(
            config.dataset.target,
            TargetTransform::Binarize { threshold: 64.0 }
        );
    }

    #[test]
    fn classifier_without_binary_target_is_rejected() {
        let raw = SELECTION.replace("target = { kind = \"binarize\", threshold = 64.0 }", "");
        assert!(SelectionConfig::from_toml_str(&raw, ".").is_err());
    }

    #[test]
    fn predict_config_loads_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("predict.toml");
        let mut file = fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
[training]
path = "train.csv"
id_column = "Name"
target_column = "MBIC"

[classifier]
features = "svm_features.json"
top_k = 9
components = 6
c = 10.0
gamma = 1000.0
threshold = 64.0

[regressor]
features = "svr_features.json"
top_k = 9
components = 8
c = 45.0
gamma = 40.0
threshold = 64.0

[cascade_cv]
repeats = 3
results = "full_model_results.txt"
"#
        )
        .unwrap();
        let config = PredictConfig::load(&path).unwrap();
        assert_eq!(config.gate_threshold(), Some(64.0));
        assert_eq!(config.regressor.features, dir.path().join("svr_features.json"));
        assert_eq!(config.cascade_cv.cv.repeats, 3);
        assert_eq!(config.cascade_cv.cv.folds, 5);
        assert!(config.output.is_none());
    }

    #[test]
    fn shipped_configs_parse() {
        for raw in [
            include_str!("configs/mbic_svm.toml"),
            include_str!("configs/mbic_svr.toml"),
            include_str!("configs/mbec_svr.toml"),
        ] {
            SelectionConfig::from_toml_str(raw, "configs").unwrap();
        }
        let cascade = PredictConfig::from_toml_str(include_str!("configs/mbic_predict.toml"), "configs").unwrap();
        assert_eq!(cascade.output.unwrap().columns.value, "Predicted MBIC Value");
        let single = PredictConfig::from_toml_str(include_str!("configs/mbec_predict.toml"), "configs").unwrap();
        assert_eq!(single.gate_threshold(), None);
        assert_eq!(single.regressor.top_k, 12);
        assert_eq!(single.output.unwrap().columns.passthrough, "Decision fn");
    }

    #[test]
    fn mbec_configs_read_mbec_shaped_tables() {
        let training = "Name,Seq,MBEC(uM),charge,length\n\
                        p1,KKLL,12.5,3,4\n\
                        p2,RRWW,50,2,4\n\
                        p3,GLFD,200,-1,4\n";
        let selection = SelectionConfig::from_toml_str(include_str!("configs/mbec_svr.toml"), "configs").unwrap();
        let dataset = Dataset::from_reader(training.as_bytes(), &selection.dataset.schema)
            .unwrap()
            .with_target(selection.dataset.target)
            .unwrap();
        assert_eq!(dataset.descriptor_names().collect::<Vec<_>>(), ["charge", "length"]);
        assert_eq!(dataset.target().to_vec(), vec![12.5, 50.0, 200.0]);

        let predict = PredictConfig::from_toml_str(include_str!("configs/mbec_predict.toml"), "configs").unwrap();
        Dataset::from_reader(training.as_bytes(), &predict.training.schema).unwrap();
        let scoring = predict.scoring.unwrap();
        let held_out = "Name,Seq,Decision Fn,charge,length\n\
                        q1,KWKW,0.8,4,4\n\
                        q2,AAAA,-0.3,0,4\n";
        let table = ScoringTable::from_reader(
            held_out.as_bytes(),
            &scoring.id_column,
            &scoring.passthrough_column,
            &scoring.drop_columns,
        )
        .unwrap();
        assert_eq!(table.passthrough(), ["0.8".to_string(), "-0.3".to_string()]);
        assert_eq!(table.columns(&["length".to_string()]).unwrap().len(), 2);
    }
}
