use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use freerecall_core::{
    align, distance_crp_by_subject, distance_rank, lag_crp_by_subject_with, lag_rank, pnr, spc,
    AlignOptions, DistanceCrpOptions, DistanceMatrix, Execution, LagCrpOptions, LagMethod, Table,
    Value,
};
use serde::Deserialize;
use serde_json::Map;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const TRIAL_TYPE_COLUMN: &str = "trial_type";
const DEFAULT_INDEX_KEY: &str = "item_index";

#[derive(Debug, Parser)]
#[command(name = "frecall")]
#[command(about = "Free-recall event alignment and transition analysis")]
struct Cli {
    /// Tracing filter for stderr logs; `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// YAML file with column roles and analysis settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Merge study and recall events into one row per item occurrence.
    Align(InputArgs),
    /// Conditional response probability by lag, per subject.
    LagCrp(LagCrpArgs),
    /// Serial position curve, per subject.
    Spc(InputArgs),
    /// Probability of nth recall, per subject.
    Pnr(PnrArgs),
    /// Mean percentile rank of transition lags, per subject.
    LagRank(InputArgs),
    /// Conditional response probability by binned item distance, per subject.
    DistanceCrp(DistanceCrpArgs),
    /// Mean percentile rank of transition distances, per subject.
    DistanceRank(DistanceArgs),
}

#[derive(Debug, Args)]
struct InputArgs {
    /// JSON records with a `trial_type` column of `study` or `recall`.
    #[arg(long)]
    trials: Option<PathBuf>,
    #[arg(long)]
    study: Option<PathBuf>,
    #[arg(long)]
    recall: Option<PathBuf>,
    /// Already-aligned JSON records; alignment is skipped.
    #[arg(long)]
    aligned: Option<PathBuf>,
    #[arg(long = "merge-key")]
    merge_keys: Vec<String>,
    #[arg(long = "list-key")]
    list_keys: Vec<String>,
    #[arg(long = "study-key")]
    study_keys: Vec<String>,
    #[arg(long = "recall-key")]
    recall_keys: Vec<String>,
    #[arg(long)]
    position_key: Option<String>,
}

#[derive(Debug, Args)]
struct LagCrpArgs {
    #[command(flatten)]
    input: InputArgs,
    #[arg(long)]
    list_length: Option<usize>,
    #[arg(long, value_enum)]
    method: Option<MethodArg>,
    /// Run subjects on the rayon thread pool.
    #[arg(long, default_value_t = false)]
    parallel: bool,
    /// Include actual and possible transition counts in each row.
    #[arg(long, default_value_t = false)]
    counts: bool,
    /// Boolean column; recalls where it is false start no transition.
    #[arg(long)]
    from_mask_key: Option<String>,
    /// Boolean column; recalls where it is false end no transition.
    #[arg(long)]
    to_mask_key: Option<String>,
}

#[derive(Debug, Args)]
struct DistanceArgs {
    #[command(flatten)]
    input: InputArgs,
    /// JSON file holding a square array of pairwise item distances.
    #[arg(long)]
    distances: PathBuf,
    /// Aligned column with each item's row in the distance matrix.
    #[arg(long)]
    index_key: Option<String>,
}

#[derive(Debug, Args)]
struct DistanceCrpArgs {
    #[command(flatten)]
    distance: DistanceArgs,
    /// Increasing bin edges, comma separated.
    #[arg(long, value_delimiter = ',')]
    edges: Vec<f64>,
    /// Count each bin at most once per transition.
    #[arg(long, default_value_t = false)]
    count_unique: bool,
    #[arg(long, default_value_t = false)]
    parallel: bool,
}

#[derive(Debug, Args)]
struct PnrArgs {
    #[command(flatten)]
    input: InputArgs,
    #[arg(long)]
    list_length: Option<usize>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MethodArg {
    Paired,
    Masked,
}

impl MethodArg {
    fn into_method(self) -> LagMethod {
        match self {
            Self::Paired => LagMethod::Paired,
            Self::Masked => LagMethod::Masked,
        }
    }
}

/// Settings read from `--config`. Command-line flags win over these.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AnalysisConfig {
    merge_keys: Option<Vec<String>>,
    list_keys: Option<Vec<String>>,
    study_keys: Option<Vec<String>>,
    recall_keys: Option<Vec<String>>,
    position_key: Option<String>,
    list_length: Option<usize>,
    method: Option<LagMethod>,
    parallel: Option<bool>,
    from_mask_key: Option<String>,
    to_mask_key: Option<String>,
    index_key: Option<String>,
    edges: Option<Vec<f64>>,
}

impl AnalysisConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded analysis config");
        Ok(config)
    }

    fn align_options(&self, args: &InputArgs) -> AlignOptions {
        let defaults = AlignOptions::default();
        let pick = |flag: &[String], file: Option<&[String]>, default: Vec<String>| {
            if flag.is_empty() {
                file.map_or(default, <[String]>::to_vec)
            } else {
                flag.to_vec()
            }
        };
        AlignOptions {
            merge_keys: pick(&args.merge_keys, self.merge_keys.as_deref(), defaults.merge_keys),
            list_keys: pick(&args.list_keys, self.list_keys.as_deref(), defaults.list_keys),
            study_keys: pick(&args.study_keys, self.study_keys.as_deref(), defaults.study_keys),
            recall_keys: pick(&args.recall_keys, self.recall_keys.as_deref(), defaults.recall_keys),
            position_key: args
                .position_key
                .clone()
                .or_else(|| self.position_key.clone())
                .unwrap_or(defaults.position_key),
        }
    }

    fn execution(&self, flag: bool) -> Execution {
        if flag || self.parallel.unwrap_or(false) {
            Execution::Parallel
        } else {
            Execution::Serial
        }
    }

    fn index_key(&self, flag: Option<&str>) -> String {
        flag.or(self.index_key.as_deref()).unwrap_or(DEFAULT_INDEX_KEY).to_string()
    }

    fn list_length(&self, flag: Option<usize>) -> Result<usize> {
        flag.or(self.list_length).ok_or_else(|| {
            anyhow!("list length is required (--list-length or `list_length` in --config)")
        })
    }
}

fn with_contract_version(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                serde_json::Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            serde_json::Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let config = AnalysisConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Align(args) => run_align(&args, &config),
        Command::LagCrp(args) => run_lag_crp(&args, &config),
        Command::Spc(args) => {
            let aligned = load_aligned(&args, &config)?;
            let rows = spc(&aligned).context("failed to compute serial position curve")?;
            emit_json(serde_json::json!({ "rows": rows }))
        }
        Command::Pnr(args) => {
            let list_length = config.list_length(args.list_length)?;
            let aligned = load_aligned(&args.input, &config)?;
            let rows = pnr(&aligned, list_length)
                .context("failed to compute nth-recall probabilities")?;
            emit_json(serde_json::json!({ "list_length": list_length, "rows": rows }))
        }
        Command::LagRank(args) => {
            let aligned = load_aligned(&args, &config)?;
            let rows = lag_rank(&aligned).context("failed to compute lag rank")?;
            emit_json(serde_json::json!({ "rows": rows }))
        }
        Command::DistanceCrp(args) => run_distance_crp(&args, &config),
        Command::DistanceRank(args) => {
            let index_key = config.index_key(args.index_key.as_deref());
            let distances = read_distances(&args.distances)?;
            let aligned = load_aligned(&args.input, &config)?;
            let rows = distance_rank(&aligned, &index_key, &distances)
                .context("failed to compute distance rank")?;
            emit_json(serde_json::json!({ "index_key": index_key, "rows": rows }))
        }
    }
}

fn run_align(args: &InputArgs, config: &AnalysisConfig) -> Result<()> {
    if args.aligned.is_some() {
        bail!("--aligned cannot be used with align; pass --trials or --study/--recall");
    }
    let aligned = load_aligned(args, config)?;
    emit_json(serde_json::json!({
        "row_count": aligned.len(),
        "columns": aligned.columns(),
        "rows": aligned,
    }))
}

fn run_lag_crp(args: &LagCrpArgs, config: &AnalysisConfig) -> Result<()> {
    let options = LagCrpOptions {
        list_length: config.list_length(args.list_length)?,
        method: args.method.map(MethodArg::into_method).or(config.method).unwrap_or_default(),
        execution: config.execution(args.parallel),
        from_mask_key: args.from_mask_key.clone().or_else(|| config.from_mask_key.clone()),
        to_mask_key: args.to_mask_key.clone().or_else(|| config.to_mask_key.clone()),
    };
    let aligned = load_aligned(&args.input, config)?;
    let rows = lag_crp_by_subject_with(&aligned, &options).context("failed to compute lag-CRP")?;

    let rows = rows
        .into_iter()
        .map(|row| {
            let mut object = serde_json::json!({
                "subject": row.subject,
                "lag": row.lag,
                "prob": row.prob,
            });
            if args.counts {
                object["actual"] = row.actual.into();
                object["possible"] = row.possible.into();
            }
            object
        })
        .collect::<Vec<_>>();
    emit_json(serde_json::json!({
        "list_length": options.list_length,
        "method": options.method,
        "rows": rows,
    }))
}

fn run_distance_crp(args: &DistanceCrpArgs, config: &AnalysisConfig) -> Result<()> {
    let edges = if args.edges.is_empty() {
        config.edges.clone().unwrap_or_default()
    } else {
        args.edges.clone()
    };
    if edges.is_empty() {
        bail!("bin edges are required (--edges or `edges` in --config)");
    }
    let options = DistanceCrpOptions {
        index_key: config.index_key(args.distance.index_key.as_deref()),
        edges,
        count_unique: args.count_unique,
        execution: config.execution(args.parallel),
    };
    let distances = read_distances(&args.distance.distances)?;
    let aligned = load_aligned(&args.distance.input, config)?;
    let rows = distance_crp_by_subject(&aligned, &distances, &options)
        .context("failed to compute distance CRP")?;
    emit_json(serde_json::json!({
        "index_key": options.index_key,
        "count_unique": options.count_unique,
        "rows": rows,
    }))
}

fn read_distances(path: &Path) -> Result<DistanceMatrix> {
    let body =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let rows: Vec<Vec<f64>> = serde_json::from_str(&body)
        .with_context(|| format!("{} must hold a JSON array of number arrays", path.display()))?;
    let distances = DistanceMatrix::new(rows)
        .with_context(|| format!("invalid distance matrix in {}", path.display()))?;
    tracing::debug!(path = %path.display(), items = distances.len(), "read distance matrix");
    Ok(distances)
}

fn read_table(path: &Path) -> Result<Table> {
    let body =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let records: Vec<Map<String, serde_json::Value>> = serde_json::from_str(&body)
        .with_context(|| format!("{} must hold a JSON array of objects", path.display()))?;
    let table = Table::from_records(&records)
        .with_context(|| format!("failed to load records from {}", path.display()))?;
    tracing::debug!(path = %path.display(), rows = table.len(), "read table");
    Ok(table)
}

/// Split a combined trial table on its `trial_type` column.
fn split_trials(trials: &Table) -> Result<(Table, Table)> {
    let Some(column) = trials.column_index(TRIAL_TYPE_COLUMN) else {
        bail!("trial table has no `{TRIAL_TYPE_COLUMN}` column");
    };
    if let Some(row) = trials.rows().iter().find(|row| {
        !matches!(&row[column], Value::Str(kind) if kind == "study" || kind == "recall")
    }) {
        bail!("`{TRIAL_TYPE_COLUMN}` must be `study` or `recall`, got {}", row[column]);
    }
    let of_kind = |kind: &str| {
        trials.filter(|row| matches!(&row[column], Value::Str(value) if value == kind))
    };
    Ok((of_kind("study"), of_kind("recall")))
}

fn load_aligned(args: &InputArgs, config: &AnalysisConfig) -> Result<Table> {
    let (study, recall) = match (&args.aligned, &args.trials, &args.study, &args.recall) {
        (Some(path), None, None, None) => return read_table(path),
        (None, Some(path), None, None) => split_trials(&read_table(path)?)?,
        (None, None, Some(study), Some(recall)) => (read_table(study)?, read_table(recall)?),
        _ => bail!("pass exactly one of --aligned, --trials, or both --study and --recall"),
    };

    let options = config.align_options(args);
    let aligned = align(&study, &recall, &options)
        .context("failed to align study and recall events")?;
    tracing::info!(
        study_rows = study.len(),
        recall_rows = recall.len(),
        aligned_rows = aligned.len(),
        "aligned trials"
    );
    Ok(aligned)
}
