use abtest_engine::bucket::AllocationEntry;
use abtest_engine::coordinator::{GitWorkspace, StopOptions};
use abtest_engine::experiment::{ChangeConfig, ExperimentConfig, ExperimentPatch, ExperimentStatus};
use abtest_engine::scheduler::{run_sweeper, sweep_expired};
use abtest_engine::tracking::VisitContext;
use abtest_engine::{EngineConfig, EngineError, EngineResult, ExperimentService};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "abtest-engine", version, about = "A/B experiment engine")]
struct Cli {
    /// JSON config file (default: ~/.abtest/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding config and ABTEST_DB_PATH
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an experiment from a JSON definition ("-" reads stdin)
    Create { file: PathBuf },
    /// Start or resume an experiment
    Start { experiment_id: String },
    /// Pause a running experiment
    Pause { experiment_id: String },
    /// Patch experiment fields from a JSON file
    Update { experiment_id: String, file: PathBuf },
    /// Replace the traffic allocation
    Allocate {
        experiment_id: String,
        /// Variant share as id=fraction (repeatable, in bucket order)
        #[arg(long = "split", required = true)]
        splits: Vec<String>,
    },
    /// Attach a change (JSON file) to a variant
    AddChange {
        experiment_id: String,
        variant_id: String,
        file: PathBuf,
    },
    /// Stop an experiment and implement the winner
    Stop {
        experiment_id: String,
        /// Override the analysis winner
        #[arg(long)]
        winner: Option<String>,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Roll back the last implementation
    Rollback {
        experiment_id: String,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Experiment, traffic, analysis and last outcome
    Status { experiment_id: String },
    /// Assign a visitor to a variant
    Assign {
        experiment_id: String,
        visitor_id: String,
        #[arg(long)]
        user_agent: Option<String>,
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        referrer: Option<String>,
        #[arg(long)]
        country: Option<String>,
    },
    /// Record a metric sample, e.g. '{"conversion": 1}'
    Record {
        experiment_id: String,
        variant_id: String,
        metrics: String,
        /// RFC 3339 timestamp (default: now)
        #[arg(long)]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Analyze the primary metric
    Analyze { experiment_id: String },
    /// List experiments
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Stop expired experiments periodically until Ctrl-C
    Watch {
        /// Seconds between sweeps (default from config)
        #[arg(long)]
        interval: Option<u64>,
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        let body = serde_json::to_string_pretty(&e).unwrap_or_else(|_| e.to_string());
        eprintln!("{body}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> EngineResult<()> {
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let sink = Arc::new(GitWorkspace::new(config.repo_path.clone()));
    let service = Arc::new(ExperimentService::open(&config, sink)?);

    match cli.command {
        Command::Create { file } => {
            let definition: ExperimentConfig = read_json(&file)?;
            print_json(&service.create_experiment(definition)?)
        }
        Command::Start { experiment_id } => print_json(&service.start_experiment(&experiment_id)?),
        Command::Pause { experiment_id } => print_json(&service.pause_experiment(&experiment_id)?),
        Command::Update {
            experiment_id,
            file,
        } => {
            let patch: ExperimentPatch = read_json(&file)?;
            print_json(&service.update_experiment(&experiment_id, patch)?)
        }
        Command::Allocate {
            experiment_id,
            splits,
        } => {
            let allocation = splits
                .iter()
                .map(|s| parse_split(s))
                .collect::<EngineResult<Vec<_>>>()?;
            print_json(&service.update_allocation(&experiment_id, allocation)?)
        }
        Command::AddChange {
            experiment_id,
            variant_id,
            file,
        } => {
            let change: ChangeConfig = read_json(&file)?;
            let change_id = service.add_change(&experiment_id, &variant_id, change)?;
            print_json(&serde_json::json!({ "changeId": change_id }))
        }
        Command::Stop {
            experiment_id,
            winner,
            branch,
        } => {
            let options = StopOptions {
                winner_variant_id: winner,
                branch,
            };
            print_json(&service.stop_experiment(&experiment_id, &options)?)
        }
        Command::Rollback {
            experiment_id,
            branch,
        } => print_json(&service.rollback_experiment(&experiment_id, branch.as_deref())?),
        Command::Status { experiment_id } => print_json(&service.get_status(&experiment_id)?),
        Command::Assign {
            experiment_id,
            visitor_id,
            user_agent,
            device,
            referrer,
            country,
        } => {
            let context = VisitContext {
                user_agent,
                device,
                referrer,
                country,
                is_bot: None,
            };
            let variant_id = service.assign_variant(&experiment_id, &visitor_id, &context)?;
            print_json(&serde_json::json!({ "variantId": variant_id }))
        }
        Command::Record {
            experiment_id,
            variant_id,
            metrics,
            timestamp,
        } => {
            let metrics: serde_json::Value = serde_json::from_str(&metrics)
                .map_err(|e| EngineError::invalid_value("metrics", e.to_string()))?;
            let id = service.record_sample(&experiment_id, &variant_id, timestamp, &metrics)?;
            print_json(&serde_json::json!({ "sampleId": id }))
        }
        Command::Analyze { experiment_id } => print_json(&service.analyze(&experiment_id)?),
        Command::List { status } => {
            let status = status
                .map(|s| {
                    ExperimentStatus::from_str(&s)
                        .ok_or_else(|| EngineError::invalid_value("status", format!("unknown status '{s}'")))
                })
                .transpose()?;
            print_json(&service.list_experiments(status)?)
        }
        Command::Watch { interval, once } => {
            if once {
                return print_json(&sweep_expired(&service, Utc::now())?);
            }
            let secs = interval.unwrap_or(config.sweep_interval_secs).max(1);
            run_sweeper(service, Duration::from_secs(secs)).await
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> EngineResult<T> {
    let contents = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| EngineError::invalid_value("input", e.to_string()))?;
        buf
    } else {
        std::fs::read_to_string(path).map_err(|e| {
            EngineError::invalid_value("input", format!("cannot read {}: {e}", path.display()))
        })?
    };
    serde_json::from_str(&contents).map_err(|e| EngineError::invalid_value("input", e.to_string()))
}

/// Parse `variant=fraction`
fn parse_split(raw: &str) -> EngineResult<AllocationEntry> {
    let (variant, fraction) = raw
        .split_once('=')
        .ok_or_else(|| EngineError::invalid_value("split", format!("expected id=fraction, got '{raw}'")))?;
    let fraction: f64 = fraction
        .trim()
        .parse()
        .map_err(|_| EngineError::invalid_value("split", format!("'{fraction}' is not a number")))?;
    Ok(AllocationEntry::new(variant.trim(), fraction))
}

fn print_json<T: Serialize>(value: &T) -> EngineResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
