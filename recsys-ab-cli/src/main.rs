use std::io::Read;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use recsys_ab::{EngineSettings, ExperimentStore, GroupConfig, NewObservation, StorageFormat};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "recsys-ab", about = "Recommendation strategy experiments")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "RECSYS_AB_DATA_DIR", default_value = "./data", global = true)]
    data_dir: PathBuf,
    /// Records storage: `json` (single document) or `jsonl` (append-only log)
    #[arg(long, env = "RECSYS_AB_STORAGE", default_value = "json", global = true)]
    storage: StorageFormat,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new experiment, replacing any existing one
    Create {
        #[arg(long)]
        name: String,
        /// JSON file holding the array of group configurations
        #[arg(long)]
        groups: PathBuf,
    },
    /// Print the group a subject is assigned to
    Assign { subject: String },
    /// Append one observation given as a JSON object (`-` reads stdin)
    Record { observation: String },
    /// Stop the running experiment
    Stop,
    /// Per-group statistics
    Stats {
        #[arg(long)]
        group: Option<String>,
    },
    /// Significance test of group B against group A
    Compare { group_a: String, group_b: String },
    /// Full experiment report
    Report,
    /// Dump all stored records
    Export,
    /// Run a two-group experiment on synthetic traffic and print its report
    Simulate {
        #[arg(long, default_value_t = 50)]
        per_group: usize,
        #[arg(long)]
        seed: Option<u64>,
        /// Write the simulated experiment to the data directory instead of memory
        #[arg(long)]
        persist: bool,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = EngineSettings::from_env()
        .with_data_dir(&cli.data_dir)
        .with_storage(cli.storage);
    tracing::debug!(
        data_dir = %settings.data_dir.display(),
        storage = ?settings.storage,
        "resolved settings"
    );

    match cli.command {
        Command::Create { name, groups } => {
            let raw = std::fs::read_to_string(&groups)
                .map_err(|e| format!("cannot read {}: {}", groups.display(), e))?;
            let groups: Vec<GroupConfig> = serde_json::from_str(&raw)?;
            let store = settings.open_store()?;
            store.create_test(&name, groups)?;
            print_json(&serde_json::json!({
                "test_name": store.test_name(),
                "groups": store.group_ids(),
                "phase": store.phase(),
            }))
        }
        Command::Assign { subject } => {
            let store = settings.open_store()?;
            match store.assign_group(&subject) {
                Some(group_id) => print_json(&serde_json::json!({
                    "subject_id": subject,
                    "group_id": group_id,
                })),
                None => Err("no active experiment".into()),
            }
        }
        Command::Record { observation } => {
            let raw = if observation == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                observation
            };
            let observation: NewObservation = serde_json::from_str(&raw)?;
            let store = settings.open_store()?;
            store.record_result(observation);
            print_json(&serde_json::json!({ "records": store.record_count() }))
        }
        Command::Stop => {
            let store = settings.open_store()?;
            store.stop_test();
            print_json(&serde_json::json!({
                "test_name": store.test_name(),
                "phase": store.phase(),
            }))
        }
        Command::Stats { group } => {
            let store = settings.open_store()?;
            match group {
                Some(id) => match store.compute_statistics(&id) {
                    Some(stats) => print_json(&stats),
                    None => Err(format!("unknown group '{}'", id).into()),
                },
                None => print_json(&store.compute_all_statistics()),
            }
        }
        Command::Compare { group_a, group_b } => {
            let store = settings.open_store()?;
            print_json(&store.compare(&group_a, &group_b)?)
        }
        Command::Report => {
            let store = settings.open_store()?;
            print_json(&store.generate_report()?)
        }
        Command::Export => {
            let store = settings.open_store()?;
            print_json(&store.export_raw_data())
        }
        Command::Simulate {
            per_group,
            seed,
            persist,
        } => {
            let store = if persist {
                settings.open_store()?
            } else {
                ExperimentStore::in_memory()
            };
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            simulate(&store, per_group, &mut rng)?;
            print_json(&store.generate_report()?)
        }
    }
}

/// Control scores sit around 60, the treatment around 70.
fn simulate(
    store: &ExperimentStore,
    per_group: usize,
    rng: &mut StdRng,
) -> Result<(), Box<dyn std::error::Error>> {
    store.create_test(
        "simulated_weights",
        vec![
            GroupConfig::new("control", "Control", 0.5)
                .with_strategy("collaborative_weight", serde_json::json!(0.4))
                .with_strategy("content_weight", serde_json::json!(0.6))
                .with_description("baseline strategy weights"),
            GroupConfig::new("treatment", "Treatment", 0.5)
                .with_strategy("collaborative_weight", serde_json::json!(0.7))
                .with_strategy("content_weight", serde_json::json!(0.3))
                .with_description("collaborative-heavy weights"),
        ],
    )?;

    for (group_id, center, label) in [("control", 60.0, "baseline"), ("treatment", 70.0, "cf_heavy")] {
        for i in 0..per_group {
            let overall: f64 = rng.gen_range(center - 5.0..center + 5.0);
            store.record_result(NewObservation {
                subject_id: format!("sim-{}-{:04}", group_id, i),
                group_id: group_id.to_string(),
                overall_score: overall,
                relevance_score: overall + rng.gen_range(-3.0..3.0),
                novelty_score: rng.gen_range(40.0..80.0),
                explainability_score: rng.gen_range(50.0..90.0),
                diversity_score: rng.gen_range(30.0..70.0),
                response_time_ms: rng.gen_range(80.0..200.0),
                item_count: 10,
                strategy_label: label.to_string(),
            });
        }
    }
    store.stop_test();
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
