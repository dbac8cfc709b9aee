//! labelrail CLI: local debugging surface for the pipeline core.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use labelrail::config::PipelineConfig;
use labelrail::etl::{self, ConvertContext, ImageManifest};
use labelrail::label::ExportedLabel;
use labelrail::media;
use labelrail::metrics::{self, GroundTruthRecord};
use labelrail::ndjson;
use labelrail::ontology::{NormalizedOntology, SchemaIndex};
use labelrail::pool::TransformPool;
use labelrail::predict::{self, ReconciledAnnotation};
use labelrail::storage::{FsStore, ObjectStore};

#[derive(Parser)]
#[command(name = "labelrail", version, about = "Annotation-to-AutoML pipeline tools")]
struct Cli {
    /// Pipeline config TOML; defaults apply when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Flatten a normalized ontology JSON file into a name-path index.
    Flatten {
        /// Path to the ontology JSON (the service's `normalized` shape).
        #[arg(long)]
        ontology: PathBuf,

        /// Emit the inverted (name path to schema id) direction.
        #[arg(long)]
        invert: bool,
    },

    /// Convert an exported-labels NDJSON file into a local ETL artifact.
    Etl {
        /// Path to the exported labels (NDJSON, one label per line).
        #[arg(long)]
        labels: PathBuf,

        /// Directory the local object store writes under.
        #[arg(long)]
        out: PathBuf,

        /// Bucket name used in emitted locators.
        #[arg(long, default_value = "labelrail-local")]
        bucket: String,
    },

    /// Reconcile batch-prediction output shards into annotations.
    Reconcile {
        /// Prediction shard files (NDJSON).
        #[arg(long, required = true)]
        shard: Vec<PathBuf>,

        /// Path to the ontology JSON the model was trained on.
        #[arg(long)]
        ontology: PathBuf,

        /// Upload manifest JSON written by the ETL step, if available.
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Pair exported ground truth with reconciled predictions and score them.
    Metrics {
        /// Ground-truth records (NDJSON).
        #[arg(long)]
        ground_truth: PathBuf,

        /// Reconciled predictions (NDJSON).
        #[arg(long)]
        predictions: PathBuf,

        /// Path to the ontology JSON both sides were produced from.
        #[arg(long)]
        ontology: PathBuf,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path).into_diagnostic()?,
        None => PipelineConfig::default(),
    };
    let divider = config.divider();

    match cli.command {
        Commands::Flatten { ontology, invert } => {
            let tree: NormalizedOntology = read_json(&ontology)?;
            let forward = SchemaIndex::build(&tree, &divider);
            let json = if invert {
                serde_json::to_string_pretty(&forward.invert()).into_diagnostic()?
            } else {
                serde_json::to_string_pretty(&forward).into_diagnostic()?
            };
            println!("{json}");
        }

        Commands::Etl { labels, out, bucket } => {
            let body = std::fs::read_to_string(&labels).into_diagnostic()?;
            let labels: Vec<ExportedLabel> = ndjson::from_lines(&body).into_diagnostic()?;

            let store = FsStore::new(bucket, &out);
            let agent = media::http_agent();
            let manifest = ImageManifest::new();
            let ctx = ConvertContext {
                agent: &agent,
                store: &store,
                manifest: &manifest,
                divider: divider.clone(),
                downsample_factor: config.downsample_factor,
                max_image_dim: config.max_image_dim,
                retry: config.retry,
            };

            let pool = TransformPool::new(config.etl_workers).into_diagnostic()?;
            let outcome = pool
                .transform_batch(&labels, |label| etl::convert_label(&ctx, label))
                .into_diagnostic()?;

            let etl_body = ndjson::to_lines(&outcome.items).into_diagnostic()?;
            store
                .put("etl/local.jsonl", etl_body.as_bytes(), "application/jsonl")
                .into_diagnostic()?;
            let manifest_json = manifest.to_json().into_diagnostic()?;
            store
                .put("etl/manifest.json", manifest_json.as_bytes(), "application/json")
                .into_diagnostic()?;

            println!(
                "Converted {} labels ({} bad rows, {} bad labels dropped) into {}",
                outcome.items.len(),
                outcome.discarded.invalid_data_rows,
                outcome.discarded.invalid_labels,
                out.join("etl/local.jsonl").display()
            );
        }

        Commands::Reconcile {
            shard,
            ontology,
            manifest,
        } => {
            let tree: NormalizedOntology = read_json(&ontology)?;
            let inverted = SchemaIndex::build(&tree, &divider).invert();
            let manifest = match manifest {
                Some(path) => {
                    let text = std::fs::read_to_string(&path).into_diagnostic()?;
                    Some(ImageManifest::from_json(&text).into_diagnostic()?)
                }
                None => None,
            };

            let mut annotations = Vec::new();
            for path in &shard {
                let text = std::fs::read_to_string(path).into_diagnostic()?;
                annotations.extend(
                    predict::reconcile_lines(&text, &inverted, &divider, manifest.as_ref())
                        .into_diagnostic()?,
                );
            }
            print!("{}", ndjson::to_lines(&annotations).into_diagnostic()?);
        }

        Commands::Metrics {
            ground_truth,
            predictions,
            ontology,
        } => {
            let tree: NormalizedOntology = read_json(&ontology)?;
            let forward = SchemaIndex::build(&tree, &divider);

            let truth_body = std::fs::read_to_string(&ground_truth).into_diagnostic()?;
            let truth: Vec<GroundTruthRecord> =
                ndjson::from_lines(&truth_body).into_diagnostic()?;
            let pred_body = std::fs::read_to_string(&predictions).into_diagnostic()?;
            let preds: Vec<ReconciledAnnotation> =
                ndjson::from_lines(&pred_body).into_diagnostic()?;

            let report = metrics::compute_metrics(&truth, &preds, &forward).into_diagnostic()?;
            print!("{}", ndjson::to_lines(&report.scored).into_diagnostic()?);
            eprintln!(
                "{} pairs scored, agreement {:.3} ({} ground-truth and {} predictions unmatched)",
                report.scored.len(),
                report.agreement_rate(),
                report.unmatched_ground_truth,
                report.unmatched_predictions,
            );
        }
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let text = std::fs::read_to_string(path).into_diagnostic()?;
    serde_json::from_str(&text).into_diagnostic()
}
