//! `eoe`: inspect expert checkpoints, preview label descriptions and route
//! precomputed embeddings.
//!
//! # Usage
//!
//! ```bash
//! eoe config --file eoe.toml
//! eoe inspect --checkpoint runs/fewrel/task-3
//! eoe descriptions --file relation_description.txt --tokenizer tokenizer.json --index 0 --index 1
//! eoe route --checkpoint runs/fewrel/task-3 --embeddings batch.json
//! ```
//!
//! Logging goes to stderr and is controlled through `RUST_LOG`.

mod precomputed;

use std::io;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use eoe_core::{DescriptionFile, DescriptionStore, EoeConfig, EoeModel, ModelState};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use precomputed::{EmbeddingsFile, PrecomputedExtractor};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "eoe")]
#[command(about = "Expert-of-experts checkpoint and routing tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration (file, then `EOE_*` overrides).
    Config {
        /// TOML configuration file; defaults are used when absent.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Summarise a checkpoint directory.
    Inspect {
        /// Directory written by `save_checkpoint`.
        #[arg(long)]
        checkpoint: PathBuf,
    },

    /// Preprocess and tokenise label descriptions.
    Descriptions {
        /// Tab-separated description file.
        #[arg(long)]
        file: PathBuf,

        /// `tokenizer.json` of the backbone.
        #[arg(long)]
        tokenizer: PathBuf,

        /// Label record indices to load.
        #[arg(long, required = true)]
        index: Vec<usize>,

        /// Description slots per label.
        #[arg(long, default_value = "3")]
        count: usize,
    },

    /// Route precomputed per-expert embeddings through a checkpoint.
    Route {
        /// Directory written by `save_checkpoint`.
        #[arg(long)]
        checkpoint: PathBuf,

        /// JSON file `{"experts": [[[f32]]]}`, origin first.
        #[arg(long)]
        embeddings: PathBuf,

        /// Force every example to this task.
        #[arg(long)]
        oracle: Option<usize>,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_writer(io::stderr).with_env_filter(filter).init();

    let args = Args::parse();
    match args.command {
        Command::Config { file } => show_config(file),
        Command::Inspect { checkpoint } => inspect(checkpoint),
        Command::Descriptions {
            file,
            tokenizer,
            index,
            count,
        } => descriptions(file, tokenizer, index, count),
        Command::Route {
            checkpoint,
            embeddings,
            oracle,
        } => route(checkpoint, embeddings, oracle),
    }
}

fn show_config(file: Option<PathBuf>) -> Result<()> {
    let config = match file {
        Some(path) => EoeConfig::from_file(&path)?,
        None => EoeConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}

fn inspect(checkpoint: PathBuf) -> Result<()> {
    let state = ModelState::read(&checkpoint)
        .with_context(|| format!("reading checkpoint {}", checkpoint.display()))?;
    info!(checkpoint = %checkpoint.display(), "Inspecting checkpoint");

    let summary = json!({
        "num_tasks": state.num_tasks.map(|n| n + 1).unwrap_or(0),
        "num_labels": state.num_labels,
        "num_old_labels": state.num_old_labels,
        "head_sizes": state.head_sizes,
        "query_mode": state.config.model.query_mode.as_str(),
        "default_expert": state.config.model.default_expert,
        "max_expert": state.config.model.max_expert,
        "class_per_task": state.config.model.class_per_task,
        "statistics": state.statistics,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn descriptions(file: PathBuf, tokenizer: PathBuf, indices: Vec<usize>, count: usize) -> Result<()> {
    let source = DescriptionFile::open(&file)?;
    let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer)
        .map_err(|e| anyhow!("loading tokenizer {}: {}", tokenizer.display(), e))?;

    let mut store = DescriptionStore::new(count);
    let labels: Vec<String> = indices.iter().map(|i| format!("label-{}", i)).collect();
    for (label, index) in labels.iter().zip(&indices) {
        store.load_label(label, *index, &source, &tokenizer)?;
    }

    let texts = store.get_description(&labels);
    let ids = store.get_description_ids(&labels);
    let out: Vec<_> = labels
        .iter()
        .zip(&indices)
        .map(|(label, index)| {
            json!({
                "index": index,
                "descriptions": texts.get(label),
                "input_ids": ids.get(label),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn route(checkpoint: PathBuf, embeddings: PathBuf, oracle: Option<usize>) -> Result<()> {
    let file = EmbeddingsFile::read(&embeddings)?;
    let extractor = PrecomputedExtractor::new(file.width()?);
    let model = EoeModel::restore(&checkpoint, extractor)
        .with_context(|| format!("restoring checkpoint {}", checkpoint.display()))?;

    let tensors = file.tensors(model.device())?;
    let out = model.predict_from_embeddings(&tensors, oracle)?;
    info!(examples = out.preds.len(), oracle = ?oracle, "Routed embeddings");

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "indices": out.indices,
            "preds": out.preds,
        }))?
    );
    Ok(())
}
