//! xsyst CLI

mod samples;

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use xs_core::TemplateStore;
use xs_frame::FrameEngine;
use xs_syst::{
    BuildOptions, DEFAULT_NOMINAL_WEIGHT, JsonTemplateStore, SystematicsConfig,
    SystematicsOrchestrator, TemplateCatalog,
};

#[derive(Parser)]
#[command(name = "xsyst")]
#[command(about = "xsyst - systematic template synthesis")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build nominal templates and every systematic variation
    Build(BuildArgs),

    /// List keys of a template store
    Keys {
        /// Template store (JSON)
        #[arg(long)]
        store: PathBuf,

        /// Only keys starting with this prefix
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Sample list (YAML, or JSON by extension)
    #[arg(long)]
    samples: PathBuf,

    /// Event-table name inside sample directories
    #[arg(long, default_value = "events")]
    tree: String,

    /// Template catalogue (tab-separated)
    #[arg(long)]
    templates: PathBuf,

    /// Template store to create or update (JSON)
    #[arg(long)]
    store: PathBuf,

    /// Systematics configuration (YAML, or JSON by extension).
    /// Defaults to the standard catalogue.
    #[arg(long)]
    systematics: Option<PathBuf>,

    /// Threads (0 = auto).
    #[arg(long, default_value = "0")]
    threads: usize,

    /// Vary overlay samples
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    include_overlay: bool,

    /// Vary dirt samples
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    include_dirt: bool,

    /// Vary strangeness samples
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    include_strangeness: bool,

    /// Vary off-beam samples
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    include_off_beam: bool,

    /// Clamp negative bins of eigenmode variations to zero
    #[arg(long)]
    clamp_negative_bins: bool,

    /// Nominal per-event weight expression
    #[arg(long, default_value = DEFAULT_NOMINAL_WEIGHT)]
    nominal_weight: String,

    /// Universes per booking batch (default: all)
    #[arg(long)]
    universe_batch: Option<usize>,

    /// Reuse nominal templates already in the store
    #[arg(long)]
    skip_nominals: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Build(args) => cmd_build(args),
        Commands::Keys { store, prefix } => cmd_keys(&store, &prefix),
    }
}

fn cmd_build(args: BuildArgs) -> Result<()> {
    let options = BuildOptions {
        thread_count: args.threads,
        include_overlay: args.include_overlay,
        include_dirt: args.include_dirt,
        include_strangeness: args.include_strangeness,
        include_off_beam: args.include_off_beam,
        clamp_negative_bins: args.clamp_negative_bins,
        skip_nominals: args.skip_nominals,
        nominal_weight: args.nominal_weight,
        universe_batch: args.universe_batch,
    };
    options.validate()?;

    let templates = TemplateCatalog::from_path(&args.templates)?;
    tracing::info!(templates = templates.len(), bins = templates.total_bins(), "catalogue loaded");

    let systematics = match &args.systematics {
        Some(path) => SystematicsConfig::from_path(path)?,
        None => {
            tracing::info!("no systematics file given, using the standard catalogue");
            SystematicsConfig::standard()
        }
    };

    let samples = samples::load_samples(&args.samples, &args.tree)?;
    let mut store = JsonTemplateStore::open(&args.store)?;
    let engine = FrameEngine::with_threads(options.thread_count)?;
    tracing::debug!(threads = engine.threads(), "histogram engine ready");

    let report = SystematicsOrchestrator::new(&engine, &templates, &options).build_all(
        &samples,
        &systematics,
        &mut store,
    )?;
    tracing::info!(store = %args.store.display(), "{report}");

    let summary = serde_json::json!({
        "store": args.store.display().to_string(),
        "completed": &report.completed,
        "skipped": &report.skipped,
        "failed": report.failed.iter().map(|f| serde_json::json!({
            "name": f.name,
            "kind": f.error.kind().to_string(),
            "error": f.error.to_string(),
        })).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !report.is_success() {
        bail!("build finished with {} failures", report.failed.len());
    }
    Ok(())
}

fn cmd_keys(store: &Path, prefix: &str) -> Result<()> {
    if !store.is_file() {
        bail!("template store {} not found", store.display());
    }
    let store = JsonTemplateStore::open(store)?;
    for key in store.keys(prefix) {
        println!("{key}");
    }
    Ok(())
}
