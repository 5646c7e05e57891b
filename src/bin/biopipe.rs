use std::process::ExitCode;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use biopipe::config::{Catalog, SourceConfig, SourceEntry};
use biopipe::datafile::DataFile;
use biopipe::domain::{FileFormat, SourceHint, SourceId, Stage};
use biopipe::download::HttpFileFetcher;
use biopipe::error::PipelineError;
use biopipe::fs_util;
use biopipe::metadata::MetadataStore;
use biopipe::orchestrator::{CancelFlag, RunOptions, SourceOrchestrator};
use biopipe::script::{ProcessInvoker, ScriptInvoker};

const DOWNLOAD_RETRIES: usize = 3;

#[derive(Parser)]
#[command(name = "biopipe")]
#[command(about = "Staged ETL pipelines for biodiversity data sources")]
#[command(version, author)]
struct Cli {
    /// Catalog root holding the per-source directories.
    #[arg(long, global = true, default_value = "dataSources")]
    root: Utf8PathBuf,

    /// Directory holding the remap tables (<mapID>.csv).
    #[arg(long, global = true, default_value = "maps")]
    maps: Utf8PathBuf,

    /// Log warnings and errors only.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the download stage for a source")]
    Download(StageArgs),
    #[command(about = "Run the processing stage for a source")]
    Process(StageArgs),
    #[command(about = "Run the conversion stage for a source")]
    Convert(StageArgs),
    #[command(about = "Run the compile stage for a source")]
    Compile(StageArgs),
    #[command(about = "Run every due source through its full pipeline")]
    Update(UpdateArgs),
    #[command(about = "List catalog sources")]
    List(HintArgs),
    #[command(about = "Create the skeleton for a new source")]
    New(NewArgs),
    #[command(about = "Delete a source's generated data, keeping its config")]
    Purge(PurgeArgs),
    #[command(about = "Print the first rows of a source's newest output")]
    Sample(SampleArgs),
    #[command(about = "Find rows by column value in a source's converted output")]
    RowFind(RowFindArgs),
    #[command(about = "Rank sources by on-disk size")]
    Largest,
}

#[derive(Args, Clone)]
struct StageArgs {
    /// Source hint, `loc[-db[-sub]]`, prefix-matched.
    source: String,

    /// Rebuild stage tasks from scratch, discarding crawl progress.
    #[arg(short = 'p', long)]
    prepare: bool,

    /// Overwrite outputs that already exist.
    #[arg(short = 'o', long)]
    overwrite: bool,

    /// Run only if the source's update policy says it is due.
    #[arg(short = 'u', long)]
    update: bool,
}

#[derive(Args)]
struct UpdateArgs {
    /// Restrict to sources matching this hint.
    source: Option<String>,

    #[arg(short = 'o', long)]
    overwrite: bool,
}

#[derive(Args)]
struct HintArgs {
    source: Option<String>,
}

#[derive(Args)]
struct PurgeArgs {
    source: String,

    /// Limit the purge to one stage (`download`, `processing`, `conversion`,
    /// `compile`).
    #[arg(short, long)]
    stage: Option<String>,
}

#[derive(Args)]
struct NewArgs {
    /// Full source id: `loc-db` or `loc-db-sub`.
    source: String,
}

#[derive(Args)]
struct SampleArgs {
    source: String,

    /// Rows to print.
    #[arg(short = 'n', long, default_value_t = 10)]
    rows: usize,
}

#[derive(Args)]
struct RowFindArgs {
    source: String,
    column: String,
    value: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::InvalidSource(_)
        | PipelineError::SourceNotFound(_)
        | PipelineError::AmbiguousSource { .. }
        | PipelineError::MissingConfig(_)
        | PipelineError::ConfigRead(_)
        | PipelineError::ConfigParse(_)
        | PipelineError::InvalidPolicy(_)
        | PipelineError::UnknownStage(_)
        | PipelineError::MappingNotFound(_) => 2,
        PipelineError::Http(_) | PipelineError::HttpStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        if let Err(err) = ctrlc::set_handler(move || cancel.cancel()) {
            eprintln!("interrupt handler not installed: {err}");
        }
    }

    let mut catalog = Catalog::scan(&cli.root)?;

    match cli.command {
        Commands::Download(args) => run_stage(&catalog, &cli.maps, &cancel, Stage::Download, args),
        Commands::Process(args) => run_stage(&catalog, &cli.maps, &cancel, Stage::Processing, args),
        Commands::Convert(args) => run_stage(&catalog, &cli.maps, &cancel, Stage::Conversion, args),
        Commands::Compile(args) => run_stage(&catalog, &cli.maps, &cancel, Stage::Compile, args),
        Commands::Update(args) => run_update(&catalog, &cli.maps, &cancel, args),
        Commands::List(args) => run_list(&catalog, args),
        Commands::New(args) => run_new(&mut catalog, args),
        Commands::Purge(args) => run_purge(&catalog, args),
        Commands::Sample(args) => run_sample(&catalog, args),
        Commands::RowFind(args) => run_row_find(&catalog, args),
        Commands::Largest => run_largest(&catalog),
    }
}

fn build_orchestrator(
    entry: &SourceEntry,
    maps: &Utf8PathBuf,
    cancel: &CancelFlag,
) -> Result<SourceOrchestrator, PipelineError> {
    let config = SourceConfig::load(&entry.dir)?;
    let fetcher = Arc::new(HttpFileFetcher::new(DOWNLOAD_RETRIES)?);
    let invoker: Arc<dyn ScriptInvoker> = Arc::new(ProcessInvoker);
    Ok(SourceOrchestrator::new(
        entry.clone(),
        config,
        maps.clone(),
        fetcher,
        invoker,
        cancel.clone(),
    ))
}

fn run_stage(
    catalog: &Catalog,
    maps: &Utf8PathBuf,
    cancel: &CancelFlag,
    stage: Stage,
    args: StageArgs,
) -> miette::Result<()> {
    let hint: SourceHint = args.source.parse::<SourceHint>()?;
    let entry = catalog.find(&hint)?;
    let mut orchestrator = build_orchestrator(entry, maps, cancel)?;
    let outcome = orchestrator.run(
        stage,
        RunOptions {
            re_prepare: args.prepare,
            overwrite: args.overwrite,
            only_if_due: args.update,
        },
    )?;
    if !outcome.ran {
        println!("{}: not due, skipped", entry.id);
        return Ok(());
    }
    if !outcome.success {
        return Err(miette::Report::msg(format!(
            "{}: {stage} finished with failed tasks",
            entry.id
        )));
    }
    println!("{}: {stage} complete", entry.id);
    Ok(())
}

fn run_update(
    catalog: &Catalog,
    maps: &Utf8PathBuf,
    cancel: &CancelFlag,
    args: UpdateArgs,
) -> miette::Result<()> {
    let entries: Vec<&SourceEntry> = match &args.source {
        Some(hint) => catalog.matching(&hint.parse::<SourceHint>()?),
        None => catalog.entries().iter().collect(),
    };
    if entries.is_empty() {
        return Err(PipelineError::SourceNotFound(
            args.source.unwrap_or_else(|| "<all>".to_string()),
        ))?;
    }

    let mut failed = Vec::new();
    for entry in entries {
        if cancel.is_cancelled() {
            break;
        }
        let mut orchestrator = match build_orchestrator(entry, maps, cancel) {
            Ok(orchestrator) => orchestrator,
            Err(err) => {
                eprintln!("{}: {err}", entry.id);
                failed.push(entry.id.to_string());
                continue;
            }
        };
        let options = RunOptions {
            re_prepare: false,
            overwrite: args.overwrite,
            only_if_due: true,
        };
        match orchestrator.run(Stage::Compile, options) {
            Ok(outcome) if !outcome.ran => println!("{}: not due", entry.id),
            Ok(outcome) if outcome.success => println!("{}: updated", entry.id),
            Ok(_) => failed.push(entry.id.to_string()),
            Err(err) => {
                eprintln!("{}: {err}", entry.id);
                failed.push(entry.id.to_string());
            }
        }
    }
    if !failed.is_empty() {
        return Err(miette::Report::msg(format!(
            "update failed for: {}",
            failed.join(", ")
        )));
    }
    Ok(())
}

fn run_list(catalog: &Catalog, args: HintArgs) -> miette::Result<()> {
    let entries: Vec<&SourceEntry> = match &args.source {
        Some(hint) => catalog.matching(&hint.parse::<SourceHint>()?),
        None => catalog.entries().iter().collect(),
    };
    for entry in entries {
        let store = MetadataStore::load(&entry.dir);
        match store.latest_success() {
            Some(when) => println!("{}\tlast success {}", entry.id, when.format("%Y-%m-%d %H:%M")),
            None => println!("{}\tnever run", entry.id),
        }
    }
    Ok(())
}

fn run_new(catalog: &mut Catalog, args: NewArgs) -> miette::Result<()> {
    let hint: SourceHint = args.source.parse::<SourceHint>()?;
    let Some(database) = hint.database.as_deref() else {
        return Err(PipelineError::InvalidSource(format!(
            "new requires a full id, got '{}'",
            args.source
        )))?;
    };
    let id = SourceId::new(&hint.location, database, hint.subsection.as_deref());
    let entry = catalog.create(&id)?;
    println!("created {} at {}", entry.id, entry.dir);
    println!("edit {} before running the pipeline", entry.dir.join("config.toml"));
    Ok(())
}

fn run_purge(catalog: &Catalog, args: PurgeArgs) -> miette::Result<()> {
    let entry = catalog.find(&args.source.parse::<SourceHint>()?)?;
    let mut store = MetadataStore::load(&entry.dir);
    match &args.stage {
        Some(raw) => {
            let stage: Stage = raw.parse()?;
            catalog.purge_stage(entry, stage)?;
            store.clear_stage(&stage.to_string());
            println!("purged {stage} data for {}", entry.id);
        }
        None => {
            catalog.purge_data(entry)?;
            store.clear();
            println!("purged data for {}", entry.id);
        }
    }
    store.save()?;
    Ok(())
}

/// Newest tabular artifact of a source, preferring later stages.
fn newest_output(entry: &SourceEntry) -> Option<DataFile> {
    for stage in [Stage::Conversion, Stage::Processing, Stage::Download] {
        let dir = entry.stage_dir(stage);
        let Ok(children) = std::fs::read_dir(dir.as_std_path()) else {
            continue;
        };
        let mut paths: Vec<Utf8PathBuf> = children
            .flatten()
            .filter_map(|child| Utf8PathBuf::from_path_buf(child.path()).ok())
            .collect();
        paths.sort();
        for path in paths {
            let file = DataFile::new(path);
            if file.format().is_tabular() {
                return Some(file);
            }
            if file.format() == FileFormat::Stacked {
                // Converted output: sample the first event file.
                if let Some(child) = file
                    .stacked_children()
                    .ok()
                    .and_then(|children| children.into_iter().next())
                {
                    return Some(child);
                }
            }
        }
    }
    None
}

fn run_sample(catalog: &Catalog, args: SampleArgs) -> miette::Result<()> {
    let entry = catalog.find(&args.source.parse::<SourceHint>()?)?;
    let Some(file) = newest_output(entry) else {
        return Err(PipelineError::FileNotFound(format!(
            "{} has no tabular outputs",
            entry.id
        )))?;
    };
    let frame = file.read()?;
    eprintln!("{}", file.path());
    for row in frame.iter_rows().take(args.rows) {
        let mut record = serde_json::Map::new();
        for (name, cell) in frame.columns().iter().zip(row) {
            let value = match cell {
                Some(text) => serde_json::Value::String(text.to_string()),
                None => serde_json::Value::Null,
            };
            record.insert(name.clone(), value);
        }
        let line = serde_json::to_string(&record)
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        println!("{line}");
    }
    Ok(())
}

fn run_row_find(catalog: &Catalog, args: RowFindArgs) -> miette::Result<()> {
    let entry = catalog.find(&args.source.parse::<SourceHint>()?)?;
    let converted = entry.stage_dir(Stage::Conversion);
    let Ok(children) = std::fs::read_dir(converted.as_std_path()) else {
        return Err(PipelineError::FileNotFound(format!(
            "{} has no converted output",
            entry.id
        )))?;
    };

    let mut hits = 0usize;
    for child in children.flatten() {
        let Ok(path) = Utf8PathBuf::from_path_buf(child.path()) else {
            continue;
        };
        let file = DataFile::new(path);
        let targets = match file.format() {
            FileFormat::Stacked => file.stacked_children()?,
            format if format.is_tabular() => vec![file],
            _ => continue,
        };
        for target in targets {
            let frame = target.read()?;
            if !frame.has_column(&args.column) {
                continue;
            }
            for row_idx in 0..frame.n_rows() {
                if frame.get(row_idx, &args.column) == Some(args.value.as_str()) {
                    let row: Vec<&str> = frame
                        .row(row_idx)
                        .into_iter()
                        .map(|cell| cell.unwrap_or(""))
                        .collect();
                    println!("{}:{row_idx}\t{}", target.path(), row.join(","));
                    hits += 1;
                }
            }
        }
    }
    println!("{hits} matching rows");
    Ok(())
}

fn run_largest(catalog: &Catalog) -> miette::Result<()> {
    let mut sizes: Vec<(String, u64)> = Vec::new();
    for entry in catalog.entries() {
        sizes.push((entry.id.to_string(), fs_util::dir_size(&entry.data_dir())?));
    }
    sizes.sort_by(|a, b| b.1.cmp(&a.1));
    for (id, size) in sizes {
        println!("{size:>12}\t{id}");
    }
    Ok(())
}
