use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use slice_recorder::error::{Error, Result};
use slice_recorder::logging;
use slice_recorder::{
    ChunkRef, JsonFileRepository, QuantityRegistry, Recording, RecordingConfig, RecordingContext, Role, SyncMode,
    Syncer,
};

/// Inspect and sync stored recordings.
#[derive(Debug, Parser)]
#[command(name = "slice_recorder", version)]
struct Cli {
    /// JSON configuration file; defaults apply to every key it omits.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `storage.data_dir` from the configuration.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON quantity registry replacing the built-in one.
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Also log to a daily rolling file in this directory.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List stored recordings.
    List,
    /// Print a recording's metadata as JSON.
    Show { id: String },
    /// Print the values of one quantity, one `time value` pair per line.
    Values {
        id: String,
        quantity: String,
        /// Only the window of this data chunk.
        #[arg(long, conflicts_with = "labelled")]
        chunk: Option<usize>,
        /// Only the window of this labelled chunk.
        #[arg(long)]
        labelled: Option<usize>,
    },
    /// Close a recording, compressing and finally analysing it.
    Close { id: String },
    /// Push a recording to the configured sync target.
    Push {
        id: String,
        #[arg(long, value_enum, default_value_t = Mode::Full)]
        mode: Mode,
    },
    /// Fetch a recording from the configured sync target.
    Pull { id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Full,
    Partial,
}

impl From<Mode> for SyncMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Full => SyncMode::Full,
            Mode::Partial => SyncMode::Partial,
        }
    }
}

fn context(cli: &Cli) -> Result<RecordingContext> {
    let mut config = match &cli.config {
        Some(path) => RecordingConfig::from_file(path)?,
        None => RecordingConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    let repository = Arc::new(JsonFileRepository::new(&config.storage.data_dir));
    let mut ctx = RecordingContext::new(config, repository);
    if let Some(path) = &cli.registry {
        ctx = ctx.with_registry(QuantityRegistry::from_file(path)?);
    }
    Ok(ctx)
}

fn syncer(ctx: &RecordingContext) -> Result<Syncer> {
    Syncer::from_config(&ctx.config.sync)?
        .ok_or_else(|| Error::InvalidInput("no sync target configured".into()))
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = context(&cli)?;
    match cli.command {
        Command::List => {
            let repository = JsonFileRepository::new(&ctx.config.storage.data_dir);
            for id in repository.ids()? {
                let rec = Recording::open(&ctx, &id, Role::Consumer)?;
                let start = rec.start_time().map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
                println!(
                    "{}\t{}\t{}\t{} samples",
                    id,
                    start,
                    if rec.is_closed() { "closed" } else { "open" },
                    rec.totals().sample_count
                );
            }
        }
        Command::Show { id } => {
            let rec = Recording::open(&ctx, &id, Role::Consumer)?;
            println!("{}", serde_json::to_string_pretty(&rec.metadata()?)?);
        }
        Command::Values { id, quantity, chunk, labelled } => {
            let mut rec = Recording::open(&ctx, &id, Role::Consumer)?;
            let window = chunk.map(ChunkRef::Data).or(labelled.map(ChunkRef::Labelled));
            let (times, values) = match window {
                Some(window) => (rec.window_times(window, &quantity)?, rec.window_values(window, &quantity)?),
                None => (rec.times(&quantity)?, rec.values(&quantity)?),
            };
            for (t, v) in times.iter().zip(&values) {
                println!("{}\t{}", t, v);
            }
        }
        Command::Close { id } => {
            let mut rec = Recording::open(&ctx, &id, Role::Producer)?;
            rec.close()?;
            info!(id = %id, samples = rec.totals().sample_count, "Closed");
        }
        Command::Push { id, mode } => {
            let syncer = syncer(&ctx)?;
            let mut rec = Recording::open(&ctx, &id, Role::Producer)?;
            let report = syncer.sync(&mut rec, mode.into()).await?;
            println!(
                "sent {} payloads ({} bytes), {} failed, all sent: {}",
                report.sent,
                report.bytes,
                report.failed.len(),
                report.all_sent
            );
            for (what, err) in &report.failed {
                error!(%what, error = %err, "Transfer failed");
            }
            if !report.is_success() {
                return Err(Error::InvalidInput(format!("sync of {} incomplete", id)));
            }
        }
        Command::Pull { id } => {
            let syncer = syncer(&ctx)?;
            let rec = syncer.pull(&id, &ctx).await?;
            info!(id = %rec.id(), columns = rec.columns().len(), "Pulled");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = logging::init("info", cli.log_dir.as_deref());
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}
