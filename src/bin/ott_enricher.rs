use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use ott_enricher::app::{
    App, EnrichOptions, EnrichResult, LoadResult, ResolveOptions, ResolveResult, StatusResult,
};
use ott_enricher::cancel::{CancellationToken, INTERRUPTED_EXIT_CODE};
use ott_enricher::config::{ConfigLoader, ResolvedConfig};
use ott_enricher::error::OttError;
use ott_enricher::ott::OttHttpClient;
use ott_enricher::output::{ConsoleProgress, JsonOutput, OutputMode};
use ott_enricher::progress::ProgressSink;
use ott_enricher::store::TaxonStore;

#[derive(Parser)]
#[command(name = "ott-enricher")]
#[command(about = "Load the Open Tree of Life and annotate every taxon from the OTT API (safe to interrupt and re-run)")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Load the tree if needed, then enrich pending taxa (default)")]
    Run(EnrichArgs),
    #[command(about = "Download, flatten and store the tree")]
    Load,
    #[command(about = "Fetch taxonomy details for pending taxa")]
    Enrich(EnrichArgs),
    #[command(about = "Resolve free-text names to OTT ids")]
    Names(NamesArgs),
    #[command(about = "Show store progress")]
    Status,
    #[command(about = "Write all taxa as JSON Lines")]
    Export(ExportArgs),
}

#[derive(Args, Clone, Default)]
struct EnrichArgs {
    #[arg(long)]
    rate_limit_ms: Option<u64>,

    #[arg(long)]
    checkpoint: Option<usize>,
}

#[derive(Args)]
struct NamesArgs {
    #[command(subcommand)]
    command: NamesCommand,
}

#[derive(Subcommand)]
enum NamesCommand {
    #[command(about = "Queue names from a file with one name per line")]
    Import { file: Utf8PathBuf },
    #[command(about = "Resolve queued names in batches")]
    Resolve {
        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        rate_limit_ms: Option<u64>,
    },
}

#[derive(Args)]
struct ExportArgs {
    file: Utf8PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        if let Some(err) = report.downcast_ref::<OttError>() {
            if matches!(err, OttError::Interrupted) {
                eprintln!("\nAborted! Run again to resume.");
            } else {
                eprintln!("{report:?}");
            }
            return ExitCode::from(map_exit_code(err));
        }
        eprintln!("{report:?}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &OttError) -> u8 {
    match error {
        OttError::Interrupted => INTERRUPTED_EXIT_CODE,
        err if err.is_remote() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let client =
        OttHttpClient::new(&config.api_url, config.timeout, config.download_timeout)?;
    let store = TaxonStore::open(&config.store_path())?;
    let app = App::new(config, store, client);

    let cancel = CancellationToken::new();
    cancel.register_signals()?;

    let console = ConsoleProgress::new();
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Interactive => &console,
        OutputMode::NonInteractive => &JsonOutput,
    };

    let command = cli
        .command
        .unwrap_or_else(|| Commands::Run(EnrichArgs::default()));
    match command {
        Commands::Run(args) => {
            let loaded = app.load(sink)?;
            report_load(&loaded, output_mode)?;
            let options = enrich_options(app.config(), &args);
            let result = app.enrich(options, &cancel, sink)?;
            console.finish_line();
            finish_enrich(&result, output_mode)
        }
        Commands::Load => {
            let loaded = app.load(sink)?;
            report_load(&loaded, output_mode)
        }
        Commands::Enrich(args) => {
            let options = enrich_options(app.config(), &args);
            let result = app.enrich(options, &cancel, sink)?;
            console.finish_line();
            finish_enrich(&result, output_mode)
        }
        Commands::Names(args) => match args.command {
            NamesCommand::Import { file } => {
                let result = app.import_names(&file)?;
                match output_mode {
                    OutputMode::NonInteractive => JsonOutput::print_import(&result).into_diagnostic(),
                    OutputMode::Interactive => {
                        println!("Queued {} new names ({} read)", result.inserted, result.read);
                        Ok(())
                    }
                }
            }
            NamesCommand::Resolve {
                batch_size,
                rate_limit_ms,
            } => {
                let mut options = ResolveOptions::from(app.config());
                if let Some(size) = batch_size {
                    options.batch_size = size;
                }
                if let Some(ms) = rate_limit_ms {
                    options.rate_limit = Duration::from_millis(ms);
                }
                let result = app.resolve_names(options, &cancel, sink)?;
                console.finish_line();
                finish_resolve(&result, output_mode)
            }
        },
        Commands::Status => {
            let status = app.status()?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_status(&status).into_diagnostic(),
                OutputMode::Interactive => {
                    print_status(&status);
                    Ok(())
                }
            }
        }
        Commands::Export(args) => {
            let result = app.export(&args.file, sink)?;
            console.finish_line();
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_export(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    println!("Exported {} taxa to {}", result.rows, result.path);
                    Ok(())
                }
            }
        }
    }
}

fn enrich_options(config: &ResolvedConfig, args: &EnrichArgs) -> EnrichOptions {
    let mut options = EnrichOptions::from(config);
    if let Some(ms) = args.rate_limit_ms {
        options.rate_limit = Duration::from_millis(ms);
    }
    if let Some(checkpoint) = args.checkpoint {
        options.checkpoint_interval = checkpoint;
    }
    options
}

fn report_load(result: &LoadResult, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_load(result).into_diagnostic(),
        OutputMode::Interactive => {
            if result.action == "existing" {
                println!("Store already holds {} taxa", result.taxa);
            }
            Ok(())
        }
    }
}

/// Prints the summary, then turns an interrupted run into the resumable exit status.
fn finish_enrich(result: &EnrichResult, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_enrich(result).into_diagnostic()?,
        OutputMode::Interactive => print_enrich_summary(result),
    }
    if result.interrupted {
        return Err(OttError::Interrupted.into());
    }
    Ok(())
}

fn finish_resolve(result: &ResolveResult, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_resolve(result).into_diagnostic()?,
        OutputMode::Interactive => println!(
            "Found {}, missing {}, ambiguous {} ({} still pending)",
            result.resolved, result.not_found, result.ambiguous, result.remaining
        ),
    }
    if result.interrupted {
        return Err(OttError::Interrupted.into());
    }
    Ok(())
}

fn print_enrich_summary(result: &EnrichResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}OTT enrichment summary{reset}");
    println!("{green}  enriched: {}{reset}", result.enriched);
    println!("{yellow}  composite (placeholder): {}{reset}", result.skipped);
    println!("  remaining: {}", result.remaining);
    if result.remaining == 0 {
        println!("{green}Done!{reset}");
    }
}

fn print_status(status: &StatusResult) {
    if !status.loaded {
        println!("Store not loaded yet (run `ott-enricher load`)");
        return;
    }
    let taxa = &status.taxa;
    let pct = ott_enricher::progress::percent(taxa.enriched, taxa.taxa);
    println!(
        "Taxa: {} total, {} enriched ({pct:.1}%), {} composite, {} pending",
        taxa.taxa, taxa.enriched, taxa.placeholders, taxa.pending
    );
    if let Some(loaded_at) = &status.loaded_at {
        println!("Loaded at {loaded_at}");
    }
    let names = &status.names;
    if names.total > 0 {
        println!(
            "Names: {} total, {} resolved, {} missing, {} ambiguous, {} pending",
            names.total, names.resolved, names.not_found, names.ambiguous, names.pending
        );
    }
}
