use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use archive_sync::app::{App, BatchReport, DatasetAction, HttpCatalogFactory, SyncOptions};
use archive_sync::config::ConfigLoader;
use archive_sync::error::SyncError;
use archive_sync::http::CancelToken;
use archive_sync::output::{ConsoleProgress, JsonOutput, OutputMode};
use archive_sync::store::Store;

#[derive(Parser)]
#[command(name = "archive-sync")]
#[command(about = "Resumable, checksum-verified download of imaging collections")]
#[command(version, author)]
struct Cli {
    /// Collection names, e.g. LIDC-IDRI
    #[arg(required = true)]
    datasets: Vec<String>,

    /// Directory receiving finished datasets
    #[arg(short, long, default_value = ".")]
    output: Utf8PathBuf,

    /// Download here first and move to the output directory when done
    #[arg(long)]
    temp_dir: Option<Utf8PathBuf>,

    /// Cache directory for metadata responses (default: ~/.cache/archive-sync)
    #[arg(long)]
    cache_dir: Option<Utf8PathBuf>,

    #[arg(long, default_value = "datasets.yaml")]
    registry: Utf8PathBuf,

    #[arg(long, default_value = "credentials.yaml")]
    credentials: Utf8PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[arg(long)]
    force: bool,

    #[arg(long)]
    no_cache: bool,

    /// Print a JSON summary instead of progress lines
    #[arg(long)]
    non_interactive: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(report) => {
            if let Some((_, err)) = report.errors().next() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::SUCCESS
        }
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<SyncError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::NotFound { .. }
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_)
        | SyncError::UnsupportedDownloader(_)
        | SyncError::UnsupportedModule(_) => 2,
        SyncError::RequestExhausted { .. }
        | SyncError::AuthenticationFailed(_)
        | SyncError::Http(_)
        | SyncError::InvalidResponse(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<BatchReport> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.verbosity));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut store = Store::new(cli.output.clone())?.with_staging_root(cli.temp_dir.clone());
    if let Some(cache_dir) = cli.cache_dir.clone() {
        store = store.with_cache_root(cache_dir);
    }

    let registry = ConfigLoader::registry(cli.registry.as_std_path())?;
    let credentials = ConfigLoader::credentials(cli.credentials.as_std_path())?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            std::process::exit(130);
        }
        warn!("interrupt received; stopping after the current step (press again to abort)");
        handler_token.cancel();
    })
    .into_diagnostic()?;

    let factory = HttpCatalogFactory::new(&store, cancel.clone());
    let app = App::new(store, registry, credentials, factory, cancel);
    let options = SyncOptions {
        force: cli.force,
        no_cache: cli.no_cache,
    };

    let report = match output_mode {
        OutputMode::NonInteractive => {
            let report = app.run(&cli.datasets, &options, &JsonOutput);
            JsonOutput::print_batch(&report).into_diagnostic()?;
            report
        }
        OutputMode::Interactive => {
            let report = app.run(&cli.datasets, &options, &ConsoleProgress);
            print_summary(&report);
            report
        }
    };
    Ok(report)
}

fn print_summary(report: &BatchReport) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{cyan}archive-sync summary{reset}");
    println!("{green}Completed datasets: {}{reset}", report.succeeded());
    println!("{yellow}Errors: {}{reset}", report.failed());

    for entry in &report.entries {
        match &entry.result {
            Ok(result) => {
                let (label, color) = match result.action {
                    DatasetAction::Downloaded => ("downloaded", cyan),
                    DatasetAction::AlreadyComplete => ("already complete", green),
                    DatasetAction::AlternatePresent => ("present in other packaging", yellow),
                };
                println!("{color}  {} ({label}){reset}", entry.dataset);
                println!("{color}     path: {}{reset}", result.path);
                if let Some(outcome) = &result.outcome {
                    println!(
                        "{color}     series: {}, fetched: {}, passes: {}, quarantined: {}{reset}",
                        outcome.items, outcome.fetched, outcome.passes, outcome.quarantined
                    );
                    if !outcome.collisions.is_empty() {
                        println!(
                            "{yellow}     left in flat layout (path collision): {}{reset}",
                            outcome.collisions.join(", ")
                        );
                    }
                }
            }
            Err(err) => {
                println!("{red}  {} failed: {err}{reset}", entry.dataset);
            }
        }
    }
}
