use std::fs::File;
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use commongroups::app::{App, RunOptions};
use commongroups::config::ConfigLoader;
use commongroups::domain::{Cid, MaterialId};
use commongroups::error::CmgError;
use commongroups::output::{JsonOutput, OutputMode};
use commongroups::params::SearchQuery;
use commongroups::pubchem::{PropertyClient, PubchemHttpClient, SearchClient};
use commongroups::scheduler::{FixedDelay, NoDelay};
use commongroups::store::{CompoundRecord, Store};

#[derive(Parser)]
#[command(name = "cmg")]
#[command(about = "Track PubChem structure searches for chemical and material groups")]
#[command(version, author)]
struct Cli {
    /// Environment root holding project directories (defaults to CMG_HOME or ~/commongroups_data).
    #[arg(long, global = true)]
    env_path: Option<String>,

    #[arg(long, global = true, default_value = "default")]
    project: String,

    /// Group definitions file (defaults to <project>/params.json).
    #[arg(long, global = true)]
    params: Option<String>,

    /// Suppress progress lines on stderr.
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search and update groups, then export results")]
    Run(RunArgs),
    #[command(about = "Show the state of every group")]
    Status,
    #[command(about = "Delete saved search results and compounds")]
    Clear(ClearArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Only run these groups.
    materialids: Vec<MaterialId>,

    /// Seconds to wait between groups.
    #[arg(long, default_value_t = 10)]
    wait: u64,

    /// Maximum number of CIDs kept from each search.
    #[arg(long)]
    limit: Option<usize>,

    /// Skip searching and continue updates from saved search results.
    #[arg(long, conflicts_with = "clean_start")]
    resume: bool,

    /// Clear every selected group before searching.
    #[arg(long)]
    clean_start: bool,
}

#[derive(Args)]
struct ClearArgs {
    /// Groups to clear; all groups when omitted.
    materialids: Vec<MaterialId>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<CmgError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CmgError) -> u8 {
    match error {
        CmgError::MissingConfig
        | CmgError::ConfigRead(_)
        | CmgError::ConfigParse(_)
        | CmgError::InvalidParams(_)
        | CmgError::InvalidMaterialId(_)
        | CmgError::GroupNotFound(_) => 2,
        CmgError::StoreCorrupt { .. } => 4,
        CmgError::BatchIncomplete { .. } => 5,
        error if error.is_remote() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let store = Store::new(cli.env_path.as_deref(), &cli.project)?;
    store.ensure_layout()?;
    init_logging(&store, cli.verbose)?;
    tracing::info!(project_root = %store.project_root(), "using project");

    let config = ConfigLoader::resolve(cli.params.as_deref(), &store.params_path())?;
    let sink = output_mode.sink();

    match cli.command {
        Commands::Run(args) => {
            let client = PubchemHttpClient::new()?;
            let app = App::new(store, client.clone(), client, FixedDelay);
            let options = RunOptions {
                clean_start: args.clean_start,
                resume: args.resume,
                wait: Duration::from_secs(args.wait),
                result_limit: args.limit,
                materialids: args.materialids,
            };
            let result = app.run(&config, &options, sink)?;
            JsonOutput::print_run(&result).into_diagnostic()?;
            if !result.is_success() {
                return Err(CmgError::BatchIncomplete {
                    failed: result.report.failures.len(),
                }
                .into());
            }
            Ok(())
        }
        Commands::Status => {
            let app = App::new(store, NopPubchem, NopPubchem, NoDelay);
            let result = app.status(&config, sink)?;
            JsonOutput::print_status(&result).into_diagnostic()
        }
        Commands::Clear(args) => {
            let app = App::new(store, NopPubchem, NopPubchem, NoDelay);
            let result = app.clear(&config, &args.materialids, sink)?;
            JsonOutput::print_clear(&result).into_diagnostic()
        }
    }
}

/// Stands in for PubChem in commands that only read local state.
struct NopPubchem;

impl SearchClient for NopPubchem {
    fn search(&self, _query: &SearchQuery, _limit: Option<usize>) -> Result<Vec<Cid>, CmgError> {
        Err(CmgError::SearchFailed("not available".to_string()))
    }
}

impl PropertyClient for NopPubchem {
    fn fetch(&self, cid: Cid) -> Result<CompoundRecord, CmgError> {
        Err(CmgError::FetchFailed {
            cid: cid.get(),
            message: "not available".to_string(),
        })
    }
}

/// Logs to stderr and to a per-run file in the project's log directory.
fn init_logging(store: &Store, verbose: u8) -> miette::Result<()> {
    let default_level = if verbose > 0 { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_path = store
        .log_dir()
        .join(format!("{}.log", Local::now().format("%Y%m%dT%H%M%S")));
    let log_file = File::create(log_path.as_std_path()).into_diagnostic()?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .init();
    Ok(())
}
