use std::process::ExitCode;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use one_client::config::ConfigLoader;
use one_client::domain::{DatasetType, ListCategory, SessionId};
use one_client::error::OneError;
use one_client::one::{LoadOptions, LoadTarget, One};
use one_client::output::JsonOutput;
use one_client::query::SearchFilters;
use one_client::registry::AlyxHttpClient;
use one_client::store::CacheStore;
use one_client::transfer::HttpTransfer;

#[derive(Parser)]
#[command(name = "one")]
#[command(about = "Search experiment sessions and load their datasets through a local cache")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Search sessions by experimenter, subject and date range")]
    Search(SearchArgs),
    #[command(about = "Print the recognized search filter keys")]
    Terms,
    #[command(about = "List dataset types for a session, or a registry catalogue")]
    List(ListArgs),
    #[command(about = "Load datasets for a session into the local cache")]
    Load(LoadArgs),
}

#[derive(Args, Clone)]
struct FilterArgs {
    #[arg(long = "user")]
    users: Vec<String>,

    #[arg(long)]
    subject: Option<String>,

    #[arg(long)]
    from: Option<NaiveDate>,

    #[arg(long)]
    to: Option<NaiveDate>,
}

impl FilterArgs {
    fn into_filters(self) -> SearchFilters {
        let mut filters = SearchFilters::new();
        filters.users = self.users;
        filters.subjects = self.subject;
        filters.date_range = match (self.from, self.to) {
            (Some(from), Some(to)) => Some((from, to)),
            (Some(day), None) | (None, Some(day)) => Some((day, day)),
            (None, None) => None,
        };
        filters
    }
}

#[derive(Args)]
struct SearchArgs {
    #[command(flatten)]
    filters: FilterArgs,

    #[arg(long)]
    details: bool,
}

#[derive(Args)]
struct ListArgs {
    session: Option<String>,

    #[arg(long, default_value = "dataset-types")]
    category: String,
}

#[derive(Args)]
struct LoadArgs {
    session: Option<String>,

    #[command(flatten)]
    filters: FilterArgs,

    #[arg(long = "dataset-type")]
    dataset_types: Vec<String>,

    #[arg(long)]
    dclass: bool,

    #[arg(long)]
    cache_only: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(one) = report.downcast_ref::<OneError>() {
            return ExitCode::from(map_exit_code(one));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &OneError) -> u8 {
    match error {
        OneError::InvalidQuery(_)
        | OneError::InvalidSessionId(_)
        | OneError::InvalidDatasetType(_)
        | OneError::AmbiguousSession { .. } => 2,
        OneError::Transport(_) | OneError::RegistryStatus { .. } => 3,
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
    let config = ConfigLoader::resolve(cli.config.as_deref()).into_diagnostic()?;
    let timeout = Duration::from_secs(config.http_timeout_secs);

    let registry = AlyxHttpClient::new(&config.base_url, timeout).into_diagnostic()?;
    let transfer = HttpTransfer::new(timeout).into_diagnostic()?;
    let store = CacheStore::new(config.cache_dir.clone());
    store.ensure_root().into_diagnostic()?;
    let one = One::new(store, registry, transfer);

    match cli.command {
        Commands::Search(args) => {
            let filters = args.filters.into_filters();
            let result = one.search(&filters, args.details).into_diagnostic()?;
            JsonOutput::print_search(&result).into_diagnostic()?;
        }
        Commands::Terms => {
            println!("{}", one.search_terms().join("\n"));
        }
        Commands::List(args) => {
            let session = args
                .session
                .map(|value| value.parse::<SessionId>())
                .transpose()
                .into_diagnostic()?;
            let category: ListCategory = args.category.parse().into_diagnostic()?;
            let result = one.list(session.as_ref(), category).into_diagnostic()?;
            JsonOutput::print_list(&result).into_diagnostic()?;
        }
        Commands::Load(args) => {
            let target = match args.session {
                Some(value) => LoadTarget::Session(value.parse().into_diagnostic()?),
                None => LoadTarget::Filters(args.filters.into_filters()),
            };
            let dataset_types = args
                .dataset_types
                .iter()
                .map(|value| value.parse::<DatasetType>())
                .collect::<Result<Vec<_>, _>>()
                .into_diagnostic()?;
            let options = LoadOptions {
                dclass_output: args.dclass,
                cache_only: args.cache_only,
            };
            let result = one.load(target, &dataset_types, options).into_diagnostic()?;
            JsonOutput::print_load(&result).into_diagnostic()?;
        }
    }

    Ok(())
}
