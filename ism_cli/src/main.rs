use clap::{Parser, Subcommand};
use ism_cli::{describe_routes, preview_rows, read_state, render_rows, run_service, summarize_state, write_state};
use ism_core::StateDirection;
use ism_mq::RoutingConfig;
use ism_processor::{
    Executor, LlmExecutor, ProcessorStateRouteStorage, RetryPolicy, RetryingExecutor, RuntimeConfig, SqliteStorage,
    StateStorage, anthropic_from_env,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ism")]
#[command(about = "Run processors and inspect routing files and persisted states")]
struct Args {
    /// Load environment from .env file
    #[arg(long, default_value = "true")]
    dotenv: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the routes of a routing file
    Routes {
        /// Defaults to ISM_ROUTING_CONFIG
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print a summary of a state file
    Inspect {
        path: PathBuf,
        /// Number of rows to print
        #[arg(long, short = 'n', default_value_t = 0)]
        rows: usize,
    },
    /// Convert a state file between JSON and binary, chosen by extension
    Convert {
        input: PathBuf,
        output: PathBuf,
        #[arg(long)]
        pretty: bool,
    },
    /// Apply database migrations
    Migrate,
    /// Write a stored state to a file
    Export {
        state_id: String,
        output: PathBuf,
        #[arg(long)]
        pretty: bool,
    },
    /// Store a state file in the database
    Import { path: PathBuf },
    /// Consume the input route until ctrl-c
    Run {
        /// JSON lines file of envelopes published to the input route first
        #[arg(long)]
        enqueue: Option<PathBuf>,
    },
    /// Reopen a failed or terminated processor route
    Reset { route_id: String },
}

async fn storage(config: &RuntimeConfig) -> color_eyre::Result<SqliteStorage> {
    let storage = SqliteStorage::connect(&config.database_url).await?;
    storage.migrate().await?;
    Ok(storage)
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    if args.dotenv {
        let _ = dotenvy::dotenv();
    }
    tracing_subscriber::fmt::init();
    let config = RuntimeConfig::from_env()?;

    match args.command {
        Command::Routes { config: path } => {
            let path = path.unwrap_or_else(|| config.routing_config.clone());
            let routing = RoutingConfig::from_file(&path)?;
            for line in describe_routes(&routing) {
                println!("{line}");
            }
        }
        Command::Inspect { path, rows } => {
            let state = read_state(&path)?;
            println!("{}", summarize_state(&state));
            if rows > 0 {
                println!("{}", render_rows(&preview_rows(&state, rows))?);
            }
        }
        Command::Convert { input, output, pretty } => {
            let state = read_state(&input)?;
            write_state(&state, &output, pretty)?;
        }
        Command::Migrate => {
            storage(&config).await?;
            tracing::info!(database_url = %config.database_url, "migrations applied");
        }
        Command::Export { state_id, output, pretty } => {
            let state = storage(&config).await?.load_state(&state_id, true).await?;
            write_state(&state, &output, pretty)?;
        }
        Command::Import { path } => {
            let state = read_state(&path)?;
            let state = storage(&config).await?.save_state(&state).await?;
            println!("imported {} ({} rows)", state.id, state.count());
        }
        Command::Run { enqueue } => {
            let routing = RoutingConfig::from_file(&config.routing_config)?;
            let storage = storage(&config).await?;
            let executor = RetryingExecutor::new(
                LlmExecutor::new(anthropic_from_env()?, config.default_model.clone()),
                RetryPolicy::default(),
            )
            .into_dyn();
            let stats = run_service(&config, &routing, storage, executor, enqueue.as_deref(), |shutdown| {
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("ctrl-c received, stopping consumer");
                        shutdown.shutdown();
                    }
                });
            })
            .await?;
            tracing::info!(
                loops = stats.loops,
                handled = stats.handled,
                failed = stats.failed,
                "consumer stopped"
            );
        }
        Command::Reset { route_id } => {
            let state = storage(&config)
                .await?
                .reset_processor_state(&route_id, StateDirection::Input)
                .await?;
            println!("{} is {}", state.route_id(), state.status);
        }
    }
    Ok(())
}
