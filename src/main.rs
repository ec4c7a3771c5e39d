//! dune-poll - run saved Dune Analytics queries and collect their results.

use std::path::Path;
use std::sync::Arc;

use dune_poll::cli::{Cli, Command, RunArgs};
use dune_poll::config::Config;
use dune_poll::dune::{DuneClient, DuneClientConfig};
use dune_poll::error::Result;
use dune_poll::logging;
use dune_poll::output;
use dune_poll::poller::{PollPolicy, Poller};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // A missing .env is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();
    logging::init_logging(cli.verbose, cli.log_file.as_deref());
    let logs_to_file = cli.log_file.is_some();

    if let Err(e) = run(cli).await {
        error!("{}: {}", e.category(), e);
        // The log file is not the terminal; say why we are exiting.
        if logs_to_file {
            eprintln!("{}: {}", e.category(), e);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    match cli.command {
        Command::Run(args) => run_query(&config_path, &args).await,
        Command::Show { path, rows } => show(&path, rows),
    }
}

/// Executes the configured query and writes its rows.
async fn run_query(config_path: &Path, args: &RunArgs) -> Result<()> {
    info!("Loading config from: {}", config_path.display());
    let mut config = Config::load_from_file(config_path)?;
    config.apply_env();
    args.apply_to(&mut config);
    config.validate()?;

    let client = DuneClient::new(DuneClientConfig::from_config(&config)?)?;
    let request = config.query_request()?;
    let policy = PollPolicy::from_config(&config);
    info!(
        "Running query {} on the {} engine (up to {} attempt(s))",
        request.query_id, request.performance, policy.max_attempts
    );

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let poller = Poller::new(Arc::new(client), request, policy);
    let result = poller.run(&cancel).await?;
    if result.is_empty() {
        warn!("Query returned no rows");
    }

    let path = &config.output.path;
    output::write_result(&result, path, config.output.resolved_format())?;

    if !args.no_preview {
        print!("{}", output::preview(&result, config.output.preview_rows));
    }
    Ok(())
}

/// Prints a preview of a saved CSV file.
fn show(path: &Path, rows: usize) -> Result<()> {
    let result = output::read_csv(path)?;
    print!("{}", output::preview(&result, rows));
    Ok(())
}

/// Cancels the token on the first Ctrl-C.
fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, cancelling the current execution");
                cancel.cancel();
            }
            Err(e) => warn!("Could not listen for Ctrl-C: {e}"),
        }
    });
}
