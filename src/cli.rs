//! Command-line argument parsing for dune-poll.
//!
//! Flags given here take precedence over the config file and environment.

use crate::config::Config;
use crate::dune::PerformanceTier;
use crate::output::OutputFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Run a saved Dune query, wait for it to finish, and save the rows.
#[derive(Parser, Debug)]
#[command(name = "dune-poll")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute the query, wait for results and write them to a file
    Run(RunArgs),

    /// Print a preview of a previously saved CSV file without querying
    Show {
        /// CSV file to read
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Number of rows to show
        #[arg(long, value_name = "N", default_value = "50")]
        rows: usize,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Saved query id (the number in dune.com/queries/<id>)
    #[arg(short, long, value_name = "ID")]
    pub query_id: Option<String>,

    /// Engine size: small, medium or large
    #[arg(short, long, value_name = "TIER")]
    pub performance: Option<PerformanceTier>,

    /// Query parameter as NAME=VALUE (repeatable)
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Output file path
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Output format: csv or json (default: from the file extension)
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<OutputFormat>,

    /// Maximum number of submissions before giving up
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<u32>,

    /// Overall deadline in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Do not print the result preview
    #[arg(long)]
    pub no_preview: bool,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }
}

impl RunArgs {
    /// Applies the flags that were given onto the loaded config.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(query_id) = &self.query_id {
            config.query.query_id = Some(query_id.clone());
        }
        if let Some(performance) = self.performance {
            config.query.performance = performance;
        }
        for (name, value) in &self.params {
            config
                .query
                .parameters
                .insert(name.clone(), serde_json::Value::String(value.clone()));
        }
        if let Some(output) = &self.output {
            config.output.path = output.clone();
        }
        if let Some(format) = self.format {
            config.output.format = Some(format);
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(timeout) = self.timeout {
            config.poll.timeout_secs = timeout;
        }
    }
}

/// Parses a `NAME=VALUE` query parameter.
fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("Invalid parameter '{raw}'. Expected NAME=VALUE")),
    }
}
