//! Command-line arguments
//!
//! Global flags override the matching `[logging]` keys of the configuration
//! file. Without a subcommand the service runs.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "repowatch")]
#[command(about = "Continuously scan a repository fleet for leaked credentials")]
#[command(version)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE", env = "REPOWATCH_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Log level
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", value_parser = ["trace", "debug", "info", "warn", "error", "off"])]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(short = 'o', long = "log-format", value_name = "FORMAT", value_parser = ["text", "ext", "json"])]
    pub log_format: Option<String>,

    /// Log file path (use 'none' to disable file logging)
    #[arg(short = 'f', long = "log-file", value_name = "FILE")]
    pub log_file: Option<String>,

    /// Disable coloured log output
    #[arg(long = "no-color")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start every worker and run until interrupted (default)
    Run,
    /// Tree-scan every branch tip under the current rules, then exit
    Rescan,
    /// Apply schema migrations, then exit
    Migrate,
    /// Print aggregate counts from the database
    Stats {
        /// Emit the counts as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    /// Effective log file: the flag wins over the file, `none` disables
    pub fn log_file_or(&self, configured: Option<&str>) -> Option<String> {
        match self.log_file.as_deref() {
            Some(flag) if flag.eq_ignore_ascii_case("none") => None,
            Some(flag) => Some(flag.to_string()),
            None => configured.map(str::to_string),
        }
    }
}
