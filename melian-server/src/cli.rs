//! Command-line surface: a config path flag, a debug flag, and a
//! `--check` validate-only mode.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "melian-server")]
#[command(version)]
#[command(about = "In-memory read cache in front of a relational database")]
pub struct CliArgs {
    /// Path to the TOML configuration file.
    #[arg(short, long, help = "Path to configuration file", value_name = "FILE", default_value = "melian.toml")]
    pub config: PathBuf,

    /// Parse and validate the configuration, print the resolved schema, and exit.
    #[arg(long, help = "Validate configuration and exit without starting the server")]
    pub check: bool,

    #[arg(short, long, help = "enable debug logging", default_value_t = false)]
    pub debug: bool,
}
