use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "pec-archiver")]
#[clap(author, version, about)]
pub struct Args {
    /// Path to the configuration file.
    #[clap(short, long, default_value = "config.toml")]
    pub config: PathBuf,
    /// Run a single archive job and exit instead of running daily.
    #[clap(long)]
    pub once: bool,
    /// Date to archive, as YYYY-MM-DD. Implies --once.
    #[clap(long)]
    pub date: Option<NaiveDate>,
    /// Suppress any progress output if set.
    #[clap(short, long)]
    pub quiet: bool,
}

impl Args {
    pub fn parse_args() -> Self {
        let mut result: Self = Self::parse();
        result.once |= result.date.is_some();
        result
    }
}
