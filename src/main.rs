mod args;

use anyhow::{anyhow, Context};
use args::Args;
use pec_archiver::config::Config;
use pec_archiver::notify::ReportNotifier;
use pec_archiver::remote::RemoteUploader;
use pec_archiver::scheduler::Scheduler;
use pec_archiver::source::MaildirSource;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let args = Args::parse_args();
    init_logging();
    do_main(&args)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn do_main(args: &Args) -> anyhow::Result<()> {
    let config = Config::load(&args.config)?;
    info!(config = %args.config.display(), accounts = config.accounts.len(), "configuration loaded");

    let maildir_root = config
        .source
        .maildir_root
        .clone()
        .ok_or_else(|| anyhow!("source.maildir_root is not configured"))?;
    let source = Arc::new(MaildirSource::new(maildir_root));
    let uploader = match &config.remote {
        Some(remote) => Some(
            RemoteUploader::from_settings(remote).context("cannot set up remote storage")?,
        ),
        None => None,
    };
    let notifier = Box::new(ReportNotifier::new(&config.notifications));
    let scheduler = Scheduler::new(config, source, uploader, notifier).quiet(args.quiet);

    if !args.once {
        scheduler.run_forever();
        return Ok(());
    }
    let report = scheduler.run_archive_job(args.date);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, &report)?;
    writeln!(out)?;
    Ok(())
}
