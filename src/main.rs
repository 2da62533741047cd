use clap::Parser;

use crate::config::Config;

mod config;
mod digits;
mod evaluator;
mod experiment;
mod logging;
mod network;
mod plot;
mod topology;
mod trainer;

fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    logging::install_logger(config.verbose)?;

    let outcome = experiment::run(&config)?;
    tracing::info!(
        samples = outcome.training.samples,
        reason = %outcome.training.reason,
        accuracy = outcome.evaluation.accuracy(),
        "experiment finished"
    );
    Ok(())
}
