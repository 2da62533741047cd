use clap::Parser;
use std::path::PathBuf;

/// Train a receptive-field network on 16x16 handwritten digits and report its accuracy on a
/// held-out set.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Config {
    /// Training set in ARFF format, optionally gzip-compressed
    #[arg(long, value_name = "PATH", default_value = "train-digits.arff")]
    pub train: PathBuf,

    /// Held-out set the trained network is scored on
    #[arg(long, value_name = "PATH", default_value = "test-digits.arff")]
    pub test: PathBuf,

    /// Only the first INT training samples are fitted, which bounds the run time
    #[arg(long, value_name = "INT", default_value_t = 1000)]
    pub train_limit: usize,

    /// Maximum number of error/gradient evaluations the optimizer may spend
    #[arg(
        long,
        value_name = "INT",
        default_value_t = 1000,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub max_evaluations: usize,

    /// Every weight and bias is kept inside [-BOUND, BOUND]
    #[arg(long, value_name = "BOUND", default_value_t = 100.0, value_parser = positive)]
    pub weight_bound: f64,

    /// Seed for the initial weights
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Where the diagnostic plot is written
    #[arg(long, value_name = "PATH", default_value = "digits.svg")]
    pub plot_path: PathBuf,

    /// Skip the diagnostic plot
    #[arg(long)]
    pub no_plot: bool,

    /// Log more (-v for optimizer progress, -vv for everything)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn positive(value: &str) -> Result<f64, String> {
    match value.parse::<f64>() {
        Ok(bound) if bound.is_finite() && bound > 0.0 => Ok(bound),
        Ok(_) => Err(format!("{value} is not a positive number")),
        Err(error) => Err(error.to_string()),
    }
}
