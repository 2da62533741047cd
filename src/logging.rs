use tracing::{Level, subscriber::SetGlobalDefaultError};

// Diagnostics go to stderr so stdout only carries the experiment's results.
pub fn install_logger(verbosity: u8) -> Result<(), SetGlobalDefaultError> {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}
