use std::fmt::Display;
use std::time::Instant;

use indicatif::ProgressStyle;

/// Style of the bar tracking a whole dispatch.
pub(crate) fn style_dispatch() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// Style of a single running batch, no progress.
pub(crate) fn style_batch() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    format!("(+{}ms)", s.elapsed().as_millis())
}

/// Installs a `tracing` subscriber that prints through the progress bars.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    Ok(())
}
