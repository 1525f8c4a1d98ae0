//! Process-wide tracing subscriber

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a compact stderr subscriber that keeps this crate's events at
/// `level` and everything else at `WARN`.
///
/// Fails if a global subscriber is already installed.
pub fn init(level: LevelFilter) -> anyhow::Result<()> {
    let filter = filter::Targets::new()
        .with_default(LevelFilter::WARN)
        .with_target("rds_exporter", level);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .try_init()?;

    Ok(())
}
