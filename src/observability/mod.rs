pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{MetricsRegistry, init_metrics};

use std::sync::Arc;

/// Process-wide observability state
pub struct ObservabilityState {
	pub metrics: Arc<MetricsRegistry>,
}

/// Initialize logging at `level` and the metrics registry.
pub fn init_observability(level: log::Level) -> anyhow::Result<ObservabilityState> {
	init_logging(level)?;
	let metrics = init_metrics()?;

	log::info!(
		target: "bifrost::observability",
		"observability initialized: logging at {}, prometheus metrics enabled",
		level
	);

	Ok(ObservabilityState { metrics })
}
