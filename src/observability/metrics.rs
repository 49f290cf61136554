use prometheus::{
	HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Central registry for all Prometheus metrics
pub struct MetricsRegistry {
	registry: Registry,

	// Replication metrics, labelled by replicator name
	pub replication_status: IntGaugeVec,
	pub replication_index: IntGaugeVec,
	pub replication_errors_total: IntCounterVec,
	pub replication_pass_seconds: HistogramVec,
	pub replication_items_total: IntCounterVec,

	// Token reaping
	pub tokens_reaped_total: IntCounterVec,
}

impl MetricsRegistry {
	pub fn new() -> prometheus::Result<Self> {
		let registry = Registry::new();

		let replication_status = IntGaugeVec::new(
			Opts::new(
				"replication_status",
				"1 if the last replication pass succeeded, 0 if it failed",
			)
			.namespace("bifrost"),
			&["replicator"],
		)?;

		let replication_index = IntGaugeVec::new(
			Opts::new(
				"replication_index",
				"Remote index the last successful pass synced to",
			)
			.namespace("bifrost"),
			&["replicator"],
		)?;

		let replication_errors_total = IntCounterVec::new(
			Opts::new(
				"replication_errors_total",
				"Replication passes that ended in an error",
			)
			.namespace("bifrost"),
			&["replicator"],
		)?;

		let replication_pass_seconds = HistogramVec::new(
			HistogramOpts::new(
				"replication_pass_seconds",
				"Duration of replication passes in seconds, including blocking reads",
			)
			.namespace("bifrost")
			.buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
			&["replicator"],
		)?;

		let replication_items_total = IntCounterVec::new(
			Opts::new(
				"replication_items_total",
				"Items deleted or updated locally by replication",
			)
			.namespace("bifrost"),
			&["replicator", "op"],
		)?;

		let tokens_reaped_total = IntCounterVec::new(
			Opts::new("tokens_reaped_total", "Expired ACL tokens deleted")
				.namespace("bifrost"),
			&["locality"],
		)?;

		registry.register(Box::new(replication_status.clone()))?;
		registry.register(Box::new(replication_index.clone()))?;
		registry.register(Box::new(replication_errors_total.clone()))?;
		registry.register(Box::new(replication_pass_seconds.clone()))?;
		registry.register(Box::new(replication_items_total.clone()))?;
		registry.register(Box::new(tokens_reaped_total.clone()))?;

		Ok(Self {
			registry,
			replication_status,
			replication_index,
			replication_errors_total,
			replication_pass_seconds,
			replication_items_total,
			tokens_reaped_total,
		})
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				log::error!("failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}

/// Initialize the metrics registry
pub fn init_metrics() -> anyhow::Result<Arc<MetricsRegistry>> {
	Ok(Arc::new(MetricsRegistry::new()?))
}
