use vanopticon_bifrost::observability::{MetricsRegistry, init_metrics};

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_registry_creation() {
	let registry = MetricsRegistry::new().unwrap();
	registry
		.replication_status
		.with_label_values(&["acl-token-replication"])
		.set(1);
	registry
		.replication_items_total
		.with_label_values(&["acl-token-replication", "update"])
		.inc();
	registry.tokens_reaped_total.with_label_values(&["local"]).inc();
	let output = registry.encode();

	assert!(output.contains("bifrost_replication_status"));
	assert!(output.contains("bifrost_replication_items_total"));
	assert!(output.contains("bifrost_tokens_reaped_total"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_increment() {
	let registry = MetricsRegistry::new().unwrap();

	registry
		.replication_errors_total
		.with_label_values(&["acl-policy-replication"])
		.inc();
	registry
		.replication_items_total
		.with_label_values(&["acl-policy-replication", "delete"])
		.inc_by(5);

	let output = registry.encode();

	assert!(output.contains("bifrost_replication_errors_total{replicator=\"acl-policy-replication\"} 1"));
	assert!(output.contains(
		"bifrost_replication_items_total{op=\"delete\",replicator=\"acl-policy-replication\"} 5"
	));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_metrics_gauge_operations() {
	let registry = MetricsRegistry::new().unwrap();
	let index = registry
		.replication_index
		.with_label_values(&["federation-state-replication"]);

	index.set(42);
	assert!(registry.encode().contains("replicator=\"federation-state-replication\"} 42"));

	// A failed pass resets the watermark.
	index.set(0);
	assert!(registry.encode().contains("replicator=\"federation-state-replication\"} 0"));
}

#[cfg(feature = "unit-tests")]
#[test]
fn test_init_metrics_returns_independent_registries() {
	let a = init_metrics().unwrap();
	let b = init_metrics().unwrap();
	a.tokens_reaped_total.with_label_values(&["global"]).inc();
	assert!(a.encode().contains("bifrost_tokens_reaped_total"));
	assert!(!b.encode().contains("bifrost_tokens_reaped_total"));
}
