use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use super::batch::{self, Applied, Payload};
use super::reconcile::{self, Replicable, Snapshot};
use super::replicator::{PassOutcome, Replicate};
use super::{ReplicationError, StatusTracker};
use crate::observability::metrics::MetricsRegistry;
use crate::rpc::PrimaryRpc;
use crate::store::{RaftApply, StateStore};
use crate::structs::LogEntry;

/// Resource types replicated from the primary datacenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationType {
	Tokens,
	Policies,
	Roles,
	FederationStates,
}

impl ReplicationType {
	/// Plural noun used in log and error messages.
	pub fn noun(&self) -> &'static str {
		match self {
			ReplicationType::Tokens => "tokens",
			ReplicationType::Policies => "policies",
			ReplicationType::Roles => "roles",
			ReplicationType::FederationStates => "federation states",
		}
	}

	/// Routine name and metric label.
	pub fn name(&self) -> &'static str {
		match self {
			ReplicationType::Tokens => "acl-token-replication",
			ReplicationType::Policies => "acl-policy-replication",
			ReplicationType::Roles => "acl-role-replication",
			ReplicationType::FederationStates => "federation-state-replication",
		}
	}

	pub fn log_target(&self) -> &'static str {
		match self {
			ReplicationType::Tokens => "bifrost::replication::acl::token",
			ReplicationType::Policies => "bifrost::replication::acl::policy",
			ReplicationType::Roles => "bifrost::replication::acl::role",
			ReplicationType::FederationStates => "bifrost::replication::federation_state",
		}
	}
}

impl std::fmt::Display for ReplicationType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.noun())
	}
}

/// Batching knobs shared by every pass of one replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassConfig {
	/// Byte ceiling for one upsert entry.
	pub max_batch_bytes: usize,
	/// Number of IDs in one delete entry.
	pub delete_batch_size: usize,
	/// Maximum applies per second; 0 disables pacing.
	pub apply_limit: u32,
}

impl PassConfig {
	pub fn min_delay(&self) -> Duration {
		if self.apply_limit == 0 {
			Duration::ZERO
		} else {
			Duration::from_secs(1) / self.apply_limit
		}
	}
}

impl Default for PassConfig {
	fn default() -> Self {
		Self {
			max_batch_bytes: 256 * 1024,
			delete_batch_size: 4096,
			apply_limit: 100,
		}
	}
}

/// Bridge between the generic pass and one resource type.
#[async_trait]
pub trait TypeAdapter: Send + Sync + 'static {
	/// Entry of the remote listing.
	type Summary: Replicable + Send + Sync + 'static;
	/// Entry of the local listing.
	type Local: Replicable + Send + Sync + 'static;
	/// Hydrated payload committed locally.
	type Item: Payload + Send + Sync + 'static;

	fn kind(&self) -> ReplicationType;

	/// List the primary's items, blocking until its index moves past
	/// `last_remote_index` or the query wait elapses.
	async fn fetch_remote(
		&self,
		last_remote_index: u64,
	) -> Result<Snapshot<Self::Summary>, ReplicationError>;

	async fn fetch_local(&self) -> Result<Snapshot<Self::Local>, ReplicationError>;

	/// Hydrate full payloads for `ids`. Types whose listing already carries
	/// full payloads take them from `remote`.
	async fn fetch_updated(
		&self,
		ids: &[String],
		remote: &Snapshot<Self::Summary>,
	) -> Result<Vec<Self::Item>, ReplicationError>;

	async fn delete_local_batch(&self, ids: &[String]) -> Result<(), ReplicationError>;

	async fn update_local_batch(&self, items: &[Self::Item]) -> Result<(), ReplicationError>;
}

/// Collaborators every adapter reads from and writes to.
#[derive(Clone)]
pub struct ReplicationSources {
	pub remote: Arc<dyn PrimaryRpc>,
	pub store: Arc<dyn StateStore>,
	pub raft: Arc<dyn RaftApply>,
}

/// Submit `entry` to the local log, mapping failures with `wrap`.
pub(crate) async fn commit(
	raft: &dyn RaftApply,
	entry: LogEntry,
	wrap: impl FnOnce(anyhow::Error) -> ReplicationError,
) -> Result<(), ReplicationError> {
	raft.apply(entry).await.map(|_| ()).map_err(wrap)
}

/// Pick the items named by `ids` out of a listing that already carries full
/// payloads. Every ID must be present.
pub fn select_updates<T>(
	kind: ReplicationType,
	ids: &[String],
	listing: &[T],
) -> Result<Vec<T>, ReplicationError>
where
	T: Replicable + Clone,
{
	let by_id: HashMap<&str, &T> = listing.iter().map(|item| (item.id(), item)).collect();
	ids.iter()
		.map(|id| {
			by_id
				.get(id.as_str())
				.map(|item| (*item).clone())
				.ok_or_else(|| ReplicationError::MissingUpdate {
					noun: kind.noun(),
					id: id.clone(),
				})
		})
		.collect()
}

/// Run one reconciliation pass for `adapter`.
///
/// Deletions are committed before updates. If the primary reports an index
/// lower than `last_remote_index` its state was rebuilt, so the diff runs
/// against a zero watermark to force a full resync.
pub async fn replicate_type<A: TypeAdapter>(
	adapter: &A,
	config: &PassConfig,
	cancel: &CancellationToken,
	last_remote_index: u64,
) -> Result<PassOutcome, ReplicationError> {
	let kind = adapter.kind();
	let target = kind.log_target();

	let remote = adapter.fetch_remote(last_remote_index).await?;
	if cancel.is_cancelled() {
		return Ok(PassOutcome::Exit);
	}
	debug!(target: target, "fetched {} remote {}", remote.items.len(), kind);

	let mut last = last_remote_index;
	if remote.index < last {
		warn!(
			target: target,
			"{} replication remote index moved backwards ({} to {}), forcing a full sync",
			kind, last, remote.index
		);
		last = 0;
	}

	let local = adapter.fetch_local().await?;
	debug!(target: target, "fetched {} local {}", local.items.len(), kind);

	let diff = reconcile::diff(&local.items, &remote.items, last)?;
	if diff.local_skipped + diff.remote_skipped > 0 {
		debug!(
			target: target,
			"skipped {} local and {} remote {} with empty IDs",
			diff.local_skipped, diff.remote_skipped, kind
		);
	}
	debug!(
		target: target,
		"{} replication - deletions: {}, updates: {}",
		kind,
		diff.deletions.len(),
		diff.updates.len()
	);

	let updates = if diff.updates.is_empty() {
		Vec::new()
	} else {
		let items = adapter.fetch_updated(&diff.updates, &remote).await?;
		debug!(target: target, "{} replication - downloaded {} updates", kind, items.len());
		items
	};
	if updates.iter().any(Payload::is_redacted) {
		return Err(ReplicationError::Redacted);
	}

	let min_delay = config.min_delay();

	if !diff.deletions.is_empty() {
		let applied = batch::apply_batches(
			cancel,
			&diff.deletions,
			|_| 1,
			config.delete_batch_size,
			min_delay,
			|ids| adapter.delete_local_batch(ids),
		)
		.await?;
		if applied == Applied::Aborted {
			return Ok(PassOutcome::Exit);
		}
		debug!(target: target, "{} replication - finished deletions", kind);
	}

	if !updates.is_empty() {
		let applied = batch::apply_batches(
			cancel,
			&updates,
			|item: &A::Item| item.estimated_size(),
			config.max_batch_bytes,
			min_delay,
			|items| adapter.update_local_batch(items),
		)
		.await?;
		if applied == Applied::Aborted {
			return Ok(PassOutcome::Exit);
		}
		debug!(target: target, "{} replication - finished updates", kind);
	}

	Ok(PassOutcome::Synced {
		index: remote.index,
		deleted: diff.deletions.len(),
		updated: updates.len(),
	})
}

/// [`Replicate`] implementation driving one adapter, recording results in the
/// status tracker and metrics when present.
pub struct TypeReplicator<A> {
	adapter: A,
	config: PassConfig,
	status: Option<Arc<StatusTracker>>,
	metrics: Option<Arc<MetricsRegistry>>,
}

impl<A: TypeAdapter> TypeReplicator<A> {
	pub fn new(adapter: A, config: PassConfig) -> Self {
		Self {
			adapter,
			config,
			status: None,
			metrics: None,
		}
	}

	pub fn with_status(mut self, status: Arc<StatusTracker>) -> Self {
		self.status = Some(status);
		self
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn adapter(&self) -> &A {
		&self.adapter
	}
}

#[async_trait]
impl<A: TypeAdapter> Replicate for TypeReplicator<A> {
	async fn replicate(
		&self,
		cancel: &CancellationToken,
		last_remote_index: u64,
	) -> Result<PassOutcome, ReplicationError> {
		let kind = self.adapter.kind();
		let started = Instant::now();
		let result = replicate_type(&self.adapter, &self.config, cancel, last_remote_index).await;

		if let Some(metrics) = &self.metrics {
			metrics
				.replication_pass_seconds
				.with_label_values(&[kind.name()])
				.observe(started.elapsed().as_secs_f64());
			if let Ok(PassOutcome::Synced {
				deleted, updated, ..
			}) = &result
			{
				metrics
					.replication_items_total
					.with_label_values(&[kind.name(), "delete"])
					.inc_by(*deleted as u64);
				metrics
					.replication_items_total
					.with_label_values(&[kind.name(), "update"])
					.inc_by(*updated as u64);
			}
		}

		if let Some(status) = &self.status {
			match &result {
				Ok(PassOutcome::Synced { index, .. }) => status.record_success(kind, *index).await,
				Ok(PassOutcome::Exit) => {}
				Err(e) => status.record_failure(e.to_string()).await,
			}
		}

		result
	}
}
