use async_trait::async_trait;

use super::adapter::{ReplicationSources, ReplicationType, TypeAdapter, commit, select_updates};
use super::batch::Payload;
use super::reconcile::{Replicable, Snapshot};
use super::ReplicationError;
use crate::structs::{FederationState, LogEntry};

impl Replicable for FederationState {
	fn id(&self) -> &str {
		&self.datacenter
	}
	fn modify_index(&self) -> u64 {
		self.modify_index
	}
	fn content_hash(&self) -> &[u8] {
		&self.hash
	}
}

impl Payload for FederationState {
	fn estimated_size(&self) -> usize {
		self.estimate_size()
	}
}

/// Replicates per-datacenter mesh gateway metadata. Federation state
/// listings carry full payloads.
pub struct FederationStateAdapter {
	sources: ReplicationSources,
}

impl FederationStateAdapter {
	pub fn new(sources: ReplicationSources) -> Self {
		Self { sources }
	}
}

#[async_trait]
impl TypeAdapter for FederationStateAdapter {
	type Summary = FederationState;
	type Local = FederationState;
	type Item = FederationState;

	fn kind(&self) -> ReplicationType {
		ReplicationType::FederationStates
	}

	async fn fetch_remote(&self, last_remote_index: u64) -> Result<Snapshot<FederationState>, ReplicationError> {
		let listing = self
			.sources
			.remote
			.federation_state_list(last_remote_index)
			.await
			.map_err(|e| ReplicationError::FetchRemote {
				noun: "federation states",
				source: e.into(),
			})?;
		Ok(Snapshot::new(listing.index, listing.items))
	}

	async fn fetch_local(&self) -> Result<Snapshot<FederationState>, ReplicationError> {
		let listing = self
			.sources
			.store
			.federation_state_list()
			.await
			.map_err(|source| ReplicationError::FetchLocal {
				noun: "federation states",
				source,
			})?;
		Ok(Snapshot::new(listing.index, listing.items))
	}

	async fn fetch_updated(
		&self,
		ids: &[String],
		remote: &Snapshot<FederationState>,
	) -> Result<Vec<FederationState>, ReplicationError> {
		select_updates(self.kind(), ids, &remote.items)
	}

	async fn delete_local_batch(&self, ids: &[String]) -> Result<(), ReplicationError> {
		let entry = LogEntry::FederationStateDelete {
			datacenters: ids.to_vec(),
		};
		commit(self.sources.raft.as_ref(), entry, |source| ReplicationError::Delete {
			noun: "federation states",
			source,
		})
		.await
	}

	async fn update_local_batch(&self, items: &[FederationState]) -> Result<(), ReplicationError> {
		let entry = LogEntry::FederationStateUpsert {
			states: items.to_vec(),
		};
		commit(self.sources.raft.as_ref(), entry, |source| ReplicationError::Update {
			noun: "federation states",
			source,
		})
		.await
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::replication::PassOutcome;
	use crate::replication::adapter::{PassConfig, replicate_type};
	use crate::rpc::StorePrimary;
	use crate::store::{MemStore, RaftApply, StateStore};
	use crate::structs::GatewayEndpoint;
	use std::sync::Arc;
	use std::time::Duration;
	use tokio_util::sync::CancellationToken;

	#[tokio::test]
	async fn deletes_datacenters_gone_from_primary() {
		let primary = Arc::new(MemStore::new());
		let secondary = Arc::new(MemStore::new());
		let gw = GatewayEndpoint::parse("10.0.0.1:8443").unwrap();

		primary
			.apply(LogEntry::FederationStateUpsert {
				states: vec![FederationState::new("dc1", vec![gw.clone()])],
			})
			.await
			.unwrap();
		secondary
			.apply(LogEntry::FederationStateUpsert {
				states: vec![FederationState::new("dc-old", vec![gw])],
			})
			.await
			.unwrap();

		let adapter = FederationStateAdapter::new(ReplicationSources {
			remote: Arc::new(StorePrimary::new(primary.clone(), Duration::from_millis(10))),
			store: secondary.clone(),
			raft: secondary.clone(),
		});
		let outcome = replicate_type(&adapter, &PassConfig::default(), &CancellationToken::new(), 0)
			.await
			.unwrap();
		assert_eq!(
			outcome,
			PassOutcome::Synced {
				index: 1,
				deleted: 1,
				updated: 1
			}
		);

		let names: Vec<String> = secondary
			.federation_state_list()
			.await
			.unwrap()
			.items
			.into_iter()
			.map(|s| s.datacenter)
			.collect();
		assert_eq!(names, vec!["dc1"]);
	}
}
