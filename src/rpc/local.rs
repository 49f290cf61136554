use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{PrimaryRpc, RpcError};
use crate::store::{RaftApply, StateStore, Table};
use crate::structs::{
	AclPolicy, AclPolicyStub, AclRole, AclToken, AclTokenStub, FederationState, Indexed, LogEntry,
};

/// [`PrimaryRpc`] answered straight from a state store. Backs the HTTP
/// handlers and lets tests stand up a primary in-process. Writes are
/// refused unless a consensus apply primitive is attached.
#[derive(Clone)]
pub struct StorePrimary {
	store: Arc<dyn StateStore>,
	raft: Option<Arc<dyn RaftApply>>,
	wait: Duration,
	redact_secrets: bool,
}

impl StorePrimary {
	pub fn new(store: Arc<dyn StateStore>, wait: Duration) -> Self {
		Self {
			store,
			raft: None,
			wait,
			redact_secrets: false,
		}
	}

	/// Replace token secrets with the redaction placeholder in batch reads.
	pub fn redacting(mut self, redact: bool) -> Self {
		self.redact_secrets = redact;
		self
	}

	pub fn writable(mut self, raft: Arc<dyn RaftApply>) -> Self {
		self.raft = Some(raft);
		self
	}

	async fn block(&self, table: Table, min_index: u64) {
		if min_index > 0 {
			self.store.wait_for_table(table, min_index, self.wait).await;
		}
	}
}

#[async_trait]
impl PrimaryRpc for StorePrimary {
	async fn token_list(&self, min_index: u64) -> Result<Indexed<AclTokenStub>, RpcError> {
		self.block(Table::Tokens, min_index).await;
		let listing = self
			.store
			.token_list(false, true)
			.await
			.map_err(RpcError::Store)?;
		Ok(Indexed::new(
			listing.index,
			listing.items.iter().map(AclToken::stub).collect(),
		))
	}

	async fn token_batch_read(&self, accessor_ids: &[String]) -> Result<Indexed<AclToken>, RpcError> {
		let mut listing = self
			.store
			.token_batch_get(accessor_ids)
			.await
			.map_err(RpcError::Store)?;
		if self.redact_secrets {
			listing.items = listing.items.iter().map(AclToken::redacted).collect();
		}
		Ok(listing)
	}

	async fn policy_list(&self, min_index: u64) -> Result<Indexed<AclPolicyStub>, RpcError> {
		self.block(Table::Policies, min_index).await;
		let listing = self.store.policy_list().await.map_err(RpcError::Store)?;
		Ok(Indexed::new(
			listing.index,
			listing.items.iter().map(AclPolicy::stub).collect(),
		))
	}

	async fn policy_batch_read(&self, ids: &[String]) -> Result<Indexed<AclPolicy>, RpcError> {
		self.store
			.policy_batch_get(ids)
			.await
			.map_err(RpcError::Store)
	}

	async fn role_list(&self, min_index: u64) -> Result<Indexed<AclRole>, RpcError> {
		self.block(Table::Roles, min_index).await;
		self.store.role_list().await.map_err(RpcError::Store)
	}

	async fn federation_state_list(&self, min_index: u64) -> Result<Indexed<FederationState>, RpcError> {
		self.block(Table::FederationStates, min_index).await;
		self.store
			.federation_state_list()
			.await
			.map_err(RpcError::Store)
	}

	async fn federation_state_apply(&self, state: FederationState) -> Result<u64, RpcError> {
		let raft = self.raft.as_ref().ok_or(RpcError::ReadOnly)?;
		raft.apply(LogEntry::FederationStateUpsert {
			states: vec![state],
		})
		.await
		.map_err(RpcError::Store)
	}
}
