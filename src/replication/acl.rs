//! Adapters replicating ACL tokens, policies and roles from the primary.
//!
//! Upserts are committed with `allow_missing_links` set: the three types are
//! replicated independently, so a token may arrive before the policy it links.

use async_trait::async_trait;

use super::adapter::{ReplicationSources, ReplicationType, TypeAdapter, commit, select_updates};
use super::batch::Payload;
use super::reconcile::{Replicable, Snapshot};
use super::ReplicationError;
use crate::structs::{AclPolicy, AclPolicyStub, AclRole, AclToken, AclTokenStub, LogEntry};

impl Replicable for AclTokenStub {
	fn id(&self) -> &str {
		&self.accessor_id
	}
	fn modify_index(&self) -> u64 {
		self.modify_index
	}
	fn content_hash(&self) -> &[u8] {
		&self.hash
	}
}

impl Replicable for AclToken {
	fn id(&self) -> &str {
		&self.accessor_id
	}
	fn modify_index(&self) -> u64 {
		self.modify_index
	}
	fn content_hash(&self) -> &[u8] {
		&self.hash
	}
}

impl Payload for AclToken {
	fn estimated_size(&self) -> usize {
		self.estimate_size()
	}
	fn is_redacted(&self) -> bool {
		AclToken::is_redacted(self)
	}
}

impl Replicable for AclPolicyStub {
	fn id(&self) -> &str {
		&self.id
	}
	fn modify_index(&self) -> u64 {
		self.modify_index
	}
	fn content_hash(&self) -> &[u8] {
		&self.hash
	}
}

impl Replicable for AclPolicy {
	fn id(&self) -> &str {
		&self.id
	}
	fn modify_index(&self) -> u64 {
		self.modify_index
	}
	fn content_hash(&self) -> &[u8] {
		&self.hash
	}
}

impl Payload for AclPolicy {
	fn estimated_size(&self) -> usize {
		self.estimate_size()
	}
}

impl Replicable for AclRole {
	fn id(&self) -> &str {
		&self.id
	}
	fn modify_index(&self) -> u64 {
		self.modify_index
	}
	fn content_hash(&self) -> &[u8] {
		&self.hash
	}
}

impl Payload for AclRole {
	fn estimated_size(&self) -> usize {
		self.estimate_size()
	}
}

/// Replicates global tokens. Local tokens never leave their datacenter.
pub struct TokenAdapter {
	sources: ReplicationSources,
}

impl TokenAdapter {
	pub fn new(sources: ReplicationSources) -> Self {
		Self { sources }
	}
}

#[async_trait]
impl TypeAdapter for TokenAdapter {
	type Summary = AclTokenStub;
	type Local = AclToken;
	type Item = AclToken;

	fn kind(&self) -> ReplicationType {
		ReplicationType::Tokens
	}

	async fn fetch_remote(&self, last_remote_index: u64) -> Result<Snapshot<AclTokenStub>, ReplicationError> {
		let listing = self
			.sources
			.remote
			.token_list(last_remote_index)
			.await
			.map_err(|e| ReplicationError::FetchRemote {
				noun: "tokens",
				source: e.into(),
			})?;
		let items = listing.items.into_iter().filter(|t| !t.local).collect();
		Ok(Snapshot::new(listing.index, items))
	}

	async fn fetch_local(&self) -> Result<Snapshot<AclToken>, ReplicationError> {
		let listing = self
			.sources
			.store
			.token_list(false, true)
			.await
			.map_err(|source| ReplicationError::FetchLocal {
				noun: "tokens",
				source,
			})?;
		Ok(Snapshot::new(listing.index, listing.items))
	}

	async fn fetch_updated(
		&self,
		ids: &[String],
		_remote: &Snapshot<AclTokenStub>,
	) -> Result<Vec<AclToken>, ReplicationError> {
		let listing = self
			.sources
			.remote
			.token_batch_read(ids)
			.await
			.map_err(|e| ReplicationError::Hydrate {
				noun: "tokens",
				source: e.into(),
			})?;
		if listing.items.iter().any(AclToken::is_redacted) {
			return Err(ReplicationError::Redacted);
		}
		Ok(listing.items.into_iter().filter(|t| !t.local).collect())
	}

	async fn delete_local_batch(&self, ids: &[String]) -> Result<(), ReplicationError> {
		let entry = LogEntry::AclTokenDelete {
			token_ids: ids.to_vec(),
		};
		commit(self.sources.raft.as_ref(), entry, |source| ReplicationError::Delete {
			noun: "tokens",
			source,
		})
		.await
	}

	async fn update_local_batch(&self, items: &[AclToken]) -> Result<(), ReplicationError> {
		let entry = LogEntry::AclTokenSet {
			tokens: items.to_vec(),
			allow_missing_links: true,
			from_replication: true,
		};
		commit(self.sources.raft.as_ref(), entry, |source| ReplicationError::Update {
			noun: "tokens",
			source,
		})
		.await
	}
}

pub struct PolicyAdapter {
	sources: ReplicationSources,
}

impl PolicyAdapter {
	pub fn new(sources: ReplicationSources) -> Self {
		Self { sources }
	}
}

#[async_trait]
impl TypeAdapter for PolicyAdapter {
	type Summary = AclPolicyStub;
	type Local = AclPolicy;
	type Item = AclPolicy;

	fn kind(&self) -> ReplicationType {
		ReplicationType::Policies
	}

	async fn fetch_remote(&self, last_remote_index: u64) -> Result<Snapshot<AclPolicyStub>, ReplicationError> {
		let listing = self
			.sources
			.remote
			.policy_list(last_remote_index)
			.await
			.map_err(|e| ReplicationError::FetchRemote {
				noun: "policies",
				source: e.into(),
			})?;
		Ok(Snapshot::new(listing.index, listing.items))
	}

	async fn fetch_local(&self) -> Result<Snapshot<AclPolicy>, ReplicationError> {
		let listing = self
			.sources
			.store
			.policy_list()
			.await
			.map_err(|source| ReplicationError::FetchLocal {
				noun: "policies",
				source,
			})?;
		Ok(Snapshot::new(listing.index, listing.items))
	}

	async fn fetch_updated(
		&self,
		ids: &[String],
		_remote: &Snapshot<AclPolicyStub>,
	) -> Result<Vec<AclPolicy>, ReplicationError> {
		let listing = self
			.sources
			.remote
			.policy_batch_read(ids)
			.await
			.map_err(|e| ReplicationError::Hydrate {
				noun: "policies",
				source: e.into(),
			})?;
		Ok(listing.items)
	}

	async fn delete_local_batch(&self, ids: &[String]) -> Result<(), ReplicationError> {
		let entry = LogEntry::AclPolicyDelete {
			policy_ids: ids.to_vec(),
		};
		commit(self.sources.raft.as_ref(), entry, |source| ReplicationError::Delete {
			noun: "policies",
			source,
		})
		.await
	}

	async fn update_local_batch(&self, items: &[AclPolicy]) -> Result<(), ReplicationError> {
		let entry = LogEntry::AclPolicySet {
			policies: items.to_vec(),
		};
		commit(self.sources.raft.as_ref(), entry, |source| ReplicationError::Update {
			noun: "policies",
			source,
		})
		.await
	}
}

/// Role listings carry full payloads, so updates are taken from the listing.
pub struct RoleAdapter {
	sources: ReplicationSources,
}

impl RoleAdapter {
	pub fn new(sources: ReplicationSources) -> Self {
		Self { sources }
	}
}

#[async_trait]
impl TypeAdapter for RoleAdapter {
	type Summary = AclRole;
	type Local = AclRole;
	type Item = AclRole;

	fn kind(&self) -> ReplicationType {
		ReplicationType::Roles
	}

	async fn fetch_remote(&self, last_remote_index: u64) -> Result<Snapshot<AclRole>, ReplicationError> {
		let listing = self
			.sources
			.remote
			.role_list(last_remote_index)
			.await
			.map_err(|e| ReplicationError::FetchRemote {
				noun: "roles",
				source: e.into(),
			})?;
		Ok(Snapshot::new(listing.index, listing.items))
	}

	async fn fetch_local(&self) -> Result<Snapshot<AclRole>, ReplicationError> {
		let listing = self
			.sources
			.store
			.role_list()
			.await
			.map_err(|source| ReplicationError::FetchLocal {
				noun: "roles",
				source,
			})?;
		Ok(Snapshot::new(listing.index, listing.items))
	}

	async fn fetch_updated(
		&self,
		ids: &[String],
		remote: &Snapshot<AclRole>,
	) -> Result<Vec<AclRole>, ReplicationError> {
		select_updates(self.kind(), ids, &remote.items)
	}

	async fn delete_local_batch(&self, ids: &[String]) -> Result<(), ReplicationError> {
		let entry = LogEntry::AclRoleDelete {
			role_ids: ids.to_vec(),
		};
		commit(self.sources.raft.as_ref(), entry, |source| ReplicationError::Delete {
			noun: "roles",
			source,
		})
		.await
	}

	async fn update_local_batch(&self, items: &[AclRole]) -> Result<(), ReplicationError> {
		let entry = LogEntry::AclRoleSet {
			roles: items.to_vec(),
			allow_missing_links: true,
		};
		commit(self.sources.raft.as_ref(), entry, |source| ReplicationError::Update {
			noun: "roles",
			source,
		})
		.await
	}
}
