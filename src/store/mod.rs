pub mod identity;
pub mod memory;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::structs::{AclPolicy, AclRole, AclToken, FederationState, Indexed, LogEntry};

pub use identity::{CachedIdentity, IdentityCacheMap};
pub use memory::MemStore;

/// Tables whose indexes can be watched by blocking queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
	Tokens,
	Policies,
	Roles,
	FederationStates,
	SystemMetadata,
}

/// Read side of the local state store. Listings are sorted ascending by ID
/// and tagged with the table index they were read at.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
	async fn token_list(&self, local: bool, global: bool) -> Result<Indexed<AclToken>>;
	async fn token_batch_get(&self, accessor_ids: &[String]) -> Result<Indexed<AclToken>>;
	async fn token_get_by_secret(&self, secret_id: &str) -> Result<Option<AclToken>>;
	/// Earliest expiration time among tokens of the given locality, if any
	/// token carries one.
	async fn token_min_expiration_time(&self, local: bool) -> Result<Option<DateTime<Utc>>>;
	/// Tokens of the given locality expired as of `as_of`, earliest first, at
	/// most `max` of them.
	async fn token_list_expired(
		&self,
		local: bool,
		as_of: DateTime<Utc>,
		max: usize,
	) -> Result<Vec<AclToken>>;

	async fn policy_list(&self) -> Result<Indexed<AclPolicy>>;
	async fn policy_batch_get(&self, ids: &[String]) -> Result<Indexed<AclPolicy>>;
	async fn policy_get(&self, id: &str) -> Result<Option<AclPolicy>>;

	async fn role_list(&self) -> Result<Indexed<AclRole>>;

	async fn federation_state_list(&self) -> Result<Indexed<FederationState>>;

	async fn system_metadata_get(&self, key: &str) -> Result<Option<String>>;

	/// Block until the table index exceeds `min_index` or `wait` elapses, and
	/// return the table index observed last.
	async fn wait_for_table(&self, table: Table, min_index: u64, wait: Duration) -> u64;
}

/// The linearizable consensus apply primitive. Returns the log index the
/// entry was committed at.
#[async_trait]
pub trait RaftApply: Send + Sync + 'static {
	async fn apply(&self, entry: LogEntry) -> Result<u64>;
}

/// Cache of resolved identities keyed by secret.
#[async_trait]
pub trait IdentityCache: Send + Sync + 'static {
	async fn remove_identity(&self, secret_id: &str);
	async fn purge(&self);
}
