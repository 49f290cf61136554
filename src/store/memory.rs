use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::{RwLock, watch};

use super::{IdentityCache, RaftApply, StateStore, Table};
use crate::structs::{AclPolicy, AclRole, AclToken, FederationState, Indexed, LogEntry};

/// In-memory state store that doubles as a single-node consensus log: every
/// applied entry gets the next index, and all tables touched by the entry
/// have their index bumped to it.
pub struct MemStore {
	tables: RwLock<Tables>,
	index_tx: watch::Sender<u64>,
	identities: Option<Arc<dyn IdentityCache>>,
}

/// Effects of one applied entry.
#[derive(Default)]
struct Applied {
	tables: Vec<Table>,
	/// Secrets of tokens that were deleted or overwritten.
	revoked_secrets: Vec<String>,
}

impl Applied {
	fn touched(table: Table) -> Self {
		Self {
			tables: vec![table],
			revoked_secrets: Vec::new(),
		}
	}
}

#[derive(Default)]
struct Tables {
	index: u64,
	table_index: HashMap<Table, u64>,
	tokens: BTreeMap<String, AclToken>,
	/// secret -> accessor
	secrets: HashMap<String, String>,
	expires_local: BTreeSet<(DateTime<Utc>, String)>,
	expires_global: BTreeSet<(DateTime<Utc>, String)>,
	policies: BTreeMap<String, AclPolicy>,
	roles: BTreeMap<String, AclRole>,
	federation_states: BTreeMap<String, FederationState>,
	system_metadata: BTreeMap<String, String>,
}

impl Tables {
	/// Index reported to readers. Never zero, so a blocking query at index 0
	/// always returns immediately.
	fn table_index(&self, table: Table) -> u64 {
		self.table_index.get(&table).copied().unwrap_or(0).max(1)
	}

	fn expires_index(&mut self, local: bool) -> &mut BTreeSet<(DateTime<Utc>, String)> {
		if local {
			&mut self.expires_local
		} else {
			&mut self.expires_global
		}
	}

	/// Insert or replace a token, returning the secret of the one replaced.
	fn insert_token(&mut self, index: u64, mut token: AclToken) -> Option<String> {
		let replaced = self.remove_token(&token.accessor_id);
		token.create_index = replaced.as_ref().map_or(index, |t| t.create_index);
		token.modify_index = index;
		token.set_hash(true);

		self.secrets
			.insert(token.secret_id.clone(), token.accessor_id.clone());
		if let Some(exp) = token.expiration_time {
			let accessor = token.accessor_id.clone();
			self.expires_index(token.local).insert((exp, accessor));
		}
		self.tokens.insert(token.accessor_id.clone(), token);
		replaced.map(|t| t.secret_id)
	}

	fn remove_token(&mut self, accessor_id: &str) -> Option<AclToken> {
		let token = self.tokens.remove(accessor_id)?;
		self.secrets.remove(&token.secret_id);
		if let Some(exp) = token.expiration_time {
			self.expires_index(token.local)
				.remove(&(exp, token.accessor_id.clone()));
		}
		Some(token)
	}

	fn validate_tokens(
		&self,
		tokens: &[AclToken],
		allow_missing_links: bool,
		from_replication: bool,
	) -> Result<()> {
		for token in tokens {
			if token.accessor_id.is_empty() {
				bail!("token is missing an accessor ID");
			}
			if token.secret_id.is_empty() {
				bail!("token {} is missing a secret ID", token.accessor_id);
			}
			if from_replication && token.local {
				bail!(
					"token {} is local and cannot be written by replication",
					token.accessor_id
				);
			}
			if let Some(owner) = self.secrets.get(&token.secret_id) {
				if owner != &token.accessor_id {
					bail!(
						"secret ID of token {} is already in use",
						token.accessor_id
					);
				}
			}
			if !allow_missing_links {
				for link in &token.policies {
					if !self.policies.contains_key(&link.id) {
						bail!(
							"token {} links to unknown policy {}",
							token.accessor_id,
							link.id
						);
					}
				}
				for link in &token.roles {
					if !self.roles.contains_key(&link.id) {
						bail!(
							"token {} links to unknown role {}",
							token.accessor_id,
							link.id
						);
					}
				}
			}
		}
		Ok(())
	}

	/// Validate then apply one entry.
	fn apply(&mut self, index: u64, entry: LogEntry) -> Result<Applied> {
		match entry {
			LogEntry::AclTokenSet {
				tokens,
				allow_missing_links,
				from_replication,
			} => {
				self.validate_tokens(&tokens, allow_missing_links, from_replication)?;
				let mut applied = Applied::touched(Table::Tokens);
				for token in tokens {
					applied.revoked_secrets.extend(self.insert_token(index, token));
				}
				Ok(applied)
			}
			LogEntry::AclTokenDelete { token_ids } => {
				let mut applied = Applied::touched(Table::Tokens);
				for id in &token_ids {
					if let Some(token) = self.remove_token(id) {
						applied.revoked_secrets.push(token.secret_id);
					}
				}
				Ok(applied)
			}
			LogEntry::AclPolicySet { policies } => {
				for policy in &policies {
					if policy.id.is_empty() || policy.name.is_empty() {
						bail!("policy must have both an ID and a name");
					}
				}
				for mut policy in policies {
					policy.create_index = self
						.policies
						.get(&policy.id)
						.map(|p| p.create_index)
						.unwrap_or(index);
					policy.modify_index = index;
					policy.set_hash(true);
					self.policies.insert(policy.id.clone(), policy);
				}
				Ok(Applied::touched(Table::Policies))
			}
			LogEntry::AclPolicyDelete { policy_ids } => {
				for id in &policy_ids {
					self.policies.remove(id);
				}
				Ok(Applied::touched(Table::Policies))
			}
			LogEntry::AclRoleSet {
				roles,
				allow_missing_links,
			} => {
				for role in &roles {
					if role.id.is_empty() || role.name.is_empty() {
						bail!("role must have both an ID and a name");
					}
					if !allow_missing_links {
						if let Some(link) = role
							.policies
							.iter()
							.find(|l| !self.policies.contains_key(&l.id))
						{
							bail!("role {} links to unknown policy {}", role.id, link.id);
						}
					}
				}
				for mut role in roles {
					role.create_index = self
						.roles
						.get(&role.id)
						.map(|r| r.create_index)
						.unwrap_or(index);
					role.modify_index = index;
					role.set_hash(true);
					self.roles.insert(role.id.clone(), role);
				}
				Ok(Applied::touched(Table::Roles))
			}
			LogEntry::AclRoleDelete { role_ids } => {
				for id in &role_ids {
					self.roles.remove(id);
				}
				Ok(Applied::touched(Table::Roles))
			}
			LogEntry::FederationStateUpsert { states } => {
				if states.iter().any(|s| s.datacenter.is_empty()) {
					bail!("federation state is missing a datacenter");
				}
				for mut state in states {
					state.create_index = self
						.federation_states
						.get(&state.datacenter)
						.map(|s| s.create_index)
						.unwrap_or(index);
					state.modify_index = index;
					state.set_hash(true);
					self.federation_states
						.insert(state.datacenter.clone(), state);
				}
				Ok(Applied::touched(Table::FederationStates))
			}
			LogEntry::FederationStateDelete { datacenters } => {
				for dc in &datacenters {
					self.federation_states.remove(dc);
				}
				Ok(Applied::touched(Table::FederationStates))
			}
			LogEntry::SystemMetadataSet { key, value } => {
				if key.is_empty() {
					bail!("system metadata key must not be empty");
				}
				self.system_metadata.insert(key, value);
				Ok(Applied::touched(Table::SystemMetadata))
			}
		}
	}
}

impl MemStore {
	pub fn new() -> Self {
		let (index_tx, _) = watch::channel(0);
		Self {
			tables: RwLock::new(Tables::default()),
			index_tx,
			identities: None,
		}
	}

	/// Evict cached identities of tokens deleted or overwritten by applied
	/// entries.
	pub fn with_identity_cache(mut self, identities: Arc<dyn IdentityCache>) -> Self {
		self.identities = Some(identities);
		self
	}

	/// Index of the last applied entry.
	pub async fn last_index(&self) -> u64 {
		self.tables.read().await.index
	}

	pub async fn table_index(&self, table: Table) -> u64 {
		self.tables.read().await.table_index(table)
	}
}

impl Default for MemStore {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl RaftApply for MemStore {
	async fn apply(&self, entry: LogEntry) -> Result<u64> {
		let kind = entry.kind();
		let (index, revoked) = {
			let mut tables = self.tables.write().await;
			let index = tables.index + 1;
			let applied = tables.apply(index, entry)?;
			tables.index = index;
			for table in applied.tables {
				tables.table_index.insert(table, index);
			}
			(index, applied.revoked_secrets)
		};
		if let Some(identities) = &self.identities {
			for secret_id in &revoked {
				identities.remove_identity(secret_id).await;
			}
		}
		self.index_tx.send_replace(index);
		debug!("applied {} at index {}", kind, index);
		Ok(index)
	}
}

#[async_trait]
impl StateStore for MemStore {
	async fn token_list(&self, local: bool, global: bool) -> Result<Indexed<AclToken>> {
		let tables = self.tables.read().await;
		let items = tables
			.tokens
			.values()
			.filter(|t| (t.local && local) || (!t.local && global))
			.cloned()
			.collect();
		Ok(Indexed::new(tables.table_index(Table::Tokens), items))
	}

	async fn token_batch_get(&self, accessor_ids: &[String]) -> Result<Indexed<AclToken>> {
		let tables = self.tables.read().await;
		let items = accessor_ids
			.iter()
			.filter_map(|id| tables.tokens.get(id).cloned())
			.collect();
		Ok(Indexed::new(tables.table_index(Table::Tokens), items))
	}

	async fn token_get_by_secret(&self, secret_id: &str) -> Result<Option<AclToken>> {
		let tables = self.tables.read().await;
		Ok(tables
			.secrets
			.get(secret_id)
			.and_then(|accessor| tables.tokens.get(accessor))
			.cloned())
	}

	async fn token_min_expiration_time(&self, local: bool) -> Result<Option<DateTime<Utc>>> {
		let tables = self.tables.read().await;
		let index = if local {
			&tables.expires_local
		} else {
			&tables.expires_global
		};
		Ok(index.first().map(|(exp, _)| *exp))
	}

	async fn token_list_expired(
		&self,
		local: bool,
		as_of: DateTime<Utc>,
		max: usize,
	) -> Result<Vec<AclToken>> {
		let tables = self.tables.read().await;
		let index = if local {
			&tables.expires_local
		} else {
			&tables.expires_global
		};
		Ok(index
			.iter()
			.take_while(|(exp, _)| *exp < as_of)
			.take(max)
			.filter_map(|(_, accessor)| tables.tokens.get(accessor).cloned())
			.collect())
	}

	async fn policy_list(&self) -> Result<Indexed<AclPolicy>> {
		let tables = self.tables.read().await;
		let items = tables.policies.values().cloned().collect();
		Ok(Indexed::new(tables.table_index(Table::Policies), items))
	}

	async fn policy_batch_get(&self, ids: &[String]) -> Result<Indexed<AclPolicy>> {
		let tables = self.tables.read().await;
		let items = ids
			.iter()
			.filter_map(|id| tables.policies.get(id).cloned())
			.collect();
		Ok(Indexed::new(tables.table_index(Table::Policies), items))
	}

	async fn policy_get(&self, id: &str) -> Result<Option<AclPolicy>> {
		Ok(self.tables.read().await.policies.get(id).cloned())
	}

	async fn role_list(&self) -> Result<Indexed<AclRole>> {
		let tables = self.tables.read().await;
		let items = tables.roles.values().cloned().collect();
		Ok(Indexed::new(tables.table_index(Table::Roles), items))
	}

	async fn federation_state_list(&self) -> Result<Indexed<FederationState>> {
		let tables = self.tables.read().await;
		let items = tables.federation_states.values().cloned().collect();
		Ok(Indexed::new(
			tables.table_index(Table::FederationStates),
			items,
		))
	}

	async fn system_metadata_get(&self, key: &str) -> Result<Option<String>> {
		Ok(self.tables.read().await.system_metadata.get(key).cloned())
	}

	async fn wait_for_table(&self, table: Table, min_index: u64, wait: Duration) -> u64 {
		// Subscribe before the first read so no commit can slip between them.
		let mut rx = self.index_tx.subscribe();
		let deadline = tokio::time::sleep(wait);
		tokio::pin!(deadline);

		loop {
			let current = self.table_index(table).await;
			if current > min_index {
				return current;
			}
			tokio::select! {
				_ = &mut deadline => return current,
				changed = rx.changed() => {
					if changed.is_err() {
						return current;
					}
				}
			}
		}
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::structs::AclLink;

	fn token(accessor: &str, secret: &str) -> AclToken {
		AclToken::new(accessor, secret)
	}

	#[tokio::test]
	async fn apply_assigns_indexes_and_hashes() {
		let store = MemStore::new();
		let idx = store
			.apply(LogEntry::AclPolicySet {
				policies: vec![AclPolicy::new("p1", "read")],
			})
			.await
			.unwrap();
		assert_eq!(idx, 1);

		let listing = store.policy_list().await.unwrap();
		assert_eq!(listing.index, 1);
		assert_eq!(listing.items[0].create_index, 1);
		assert_eq!(listing.items[0].modify_index, 1);
		assert!(!listing.items[0].hash.is_empty());

		let mut updated = AclPolicy::new("p1", "read");
		updated.rules = "operator = \"read\"".to_string();
		store
			.apply(LogEntry::AclPolicySet {
				policies: vec![updated],
			})
			.await
			.unwrap();
		let listing = store.policy_list().await.unwrap();
		assert_eq!(listing.items[0].create_index, 1);
		assert_eq!(listing.items[0].modify_index, 2);
	}

	#[tokio::test]
	async fn token_set_enforces_links_unless_allowed() {
		let store = MemStore::new();
		let mut t = token("a", "s");
		t.policies.push(AclLink::new("missing"));

		let err = store
			.apply(LogEntry::AclTokenSet {
				tokens: vec![t.clone()],
				allow_missing_links: false,
				from_replication: false,
			})
			.await
			.unwrap_err();
		assert!(err.to_string().contains("unknown policy"));
		assert_eq!(store.last_index().await, 0);

		store
			.apply(LogEntry::AclTokenSet {
				tokens: vec![t],
				allow_missing_links: true,
				from_replication: true,
			})
			.await
			.unwrap();
		assert!(store.token_get_by_secret("s").await.unwrap().is_some());
	}

	#[tokio::test]
	async fn replication_cannot_write_local_tokens() {
		let store = MemStore::new();
		let mut t = token("a", "s");
		t.local = true;
		let res = store
			.apply(LogEntry::AclTokenSet {
				tokens: vec![t],
				allow_missing_links: true,
				from_replication: true,
			})
			.await;
		assert!(res.is_err());
	}

	#[tokio::test]
	async fn expiration_index_tracks_locality() {
		let store = MemStore::new();
		let now = Utc::now();
		let mut expired = token("a", "s1");
		expired.expiration_time = Some(now - chrono::Duration::minutes(5));
		let mut later = token("b", "s2");
		later.expiration_time = Some(now + chrono::Duration::minutes(5));
		let mut local = token("c", "s3");
		local.local = true;
		local.expiration_time = Some(now - chrono::Duration::minutes(1));

		store
			.apply(LogEntry::AclTokenSet {
				tokens: vec![expired, later, local],
				allow_missing_links: true,
				from_replication: false,
			})
			.await
			.unwrap();

		let min = store.token_min_expiration_time(false).await.unwrap();
		assert_eq!(min, Some(now - chrono::Duration::minutes(5)));

		let global = store.token_list_expired(false, now, 10).await.unwrap();
		assert_eq!(global.len(), 1);
		assert_eq!(global[0].accessor_id, "a");

		let local = store.token_list_expired(true, now, 10).await.unwrap();
		assert_eq!(local.len(), 1);
		assert_eq!(local[0].accessor_id, "c");

		store
			.apply(LogEntry::AclTokenDelete {
				token_ids: vec!["a".to_string()],
			})
			.await
			.unwrap();
		let min = store.token_min_expiration_time(false).await.unwrap();
		assert_eq!(min, Some(now + chrono::Duration::minutes(5)));
		assert!(store.token_get_by_secret("s1").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn wait_for_table_returns_on_change() {
		let store = std::sync::Arc::new(MemStore::new());
		// Empty tables report index 1 so index 0 never blocks.
		assert_eq!(
			store
				.wait_for_table(Table::Roles, 0, Duration::from_secs(5))
				.await,
			1
		);

		store
			.apply(LogEntry::AclPolicySet {
				policies: vec![AclPolicy::new("p1", "read")],
			})
			.await
			.unwrap();

		let writer = std::sync::Arc::clone(&store);
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			writer
				.apply(LogEntry::AclRoleSet {
					roles: vec![AclRole::new("r1", "ops")],
					allow_missing_links: true,
				})
				.await
				.unwrap();
		});

		// Policy writes do not wake role waiters.
		let idx = store
			.wait_for_table(Table::Roles, 1, Duration::from_secs(5))
			.await;
		assert_eq!(idx, 2);
		assert_eq!(store.role_list().await.unwrap().items.len(), 1);
	}

	#[tokio::test]
	async fn wait_for_table_times_out_without_change() {
		let store = MemStore::new();
		let idx = store
			.wait_for_table(Table::Tokens, 5, Duration::from_millis(20))
			.await;
		assert_eq!(idx, 1);
	}

	#[tokio::test]
	async fn token_writes_evict_cached_identities() {
		use crate::store::{CachedIdentity, IdentityCacheMap};

		let cache = Arc::new(IdentityCacheMap::new());
		let store = MemStore::new().with_identity_cache(cache.clone());
		store
			.apply(LogEntry::AclTokenSet {
				tokens: vec![token("t1", "s1"), token("t2", "s2"), token("t3", "s3")],
				allow_missing_links: true,
				from_replication: false,
			})
			.await
			.unwrap();
		for (secret, accessor) in [("s1", "t1"), ("s2", "t2"), ("s3", "t3")] {
			cache
				.insert(
					secret,
					CachedIdentity {
						accessor_id: accessor.into(),
						privileged: true,
						cached_at: Utc::now(),
					},
				)
				.await;
		}

		store
			.apply(LogEntry::AclTokenDelete {
				token_ids: vec!["t1".into(), "missing".into()],
			})
			.await
			.unwrap();
		assert!(cache.get("s1").await.is_none());

		// Overwriting a token drops the identity cached under its old secret.
		store
			.apply(LogEntry::AclTokenSet {
				tokens: vec![token("t2", "s2-rotated")],
				allow_missing_links: true,
				from_replication: false,
			})
			.await
			.unwrap();
		assert!(cache.get("s2").await.is_none());
		assert!(cache.get("s3").await.is_some());
	}
}
