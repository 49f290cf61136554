use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::trace;
use tokio::sync::RwLock;

use super::IdentityCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIdentity {
	pub accessor_id: String,
	/// Whether the identity links the global management policy.
	pub privileged: bool,
	pub cached_at: DateTime<Utc>,
}

/// How long a resolved identity is trusted before it is resolved again.
pub const DEFAULT_IDENTITY_TTL: Duration = Duration::from_secs(30);

/// Resolved identities keyed by secret. Entries expire after the TTL and are
/// dropped early when the backing token is written, deleted or reaped, or
/// when leadership changes.
pub struct IdentityCacheMap {
	entries: RwLock<HashMap<String, CachedIdentity>>,
	ttl: Duration,
}

impl Default for IdentityCacheMap {
	fn default() -> Self {
		Self::with_ttl(DEFAULT_IDENTITY_TTL)
	}
}

impl IdentityCacheMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_ttl(ttl: Duration) -> Self {
		Self {
			entries: RwLock::new(HashMap::new()),
			ttl,
		}
	}

	pub async fn insert(&self, secret_id: impl Into<String>, identity: CachedIdentity) {
		self.entries.write().await.insert(secret_id.into(), identity);
	}

	/// Cached identity for `secret_id`, unless it is older than the TTL.
	pub async fn get(&self, secret_id: &str) -> Option<CachedIdentity> {
		let identity = self.entries.read().await.get(secret_id).cloned()?;
		let age = (Utc::now() - identity.cached_at).to_std().unwrap_or_default();
		if age < self.ttl {
			return Some(identity);
		}
		self.entries.write().await.remove(secret_id);
		trace!("cached identity expired");
		None
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.read().await.is_empty()
	}
}

#[async_trait]
impl IdentityCache for IdentityCacheMap {
	async fn remove_identity(&self, secret_id: &str) {
		if self.entries.write().await.remove(secret_id).is_some() {
			trace!("evicted cached identity");
		}
	}

	async fn purge(&self) {
		self.entries.write().await.clear();
	}
}
