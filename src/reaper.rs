//! Removal of expired ACL tokens.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::observability::metrics::MetricsRegistry;
use crate::replication::rate_limiter::RateLimiter;
use crate::store::{IdentityCache, RaftApply, StateStore};
use crate::structs::LogEntry;

/// Most tokens removed by one reaping pass.
pub const MAX_REAP_BATCH: usize = 4096;

#[derive(Debug, Error)]
pub enum ReapError {
	#[error("cannot reap both local and global tokens in the same pass")]
	LocalityConflict,

	#[error("ACLs are disabled")]
	AclsDisabled,

	#[error("token reaping is unavailable in legacy ACL mode")]
	LegacyMode,

	#[error("expired index for local={expected} returned token {accessor_id} with local={actual}")]
	MismatchedLocality {
		expected: bool,
		actual: bool,
		accessor_id: String,
	},

	#[error("failed to read expired tokens: {0}")]
	Store(#[source] anyhow::Error),

	#[error("failed to apply token expiration deletions: {0}")]
	Apply(#[source] anyhow::Error),
}

fn locality(local: bool) -> &'static str {
	if local { "local" } else { "global" }
}

pub struct TokenReaper {
	store: Arc<dyn StateStore>,
	raft: Arc<dyn RaftApply>,
	identities: Arc<dyn IdentityCache>,
	acls_enabled: bool,
	legacy_mode: bool,
	metrics: Option<Arc<MetricsRegistry>>,
}

impl TokenReaper {
	pub fn new(
		store: Arc<dyn StateStore>,
		raft: Arc<dyn RaftApply>,
		identities: Arc<dyn IdentityCache>,
	) -> Self {
		Self {
			store,
			raft,
			identities,
			acls_enabled: true,
			legacy_mode: false,
			metrics: None,
		}
	}

	pub fn with_modes(mut self, acls_enabled: bool, legacy_mode: bool) -> Self {
		self.acls_enabled = acls_enabled;
		self.legacy_mode = legacy_mode;
		self
	}

	pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	/// Delete tokens of one locality that expired before `now`, returning how
	/// many were removed. Exactly one of `local` and `global` must be set.
	pub async fn reap(&self, local: bool, global: bool, now: DateTime<Utc>) -> Result<usize, ReapError> {
		if local == global {
			return Err(ReapError::LocalityConflict);
		}
		if !self.acls_enabled {
			return Err(ReapError::AclsDisabled);
		}
		if self.legacy_mode {
			return Err(ReapError::LegacyMode);
		}

		let min_expiration = self
			.store
			.token_min_expiration_time(local)
			.await
			.map_err(ReapError::Store)?;
		match min_expiration {
			Some(exp) if exp < now => {}
			_ => return Ok(0),
		}

		let tokens = self
			.store
			.token_list_expired(local, now, MAX_REAP_BATCH)
			.await
			.map_err(ReapError::Store)?;

		let mut accessor_ids = Vec::with_capacity(tokens.len());
		let mut secret_ids = Vec::with_capacity(tokens.len());
		for token in tokens {
			if token.local != local {
				return Err(ReapError::MismatchedLocality {
					expected: local,
					actual: token.local,
					accessor_id: token.accessor_id,
				});
			}
			accessor_ids.push(token.accessor_id);
			secret_ids.push(token.secret_id);
		}
		if accessor_ids.is_empty() {
			return Ok(0);
		}

		let count = accessor_ids.len();
		info!(
			target: "bifrost::reaper",
			"deleting {} expired {} ACL tokens",
			count,
			locality(local)
		);
		self.raft
			.apply(LogEntry::AclTokenDelete {
				token_ids: accessor_ids,
			})
			.await
			.map_err(ReapError::Apply)?;

		for secret_id in &secret_ids {
			self.identities.remove_identity(secret_id).await;
		}

		if let Some(metrics) = &self.metrics {
			metrics
				.tokens_reaped_total
				.with_label_values(&[locality(local)])
				.inc_by(count as u64);
		}
		Ok(count)
	}

	/// Reap tokens of one locality on a rate-limited loop until `cancel` fires.
	pub async fn run(
		&self,
		local: bool,
		rate: f64,
		burst: usize,
		cancel: CancellationToken,
	) -> anyhow::Result<()> {
		let limiter = RateLimiter::new(rate, burst);
		loop {
			if limiter.wait(&cancel).await.is_err() {
				return Ok(());
			}
			if let Err(e) = self.reap(local, !local, Utc::now()).await {
				error!(
					target: "bifrost::reaper",
					"failed to reap expired {} tokens: {}",
					locality(local),
					e
				);
			}
		}
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::store::{CachedIdentity, IdentityCacheMap, MemStore};
	use crate::structs::AclToken;

	fn reaper(store: &Arc<MemStore>, cache: &Arc<IdentityCacheMap>) -> TokenReaper {
		TokenReaper::new(store.clone(), store.clone(), cache.clone())
	}

	#[tokio::test]
	async fn rejects_invalid_requests() {
		let store = Arc::new(MemStore::new());
		let cache = Arc::new(IdentityCacheMap::new());
		let now = Utc::now();

		let r = reaper(&store, &cache);
		assert!(matches!(r.reap(true, true, now).await, Err(ReapError::LocalityConflict)));
		assert!(matches!(r.reap(false, false, now).await, Err(ReapError::LocalityConflict)));

		let r = reaper(&store, &cache).with_modes(false, false);
		assert!(matches!(r.reap(true, false, now).await, Err(ReapError::AclsDisabled)));

		let r = reaper(&store, &cache).with_modes(true, true);
		assert!(matches!(r.reap(true, false, now).await, Err(ReapError::LegacyMode)));
	}

	#[tokio::test]
	async fn reaps_only_expired_tokens_of_the_requested_locality() {
		let store = Arc::new(MemStore::new());
		let cache = Arc::new(IdentityCacheMap::new());
		let now = Utc::now();

		let mut expired = AclToken::new("t1", "s1");
		expired.expiration_time = Some(now - chrono::Duration::seconds(30));
		let mut fresh = AclToken::new("t2", "s2");
		fresh.expiration_time = Some(now + chrono::Duration::hours(1));
		let mut expired_local = AclToken::new("t3", "s3");
		expired_local.local = true;
		expired_local.expiration_time = Some(now - chrono::Duration::seconds(30));
		store
			.apply(LogEntry::AclTokenSet {
				tokens: vec![expired, fresh, expired_local],
				allow_missing_links: true,
				from_replication: false,
			})
			.await
			.unwrap();
		cache
			.insert(
				"s1",
				CachedIdentity {
					accessor_id: "t1".into(),
					privileged: false,
					cached_at: now,
				},
			)
			.await;

		let r = reaper(&store, &cache);
		assert_eq!(r.reap(false, true, now).await.unwrap(), 1);
		assert!(store.token_get_by_secret("s1").await.unwrap().is_none());
		assert!(store.token_get_by_secret("s2").await.unwrap().is_some());
		assert!(store.token_get_by_secret("s3").await.unwrap().is_some());
		assert!(cache.get("s1").await.is_none());

		assert_eq!(r.reap(false, true, now).await.unwrap(), 0);
		assert_eq!(r.reap(true, false, now).await.unwrap(), 1);
	}

	#[tokio::test]
	async fn large_backlogs_drain_over_several_passes() {
		let store = Arc::new(MemStore::new());
		let cache = Arc::new(IdentityCacheMap::new());
		let now = Utc::now();

		let backlog = MAX_REAP_BATCH + 10;
		let tokens = (0..backlog)
			.map(|i| {
				let mut token = AclToken::new(format!("t{i:05}"), format!("s{i:05}"));
				token.expiration_time = Some(now - chrono::Duration::seconds(60));
				token
			})
			.collect();
		store
			.apply(LogEntry::AclTokenSet {
				tokens,
				allow_missing_links: true,
				from_replication: false,
			})
			.await
			.unwrap();
		let seeded = store.last_index().await;

		let r = reaper(&store, &cache);
		assert_eq!(r.reap(false, true, now).await.unwrap(), MAX_REAP_BATCH);
		assert_eq!(store.last_index().await, seeded + 1);
		assert_eq!(store.token_list(false, true).await.unwrap().items.len(), 10);

		assert_eq!(r.reap(false, true, now).await.unwrap(), 10);
		assert_eq!(store.last_index().await, seeded + 2);
		assert!(store.token_list(false, true).await.unwrap().items.is_empty());

		assert_eq!(r.reap(false, true, now).await.unwrap(), 0);
		assert_eq!(store.last_index().await, seeded + 2);
	}
}
