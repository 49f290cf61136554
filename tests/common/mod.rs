/// Common test utilities and helpers for integration tests.
use std::ops::AsyncFnMut;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use vanopticon_bifrost::replication::adapter::ReplicationSources;
use vanopticon_bifrost::rpc::{PrimaryRpc, RpcError, StorePrimary};
use vanopticon_bifrost::store::{MemStore, RaftApply};
use vanopticon_bifrost::structs::{
	AclPolicy, AclPolicyStub, AclRole, AclToken, AclTokenStub, FederationState, Indexed, LogEntry,
};

/// A primary served from an in-process store that can be told to fail its
/// next list calls or to report a rebuilt (lower) index. Federation state
/// writes are applied to the same store.
pub struct FakePrimary {
	inner: StorePrimary,
	failures: AtomicUsize,
	rebuilt: AtomicBool,
	pub list_calls: AtomicUsize,
}

#[allow(dead_code)]
impl FakePrimary {
	pub fn new(store: Arc<MemStore>) -> Self {
		Self {
			inner: StorePrimary::new(store.clone(), Duration::from_millis(20)).writable(store),
			failures: AtomicUsize::new(0),
			rebuilt: AtomicBool::new(false),
			list_calls: AtomicUsize::new(0),
		}
	}

	pub fn redacting(mut self) -> Self {
		self.inner = self.inner.redacting(true);
		self
	}

	/// Fail the next `n` list calls.
	pub fn fail_next(&self, n: usize) {
		self.failures.store(n, Ordering::SeqCst);
	}

	/// Report index 1 on every listing from now on.
	pub fn rebuild(&self) {
		self.rebuilt.store(true, Ordering::SeqCst);
	}

	fn before_list(&self) -> Result<(), RpcError> {
		self.list_calls.fetch_add(1, Ordering::SeqCst);
		let failed = self
			.failures
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		if failed {
			return Err(RpcError::Status {
				status: 503,
				message: "primary unavailable".into(),
			});
		}
		Ok(())
	}

	fn after_list<T>(&self, mut listing: Indexed<T>) -> Indexed<T> {
		if self.rebuilt.load(Ordering::SeqCst) {
			listing.index = 1;
		}
		listing
	}
}

#[async_trait]
impl PrimaryRpc for FakePrimary {
	async fn token_list(&self, min_index: u64) -> Result<Indexed<AclTokenStub>, RpcError> {
		self.before_list()?;
		let listing = self.inner.token_list(self.effective(min_index)).await?;
		Ok(self.after_list(listing))
	}

	async fn token_batch_read(&self, accessor_ids: &[String]) -> Result<Indexed<AclToken>, RpcError> {
		self.inner.token_batch_read(accessor_ids).await
	}

	async fn policy_list(&self, min_index: u64) -> Result<Indexed<AclPolicyStub>, RpcError> {
		self.before_list()?;
		let listing = self.inner.policy_list(self.effective(min_index)).await?;
		Ok(self.after_list(listing))
	}

	async fn policy_batch_read(&self, ids: &[String]) -> Result<Indexed<AclPolicy>, RpcError> {
		self.inner.policy_batch_read(ids).await
	}

	async fn role_list(&self, min_index: u64) -> Result<Indexed<AclRole>, RpcError> {
		self.before_list()?;
		let listing = self.inner.role_list(self.effective(min_index)).await?;
		Ok(self.after_list(listing))
	}

	async fn federation_state_list(&self, min_index: u64) -> Result<Indexed<FederationState>, RpcError> {
		self.before_list()?;
		let listing = self.inner.federation_state_list(self.effective(min_index)).await?;
		Ok(self.after_list(listing))
	}

	async fn federation_state_apply(&self, state: FederationState) -> Result<u64, RpcError> {
		self.inner.federation_state_apply(state).await
	}
}

impl FakePrimary {
	/// A rebuilt primary never blocks on the caller's stale index.
	fn effective(&self, min_index: u64) -> u64 {
		if self.rebuilt.load(Ordering::SeqCst) {
			0
		} else {
			min_index
		}
	}
}

#[allow(dead_code)]
pub fn sources(remote: Arc<dyn PrimaryRpc>, secondary: &Arc<MemStore>) -> ReplicationSources {
	ReplicationSources {
		remote,
		store: secondary.clone(),
		raft: secondary.clone(),
	}
}

#[allow(dead_code)]
pub async fn apply(store: &MemStore, entry: LogEntry) -> u64 {
	match store.apply(entry).await {
		Ok(index) => index,
		Err(e) => panic!("apply failed: {e:#}"),
	}
}

/// Poll `check` until it holds or `timeout` elapses.
#[allow(dead_code)]
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
	F: AsyncFnMut() -> bool,
{
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		if check().await {
			return true;
		}
		if tokio::time::Instant::now() >= deadline {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}
