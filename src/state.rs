use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::observability::MetricsRegistry;
use crate::replication::StatusTracker;
use crate::store::{IdentityCacheMap, RaftApply, StateStore};

/// Application state passed to handlers via Axum's `State` extractor.
///
/// Handlers read the local state store directly; blocking list queries are
/// capped at `max_query_wait`. Only the primary datacenter carries `raft` and
/// accepts federation state writes.
#[derive(Clone)]
pub struct AppState {
	pub datacenter: String,
	pub store: Arc<dyn StateStore>,
	pub raft: Option<Arc<dyn RaftApply>>,
	pub identities: Arc<IdentityCacheMap>,
	pub status: Arc<StatusTracker>,
	pub metrics: Arc<MetricsRegistry>,
	pub is_leader: Arc<AtomicBool>,
	pub max_query_wait: Duration,
}
