use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::ReplicationType;

/// What the ACL replicators are currently doing, as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReplicationStatus {
	pub enabled: bool,
	pub running: bool,
	pub source_datacenter: String,
	/// `"tokens"` when token replication is enabled, `"policies"` otherwise.
	pub replication_type: String,
	pub replicated_index: u64,
	pub replicated_role_index: u64,
	pub replicated_token_index: u64,
	pub last_success: Option<DateTime<Utc>>,
	pub last_error: Option<DateTime<Utc>>,
	#[serde(default)]
	pub last_error_message: String,
}

#[derive(Default)]
pub struct StatusTracker {
	inner: RwLock<ReplicationStatus>,
}

impl StatusTracker {
	pub fn new() -> Self {
		Self::default()
	}

	/// Mark replication enabled and running, discarding indexes from any
	/// earlier leadership term.
	pub async fn start(&self, source_datacenter: &str, token_replication: bool) {
		let mut s = self.inner.write().await;
		s.enabled = true;
		s.running = true;
		s.source_datacenter = source_datacenter.to_string();
		s.replication_type = if token_replication { "tokens" } else { "policies" }.to_string();
		s.replicated_index = 0;
		s.replicated_role_index = 0;
		s.replicated_token_index = 0;
	}

	pub async fn stop(&self) {
		self.inner.write().await.running = false;
	}

	pub async fn record_success(&self, kind: ReplicationType, index: u64) {
		let mut s = self.inner.write().await;
		match kind {
			ReplicationType::Policies => s.replicated_index = index,
			ReplicationType::Roles => s.replicated_role_index = index,
			ReplicationType::Tokens => s.replicated_token_index = index,
			ReplicationType::FederationStates => return,
		}
		s.last_success = Some(Utc::now());
	}

	pub async fn record_failure(&self, message: impl Into<String>) {
		let mut s = self.inner.write().await;
		s.last_error = Some(Utc::now());
		s.last_error_message = message.into();
	}

	pub async fn snapshot(&self) -> ReplicationStatus {
		self.inner.read().await.clone()
	}
}
