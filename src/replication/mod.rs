//! Cross-datacenter anti-entropy replication.
//!
//! Every replicated resource type goes through the same generic pass:
//! fetch the remote summary listing, fetch the local one, diff them with
//! [`reconcile::diff`], hydrate the changed items and apply deletions then
//! updates through [`batch::apply_batches`]. A [`replicator::Replicator`]
//! drives one pass function on a rate-limited loop while leadership is held.
//! [`anti_entropy`] runs the reverse direction for a secondary's own
//! federation state.

pub mod acl;
pub mod adapter;
pub mod anti_entropy;
pub mod batch;
pub mod federation_state;
pub mod rate_limiter;
pub mod reconcile;
pub mod replicator;
pub mod status;

use thiserror::Error;

pub use adapter::{PassConfig, ReplicationType, TypeAdapter, TypeReplicator};
pub use anti_entropy::{AntiEntropyOutcome, FederationStateAntiEntropy};
pub use reconcile::{DiffResult, Replicable, Snapshot};
pub use replicator::{PassOutcome, Replicate, Replicator, ReplicatorConfig};
pub use status::{ReplicationStatus, StatusTracker};

/// Which side of a diff an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
	Local,
	Remote,
}

impl std::fmt::Display for Side {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Side::Local => f.write_str("local"),
			Side::Remote => f.write_str("remote"),
		}
	}
}

#[derive(Debug, Error)]
pub enum ReplicationError {
	#[error("failed to retrieve remote {noun}: {source}")]
	FetchRemote {
		noun: &'static str,
		#[source]
		source: anyhow::Error,
	},

	#[error("failed to retrieve local {noun}: {source}")]
	FetchLocal {
		noun: &'static str,
		#[source]
		source: anyhow::Error,
	},

	/// The primary returned secrets replaced by the redaction placeholder,
	/// usually because the replication token lacks management privileges.
	#[error("replication results contain redacted data")]
	Redacted,

	#[error("duplicate ID {id:?} in {side} listing")]
	DuplicateId { side: Side, id: String },

	#[error("{noun} {id:?} scheduled for update is missing from the remote listing")]
	MissingUpdate { noun: &'static str, id: String },

	#[error("failed to retrieve {noun} updates: {source}")]
	Hydrate {
		noun: &'static str,
		#[source]
		source: anyhow::Error,
	},

	#[error("failed to apply {noun} deletions: {source}")]
	Delete {
		noun: &'static str,
		#[source]
		source: anyhow::Error,
	},

	#[error("failed to apply {noun} updates: {source}")]
	Update {
		noun: &'static str,
		#[source]
		source: anyhow::Error,
	},

	#[error("operation cancelled")]
	Cancelled,

	#[error("invalid replicator configuration: {0}")]
	Config(String),
}

impl ReplicationError {
	pub fn is_redacted(&self) -> bool {
		matches!(self, ReplicationError::Redacted)
	}
}
