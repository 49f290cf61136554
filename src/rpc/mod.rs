//! Reads served by the primary datacenter and consumed by replication, plus
//! the one write secondaries send back: their own federation state.

pub mod client;
pub mod handlers;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::structs::{AclPolicy, AclPolicyStub, AclRole, AclToken, AclTokenStub, FederationState, Indexed};

pub use client::HttpPrimaryClient;
pub use local::StorePrimary;

/// Header carrying the caller's token secret.
pub const TOKEN_HEADER: &str = "X-Bifrost-Token";

#[derive(Debug, Error)]
pub enum RpcError {
	#[error("request to primary failed: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("primary returned {status}: {message}")]
	Status { status: u16, message: String },

	#[error("invalid primary address: {0}")]
	Url(#[from] url::ParseError),

	#[error("state store request failed: {0}")]
	Store(#[source] anyhow::Error),

	#[error("this node does not accept writes")]
	ReadOnly,
}

/// Body of the batch read endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
	pub ids: Vec<String>,
}

/// Response of write endpoints: the log index the write was committed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
	pub index: u64,
}

/// Query string of the blocking list endpoints. `index` is the index the
/// caller already has; the response is held until the table moves past it or
/// `wait` milliseconds elapse. A missing or zero `wait` means the server's
/// maximum.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BlockingQuery {
	#[serde(default)]
	pub index: u64,
	#[serde(default)]
	pub wait: Option<u64>,
}

/// Remote interface of the primary datacenter. List calls block until the
/// remote index exceeds `min_index` or the server-side wait elapses.
#[async_trait]
pub trait PrimaryRpc: Send + Sync + 'static {
	/// Global tokens only.
	async fn token_list(&self, min_index: u64) -> Result<Indexed<AclTokenStub>, RpcError>;
	async fn token_batch_read(&self, accessor_ids: &[String]) -> Result<Indexed<AclToken>, RpcError>;
	async fn policy_list(&self, min_index: u64) -> Result<Indexed<AclPolicyStub>, RpcError>;
	async fn policy_batch_read(&self, ids: &[String]) -> Result<Indexed<AclPolicy>, RpcError>;
	async fn role_list(&self, min_index: u64) -> Result<Indexed<AclRole>, RpcError>;
	async fn federation_state_list(&self, min_index: u64) -> Result<Indexed<FederationState>, RpcError>;
	/// Upsert one datacenter's federation state, returning the commit index.
	async fn federation_state_apply(&self, state: FederationState) -> Result<u64, RpcError>;
}
