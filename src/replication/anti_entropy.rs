//! Federation-state anti-entropy: a secondary datacenter's leader keeps its
//! own federation state current on the primary, which is how the primary's
//! listing comes to describe every datacenter.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use super::ReplicationError;
use super::rate_limiter::RateLimiter;
use crate::rpc::PrimaryRpc;
use crate::structs::{FederationState, GatewayEndpoint};

const TARGET: &str = "bifrost::replication::federation_states";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AntiEntropyOutcome {
	/// The primary already holds this datacenter's state.
	Current { index: u64 },
	/// The state was written to the primary at `index`.
	Pushed { index: u64 },
	Exit,
}

pub struct FederationStateAntiEntropy {
	remote: Arc<dyn PrimaryRpc>,
	desired: FederationState,
}

impl FederationStateAntiEntropy {
	pub fn new(
		remote: Arc<dyn PrimaryRpc>,
		datacenter: impl Into<String>,
		mesh_gateways: Vec<GatewayEndpoint>,
	) -> Self {
		let mut desired = FederationState::new(datacenter, mesh_gateways);
		desired.set_hash(true);
		Self { remote, desired }
	}

	/// Compare the primary's copy of this datacenter's state with the local
	/// one and push the local one if they differ. The listing blocks until the
	/// primary's federation state index exceeds `min_index`.
	pub async fn sync_once(
		&self,
		min_index: u64,
		cancel: &CancellationToken,
	) -> Result<AntiEntropyOutcome, ReplicationError> {
		let listing = tokio::select! {
			_ = cancel.cancelled() => return Ok(AntiEntropyOutcome::Exit),
			listing = self.remote.federation_state_list(min_index) => listing,
		};
		let listing = listing.map_err(|e| ReplicationError::FetchRemote {
			noun: "federation states",
			source: e.into(),
		})?;

		let current = listing
			.items
			.iter()
			.find(|state| state.datacenter == self.desired.datacenter);
		if current.is_some_and(|state| state.hash == self.desired.hash) {
			return Ok(AntiEntropyOutcome::Current {
				index: listing.index,
			});
		}
		if cancel.is_cancelled() {
			return Ok(AntiEntropyOutcome::Exit);
		}

		let mut state = self.desired.clone();
		state.updated_at = Utc::now();
		let index = self
			.remote
			.federation_state_apply(state)
			.await
			.map_err(|e| ReplicationError::Update {
				noun: "federation state",
				source: e.into(),
			})?;
		info!(
			target: TARGET,
			"pushed the federation state of {} to the primary at index {}",
			self.desired.datacenter,
			index
		);
		Ok(AntiEntropyOutcome::Pushed { index })
	}

	/// Run [`FederationStateAntiEntropy::sync_once`] on a rate-limited loop
	/// until `cancel` fires. A failed round resets the index and waits
	/// `retry_delay`.
	pub async fn run(
		&self,
		rate: f64,
		burst: usize,
		retry_delay: Duration,
		cancel: CancellationToken,
	) -> anyhow::Result<()> {
		let limiter = RateLimiter::new(rate, burst);
		let mut index = 0;
		loop {
			if limiter.wait(&cancel).await.is_err() {
				break;
			}
			match self.sync_once(index, &cancel).await {
				Ok(AntiEntropyOutcome::Exit) => break,
				Ok(AntiEntropyOutcome::Current { index: seen })
				| Ok(AntiEntropyOutcome::Pushed { index: seen }) => index = seen,
				Err(e) => {
					warn!(
						target: TARGET,
						"federation state anti-entropy for {} failed (will retry): {}",
						self.desired.datacenter,
						e
					);
					index = 0;
					tokio::select! {
						_ = cancel.cancelled() => break,
						_ = tokio::time::sleep(retry_delay) => {}
					}
				}
			}
		}
		debug!(target: TARGET, "federation state anti-entropy loop exited");
		Ok(())
	}
}
