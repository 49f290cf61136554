use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ReplicationError;
use super::rate_limiter::RateLimiter;
use crate::leader::Leadership;
use crate::observability::metrics::MetricsRegistry;

/// Result of one successful call into a [`Replicate`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
	/// The local state matches the remote state observed at `index`.
	Synced {
		index: u64,
		deleted: usize,
		updated: usize,
	},
	/// Stop replicating without reporting an error.
	Exit,
}

impl PassOutcome {
	pub fn synced(index: u64) -> Self {
		PassOutcome::Synced {
			index,
			deleted: 0,
			updated: 0,
		}
	}
}

/// One replication pass. `last_remote_index` is the remote index the previous
/// successful pass synced to, or 0 to force a full sync.
#[async_trait]
pub trait Replicate: Send + Sync + 'static {
	async fn replicate(
		&self,
		cancel: &CancellationToken,
		last_remote_index: u64,
	) -> Result<PassOutcome, ReplicationError>;
}

pub struct ReplicatorConfig {
	pub name: String,
	pub delegate: Option<Arc<dyn Replicate>>,
	/// Passes per second.
	pub rate: f64,
	pub burst: usize,
	/// Pause after a failed pass.
	pub retry_delay: Duration,
	pub metrics: Option<Arc<MetricsRegistry>>,
}

impl ReplicatorConfig {
	pub fn new(name: impl Into<String>, delegate: Arc<dyn Replicate>) -> Self {
		Self {
			name: name.into(),
			delegate: Some(delegate),
			rate: 1.0,
			burst: 5,
			retry_delay: Duration::from_secs(30),
			metrics: None,
		}
	}
}

#[derive(Default)]
struct RunState {
	cancel: Option<CancellationToken>,
	handle: Option<JoinHandle<()>>,
}

impl RunState {
	fn is_running(&self) -> bool {
		let live = self.cancel.as_ref().is_some_and(|c| !c.is_cancelled());
		let unfinished = self.handle.as_ref().is_some_and(|h| !h.is_finished());
		live && unfinished
	}
}

/// Drives a [`Replicate`] implementation on a rate-limited loop while
/// leadership is held. At most one loop runs per instance.
pub struct Replicator {
	name: Arc<str>,
	delegate: Arc<dyn Replicate>,
	limiter: Arc<RateLimiter>,
	retry_delay: Duration,
	metrics: Option<Arc<MetricsRegistry>>,
	last_remote_index: Arc<AtomicU64>,
	state: Mutex<RunState>,
}

impl Replicator {
	pub fn new(config: ReplicatorConfig) -> Result<Self, ReplicationError> {
		let delegate = config
			.delegate
			.ok_or_else(|| ReplicationError::Config("a replicate function is required".into()))?;
		if config.rate.is_nan() || config.rate <= 0.0 {
			return Err(ReplicationError::Config(format!(
				"rate must be positive, got {}",
				config.rate
			)));
		}
		if config.burst == 0 {
			return Err(ReplicationError::Config("burst must be at least 1".into()));
		}

		Ok(Self {
			name: config.name.into(),
			delegate,
			limiter: Arc::new(RateLimiter::new(config.rate, config.burst)),
			retry_delay: config.retry_delay,
			metrics: config.metrics,
			last_remote_index: Arc::new(AtomicU64::new(0)),
			state: Mutex::new(RunState::default()),
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Spawn the replication loop unless it is already running. The loop is
	/// bound to `leadership` and ends when it is revoked. Returns whether a new
	/// loop was started.
	pub fn start(&self, leadership: &Leadership) -> bool {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		if state.is_running() {
			return false;
		}
		if !leadership.is_held() {
			warn!("not starting {} replication without leadership", self.name);
			return false;
		}

		let cancel = leadership.child_token();
		let run = ReplicationLoop {
			name: Arc::clone(&self.name),
			delegate: Arc::clone(&self.delegate),
			limiter: Arc::clone(&self.limiter),
			retry_delay: self.retry_delay,
			metrics: self.metrics.clone(),
			last_remote_index: Arc::clone(&self.last_remote_index),
		};
		let task_cancel = cancel.clone();
		state.handle = Some(tokio::spawn(async move { run.run(task_cancel).await }));
		state.cancel = Some(cancel);

		info!("started {} replication", self.name);
		true
	}

	/// Signal the loop to stop without waiting for it. Returns whether a
	/// running loop was signalled.
	pub fn stop(&self) -> bool {
		let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
		if !state.is_running() {
			return false;
		}
		if let Some(cancel) = state.cancel.take() {
			cancel.cancel();
		}
		info!("stopped {} replication", self.name);
		true
	}

	pub fn is_running(&self) -> bool {
		self.state
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.is_running()
	}

	/// Remote index the last successful pass synced to.
	pub fn last_remote_index(&self) -> u64 {
		self.last_remote_index.load(Ordering::SeqCst)
	}

	/// Wait for the most recently spawned loop to exit.
	pub async fn wait_stopped(&self) {
		let handle = self
			.state
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.handle
			.take();
		if let Some(handle) = handle {
			if let Err(e) = handle.await {
				error!("{} replication task failed: {}", self.name, e);
			}
		}
	}
}

impl Drop for Replicator {
	fn drop(&mut self) {
		let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
		if let Some(cancel) = state.cancel.take() {
			cancel.cancel();
		}
	}
}

struct ReplicationLoop {
	name: Arc<str>,
	delegate: Arc<dyn Replicate>,
	limiter: Arc<RateLimiter>,
	retry_delay: Duration,
	metrics: Option<Arc<MetricsRegistry>>,
	last_remote_index: Arc<AtomicU64>,
}

impl ReplicationLoop {
	async fn run(self, cancel: CancellationToken) {
		let mut last = 0;
		self.last_remote_index.store(0, Ordering::SeqCst);

		loop {
			if self.limiter.wait(&cancel).await.is_err() {
				break;
			}

			match self.delegate.replicate(&cancel, last).await {
				Ok(PassOutcome::Exit) => break,
				Ok(PassOutcome::Synced { index, .. }) => {
					if index != last {
						debug!("{} replication synced to remote index {}", self.name, index);
					}
					last = index;
					self.last_remote_index.store(index, Ordering::SeqCst);
					self.record(true, index);
				}
				Err(ReplicationError::Cancelled) => break,
				Err(e) => {
					if e.is_redacted() {
						warn!(
							"{} replication cannot proceed, the replication token lacks the privileges to read secrets",
							self.name
						);
					} else {
						error!("{} replication error (will retry if still leader): {}", self.name, e);
					}
					last = 0;
					self.last_remote_index.store(0, Ordering::SeqCst);
					self.record(false, 0);

					tokio::select! {
						_ = cancel.cancelled() => break,
						_ = tokio::time::sleep(self.retry_delay) => {}
					}
				}
			}

			if cancel.is_cancelled() {
				break;
			}
		}

		debug!("{} replication loop exited", self.name);
	}

	fn record(&self, ok: bool, index: u64) {
		let Some(metrics) = &self.metrics else {
			return;
		};
		metrics
			.replication_status
			.with_label_values(&[&*self.name])
			.set(if ok { 1 } else { 0 });
		metrics
			.replication_index
			.with_label_values(&[&*self.name])
			.set(index as i64);
		if !ok {
			metrics
				.replication_errors_total
				.with_label_values(&[&*self.name])
				.inc();
		}
	}
}
