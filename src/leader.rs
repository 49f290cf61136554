use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Proof that this node currently leads its datacenter. Work bound to it is
/// cancelled when leadership is revoked.
#[derive(Debug, Clone)]
pub struct Leadership {
	token: CancellationToken,
}

impl Leadership {
	pub fn acquire() -> Self {
		Self {
			token: CancellationToken::new(),
		}
	}

	pub fn revoke(&self) {
		self.token.cancel();
	}

	pub fn is_held(&self) -> bool {
		!self.token.is_cancelled()
	}

	/// Token cancelled on revocation, or independently by its holder.
	pub fn child_token(&self) -> CancellationToken {
		self.token.child_token()
	}
}

struct Routine {
	cancel: CancellationToken,
	handle: JoinHandle<()>,
}

impl Routine {
	fn is_running(&self) -> bool {
		!self.cancel.is_cancelled() && !self.handle.is_finished()
	}
}

/// Named background routines that only run while leadership is held. At most
/// one routine per name is active at a time.
#[derive(Default)]
pub struct LeaderRoutineManager {
	routines: Mutex<HashMap<String, Routine>>,
}

impl LeaderRoutineManager {
	pub fn new() -> Self {
		Self::default()
	}

	/// Start `routine` under `name` unless a routine with that name is still
	/// running. Returns whether it was started.
	pub fn start<F, Fut>(&self, leadership: &Leadership, name: &str, routine: F) -> bool
	where
		F: FnOnce(CancellationToken) -> Fut,
		Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
	{
		let mut routines = self.routines.lock().unwrap_or_else(PoisonError::into_inner);
		if routines.get(name).is_some_and(Routine::is_running) {
			return false;
		}
		if !leadership.is_held() {
			return false;
		}

		let cancel = leadership.child_token();
		let fut = routine(cancel.clone());
		let owned_name = name.to_string();
		let handle = tokio::spawn(async move {
			match fut.await {
				Ok(()) => debug!("leader routine {} exited", owned_name),
				Err(e) => error!("leader routine {} failed: {:#}", owned_name, e),
			}
		});

		routines.insert(name.to_string(), Routine { cancel, handle });
		info!("started leader routine {}", name);
		true
	}

	/// Cancel the routine named `name`. Returns whether one was registered.
	pub fn stop(&self, name: &str) -> bool {
		let routine = self
			.routines
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(name);
		match routine {
			Some(routine) => {
				routine.cancel.cancel();
				info!("stopped leader routine {}", name);
				true
			}
			None => false,
		}
	}

	pub fn is_running(&self, name: &str) -> bool {
		self.routines
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(name)
			.is_some_and(Routine::is_running)
	}

	pub fn stop_all(&self) {
		let drained: Vec<(String, Routine)> = self
			.routines
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.drain()
			.collect();
		for (name, routine) in drained {
			routine.cancel.cancel();
			debug!("stopped leader routine {}", name);
		}
	}

	/// Wait for the routine named `name` to exit, if it is registered.
	pub async fn join(&self, name: &str) {
		let routine = self
			.routines
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(name);
		if let Some(routine) = routine {
			if let Err(e) = routine.handle.await {
				error!("leader routine {} panicked: {}", name, e);
			}
		}
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[tokio::test]
	async fn one_routine_per_name() {
		let manager = LeaderRoutineManager::new();
		let leadership = Leadership::acquire();
		let started = Arc::new(AtomicUsize::new(0));

		for _ in 0..3 {
			let started = Arc::clone(&started);
			manager.start(&leadership, "reaper", move |cancel| async move {
				started.fetch_add(1, Ordering::SeqCst);
				cancel.cancelled().await;
				Ok::<(), anyhow::Error>(())
			});
		}
		tokio::task::yield_now().await;
		assert!(manager.is_running("reaper"));

		assert!(manager.stop("reaper"));
		assert!(!manager.is_running("reaper"));
		assert!(!manager.stop("reaper"));
		assert_eq!(started.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn revoking_leadership_cancels_routines() {
		let manager = LeaderRoutineManager::new();
		let leadership = Leadership::acquire();

		manager.start(&leadership, "a", |cancel| async move {
			cancel.cancelled().await;
			Ok::<(), anyhow::Error>(())
		});
		manager.start(&leadership, "b", |cancel| async move {
			cancel.cancelled().await;
			Err::<(), _>(anyhow::anyhow!("interrupted"))
		});

		leadership.revoke();
		assert!(!manager.is_running("a"));
		manager.join("a").await;
		manager.join("b").await;

		assert!(!manager.start(&leadership, "a", |_| async { Ok::<(), anyhow::Error>(()) }));
	}

	#[tokio::test]
	async fn finished_routine_can_restart() {
		let manager = LeaderRoutineManager::new();
		let leadership = Leadership::acquire();

		assert!(manager.start(&leadership, "once", |_| async { Ok::<(), anyhow::Error>(()) }));
		while manager.is_running("once") {
			tokio::task::yield_now().await;
		}
		assert!(manager.start(&leadership, "once", |_| async { Ok::<(), anyhow::Error>(()) }));
		manager.stop_all();
	}
}
