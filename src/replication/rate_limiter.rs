use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::ReplicationError;

/// Token bucket holding up to `capacity` tokens, refilled continuously at
/// `refill_per_sec`. Starts full.
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last_refill: Instant,
}

impl TokenBucket {
	fn new(capacity: usize, refill_per_sec: f64) -> Self {
		Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec,
			last_refill: Instant::now(),
		}
	}

	fn refill(&mut self) {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
		self.last_refill = now;
	}

	fn try_consume(&mut self) -> bool {
		self.refill();
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}

	/// Time until one whole token is available.
	fn time_to_next(&self) -> Duration {
		if self.refill_per_sec <= 0.0 {
			return Duration::from_secs(1);
		}
		Duration::from_secs_f64(((1.0 - self.tokens) / self.refill_per_sec).max(0.001))
	}
}

/// Async token-bucket limiter used to pace replication passes and reaping.
pub struct RateLimiter {
	bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
	pub fn new(rate_per_sec: f64, burst: usize) -> Self {
		Self {
			bucket: Mutex::new(TokenBucket::new(burst, rate_per_sec)),
		}
	}

	/// Wait for a token, giving up with [`ReplicationError::Cancelled`] once
	/// `cancel` fires.
	pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ReplicationError> {
		loop {
			let delay = {
				let mut bucket = self.bucket.lock().await;
				if bucket.try_consume() {
					return Ok(());
				}
				bucket.time_to_next()
			};

			tokio::select! {
				_ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
				_ = tokio::time::sleep(delay) => {}
			}
		}
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn burst_is_immediate() {
		let limiter = RateLimiter::new(1.0, 2);
		let cancel = CancellationToken::new();
		let start = Instant::now();

		limiter.wait(&cancel).await.unwrap();
		limiter.wait(&cancel).await.unwrap();
		assert!(start.elapsed() < Duration::from_millis(10));

		limiter.wait(&cancel).await.unwrap();
		assert!(start.elapsed() >= Duration::from_millis(990));
	}

	#[tokio::test(start_paused = true)]
	async fn wait_refills_at_rate() {
		let limiter = RateLimiter::new(10.0, 1);
		let cancel = CancellationToken::new();
		let start = Instant::now();

		limiter.wait(&cancel).await.unwrap();
		limiter.wait(&cancel).await.unwrap();
		limiter.wait(&cancel).await.unwrap();

		let elapsed = start.elapsed();
		assert!(elapsed >= Duration::from_millis(190), "{elapsed:?}");
		assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
	}

	#[tokio::test]
	async fn wait_observes_cancellation() {
		let limiter = RateLimiter::new(0.0, 1);
		let cancel = CancellationToken::new();
		limiter.wait(&cancel).await.unwrap();

		cancel.cancel();
		let err = limiter.wait(&cancel).await.unwrap_err();
		assert!(matches!(err, ReplicationError::Cancelled));
	}
}
