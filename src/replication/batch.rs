use std::future::Future;
use std::ops::Range;
use std::time::Duration;

use log::trace;
use tokio_util::sync::CancellationToken;

use super::ReplicationError;

/// Hydrated item ready to be committed locally.
pub trait Payload {
	/// Approximate encoded size, used to budget apply batches.
	fn estimated_size(&self) -> usize;

	/// Whether the item carries a redacted secret and must never be applied.
	fn is_redacted(&self) -> bool {
		false
	}
}

/// IDs scheduled for deletion. Deletions are budgeted by count.
impl Payload for String {
	fn estimated_size(&self) -> usize {
		1
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
	Completed { batches: usize },
	/// Cancelled between batches; earlier batches stay committed.
	Aborted,
}

/// Greedily split `items` into consecutive ranges whose summed size stays at
/// or below `max`. A batch is closed when the next item would push it over the
/// ceiling, so only a single oversized item can produce a batch above `max`.
pub fn pack_batches<T, S>(items: &[T], size_of: S, max: usize) -> Vec<Range<usize>>
where
	S: Fn(&T) -> usize,
{
	let mut batches = Vec::new();
	let mut start = 0;
	let mut size = 0;

	for (i, item) in items.iter().enumerate() {
		let item_size = size_of(item);
		if i > start && size + item_size > max {
			batches.push(start..i);
			start = i;
			size = 0;
		}
		size += item_size;
	}
	if start < items.len() {
		batches.push(start..items.len());
	}
	batches
}

/// Commit `items` through `apply`, one call per packed batch.
///
/// Nothing is applied if any item is redacted. Cancellation is observed
/// before each batch and during the `min_delay` pause that separates them,
/// never while an apply is in flight.
pub async fn apply_batches<'a, T, S, F, Fut>(
	cancel: &CancellationToken,
	items: &'a [T],
	size_of: S,
	max_batch: usize,
	min_delay: Duration,
	mut apply: F,
) -> Result<Applied, ReplicationError>
where
	T: Payload,
	S: Fn(&T) -> usize,
	F: FnMut(&'a [T]) -> Fut,
	Fut: Future<Output = Result<(), ReplicationError>>,
{
	if items.iter().any(Payload::is_redacted) {
		return Err(ReplicationError::Redacted);
	}

	let batches = pack_batches(items, size_of, max_batch);
	let total = batches.len();

	for (n, range) in batches.into_iter().enumerate() {
		if cancel.is_cancelled() {
			return Ok(Applied::Aborted);
		}

		trace!("applying batch {}/{} ({} items)", n + 1, total, range.len());
		apply(&items[range]).await?;

		if n + 1 < total && !min_delay.is_zero() {
			tokio::select! {
				_ = cancel.cancelled() => return Ok(Applied::Aborted),
				_ = tokio::time::sleep(min_delay) => {}
			}
		}
	}

	Ok(Applied::Completed { batches: total })
}
