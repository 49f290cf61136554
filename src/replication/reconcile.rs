use std::cmp::Ordering;

use super::{ReplicationError, Side};

/// Anything that can take part in a diff: a stable ID, the index it was last
/// modified at, and a digest of its content.
pub trait Replicable {
	fn id(&self) -> &str;
	fn modify_index(&self) -> u64;
	fn content_hash(&self) -> &[u8];
}

/// A listing observed at `index`. Items are not trusted to be sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<T> {
	pub index: u64,
	pub items: Vec<T>,
}

impl<T> Snapshot<T> {
	pub fn new(index: u64, items: Vec<T>) -> Self {
		Self { index, items }
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiffResult {
	/// IDs present locally but not remotely.
	pub deletions: Vec<String>,
	/// IDs missing locally or whose remote content changed since the watermark.
	pub updates: Vec<String>,
	pub local_skipped: usize,
	pub remote_skipped: usize,
}

impl DiffResult {
	pub fn is_empty(&self) -> bool {
		self.deletions.is_empty() && self.updates.is_empty()
	}
}

/// Sort references to the non-empty-ID items by ID, returning them with the
/// number of skipped items. Duplicate IDs are rejected.
fn sorted<'a, T: Replicable>(
	items: &'a [T],
	side: Side,
) -> Result<(Vec<&'a T>, usize), ReplicationError> {
	let mut refs: Vec<&T> = items.iter().filter(|i| !i.id().is_empty()).collect();
	let skipped = items.len() - refs.len();
	refs.sort_by(|a, b| a.id().cmp(b.id()));

	if let Some(pair) = refs.windows(2).find(|w| w[0].id() == w[1].id()) {
		return Err(ReplicationError::DuplicateId {
			side,
			id: pair[0].id().to_string(),
		});
	}
	Ok((refs, skipped))
}

/// Merge-diff the local and remote listings.
///
/// Remote-only IDs become updates and local-only IDs become deletions. An ID
/// present on both sides is updated only when the remote copy was modified
/// after `last_remote_index` and its content hash differs from the local one.
/// Both outputs are in ascending ID order.
pub fn diff<L, R>(
	local: &[L],
	remote: &[R],
	last_remote_index: u64,
) -> Result<DiffResult, ReplicationError>
where
	L: Replicable,
	R: Replicable,
{
	let (local, local_skipped) = sorted(local, Side::Local)?;
	let (remote, remote_skipped) = sorted(remote, Side::Remote)?;

	let mut result = DiffResult {
		local_skipped,
		remote_skipped,
		..Default::default()
	};

	let (mut l, mut r) = (0, 0);
	while l < local.len() || r < remote.len() {
		let ordering = match (local.get(l), remote.get(r)) {
			(Some(li), Some(ri)) => li.id().cmp(ri.id()),
			(Some(_), None) => Ordering::Less,
			_ => Ordering::Greater,
		};

		match ordering {
			Ordering::Less => {
				result.deletions.push(local[l].id().to_string());
				l += 1;
			}
			Ordering::Greater => {
				result.updates.push(remote[r].id().to_string());
				r += 1;
			}
			Ordering::Equal => {
				let (li, ri) = (local[l], remote[r]);
				if ri.modify_index() > last_remote_index && li.content_hash() != ri.content_hash()
				{
					result.updates.push(ri.id().to_string());
				}
				l += 1;
				r += 1;
			}
		}
	}

	Ok(result)
}
