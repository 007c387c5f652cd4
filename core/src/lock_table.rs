use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

impl LockId {
	#[must_use]
	pub const fn get(self) -> u64 {
		self.0
	}
}

impl fmt::Display for LockId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Default)]
struct Locks {
	active: HashMap<String, LockId>,
	next: u64,
}

/// Advisory single-writer locks keyed by item id.
///
/// Acquiring never blocks: it hands out a fresh id and supersedes whoever held the key before.
/// Holders must [validate](LockTable::validate_lock) right before mutating anything.
#[derive(Debug, Default)]
pub struct LockTable {
	locks: Mutex<Locks>,
}

impl LockTable {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn acquire_lock(&self, key: &str) -> LockId {
		let mut locks = self.locks.lock();
		locks.next += 1;
		let id = LockId(locks.next);

		if let Some(previous) = locks.active.insert(key.to_string(), id) {
			debug!(%key, %previous, lock_id = %id, "Lock superseded");
		} else {
			trace!(%key, lock_id = %id, "Lock acquired");
		}

		id
	}

	/// Like [`Self::acquire_lock`], but leaves a live lock alone.
	pub fn try_acquire_lock(&self, key: &str) -> Option<LockId> {
		let mut locks = self.locks.lock();
		if locks.active.contains_key(key) {
			return None;
		}

		locks.next += 1;
		let id = LockId(locks.next);
		locks.active.insert(key.to_string(), id);
		trace!(%key, lock_id = %id, "Lock acquired");

		Some(id)
	}

	/// Returns `false` if `id` no longer holds `key`, in which case nothing is released.
	pub fn release_lock(&self, id: LockId, key: &str) -> bool {
		let mut locks = self.locks.lock();
		if locks.active.get(key) == Some(&id) {
			locks.active.remove(key);
			trace!(%key, lock_id = %id, "Lock released");
			true
		} else {
			false
		}
	}

	#[must_use]
	pub fn validate_lock(&self, id: LockId, key: &str) -> bool {
		self.locks.lock().active.get(key) == Some(&id)
	}

	#[must_use]
	pub fn is_key_locked(&self, key: &str) -> bool {
		self.locks.lock().active.contains_key(key)
	}

	/// Whether `id` was ever issued by this table.
	#[must_use]
	pub fn is_valid_lock_id(&self, id: LockId) -> bool {
		id.0 > 0 && id.0 <= self.locks.lock().next
	}

	#[must_use]
	pub fn all_locked_keys(&self) -> Vec<String> {
		let mut keys = self.locks.lock().active.keys().cloned().collect::<Vec<_>>();
		keys.sort_unstable();
		keys
	}

	#[must_use]
	pub fn describe_lock(&self, key: &str) -> Option<String> {
		self.locks
			.lock()
			.active
			.get(key)
			.map(|id| format!("<key='{key}', lock_id={id}>"))
	}

	pub fn new_auto_lock(self: &Arc<Self>, key: &str) -> AutoLock {
		AutoLock {
			id: self.acquire_lock(key),
			key: key.to_string(),
			table: Arc::clone(self),
			released: false,
		}
	}

	pub fn try_new_auto_lock(self: &Arc<Self>, key: &str) -> Option<AutoLock> {
		self.try_acquire_lock(key).map(|id| AutoLock {
			id,
			key: key.to_string(),
			table: Arc::clone(self),
			released: false,
		})
	}
}

/// A lock that releases itself when dropped.
#[derive(Debug)]
pub struct AutoLock {
	id: LockId,
	key: String,
	table: Arc<LockTable>,
	released: bool,
}

impl AutoLock {
	#[must_use]
	pub const fn id(&self) -> LockId {
		self.id
	}

	#[must_use]
	pub fn key(&self) -> &str {
		&self.key
	}

	#[must_use]
	pub fn is_valid(&self) -> bool {
		!self.released && self.table.validate_lock(self.id, &self.key)
	}

	pub fn release(&mut self) -> bool {
		if self.released {
			return false;
		}

		self.released = true;
		self.table.release_lock(self.id, &self.key)
	}
}

impl Drop for AutoLock {
	fn drop(&mut self) {
		self.release();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reacquiring_invalidates_the_first_holder() {
		let table = LockTable::new();

		let first = table.acquire_lock("item");
		assert!(table.validate_lock(first, "item"));

		let second = table.acquire_lock("item");
		assert!(second > first);
		assert!(!table.validate_lock(first, "item"));
		assert!(table.validate_lock(second, "item"));

		assert!(!table.release_lock(first, "item"));
		assert!(table.is_key_locked("item"));
		assert!(table.release_lock(second, "item"));
		assert!(!table.is_key_locked("item"));
	}

	#[test]
	fn auto_lock_releases_on_drop() {
		let table = Arc::new(LockTable::new());

		{
			let lock = table.new_auto_lock("a");
			assert!(lock.is_valid());
			assert!(table.try_new_auto_lock("a").is_none());
			assert_eq!(table.all_locked_keys(), vec!["a".to_string()]);
			assert!(table.describe_lock("a").is_some());
		}

		assert!(!table.is_key_locked("a"));
		assert!(table.try_new_auto_lock("a").is_some());
	}

	#[test]
	fn superseded_auto_lock_leaves_the_new_holder_alone() {
		let table = Arc::new(LockTable::new());

		let stale = table.new_auto_lock("a");
		let fresh = table.acquire_lock("a");

		assert!(!stale.is_valid());
		drop(stale);

		assert!(table.validate_lock(fresh, "a"));
		assert!(table.is_valid_lock_id(fresh));
		assert!(!table.is_valid_lock_id(LockId(fresh.get() + 1)));
	}
}
