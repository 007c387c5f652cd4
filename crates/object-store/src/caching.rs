use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use mini_moka::sync::Cache;
use parking_lot::Mutex;

use super::{Error, ObjectStore};

const DEFAULT_CAPACITY: u64 = 512;

/// Keeps recently read blobs in memory in front of another [`ObjectStore`].
///
/// Writes go straight through to the inner store. [`ObjectStore::clear_cache`] drops every
/// cached blob, here and in every child store opened through this one.
pub struct CachingStore {
	inner: Arc<dyn ObjectStore>,
	capacity: u64,
	cache: Cache<String, Arc<[u8]>>,
	children: Mutex<HashMap<String, Arc<CachingStore>>>,
}

impl CachingStore {
	#[must_use]
	pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
		Self::with_capacity(inner, DEFAULT_CAPACITY)
	}

	/// At most `capacity` blobs are kept, least useful ones are evicted first.
	#[must_use]
	pub fn with_capacity(inner: Arc<dyn ObjectStore>, capacity: u64) -> Self {
		let capacity = capacity.max(1);

		Self {
			inner,
			capacity,
			cache: Cache::new(capacity),
			children: Mutex::default(),
		}
	}

	#[must_use]
	pub fn is_cached(&self, key: &str) -> bool {
		self.cache.contains_key(&key.to_string())
	}

	fn remember(&self, key: &str, blob: &[u8]) {
		self.cache.insert(key.to_string(), blob.into());
	}
}

impl ObjectStore for CachingStore {
	fn all_keys(&self) -> Result<Vec<String>, Error> {
		self.inner.all_keys()
	}

	fn key_exists(&self, key: &str) -> bool {
		self.cache.contains_key(&key.to_string()) || self.inner.key_exists(key)
	}

	fn create_date(&self, key: &str) -> Result<Option<DateTime<Utc>>, Error> {
		self.inner.create_date(key)
	}

	fn update_date(&self, key: &str) -> Result<Option<DateTime<Utc>>, Error> {
		self.inner.update_date(key)
	}

	fn delete_key(&self, key: &str) -> Result<bool, Error> {
		self.cache.invalidate(&key.to_string());
		self.inner.delete_key(key)
	}

	fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
		if let Some(blob) = self.cache.get(&key.to_string()) {
			return Ok(Some(blob.to_vec()));
		}

		self.refresh_and_get_blob(key)
	}

	fn put_blob(&self, key: &str, blob: &[u8]) -> Result<(), Error> {
		// Invalidate first, a failed write must not leave the old blob cached
		self.cache.invalidate(&key.to_string());
		self.inner.put_blob(key, blob)?;
		self.remember(key, blob);
		Ok(())
	}

	fn refresh_and_get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
		let maybe_blob = self.inner.get_blob(key)?;

		match &maybe_blob {
			Some(blob) => self.remember(key, blob),
			None => self.cache.invalidate(&key.to_string()),
		}

		Ok(maybe_blob)
	}

	fn new_child_store(&self, name: &str) -> Result<Arc<dyn ObjectStore>, Error> {
		let mut children = self.children.lock();
		if let Some(child) = children.get(name) {
			return Ok(Arc::clone(child) as Arc<dyn ObjectStore>);
		}

		let child = Arc::new(Self::with_capacity(
			self.inner.new_child_store(name)?,
			self.capacity,
		));
		children.insert(name.to_string(), Arc::clone(&child));

		Ok(child)
	}

	fn child_store_exists(&self, name: &str) -> bool {
		self.inner.child_store_exists(name)
	}

	fn child_store_names(&self) -> Result<Vec<String>, Error> {
		self.inner.child_store_names()
	}

	fn delete_child_store(&self, name: &str) -> Result<bool, Error> {
		self.children.lock().remove(name);
		self.inner.delete_child_store(name)
	}

	fn clear_cache(&self) {
		self.cache.invalidate_all();

		for child in self.children.lock().values() {
			child.clear_cache();
		}

		self.inner.clear_cache();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::MemoryStore;

	#[test]
	fn reads_are_served_from_memory_until_cleared() {
		let inner = Arc::new(MemoryStore::new());
		let store = CachingStore::new(Arc::clone(&inner) as Arc<dyn ObjectStore>);

		store.put_blob("k", b"v1").unwrap();
		assert!(store.is_cached("k"));

		// Bypass the cache to simulate another writer
		inner.put_blob("k", b"v2").unwrap();

		assert_eq!(store.get_blob("k").unwrap(), Some(b"v1".to_vec()));
		assert_eq!(store.refresh_and_get_blob("k").unwrap(), Some(b"v2".to_vec()));

		inner.put_blob("k", b"v3").unwrap();
		store.clear_cache();

		assert!(!store.is_cached("k"));
		assert_eq!(store.get_blob("k").unwrap(), Some(b"v3".to_vec()));
	}

	#[test]
	fn deletes_and_misses_are_not_cached() {
		let inner = Arc::new(MemoryStore::new());
		let store = CachingStore::new(Arc::clone(&inner) as Arc<dyn ObjectStore>);

		store.put_blob("k", b"v").unwrap();
		assert!(store.delete_key("k").unwrap());
		assert!(!store.is_cached("k"));
		assert!(!store.key_exists("k"));

		inner.put_blob("k", b"v").unwrap();
		inner.delete_key("k").unwrap();
		assert_eq!(store.refresh_and_get_blob("k").unwrap(), None);
		assert!(!store.is_cached("k"));
	}

	#[test]
	fn clearing_reaches_child_stores() {
		let store = CachingStore::new(Arc::new(MemoryStore::new()));

		let child = store.new_child_store("data").unwrap();
		child.put_blob("k", b"v").unwrap();
		child.get_blob("k").unwrap();

		store.clear_cache();

		let child = store.new_child_store("data").unwrap();
		assert_eq!(child.get_blob("k").unwrap(), Some(b"v".to_vec()));
	}

	#[test]
	fn evicted_blobs_are_read_through() {
		let store = CachingStore::with_capacity(Arc::new(MemoryStore::new()), 2);

		let keys = (0..16).map(|i| format!("k{i}")).collect::<Vec<_>>();
		for key in &keys {
			store.put_blob(key, key.as_bytes()).unwrap();
		}

		for key in &keys {
			assert_eq!(store.get_blob(key).unwrap(), Some(key.as_bytes().to_vec()));
		}
	}
}
