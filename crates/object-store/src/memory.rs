use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{validate_key, Error, ObjectStore};

#[derive(Debug, Clone)]
struct Entry {
	blob: Arc<[u8]>,
	created_at: DateTime<Utc>,
	updated_at: DateTime<Utc>,
}

/// An [`ObjectStore`] that lives entirely in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
	entries: RwLock<HashMap<String, Entry>>,
	children: RwLock<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}
}

impl ObjectStore for MemoryStore {
	fn all_keys(&self) -> Result<Vec<String>, Error> {
		let mut keys = self.entries.read().keys().cloned().collect::<Vec<_>>();
		keys.sort_unstable();
		Ok(keys)
	}

	fn key_exists(&self, key: &str) -> bool {
		self.entries.read().contains_key(key)
	}

	fn create_date(&self, key: &str) -> Result<Option<DateTime<Utc>>, Error> {
		Ok(self.entries.read().get(key).map(|entry| entry.created_at))
	}

	fn update_date(&self, key: &str) -> Result<Option<DateTime<Utc>>, Error> {
		Ok(self.entries.read().get(key).map(|entry| entry.updated_at))
	}

	fn delete_key(&self, key: &str) -> Result<bool, Error> {
		Ok(self.entries.write().remove(key).is_some())
	}

	fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
		Ok(self.entries.read().get(key).map(|entry| entry.blob.to_vec()))
	}

	fn put_blob(&self, key: &str, blob: &[u8]) -> Result<(), Error> {
		validate_key(key)?;

		let now = Utc::now();
		let mut entries = self.entries.write();
		let created_at = entries.get(key).map_or(now, |entry| entry.created_at);

		entries.insert(
			key.to_string(),
			Entry {
				blob: blob.into(),
				created_at,
				updated_at: now,
			},
		);

		Ok(())
	}

	fn new_child_store(&self, name: &str) -> Result<Arc<dyn ObjectStore>, Error> {
		validate_key(name)?;

		let child = Arc::clone(
			self.children
				.write()
				.entry(name.to_string())
				.or_default(),
		);

		Ok(child)
	}

	fn child_store_exists(&self, name: &str) -> bool {
		self.children.read().contains_key(name)
	}

	fn child_store_names(&self) -> Result<Vec<String>, Error> {
		let mut names = self.children.read().keys().cloned().collect::<Vec<_>>();
		names.sort_unstable();
		Ok(names)
	}

	fn delete_child_store(&self, name: &str) -> Result<bool, Error> {
		Ok(self.children.write().remove(name).is_some())
	}
}
