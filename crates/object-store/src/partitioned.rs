use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::{Error, ObjectStore, ObjectStoreExt};

/// Adds a partition dimension on top of an [`ObjectStore`].
///
/// Every partition is a child store of the inner store, so enumerating or dropping a whole
/// partition never has to scan unrelated keys.
pub struct PartitionedObjectStore {
	inner: Arc<dyn ObjectStore>,
	partitions: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl PartitionedObjectStore {
	#[must_use]
	pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
		Self {
			inner,
			partitions: Mutex::default(),
		}
	}

	fn partition(&self, partition: &str) -> Result<Arc<dyn ObjectStore>, Error> {
		let mut partitions = self.partitions.lock();
		if let Some(store) = partitions.get(partition) {
			return Ok(Arc::clone(store));
		}

		let store = self.inner.new_child_store(partition)?;
		partitions.insert(partition.to_string(), Arc::clone(&store));

		Ok(store)
	}

	/// Like [`Self::partition`], but never creates an empty partition just to look into it.
	fn existing_partition(&self, partition: &str) -> Result<Option<Arc<dyn ObjectStore>>, Error> {
		if self.partitions.lock().contains_key(partition) || self.inner.child_store_exists(partition)
		{
			self.partition(partition).map(Some)
		} else {
			Ok(None)
		}
	}

	#[must_use]
	pub fn key_exists(&self, partition: &str, key: &str) -> bool {
		matches!(
			self.existing_partition(partition),
			Ok(Some(store)) if store.key_exists(key)
		)
	}

	pub fn get_object<T: DeserializeOwned>(
		&self,
		partition: &str,
		key: &str,
		name: &str,
	) -> Result<Option<T>, Error> {
		match self.existing_partition(partition)? {
			Some(store) => store.get_object(key, name),
			None => Ok(None),
		}
	}

	pub fn put_object<T: Serialize + ?Sized>(
		&self,
		partition: &str,
		key: &str,
		name: &str,
		object: &T,
	) -> Result<(), Error> {
		self.partition(partition)?.put_object(key, name, object)
	}

	pub fn delete_key(&self, partition: &str, key: &str) -> Result<bool, Error> {
		match self.existing_partition(partition)? {
			Some(store) => store.delete_key(key),
			None => Ok(false),
		}
	}

	pub fn create_date(&self, partition: &str, key: &str) -> Result<Option<DateTime<Utc>>, Error> {
		match self.existing_partition(partition)? {
			Some(store) => store.create_date(key),
			None => Ok(None),
		}
	}

	pub fn update_date(&self, partition: &str, key: &str) -> Result<Option<DateTime<Utc>>, Error> {
		match self.existing_partition(partition)? {
			Some(store) => store.update_date(key),
			None => Ok(None),
		}
	}

	/// Names of all partitions that currently exist, including empty ones.
	pub fn all_partition_keys(&self) -> Result<Vec<String>, Error> {
		self.inner.child_store_names()
	}

	pub fn all_keys_in_partition(&self, partition: &str) -> Result<Vec<String>, Error> {
		match self.existing_partition(partition)? {
			Some(store) => store.all_keys(),
			None => Ok(vec![]),
		}
	}

	pub fn delete_partition(&self, partition: &str) -> Result<bool, Error> {
		self.partitions.lock().remove(partition);

		let deleted = self.inner.delete_child_store(partition)?;
		if deleted {
			debug!(%partition, "Deleted partition");
		}

		Ok(deleted)
	}

	pub fn delete_all_partitions(&self) -> Result<(), Error> {
		for partition in self.all_partition_keys()? {
			self.delete_partition(&partition)?;
		}

		Ok(())
	}

	pub fn clear_cache(&self) {
		self.partitions.lock().clear();
		self.inner.clear_cache();
	}
}
