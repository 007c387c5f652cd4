use hv_object_store::{ObjectStore, PartitionedObjectStore};

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

use super::{Change, ChangeQueue, ChangeType};
use crate::{Error, Item, ItemKey};

const CHANGE_OBJECT_NAME: &str = "Change";

/// Durable journal of pending changes, partitioned by type id and keyed by item id.
///
/// Holds at most one change per item: tracking another mutation of an item folds it into the
/// change already pending for it.
pub struct ChangeTable {
	store: PartitionedObjectStore,
	// Serializes read-modify-write cycles and keeps timestamps strictly increasing
	last_timestamp: Mutex<DateTime<Utc>>,
}

impl ChangeTable {
	#[must_use]
	pub fn new(store: Arc<dyn ObjectStore>) -> Self {
		Self {
			store: PartitionedObjectStore::new(store),
			last_timestamp: Mutex::new(DateTime::<Utc>::MIN_UTC),
		}
	}

	fn next_timestamp(last: &mut DateTime<Utc>) -> DateTime<Utc> {
		let now = Utc::now();
		*last = if now > *last {
			now
		} else {
			*last + Duration::microseconds(1)
		};
		*last
	}

	/// Records a mutation of `key`, merging it with any change already pending for the item.
	///
	/// Returns the id of the pending change, or `None` when nothing is left to commit: removing
	/// an item that was never committed cancels its pending put.
	#[instrument(skip(self, local_item), fields(item_id = %key.id), err)]
	pub fn track_change(
		&self,
		change_type: ChangeType,
		type_id: &str,
		key: &ItemKey,
		local_item: Option<Item>,
	) -> Result<Option<String>, Error> {
		let mut last = self.last_timestamp.lock();

		let Some(mut change) = self.get(type_id, &key.id)? else {
			if change_type == ChangeType::Remove && key.is_local() {
				trace!("Removed an item that was never committed, nothing to track");
				return Ok(None);
			}

			let change = Change::new(
				change_type,
				type_id,
				key.clone(),
				local_item,
				Self::next_timestamp(&mut last),
			);
			self.write(&change)?;
			debug!(change_id = %change.change_id, ?change_type, "Tracked new change");

			return Ok(Some(change.change_id));
		};

		match (change.change_type, change_type) {
			(ChangeType::Put, ChangeType::Put) => {
				change.key = key.clone();
				change.local_item = local_item;
			}

			(ChangeType::Put, ChangeType::Remove) => {
				if change.current_key().is_local() {
					self.delete(type_id, &key.id)?;
					debug!(
						change_id = %change.change_id,
						"Remove cancelled a put that was never committed"
					);
					return Ok(None);
				}

				change.change_type = ChangeType::Remove;
				change.local_item = None;
				change.updated_item = None;
			}

			(ChangeType::Remove, ChangeType::Put) => {
				return Err(Error::PendingRemove {
					type_id: type_id.to_string(),
					item_id: key.id.clone(),
				});
			}

			(ChangeType::Remove, ChangeType::Remove) => {}
		}

		change.timestamp = Self::next_timestamp(&mut last);
		self.write(&change)?;
		debug!(change_id = %change.change_id, change_type = ?change.change_type, "Updated pending change");

		Ok(Some(change.change_id))
	}

	pub fn get(&self, type_id: &str, item_id: &str) -> Result<Option<Change>, Error> {
		self.store
			.get_object(type_id, item_id, CHANGE_OBJECT_NAME)
			.map_err(Into::into)
	}

	/// Overwrites the pending change for the same item.
	pub fn put(&self, change: &Change) -> Result<(), Error> {
		let _guard = self.last_timestamp.lock();
		self.write(change)
	}

	/// Applies `update` to the pending change of an item, if there is one, and persists it.
	pub fn update(
		&self,
		type_id: &str,
		item_id: &str,
		update: impl FnOnce(&mut Change),
	) -> Result<Option<Change>, Error> {
		let _guard = self.last_timestamp.lock();

		let Some(mut change) = self.get(type_id, item_id)? else {
			return Ok(None);
		};

		update(&mut change);
		self.write(&change)?;

		Ok(Some(change))
	}

	fn write(&self, change: &Change) -> Result<(), Error> {
		self.store
			.put_object(
				&change.type_id,
				change.item_id(),
				CHANGE_OBJECT_NAME,
				change,
			)
			.map_err(Into::into)
	}

	fn delete(&self, type_id: &str, item_id: &str) -> Result<bool, Error> {
		self.store.delete_key(type_id, item_id).map_err(Into::into)
	}

	pub fn remove(&self, type_id: &str, item_id: &str) -> Result<bool, Error> {
		let _guard = self.last_timestamp.lock();
		self.delete(type_id, item_id)
	}

	/// Removes the change only if it is still the one identified by `change_id`.
	pub fn remove_if_current(
		&self,
		type_id: &str,
		item_id: &str,
		change_id: &str,
	) -> Result<bool, Error> {
		let _guard = self.last_timestamp.lock();

		match self.get(type_id, item_id)? {
			Some(change) if change.change_id == change_id => self.delete(type_id, item_id),
			_ => Ok(false),
		}
	}

	pub fn remove_all_for_type(&self, type_id: &str) -> Result<bool, Error> {
		let _guard = self.last_timestamp.lock();
		self.store.delete_partition(type_id).map_err(Into::into)
	}

	pub fn remove_all(&self) -> Result<(), Error> {
		let _guard = self.last_timestamp.lock();
		self.store.delete_all_partitions().map_err(Into::into)
	}

	#[must_use]
	pub fn has_changes_for_item(&self, type_id: &str, item_id: &str) -> bool {
		self.store.key_exists(type_id, item_id)
	}

	pub fn has_changes_for_type(&self, type_id: &str) -> Result<bool, Error> {
		Ok(!self.store.all_keys_in_partition(type_id)?.is_empty())
	}

	pub fn has_changes(&self) -> Result<bool, Error> {
		Ok(!self.get_all_types_with_changes()?.is_empty())
	}

	/// Sorted type ids that have at least one pending change.
	pub fn get_all_types_with_changes(&self) -> Result<Vec<String>, Error> {
		let mut types = Vec::new();
		for type_id in self.store.all_partition_keys()? {
			if self.has_changes_for_type(&type_id)? {
				types.push(type_id);
			}
		}

		types.sort_unstable();
		Ok(types)
	}

	pub fn item_ids_for_type(&self, type_id: &str) -> Result<Vec<String>, Error> {
		self.store
			.all_keys_in_partition(type_id)
			.map_err(Into::into)
	}

	/// Pending changes of one type in commit order. Unreadable entries are skipped.
	pub fn get_all_for_type(&self, type_id: &str) -> Result<Vec<Change>, Error> {
		let mut changes = Vec::new();
		for item_id in self.item_ids_for_type(type_id)? {
			match self.get(type_id, &item_id) {
				Ok(Some(change)) => changes.push(change),
				Ok(None) => {}
				Err(e) => warn!(%type_id, %item_id, ?e, "Skipping unreadable change"),
			}
		}

		changes.sort_by(Change::queue_order);
		Ok(changes)
	}

	/// Every pending change, grouped by type in commit order.
	pub fn get_all(&self) -> Result<Vec<Change>, Error> {
		let mut changes = Vec::new();
		for type_id in self.get_all_types_with_changes()? {
			changes.extend(self.get_all_for_type(&type_id)?);
		}

		Ok(changes)
	}

	pub fn get_queue(&self) -> Result<ChangeQueue<'_>, Error> {
		Ok(ChangeQueue::new(self, self.get_all_types_with_changes()?))
	}

	pub fn get_queue_for_type(&self, type_id: &str) -> ChangeQueue<'_> {
		ChangeQueue::new(self, vec![type_id.to_string()])
	}

	pub fn clear_cache(&self) {
		self.store.clear_cache();
	}
}
