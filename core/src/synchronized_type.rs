use std::sync::Arc;

use tracing::{debug, instrument};

use crate::{
	change_manager::ChangeManager,
	lock_table::{AutoLock, LockId},
	view::{RefreshReport, TypeView, TypeViewItem},
	Error, Item, ItemKey,
};

/// A [`TypeView`] that can also be written to.
///
/// Writes land in the local store and the view right away, and are queued on the record's
/// [`ChangeManager`] for the next commit.
#[derive(Clone)]
pub struct SynchronizedType {
	view: Arc<TypeView>,
	changes: Arc<ChangeManager>,
}

impl SynchronizedType {
	#[must_use]
	pub fn new(view: Arc<TypeView>, changes: Arc<ChangeManager>) -> Self {
		Self { view, changes }
	}

	#[must_use]
	pub const fn view(&self) -> &Arc<TypeView> {
		&self.view
	}

	#[must_use]
	pub fn type_id(&self) -> &str {
		self.view.type_id()
	}

	#[must_use]
	pub const fn changes(&self) -> &Arc<ChangeManager> {
		&self.changes
	}

	fn check_type(&self, item: &Item) -> Result<(), Error> {
		if item.type_id == self.type_id() {
			Ok(())
		} else {
			Err(Error::TypeMismatch {
				expected: self.type_id().to_string(),
				found: item.type_id.clone(),
			})
		}
	}

	/// Adds an item that doesn't exist remotely yet. It keeps a local key until committed.
	///
	/// Returns the item as stored.
	pub fn add_new_item(&self, mut item: Item) -> Result<Item, Error> {
		self.check_type(&item)?;

		if !item.key.is_local() {
			item.key = ItemKey::new_local();
		}

		let lock = self.changes.locks().new_auto_lock(&item.key.id);
		self.put_item(&item, lock.id())?;

		Ok(item)
	}

	/// Writes `item`, which must be locked with `lock`.
	#[instrument(skip(self, item), fields(type_id = %item.type_id, key = %item.key), err)]
	pub fn put_item(&self, item: &Item, lock: LockId) -> Result<(), Error> {
		self.check_type(item)?;
		self.changes.track_put(item, lock)?;
		self.view.put_item(item)?;

		self.view.save()
	}

	/// Locks the item at `index` and loads a copy of it to edit.
	///
	/// Returns `None` when there is no such entry or its body can't be found.
	pub async fn open_item_for_edit(
		&self,
		index: usize,
	) -> Result<Option<ItemEditOperation>, Error> {
		let Some(entry) = self.view.item_at(index) else {
			return Ok(None);
		};

		self.open_item_for_edit_with_key(&entry.key).await
	}

	pub async fn open_item_for_edit_with_key(
		&self,
		key: &ItemKey,
	) -> Result<Option<ItemEditOperation>, Error> {
		let lock = self
			.changes
			.locks()
			.try_new_auto_lock(&key.id)
			.ok_or_else(|| Error::ItemLocked(key.id.clone()))?;

		let Some(item) = self
			.view
			.store()
			.get_items(std::slice::from_ref(key))
			.await?
			.into_iter()
			.next()
			.flatten()
		else {
			debug!(%key, "Nothing to edit");
			return Ok(None);
		};

		Ok(Some(ItemEditOperation {
			sync_type: self.clone(),
			lock,
			original: item.clone(),
			item,
		}))
	}

	/// Removes the item locally and queues its removal. Returns whether the view had it.
	#[instrument(skip(self), err)]
	pub fn remove_item_with_key(&self, key: &ItemKey) -> Result<bool, Error> {
		let mut lock = self
			.changes
			.locks()
			.try_new_auto_lock(&key.id)
			.ok_or_else(|| Error::ItemLocked(key.id.clone()))?;

		self.changes.track_remove(self.type_id(), key, lock.id())?;
		let removed = self.view.remove_item_by_id(&key.id)?;
		lock.release();

		if removed.is_some() {
			self.view.save()?;
		}

		Ok(removed.is_some())
	}

	pub fn remove_item_at_index(&self, index: usize) -> Result<Option<TypeViewItem>, Error> {
		let Some(entry) = self.view.item_at(index) else {
			return Ok(None);
		};

		self.remove_item_with_key(&entry.key)?;
		Ok(Some(entry))
	}

	pub fn has_pending_changes(&self) -> Result<bool, Error> {
		self.changes.has_pending_changes_for_type(self.type_id())
	}

	/// See [`TypeView::refresh`], skipped while this type has pending changes.
	pub async fn refresh(&self) -> Result<Option<RefreshReport>, Error> {
		self.view.refresh().await
	}
}

/// An item checked out for editing, holding its lock until committed or cancelled.
pub struct ItemEditOperation {
	sync_type: SynchronizedType,
	lock: AutoLock,
	original: Item,
	item: Item,
}

impl ItemEditOperation {
	#[must_use]
	pub const fn item(&self) -> &Item {
		&self.item
	}

	pub fn item_mut(&mut self) -> &mut Item {
		&mut self.item
	}

	/// The item as it was when opened
	#[must_use]
	pub const fn original(&self) -> &Item {
		&self.original
	}

	#[must_use]
	pub fn is_modified(&self) -> bool {
		self.item != self.original
	}

	/// Whether the edit still holds its lock. A lost lock makes [`Self::commit`] fail.
	#[must_use]
	pub fn is_valid(&self) -> bool {
		self.lock.is_valid()
	}

	pub fn commit(mut self) -> Result<(), Error> {
		let res = self.sync_type.put_item(&self.item, self.lock.id());
		self.lock.release();
		res
	}

	pub fn cancel(mut self) {
		self.lock.release();
	}
}
