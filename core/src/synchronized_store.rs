use hv_object_store::{ObjectStore, ObjectStoreExt};

use std::{collections::HashSet, sync::Arc};

use tracing::{debug, instrument, trace, warn};

use crate::{
	change::ChangeTable, view::TypeView, Error, Item, ItemKey, ItemQuery, QueryResult, RecordId,
	RemoteVault,
};

const ITEM_OBJECT_NAME: &str = "Item";

/// Outcome of a download: the items found and the keys the remote vault no longer has.
#[derive(Debug, Default)]
pub struct Downloaded {
	pub items: Vec<Item>,
	pub not_found: Vec<ItemKey>,
	/// Still in the remote vault, but it kept answering with the key only
	pub unloaded: Vec<ItemKey>,
}

/// Cache-first access to full item bodies of one record.
///
/// Items are cached by id. A cached item only satisfies a lookup for the exact key, a different
/// version counts as a miss.
pub struct SynchronizedStore {
	record: RecordId,
	remote: Arc<dyn RemoteVault>,
	items: Arc<dyn ObjectStore>,
	changes: Option<Arc<ChangeTable>>,
	max_batch: usize,
}

impl SynchronizedStore {
	pub fn new(
		record: RecordId,
		remote: Arc<dyn RemoteVault>,
		items: Arc<dyn ObjectStore>,
		max_batch: usize,
	) -> Self {
		Self {
			record,
			remote,
			items,
			changes: None,
			max_batch: max_batch.max(1),
		}
	}

	/// Downloads never overwrite items with a change pending in `changes`.
	#[must_use]
	pub fn with_change_table(mut self, changes: Arc<ChangeTable>) -> Self {
		self.changes = Some(changes);
		self
	}

	#[must_use]
	pub const fn record(&self) -> &RecordId {
		&self.record
	}

	#[must_use]
	pub fn has_pending_change(&self, type_id: &str, item_id: &str) -> bool {
		self.changes
			.as_ref()
			.is_some_and(|changes| changes.has_changes_for_item(type_id, item_id))
	}

	pub fn has_pending_changes_for_type(&self, type_id: &str) -> Result<bool, Error> {
		self.changes
			.as_ref()
			.map_or(Ok(false), |changes| changes.has_changes_for_type(type_id))
	}

	pub fn get_local_item_by_id(&self, item_id: &str) -> Result<Option<Item>, Error> {
		self.items
			.get_object(item_id, ITEM_OBJECT_NAME)
			.map_err(Into::into)
	}

	pub fn get_local_item(&self, key: &ItemKey) -> Result<Option<Item>, Error> {
		Ok(self
			.get_local_item_by_id(&key.id)?
			.filter(|item| item.key.version == key.version))
	}

	#[must_use]
	pub fn has_local_item(&self, key: &ItemKey) -> bool {
		matches!(self.get_local_item(key), Ok(Some(_)))
	}

	/// One slot per key, `None` where the exact key is not cached or could not be read.
	pub fn get_local_items<'k>(
		&self,
		keys: impl IntoIterator<Item = &'k ItemKey>,
	) -> Vec<Option<Item>> {
		keys.into_iter()
			.map(|key| {
				self.get_local_item(key).unwrap_or_else(|e| {
					warn!(item_id = %key.id, ?e, "Failed to read cached item");
					None
				})
			})
			.collect()
	}

	pub fn put_local_item(&self, item: &Item) -> Result<(), Error> {
		self.items
			.put_object(&item.key.id, ITEM_OBJECT_NAME, item)
			.map_err(Into::into)
	}

	pub fn remove_local_item(&self, item_id: &str) -> Result<bool, Error> {
		self.items.delete_key(item_id).map_err(Into::into)
	}

	/// Caches a downloaded item unless a local change to it is still pending.
	pub fn replace_local_with_downloaded(&self, item: &Item) -> Result<bool, Error> {
		if self.has_pending_change(&item.type_id, &item.key.id) {
			trace!(item_id = %item.key.id, "Kept local item with pending change");
			return Ok(false);
		}

		self.put_local_item(item)?;
		Ok(true)
	}

	/// Runs `query` against the remote vault without touching the cache.
	pub async fn query(&self, query: &ItemQuery) -> Result<QueryResult, Error> {
		self.remote
			.get_items(&self.record, query)
			.await
			.map_err(Into::into)
	}

	/// Fetches the latest version of every key, whatever version the key names, and caches it.
	#[instrument(skip_all, fields(record = %self.record, count = keys.len()), err)]
	pub async fn download_items(&self, keys: &[ItemKey]) -> Result<Downloaded, Error> {
		let mut downloaded = Downloaded::default();
		let mut remaining = keys.to_vec();

		while !remaining.is_empty() {
			let batch = remaining
				.drain(..remaining.len().min(self.max_batch))
				.collect::<Vec<_>>();

			let query = ItemQuery::default()
				.with_item_ids(batch.iter().map(|key| key.id.clone()))
				.full();

			let result = self.remote.get_items(&self.record, &query).await?;

			let (found, pending) = {
				let found_ids = result
					.items
					.iter()
					.map(|item| item.key.id.as_str())
					.collect::<HashSet<_>>();
				let pending_ids = result
					.pending
					.iter()
					.map(|pending| pending.key.id.as_str())
					.collect::<HashSet<_>>();

				let (pending, not_found): (Vec<_>, Vec<_>) = batch
					.into_iter()
					.filter(|key| !found_ids.contains(key.id.as_str()))
					.partition(|key| pending_ids.contains(key.id.as_str()));

				downloaded.not_found.extend(not_found);

				(found_ids.len(), pending)
			};

			// Bodies the service held back are asked for again, unless it made no progress
			if found == 0 {
				downloaded.unloaded.extend(pending);
			} else {
				if !pending.is_empty() {
					trace!(count = pending.len(), "Requesting held back items again");
				}
				remaining.extend(pending);
			}

			for item in &result.items {
				self.replace_local_with_downloaded(item)?;
			}

			downloaded.items.extend(result.items);
		}

		debug!(
			found = downloaded.items.len(),
			not_found = downloaded.not_found.len(),
			unloaded = downloaded.unloaded.len(),
			"Downloaded items"
		);

		Ok(downloaded)
	}

	/// Downloads `keys` and hands the outcome to `view`.
	pub async fn download_items_for_view(
		&self,
		keys: &[ItemKey],
		view: &TypeView,
	) -> Result<(), Error> {
		match self.download_items(keys).await {
			Ok(Downloaded {
				items,
				not_found,
				unloaded,
			}) => {
				if !items.is_empty() {
					view.items_retrieved(items, keys);
				}

				if !not_found.is_empty() {
					view.keys_not_retrieved(&not_found);
				}

				if !unloaded.is_empty() {
					view.keys_not_loaded(&unloaded);
				}

				Ok(())
			}
			Err(e) => {
				view.download_failed(keys, &e);
				Err(e)
			}
		}
	}

	/// Local items first, the rest from the remote vault. One slot per key.
	pub async fn get_items(&self, keys: &[ItemKey]) -> Result<Vec<Option<Item>>, Error> {
		let mut items = self.get_local_items(keys);

		let missing = keys
			.iter()
			.zip(&items)
			.filter(|(_, item)| item.is_none())
			.map(|(key, _)| key.clone())
			.collect::<Vec<_>>();

		if missing.is_empty() {
			return Ok(items);
		}

		let downloaded = self.download_items(&missing).await?;

		for (slot, key) in items.iter_mut().zip(keys) {
			if slot.is_none() {
				*slot = downloaded
					.items
					.iter()
					.find(|item| item.key.id == key.id)
					.cloned();
			}
		}

		Ok(items)
	}

	pub fn clear_cache(&self) {
		self.items.clear_cache();
	}
}
