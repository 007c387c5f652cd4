//! Ordered, persistable views over the remote items of one type.

use hv_object_store::{ObjectStore, ObjectStoreExt};

use std::{collections::HashSet, ops::Range, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, sync::broadcast};
use tracing::{debug, error, instrument, trace, warn};

use crate::{
	config::{ReadAheadMode, ViewsConfig},
	synchronized_store::SynchronizedStore,
	Error, Item, ItemKey, ItemQuery,
};

mod items;
mod refresher;
mod registry;

pub use items::{TypeViewItem, TypeViewItems};
pub use refresher::{RefresherReport, TypeViewRefresher};
pub use registry::ViewRegistry;

const VIEW_OBJECT_NAME: &str = "TypeView";
const VIEW_KEY_PREFIX: &str = "view-";
const VIEW_EVENTS_CAPACITY: usize = 256;

pub(crate) fn view_key(name: &str) -> String {
	format!("{VIEW_KEY_PREFIX}{name}")
}

pub(crate) fn view_name_from_key(key: &str) -> Option<&str> {
	key.strip_prefix(VIEW_KEY_PREFIX)
}

#[derive(Debug, Clone)]
pub enum TypeViewEvent {
	/// Full items arrived. `view_changed` is set when their keys or dates moved entries around.
	ItemsAvailable {
		items: Vec<Item>,
		view_changed: bool,
	},
	/// These keys were dropped from the view because the remote vault no longer has them
	KeysNotAvailable { keys: Vec<ItemKey> },
	SynchronizationCompleted,
	SynchronizationFailed { error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
	pub added: usize,
	pub updated: usize,
	pub removed: Vec<ItemKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistedView {
	pub name: String,
	pub type_id: String,
	pub query: ItemQuery,
	pub items: TypeViewItems,
	pub last_update_date: Option<DateTime<Utc>>,
	pub max_items: Option<usize>,
}

impl PersistedView {
	pub fn load(metadata: &dyn ObjectStore, name: &str) -> Result<Option<Self>, Error> {
		metadata
			.get_object(&view_key(name), VIEW_OBJECT_NAME)
			.map_err(Into::into)
	}

	pub fn save(&self, metadata: &dyn ObjectStore) -> Result<(), Error> {
		metadata
			.put_object(&view_key(&self.name), VIEW_OBJECT_NAME, self)
			.map_err(Into::into)
	}
}

#[derive(Debug, Clone, Copy)]
struct ReadAhead {
	mode: ReadAheadMode,
	chunk_size: usize,
}

impl ReadAhead {
	fn extend(self, range: Range<usize>) -> Range<usize> {
		if self.chunk_size == 0 || range.is_empty() {
			return range;
		}

		match self.mode {
			ReadAheadMode::Page => {
				(range.start / self.chunk_size * self.chunk_size)
					..range
						.end
						.div_ceil(self.chunk_size)
						.saturating_mul(self.chunk_size)
			}
			ReadAheadMode::Sequential => range.start..range.end.saturating_add(self.chunk_size),
		}
	}
}

struct ViewState {
	items: TypeViewItems,
	query: ItemQuery,
	last_update_date: Option<DateTime<Utc>>,
	max_items: Option<usize>,
}

/// The known, ordered set of remote items of one type, with their full bodies hydrated lazily.
///
/// All mutations of the entry collection go through the view's lock, and every outcome of
/// background work is reported on the view's [`TypeViewEvent`] channel.
pub struct TypeView {
	name: String,
	type_id: String,
	store: Arc<SynchronizedStore>,
	metadata: Arc<dyn ObjectStore>,
	read_ahead: ReadAhead,
	state: RwLock<ViewState>,
	events: broadcast::Sender<TypeViewEvent>,
}

impl TypeView {
	/// An empty view over the items of `type_id` matching `query`.
	pub fn new(
		name: impl Into<String>,
		type_id: impl Into<String>,
		mut query: ItemQuery,
		store: Arc<SynchronizedStore>,
		metadata: Arc<dyn ObjectStore>,
		config: &ViewsConfig,
	) -> Self {
		let type_id = type_id.into();
		query.type_ids = vec![type_id.clone()];

		Self::from_persisted(
			PersistedView {
				name: name.into(),
				type_id,
				query,
				items: TypeViewItems::new(),
				last_update_date: None,
				max_items: config.default_max_items,
			},
			store,
			metadata,
			config,
		)
	}

	pub(crate) fn from_persisted(
		persisted: PersistedView,
		store: Arc<SynchronizedStore>,
		metadata: Arc<dyn ObjectStore>,
		config: &ViewsConfig,
	) -> Self {
		let PersistedView {
			name,
			type_id,
			query,
			items,
			last_update_date,
			max_items,
		} = persisted;

		let (events, _) = broadcast::channel(VIEW_EVENTS_CAPACITY);

		Self {
			name,
			type_id,
			store,
			metadata,
			read_ahead: ReadAhead {
				mode: config.read_ahead_mode,
				chunk_size: config.read_ahead_chunk_size,
			},
			state: RwLock::new(ViewState {
				items,
				query,
				last_update_date,
				max_items,
			}),
			events,
		}
	}

	/// Loads the view saved under `name`, if there is one.
	pub fn load(
		name: &str,
		store: Arc<SynchronizedStore>,
		metadata: Arc<dyn ObjectStore>,
		config: &ViewsConfig,
	) -> Result<Option<Self>, Error> {
		Ok(PersistedView::load(metadata.as_ref(), name)?
			.map(|persisted| Self::from_persisted(persisted, store, metadata, config)))
	}

	#[must_use]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[must_use]
	pub fn type_id(&self) -> &str {
		&self.type_id
	}

	#[must_use]
	pub fn store(&self) -> &Arc<SynchronizedStore> {
		&self.store
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<TypeViewEvent> {
		self.events.subscribe()
	}

	fn emit(&self, event: TypeViewEvent) {
		if self.events.send(event).is_err() {
			trace!(view = %self.name, "View event emitted but no subscribers");
		}
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.state.read().items.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.state.read().items.is_empty()
	}

	#[must_use]
	pub fn item_at(&self, index: usize) -> Option<TypeViewItem> {
		self.state.read().items.get(index).cloned()
	}

	#[must_use]
	pub fn item_for_id(&self, item_id: &str) -> Option<TypeViewItem> {
		self.state.read().items.get_by_id(item_id).cloned()
	}

	#[must_use]
	pub fn index_of_id(&self, item_id: &str) -> Option<usize> {
		self.state.read().items.index_of_id(item_id)
	}

	#[must_use]
	pub fn contains_id(&self, item_id: &str) -> bool {
		self.state.read().items.contains_id(item_id)
	}

	#[must_use]
	pub fn index_of_closest_date(&self, date: DateTime<Utc>) -> usize {
		self.state.read().items.index_of_closest_date(date)
	}

	#[must_use]
	pub fn min_date(&self) -> Option<DateTime<Utc>> {
		self.state.read().items.min_date()
	}

	#[must_use]
	pub fn max_date(&self) -> Option<DateTime<Utc>> {
		self.state.read().items.max_date()
	}

	/// Snapshot of every entry, in view order.
	#[must_use]
	pub fn entries(&self) -> Vec<TypeViewItem> {
		self.state.read().items.iter().cloned().collect()
	}

	#[must_use]
	pub fn keys(&self) -> Vec<ItemKey> {
		self.state
			.read()
			.items
			.iter()
			.map(|item| item.key.clone())
			.collect()
	}

	#[must_use]
	pub fn query(&self) -> ItemQuery {
		self.state.read().query.clone()
	}

	#[must_use]
	pub fn last_update_date(&self) -> Option<DateTime<Utc>> {
		self.state.read().last_update_date
	}

	#[must_use]
	pub fn max_items(&self) -> Option<usize> {
		self.state.read().max_items
	}

	pub fn set_max_items(&self, max_items: Option<usize>) {
		self.state.write().max_items = max_items;
	}

	/// Never refreshed views are always stale.
	#[must_use]
	pub fn is_stale(&self, max_age: chrono::Duration) -> bool {
		self.last_update_date()
			.map_or(true, |last| Utc::now() - last > max_age)
	}

	fn local_item(&self, key: &ItemKey) -> Option<Item> {
		self.store.get_local_item(key).unwrap_or_else(|e| {
			warn!(view = %self.name, item_id = %key.id, ?e, "Failed to read cached item");
			None
		})
	}

	/// Cached items of `range`, one slot per index, `None` where the body isn't available yet.
	///
	/// Missing bodies, plus the read-ahead window around them, are downloaded in the background
	/// and announced with [`TypeViewEvent::ItemsAvailable`].
	pub fn get_items_in_range(self: &Arc<Self>, range: Range<usize>) -> Vec<Option<Item>> {
		let keys = {
			let state = self.state.read();
			range
				.clone()
				.map(|index| state.items.get(index).map(|item| item.key.clone()))
				.collect::<Vec<_>>()
		};

		let items = keys
			.iter()
			.map(|maybe_key| maybe_key.as_ref().and_then(|key| self.local_item(key)))
			.collect::<Vec<_>>();

		let has_missing = keys
			.iter()
			.zip(&items)
			.any(|(key, item)| key.is_some() && item.is_none());

		if has_missing {
			let to_download = self.claim_downloads(self.read_ahead.extend(range));
			if !to_download.is_empty() {
				self.spawn_download(to_download);
			}
		}

		items
	}

	pub fn get_item_at_index(self: &Arc<Self>, index: usize) -> Option<Item> {
		self.get_items_in_range(index..index.saturating_add(1))
			.pop()
			.flatten()
	}

	#[must_use]
	pub fn get_local_item_at_index(&self, index: usize) -> Option<Item> {
		self.item_at(index).and_then(|item| self.local_item(&item.key))
	}

	/// Keys in `range` that aren't cached, optionally skipping those already being downloaded.
	fn missing_keys(&self, range: Range<usize>, skip_pending: bool) -> Vec<ItemKey> {
		let candidates = {
			let state = self.state.read();
			state
				.items
				.select_range(range)
				.iter()
				.filter(|item| !(skip_pending && item.is_load_pending))
				.map(|item| item.key.clone())
				.collect::<Vec<_>>()
		};

		candidates
			.into_iter()
			.filter(|key| !self.store.has_local_item(key))
			.collect()
	}

	fn set_load_pending(&self, keys: &[ItemKey], pending: bool) -> Vec<ItemKey> {
		let mut state = self.state.write();
		let mut marked = Vec::with_capacity(keys.len());

		for key in keys {
			let Some(index) = state.items.index_of_id(&key.id) else {
				continue;
			};

			if let Some(item) = state.items.get_mut(index) {
				if item.key == *key && item.is_load_pending != pending {
					item.is_load_pending = pending;
					marked.push(key.clone());
				}
			}
		}

		marked
	}

	fn claim_downloads(&self, range: Range<usize>) -> Vec<ItemKey> {
		let missing = self.missing_keys(range, true);
		self.set_load_pending(&missing, true)
	}

	fn spawn_download(self: &Arc<Self>, keys: Vec<ItemKey>) {
		let Ok(handle) = Handle::try_current() else {
			warn!(view = %self.name, "No async runtime to download items on");
			self.set_load_pending(&keys, false);
			return;
		};

		let view = Arc::clone(self);
		handle.spawn(async move {
			trace!(view = %view.name, count = keys.len(), "Downloading items in background");
			// Failures are published on the view's event channel
			let _ = view.store.download_items_for_view(&keys, &view).await;
		});
	}

	/// Downloads every missing body in `range` and waits for them.
	#[instrument(skip(self), fields(view = %self.name), err)]
	pub async fn synchronize_data_in_range(&self, range: Range<usize>) -> Result<(), Error> {
		let keys = self.missing_keys(range, false);
		if keys.is_empty() {
			return Ok(());
		}

		self.set_load_pending(&keys, true);
		self.store.download_items_for_view(&keys, self).await
	}

	pub async fn synchronize_data(&self) -> Result<(), Error> {
		let len = self.len();
		self.synchronize_data_in_range(0..len).await
	}

	/// Reconciles the view with downloaded items. Called by the synchronized store.
	pub fn items_retrieved(&self, items: Vec<Item>, requested: &[ItemKey]) {
		let mut view_changed = false;

		{
			let mut state = self.state.write();

			for item in &items {
				if state.items.contains_id(&item.key.id) {
					view_changed |= state.items.add_item(TypeViewItem::from(item));
				}
			}

			for key in requested {
				if let Some(index) = state.items.index_of_id(&key.id) {
					if let Some(entry) = state.items.get_mut(index) {
						entry.is_load_pending = false;
					}
				}
			}
		}

		debug!(view = %self.name, count = items.len(), view_changed, "Items available");
		self.emit(TypeViewEvent::ItemsAvailable {
			items,
			view_changed,
		});
	}

	/// Drops keys the remote vault no longer has. Called by the synchronized store.
	pub fn keys_not_retrieved(&self, keys: &[ItemKey]) {
		let mut dropped = Vec::with_capacity(keys.len());

		{
			let mut state = self.state.write();
			for key in keys {
				if self.store.has_pending_change(&self.type_id, &key.id) {
					continue;
				}

				if let Some(removed) = state.items.remove_by_id(&key.id) {
					dropped.push(removed.key);
				}
			}
		}

		for key in &dropped {
			if let Err(e) = self.store.remove_local_item(&key.id) {
				warn!(view = %self.name, item_id = %key.id, ?e, "Failed to drop cached item");
			}
		}

		if !dropped.is_empty() {
			debug!(view = %self.name, count = dropped.len(), "Keys not available");
			self.emit(TypeViewEvent::KeysNotAvailable { keys: dropped });
		}
	}

	/// Keys still in the remote vault whose bodies didn't come back, left for a later read.
	pub(crate) fn keys_not_loaded(&self, keys: &[ItemKey]) {
		let released = self.set_load_pending(keys, false);
		debug!(view = %self.name, count = released.len(), "Items left unloaded");
	}

	pub(crate) fn download_failed(&self, keys: &[ItemKey], e: &Error) {
		error!(view = %self.name, ?e, "Failed to download items");
		self.set_load_pending(keys, false);
		self.emit(TypeViewEvent::SynchronizationFailed {
			error: e.to_string(),
		});
	}

	/// Re-queries the remote vault for the keys of this view and merges them in.
	///
	/// Returns `None` without touching anything while changes to this type are pending: the
	/// remote vault doesn't know about them yet and would drop them from the view.
	#[instrument(skip(self), fields(view = %self.name, type_id = %self.type_id), err)]
	pub async fn refresh(&self) -> Result<Option<RefreshReport>, Error> {
		if self.store.has_pending_changes_for_type(&self.type_id)? {
			debug!("Pending changes, refresh skipped");
			return Ok(None);
		}

		let query = {
			let state = self.state.read();
			let mut query = state.query.clone().keys_only();
			if let Some(max_items) = state.max_items {
				query.max_results = Some(max_items);
			}
			query
		};

		let result = match self.store.query(&query).await {
			Ok(result) => result,
			Err(e) => {
				self.emit(TypeViewEvent::SynchronizationFailed {
					error: e.to_string(),
				});
				return Err(e);
			}
		};

		// Edits may have been queued while the query was in flight
		if self.store.has_pending_changes_for_type(&self.type_id)? {
			debug!("Changes queued during refresh, result discarded");
			return Ok(None);
		}

		let fresh = result.keys().map(TypeViewItem::from).collect::<Vec<_>>();

		let report = {
			let mut state = self.state.write();

			let fresh_ids = fresh.iter().map(TypeViewItem::id).collect::<HashSet<_>>();
			let removed = state.items.items_not_in(&fresh_ids);
			for item in &removed {
				state.items.remove_by_id(item.id());
			}

			let mut report = RefreshReport {
				removed: removed.into_iter().map(|item| item.key).collect(),
				..Default::default()
			};

			for item in fresh {
				let existed = state.items.contains_id(item.id());
				if state.items.add_item(item) {
					if existed {
						report.updated += 1;
					} else {
						report.added += 1;
					}
				}
			}

			state.last_update_date = Some(Utc::now());

			report
		};

		for key in &report.removed {
			if let Err(e) = self.store.remove_local_item(&key.id) {
				warn!(item_id = %key.id, ?e, "Failed to drop cached item");
			}
		}

		self.save()?;

		debug!(
			added = report.added,
			updated = report.updated,
			removed = report.removed.len(),
			"View refreshed"
		);

		if !report.removed.is_empty() {
			self.emit(TypeViewEvent::KeysNotAvailable {
				keys: report.removed.clone(),
			});
		}
		self.emit(TypeViewEvent::SynchronizationCompleted);

		Ok(Some(report))
	}

	/// Stores `item` locally and moves its entry into place. Returns its index in the view.
	pub fn put_item(&self, item: &Item) -> Result<usize, Error> {
		self.store.put_local_item(item)?;
		Ok(self.update_item_in_view(TypeViewItem::from(item)).0)
	}

	pub fn put_items(&self, items: &[Item]) -> Result<(), Error> {
		for item in items {
			self.put_item(item)?;
		}

		Ok(())
	}

	/// Removes the entry and its cached body.
	pub fn remove_item_at_index(&self, index: usize) -> Result<Option<TypeViewItem>, Error> {
		let removed = self.state.write().items.remove_at(index);

		if let Some(item) = &removed {
			self.store.remove_local_item(item.id())?;
		}

		Ok(removed)
	}

	pub fn remove_item_by_id(&self, item_id: &str) -> Result<Option<TypeViewItem>, Error> {
		let removed = self.state.write().items.remove_by_id(item_id);

		if removed.is_some() {
			self.store.remove_local_item(item_id)?;
		}

		Ok(removed)
	}

	/// Returns `(new_index, previous_index)`.
	pub fn update_item_in_view(&self, item: TypeViewItem) -> (usize, Option<usize>) {
		self.state.write().items.update_item(item)
	}

	pub fn remove_item_from_view_by_id(&self, item_id: &str) -> bool {
		self.state.write().items.remove_by_id(item_id).is_some()
	}

	pub fn remove_items_from_view_by_id<'a>(
		&self,
		item_ids: impl IntoIterator<Item = &'a str>,
	) -> bool {
		let mut state = self.state.write();
		item_ids
			.into_iter()
			.fold(false, |changed, id| state.items.remove_by_id(id).is_some() || changed)
	}

	/// Drops the cached body but keeps the entry.
	pub fn remove_local_item_at_index(&self, index: usize) -> Result<bool, Error> {
		match self.item_at(index) {
			Some(item) => self.store.remove_local_item(item.id()),
			None => Ok(false),
		}
	}

	pub fn remove_all_local_items(&self) -> Result<(), Error> {
		for key in self.keys() {
			self.store.remove_local_item(&key.id)?;
		}

		Ok(())
	}

	/// Forgets every entry and the last refresh date.
	pub fn reset(&self) {
		let mut state = self.state.write();
		state.items.clear();
		state.last_update_date = None;
	}

	pub(crate) fn to_persisted(&self) -> PersistedView {
		let state = self.state.read();

		PersistedView {
			name: self.name.clone(),
			type_id: self.type_id.clone(),
			query: state.query.clone(),
			items: state.items.clone(),
			last_update_date: state.last_update_date,
			max_items: state.max_items,
		}
	}

	pub fn save(&self) -> Result<(), Error> {
		self.to_persisted().save(self.metadata.as_ref())?;
		trace!(view = %self.name, "Saved view");
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn page_read_ahead_aligns_to_chunks() {
		let read_ahead = ReadAhead {
			mode: ReadAheadMode::Page,
			chunk_size: 10,
		};

		assert_eq!(read_ahead.extend(3..5), 0..10);
		assert_eq!(read_ahead.extend(8..12), 0..20);
		assert_eq!(read_ahead.extend(20..21), 20..30);
		assert_eq!(read_ahead.extend(4..4), 4..4);
	}

	#[test]
	fn sequential_read_ahead_loads_the_next_chunk() {
		let read_ahead = ReadAhead {
			mode: ReadAheadMode::Sequential,
			chunk_size: 10,
		};

		assert_eq!(read_ahead.extend(3..5), 3..15);
	}

	#[test]
	fn read_ahead_stops_at_the_end_of_the_index_space() {
		let sequential = ReadAhead {
			mode: ReadAheadMode::Sequential,
			chunk_size: 10,
		};
		assert_eq!(
			sequential.extend(usize::MAX - 3..usize::MAX - 1),
			usize::MAX - 3..usize::MAX
		);

		let page = ReadAhead {
			mode: ReadAheadMode::Page,
			chunk_size: 10,
		};
		let extended = page.extend(usize::MAX - 5..usize::MAX - 1);
		assert_eq!(extended.end, usize::MAX);
		assert!(extended.start <= usize::MAX - 5);
	}

	#[test]
	fn view_keys_round_trip_names() {
		assert_eq!(view_name_from_key(&view_key("weights")), Some("weights"));
		assert_eq!(view_name_from_key("personal-image"), None);
	}
}
