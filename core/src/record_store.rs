use hv_object_store::ObjectStore;

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::{
	change::ChangeTable,
	change_manager::{ChangeManager, CHANGE_STORE_KEY},
	commit::CommitReport,
	config::VaultConfig,
	event::EventBus,
	synchronized_store::SynchronizedStore,
	synchronized_type::SynchronizedType,
	view::{TypeView, ViewRegistry},
	Error, ItemQuery, ItemTypeRegistry, RecordId, RemoteVault,
};

const METADATA_STORE: &str = "metadata";
const DATA_STORE: &str = "data";
const PERSONAL_IMAGE_KEY: &str = "personal-image";

/// Everything kept offline for one record: cached items, saved views and pending changes.
///
/// On disk a record is a directory holding a `metadata` store for views and record level blobs,
/// and a `data` store for item bodies with the change journal nested under it.
pub struct LocalRecordStore {
	record: RecordId,
	root: Arc<dyn ObjectStore>,
	metadata: Arc<dyn ObjectStore>,
	data: Arc<dyn ObjectStore>,
	store: Arc<SynchronizedStore>,
	changes: Arc<ChangeManager>,
	views: Arc<ViewRegistry>,
	types: Arc<ItemTypeRegistry>,
	config: Arc<VaultConfig>,
}

impl LocalRecordStore {
	#[instrument(skip_all, fields(%record), err)]
	pub fn open(
		record: RecordId,
		root: Arc<dyn ObjectStore>,
		remote: Arc<dyn RemoteVault>,
		types: Arc<ItemTypeRegistry>,
		config: Arc<VaultConfig>,
		events: EventBus,
	) -> Result<Self, Error> {
		let metadata = root.new_child_store(METADATA_STORE)?;
		let data = root.new_child_store(DATA_STORE)?;

		let table = Arc::new(ChangeTable::new(data.new_child_store(CHANGE_STORE_KEY)?));

		let store = Arc::new(
			SynchronizedStore::new(
				record.clone(),
				Arc::clone(&remote),
				Arc::clone(&data),
				config.views.max_download_batch,
			)
			.with_change_table(Arc::clone(&table)),
		);

		let views = Arc::new(ViewRegistry::new(Arc::clone(&metadata)));

		let changes = Arc::new(ChangeManager::new(
			record.clone(),
			remote,
			table,
			Arc::clone(&store),
			Arc::clone(&views),
			events,
			config.commit.clone(),
		));

		debug!("Opened record store");

		Ok(Self {
			record,
			root,
			metadata,
			data,
			store,
			changes,
			views,
			types,
			config,
		})
	}

	#[must_use]
	pub const fn record(&self) -> &RecordId {
		&self.record
	}

	#[must_use]
	pub const fn changes(&self) -> &Arc<ChangeManager> {
		&self.changes
	}

	#[must_use]
	pub const fn store(&self) -> &Arc<SynchronizedStore> {
		&self.store
	}

	#[must_use]
	pub const fn views(&self) -> &Arc<ViewRegistry> {
		&self.views
	}

	/// Creates and saves an empty view, replacing any saved view of the same name.
	pub fn create_view(
		&self,
		name: &str,
		type_id: &str,
		query: ItemQuery,
	) -> Result<Arc<TypeView>, Error> {
		self.types.validate(type_id)?;

		let view = Arc::new(TypeView::new(
			name,
			type_id,
			query,
			Arc::clone(&self.store),
			Arc::clone(&self.metadata),
			&self.config.views,
		));

		view.save()?;
		self.views.register(&view);

		Ok(view)
	}

	/// The open view named `name`, or the saved one.
	pub fn load_view(&self, name: &str) -> Result<Option<Arc<TypeView>>, Error> {
		if let Some(view) = self.views.get_open(name) {
			return Ok(Some(view));
		}

		let Some(view) = TypeView::load(
			name,
			Arc::clone(&self.store),
			Arc::clone(&self.metadata),
			&self.config.views,
		)?
		else {
			return Ok(None);
		};

		let view = Arc::new(view);
		self.views.register(&view);

		Ok(Some(view))
	}

	pub fn delete_view(&self, name: &str) -> Result<bool, Error> {
		self.views.delete_view(name)
	}

	#[must_use]
	pub fn synchronized_type(&self, view: Arc<TypeView>) -> SynchronizedType {
		SynchronizedType::new(view, Arc::clone(&self.changes))
	}

	/// A writable view of every item of `type_id`, saved under the type id.
	pub fn synchronized_type_for(&self, type_id: &str) -> Result<SynchronizedType, Error> {
		let view = match self.load_view(type_id)? {
			Some(view) => view,
			None => self.create_view(type_id, type_id, ItemQuery::for_type(type_id))?,
		};

		Ok(self.synchronized_type(view))
	}

	pub fn personal_image(&self) -> Result<Option<Vec<u8>>, Error> {
		self.metadata
			.get_blob(PERSONAL_IMAGE_KEY)
			.map_err(Into::into)
	}

	pub fn put_personal_image(&self, image: &[u8]) -> Result<(), Error> {
		self.metadata
			.put_blob(PERSONAL_IMAGE_KEY, image)
			.map_err(Into::into)
	}

	pub fn delete_personal_image(&self) -> Result<bool, Error> {
		self.metadata
			.delete_key(PERSONAL_IMAGE_KEY)
			.map_err(Into::into)
	}

	/// Drops cached items, saved views and pending changes.
	#[instrument(skip(self), fields(record = %self.record), err)]
	pub fn reset(&self) -> Result<(), Error> {
		if self.changes.cancel_active_commits() {
			warn!("Resetting a record with a commit in flight");
		}

		self.changes.table().remove_all()?;

		for key in self.data.all_keys()? {
			self.data.delete_key(&key)?;
		}

		self.views.reset()?;

		info!("Record store reset");
		Ok(())
	}

	pub fn clear_cache(&self) {
		self.root.clear_cache();
		self.store.clear_cache();
		self.changes.table().clear_cache();
	}

	pub async fn commit_offline_changes(&self) -> Result<Option<CommitReport>, Error> {
		self.changes.commit_changes().await
	}
}
