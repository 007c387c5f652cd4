use hv_object_store::{report_error, CachingStore, Directory, ObjectStore};

use std::{collections::HashMap, path::Path, sync::Arc};

use itertools::Itertools;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::{
	commit::CommitReport,
	config::VaultConfig,
	event::{EventBus, VaultEvent},
	record_store::LocalRecordStore,
	Error, ItemTypeRegistry, RecordId, RemoteVault,
};

/// The offline store of every record, one [`LocalRecordStore`] per record.
pub struct LocalVault {
	root: Arc<dyn ObjectStore>,
	config: Arc<VaultConfig>,
	remote: Arc<dyn RemoteVault>,
	types: Arc<ItemTypeRegistry>,
	events: EventBus,
	records: Mutex<HashMap<RecordId, Arc<LocalRecordStore>>>,
}

impl LocalVault {
	/// Opens the vault kept in the directory at `path`.
	pub fn open(
		path: impl AsRef<Path>,
		config: VaultConfig,
		remote: Arc<dyn RemoteVault>,
	) -> Result<Self, Error> {
		let dir = Directory::open(path)?;
		info!(path = %dir.path().display(), "Opening local vault");

		Ok(Self::with_store(Arc::new(dir), config, remote))
	}

	#[must_use]
	pub fn with_store(
		store: Arc<dyn ObjectStore>,
		config: VaultConfig,
		remote: Arc<dyn RemoteVault>,
	) -> Self {
		let root: Arc<dyn ObjectStore> = if config.cache_enabled {
			Arc::new(CachingStore::new(store))
		} else {
			store
		};

		Self {
			root,
			events: EventBus::new(config.commit.broadcast_events),
			config: Arc::new(config),
			remote,
			types: Arc::new(ItemTypeRegistry::new()),
			records: Mutex::default(),
		}
	}

	/// Views are only created for types known to `types`.
	#[must_use]
	pub fn with_type_registry(mut self, types: ItemTypeRegistry) -> Self {
		self.types = Arc::new(types);
		self
	}

	#[must_use]
	pub fn config(&self) -> &VaultConfig {
		&self.config
	}

	#[must_use]
	pub const fn events(&self) -> &EventBus {
		&self.events
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
		self.events.subscribe()
	}

	/// Opens the store of `record`, creating it on first use.
	pub fn record_store(&self, record: &RecordId) -> Result<Arc<LocalRecordStore>, Error> {
		let mut records = self.records.lock();

		if let Some(store) = records.get(record) {
			return Ok(Arc::clone(store));
		}

		let store = Arc::new(LocalRecordStore::open(
			record.clone(),
			self.root.new_child_store(record.as_str())?,
			Arc::clone(&self.remote),
			Arc::clone(&self.types),
			Arc::clone(&self.config),
			self.events.clone(),
		)?);

		records.insert(record.clone(), Arc::clone(&store));

		Ok(store)
	}

	/// Records with anything stored offline, open or not.
	pub fn record_ids(&self) -> Result<Vec<RecordId>, Error> {
		let open = self.records.lock().keys().cloned().collect::<Vec<_>>();

		Ok(self
			.root
			.child_store_names()?
			.into_iter()
			.map(RecordId::new)
			.chain(open)
			.sorted()
			.dedup()
			.collect())
	}

	#[instrument(skip(self), err)]
	pub fn delete_record_store(&self, record: &RecordId) -> Result<bool, Error> {
		if let Some(store) = self.records.lock().remove(record) {
			store.changes().cancel_active_commits();
		}

		self.root
			.delete_child_store(record.as_str())
			.map_err(Into::into)
	}

	pub fn reset_data_store_for_records(&self, records: &[RecordId]) -> Result<(), Error> {
		for record in records {
			self.record_store(record)?.reset()?;
		}

		Ok(())
	}

	/// Forgets record stores nobody holds and drops in-memory caches.
	pub fn did_receive_memory_warning(&self) {
		let evicted = {
			let mut records = self.records.lock();
			let before = records.len();
			records.retain(|_, store| Arc::strong_count(store) > 1 || store.changes().is_busy());
			before - records.len()
		};

		debug!(evicted, "Memory warning handled");
		self.clear_cache();
	}

	pub fn clear_cache(&self) {
		self.root.clear_cache();

		for store in self.records.lock().values() {
			store.clear_cache();
		}
	}

	/// Commits pending changes of every record.
	///
	/// A record whose run fails is logged and left for the next run, the others still commit.
	pub async fn commit_offline_changes(&self) -> Result<Vec<(RecordId, CommitReport)>, Error> {
		let records = self.record_ids()?;
		self.commit_offline_changes_for_records(&records).await
	}

	#[instrument(skip_all, fields(records = records.len()), err)]
	pub async fn commit_offline_changes_for_records(
		&self,
		records: &[RecordId],
	) -> Result<Vec<(RecordId, CommitReport)>, Error> {
		let mut reports = Vec::with_capacity(records.len());

		for record in records {
			let store = self.record_store(record)?;

			if !store.changes().has_pending_changes()? {
				continue;
			}

			let res = store.commit_offline_changes().await;
			report_error(&res);

			if let Ok(Some(report)) = res {
				reports.push((record.clone(), report));
			}
		}

		Ok(reports)
	}

	/// Returns how many runs were asked to stop.
	pub fn cancel_active_commits(&self) -> usize {
		let stores = self.records.lock().values().cloned().collect::<Vec<_>>();

		let cancelled = stores
			.iter()
			.filter(|store| store.changes().cancel_active_commits())
			.count();

		if cancelled > 0 {
			warn!(cancelled, "Cancelled active commits");
		}

		cancelled
	}

	#[must_use]
	pub fn is_committing(&self) -> bool {
		self.records
			.lock()
			.values()
			.any(|store| store.changes().is_busy())
	}
}
