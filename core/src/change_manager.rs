use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::{
	change::{Change, ChangeTable, ChangeType},
	commit::{
		CommitErrorHandler, CommitOutcome, CommitReport, DefaultCommitErrorHandler, QueueProcess,
	},
	config::CommitConfig,
	event::{EventBus, VaultEvent},
	lock_table::{LockId, LockTable},
	synchronized_store::SynchronizedStore,
	view::{TypeViewItem, ViewRegistry},
	Error, Item, ItemKey, RecordId, RemoteVault,
};

/// Key of the change journal inside a record's data store.
pub const CHANGE_STORE_KEY: &str = "changes";

/// Clears the busy flag when a commit run ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
	fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
		flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.ok()
			.map(|_| Self(flag))
	}
}

impl Drop for BusyGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}

/// Publishes the cancellation token of a commit run for as long as the run is alive.
struct ActiveRun<'a>(&'a Mutex<Option<CancellationToken>>);

impl<'a> ActiveRun<'a> {
	fn start(slot: &'a Mutex<Option<CancellationToken>>, cancel: CancellationToken) -> Self {
		*slot.lock() = Some(cancel);
		Self(slot)
	}
}

impl Drop for ActiveRun<'_> {
	fn drop(&mut self) {
		self.0.lock().take();
	}
}

/// Tracks local mutations of a record and commits them to the remote vault.
pub struct ChangeManager {
	record: RecordId,
	remote: Arc<dyn RemoteVault>,
	table: Arc<ChangeTable>,
	locks: Arc<LockTable>,
	store: Arc<SynchronizedStore>,
	views: Arc<ViewRegistry>,
	handler: Arc<dyn CommitErrorHandler>,
	events: EventBus,
	config: CommitConfig,
	is_busy: AtomicBool,
	active: Mutex<Option<CancellationToken>>,
}

impl ChangeManager {
	#[must_use]
	pub fn new(
		record: RecordId,
		remote: Arc<dyn RemoteVault>,
		table: Arc<ChangeTable>,
		store: Arc<SynchronizedStore>,
		views: Arc<ViewRegistry>,
		events: EventBus,
		config: CommitConfig,
	) -> Self {
		let events = if config.broadcast_events {
			events
		} else {
			EventBus::new(false)
		};

		Self {
			record,
			remote,
			table,
			locks: Arc::new(LockTable::new()),
			store,
			views,
			handler: Arc::new(DefaultCommitErrorHandler::new(config.max_attempts_per_change)),
			events,
			config,
			is_busy: AtomicBool::new(false),
			active: Mutex::new(None),
		}
	}

	#[must_use]
	pub fn with_error_handler(mut self, handler: Arc<dyn CommitErrorHandler>) -> Self {
		self.handler = handler;
		self
	}

	#[must_use]
	pub fn with_lock_table(mut self, locks: Arc<LockTable>) -> Self {
		self.locks = locks;
		self
	}

	#[must_use]
	pub const fn record(&self) -> &RecordId {
		&self.record
	}

	#[must_use]
	pub fn table(&self) -> &ChangeTable {
		&self.table
	}

	#[must_use]
	pub const fn locks(&self) -> &Arc<LockTable> {
		&self.locks
	}

	#[must_use]
	pub const fn store(&self) -> &Arc<SynchronizedStore> {
		&self.store
	}

	#[must_use]
	pub const fn views(&self) -> &Arc<ViewRegistry> {
		&self.views
	}

	#[must_use]
	pub const fn events(&self) -> &EventBus {
		&self.events
	}

	pub(crate) fn remote(&self) -> &dyn RemoteVault {
		self.remote.as_ref()
	}

	pub(crate) fn error_handler(&self) -> &dyn CommitErrorHandler {
		self.handler.as_ref()
	}

	fn check_lock(&self, lock: LockId, item_id: &str) -> Result<(), Error> {
		if self.locks.validate_lock(lock, item_id) {
			Ok(())
		} else {
			debug!(%lock, %item_id, "Rejected mutation with a stale lock");
			Err(Error::LockLost(item_id.to_string()))
		}
	}

	/// Queues a put of `item`, which must be locked with `lock`. Returns the pending change id.
	#[instrument(skip(self, item), fields(type_id = %item.type_id, key = %item.key), err)]
	pub fn track_put(&self, item: &Item, lock: LockId) -> Result<Option<String>, Error> {
		self.check_lock(lock, &item.key.id)?;
		self.table
			.track_change(ChangeType::Put, &item.type_id, &item.key, Some(item.clone()))
	}

	/// Queues a remove of `key`, which must be locked with `lock`.
	///
	/// Returns `None` when the item never reached the remote vault and nothing is left to commit.
	#[instrument(skip(self), err)]
	pub fn track_remove(
		&self,
		type_id: &str,
		key: &ItemKey,
		lock: LockId,
	) -> Result<Option<String>, Error> {
		self.check_lock(lock, &key.id)?;
		self.table
			.track_change(ChangeType::Remove, type_id, key, None)
	}

	pub fn has_pending_changes(&self) -> Result<bool, Error> {
		self.table.has_changes()
	}

	pub fn has_pending_changes_for_type(&self, type_id: &str) -> Result<bool, Error> {
		self.table.has_changes_for_type(type_id)
	}

	#[must_use]
	pub fn has_pending_changes_for_item(&self, type_id: &str, item_id: &str) -> bool {
		self.table.has_changes_for_item(type_id, item_id)
	}

	pub fn get_change(&self, type_id: &str, item_id: &str) -> Result<Option<Change>, Error> {
		self.table.get(type_id, item_id)
	}

	#[must_use]
	pub fn is_busy(&self) -> bool {
		self.is_busy.load(Ordering::Acquire)
	}

	/// Runs every pending change through the commit pipeline.
	///
	/// Returns `None` without doing anything when commits are disabled or a run is already in
	/// flight.
	#[instrument(skip(self), fields(record = %self.record), err)]
	pub async fn commit_changes(&self) -> Result<Option<CommitReport>, Error> {
		if !self.config.enabled {
			debug!("Commits disabled");
			return Ok(None);
		}

		let Some(_busy) = BusyGuard::try_acquire(&self.is_busy) else {
			debug!("Commit already in progress");
			return Ok(None);
		};

		let cancel = CancellationToken::new();
		let active = ActiveRun::start(&self.active, cancel.clone());

		self.events.emit(VaultEvent::CommitStarting {
			record: self.record.clone(),
		});

		let res = QueueProcess::new(self, cancel).run().await;
		drop(active);

		match &res {
			Ok(report) => {
				self.events.emit(VaultEvent::CommitFinished {
					record: self.record.clone(),
					report: report.clone(),
				});
			}
			Err(e) => {
				error!(?e, "Commit run failed");
				self.events.emit(VaultEvent::CommitException {
					record: self.record.clone(),
					error: e.to_string(),
				});
			}
		}

		res.map(Some)
	}

	/// Asks the running commit, if any, to stop at its next checkpoint.
	pub fn cancel_active_commits(&self) -> bool {
		self.active.lock().as_ref().map_or(false, |cancel| {
			debug!(record = %self.record, "Cancelling active commit");
			cancel.cancel();
			true
		})
	}

	/// Drops a committed change and reconciles the local cache and views with the remote state.
	pub(crate) fn apply_commit(&self, change: &Change, outcome: &CommitOutcome) -> Result<(), Error> {
		self.table
			.remove_if_current(&change.type_id, change.item_id(), &change.change_id)?;

		match outcome {
			CommitOutcome::Removed => {
				self.store.remove_local_item(change.item_id())?;
				self.views.apply_remove(&change.type_id, change.item_id())
			}

			CommitOutcome::Put { item } => {
				if item.key.id != change.item_id() {
					self.store.remove_local_item(change.item_id())?;
				}
				self.store.put_local_item(item)?;
				self.views
					.apply_put(&change.type_id, change.item_id(), &TypeViewItem::from(item))
			}
		}
	}
}
