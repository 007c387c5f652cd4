use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use super::CommitErrorHandler;
use crate::{
	change::{Change, ChangeType},
	Error, Item, ItemKey, ItemQuery, RecordId, RemoteError, RemoteVault, ServerStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemCommitState {
	Start,
	Remove,
	StartPut,
	StartNew,
	DetectDupeNew,
	New,
	StartUpdate,
	DetectDupeUpdate,
	Put,
	Refresh,
	Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
	Removed,
	/// The remote vault now holds `item` under `item.key`
	Put { item: Item },
}

/// Replays one [`Change`] against the remote vault.
///
/// Each [`ItemCommit::step`] performs at most one remote call. Cancellation is only honored
/// before the first write, so a write in flight always runs to completion.
pub struct ItemCommit<'a> {
	remote: &'a dyn RemoteVault,
	record: &'a RecordId,
	handler: &'a dyn CommitErrorHandler,
	cancel: &'a CancellationToken,
	change: &'a Change,
	state: ItemCommitState,
	target_key: ItemKey,
	committed: Option<Item>,
	wrote: bool,
}

impl<'a> ItemCommit<'a> {
	pub fn new(
		remote: &'a dyn RemoteVault,
		record: &'a RecordId,
		handler: &'a dyn CommitErrorHandler,
		cancel: &'a CancellationToken,
		change: &'a Change,
	) -> Self {
		Self {
			remote,
			record,
			handler,
			cancel,
			change,
			state: ItemCommitState::Start,
			target_key: change.current_key().clone(),
			committed: None,
			wrote: false,
		}
	}

	#[must_use]
	pub const fn state(&self) -> ItemCommitState {
		self.state
	}

	fn check_cancelled(&self) -> Result<(), Error> {
		if !self.wrote && self.cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}

		Ok(())
	}

	/// The local snapshot as it should be sent, stamped with this change's correlation id.
	fn outgoing_item(&self) -> Result<Item, Error> {
		let mut item = self
			.change
			.local_item
			.clone()
			.ok_or_else(|| Error::MissingSnapshot(self.change.change_id.clone()))?;

		item.key = self.target_key.clone();
		item.client_id = Some(self.change.change_id.clone());

		Ok(item)
	}

	async fn put(&mut self) -> Result<ItemKey, RemoteError> {
		let item = match self.outgoing_item() {
			Ok(item) => item,
			Err(e) => return Err(RemoteError::Serialization(e.to_string())),
		};

		self.wrote = true;
		self.remote
			.put_items(self.record, &[item])
			.await?
			.into_iter()
			.next()
			.ok_or_else(|| RemoteError::server(ServerStatus::Other(0), "put returned no key"))
	}

	async fn query_first(&self, query: ItemQuery) -> Result<Option<Item>, RemoteError> {
		Ok(self
			.remote
			.get_items(self.record, &query.full())
			.await?
			.items
			.into_iter()
			.next())
	}

	/// A previous attempt may have been applied remotely without us hearing back.
	async fn find_duplicate_new(&self) -> Result<Option<Item>, RemoteError> {
		self.query_first(
			ItemQuery::for_type(&self.change.type_id).with_client_id(&self.change.change_id),
		)
		.await
	}

	async fn find_duplicate_update(&self) -> Result<Option<Item>, RemoteError> {
		Ok(self
			.query_first(
				ItemQuery::for_type(&self.change.type_id).with_item_ids([&self.target_key.id]),
			)
			.await?
			.filter(|item| item.client_id.as_deref() == Some(self.change.change_id.as_str())))
	}

	/// Takes over the item an earlier attempt wrote. The snapshot may have been edited since,
	/// in which case the earlier write is updated with it.
	fn adopt(&mut self, item: Item) -> ItemCommitState {
		let is_current = self
			.change
			.local_item
			.as_ref()
			.is_some_and(|local| local.has_same_content(&item));

		if is_current {
			debug!(key = %item.key, "Found item from a previous attempt, adopting it");
			self.committed = Some(item);
			ItemCommitState::Refresh
		} else {
			debug!(
				key = %item.key,
				"Found an outdated write from a previous attempt, updating it"
			);
			self.target_key = item.key;
			ItemCommitState::Put
		}
	}

	fn written(&mut self, key: ItemKey) -> Result<ItemCommitState, Error> {
		let mut item = self.outgoing_item()?;
		item.key = key;
		self.committed = Some(item);
		Ok(ItemCommitState::Refresh)
	}

	pub async fn step(&mut self) -> Result<ItemCommitState, Error> {
		use ItemCommitState as S;

		let next = match self.state {
			S::Start => {
				self.check_cancelled()?;
				match self.change.change_type {
					ChangeType::Remove => S::Remove,
					ChangeType::Put => S::StartPut,
				}
			}

			S::Remove => {
				if self.target_key.is_local() {
					trace!("Item never reached the remote vault, nothing to remove");
					S::Done
				} else {
					self.check_cancelled()?;
					self.wrote = true;

					match self
						.remote
						.remove_items(self.record, &[self.target_key.clone()])
						.await
					{
						Ok(()) => S::Done,
						Err(e) if e.is_item_not_found() => {
							debug!("Item already gone remotely");
							S::Done
						}
						Err(e) => return Err(e.into()),
					}
				}
			}

			S::StartPut => {
				if self.change.local_item.is_none() {
					return Err(Error::MissingSnapshot(self.change.change_id.clone()));
				}

				if self.target_key.is_local() {
					S::StartNew
				} else {
					S::StartUpdate
				}
			}

			S::StartNew => {
				if self.change.attempt_count > 1 {
					S::DetectDupeNew
				} else {
					S::New
				}
			}

			S::DetectDupeNew => match self.find_duplicate_new().await? {
				Some(item) => self.adopt(item),
				None => S::New,
			},

			S::New => {
				self.check_cancelled()?;
				let key = self.put().await?;
				self.written(key)?
			}

			S::StartUpdate => {
				if self.change.attempt_count > 1 {
					S::DetectDupeUpdate
				} else {
					S::Put
				}
			}

			S::DetectDupeUpdate => match self.find_duplicate_update().await? {
				Some(item) => self.adopt(item),
				None => S::Put,
			},

			S::Put => {
				self.check_cancelled()?;
				match self.put().await {
					Ok(key) => self.written(key)?,
					Err(e)
						if e.is_conflict()
							&& self
								.handler
								.should_create_new_item_for_conflict(self.change, &e) =>
					{
						warn!(%e, "Update conflicted, writing the item as new");
						self.target_key = ItemKey::new_local();
						S::New
					}
					Err(e) => return Err(e.into()),
				}
			}

			S::Refresh => {
				if let Some(key) = self.committed.as_ref().map(|item| item.key.clone()) {
					let query = ItemQuery::for_type(&self.change.type_id).with_item_ids([&key.id]);

					match self.query_first(query).await {
						Ok(Some(item)) => self.committed = Some(item),
						Ok(None) => warn!(%key, "Committed item not found on refresh"),
						// The write went through, a stale local copy is no reason to fail it
						Err(e) => warn!(%e, "Failed to refresh committed item"),
					}
				}

				S::Done
			}

			S::Done => S::Done,
		};

		trace!(from = ?self.state, to = ?next, "Item commit step");
		self.state = next;

		Ok(next)
	}

	#[instrument(
		skip_all,
		fields(
			change_id = %self.change.change_id,
			type_id = %self.change.type_id,
			item_id = %self.change.item_id(),
			attempt = self.change.attempt_count,
		),
		err,
	)]
	pub async fn run(mut self) -> Result<CommitOutcome, Error> {
		while self.state != ItemCommitState::Done {
			self.step().await?;
		}

		Ok(match (self.change.change_type, self.committed) {
			(ChangeType::Put, Some(item)) => CommitOutcome::Put { item },
			(ChangeType::Put, None) => {
				return Err(Error::MissingSnapshot(self.change.change_id.clone()))
			}
			(ChangeType::Remove, _) => CommitOutcome::Removed,
		})
	}
}
