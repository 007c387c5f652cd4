use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::{CommitAction, CommitOutcome, CommitReport, ItemCommit};
use crate::{
	change::{Change, ChangeQueue},
	event::VaultEvent,
	lock_table::AutoLock,
	ChangeManager, Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
	Start,
	Next,
	Done,
}

/// One pass over the pending changes of a record.
pub struct QueueProcess<'a> {
	manager: &'a ChangeManager,
	cancel: CancellationToken,
	queue: Option<ChangeQueue<'a>>,
	state: QueueState,
	report: CommitReport,
}

impl<'a> QueueProcess<'a> {
	#[must_use]
	pub fn new(manager: &'a ChangeManager, cancel: CancellationToken) -> Self {
		Self {
			manager,
			cancel,
			queue: None,
			state: QueueState::Start,
			report: CommitReport::default(),
		}
	}

	#[must_use]
	pub const fn state(&self) -> QueueState {
		self.state
	}

	#[must_use]
	pub const fn report(&self) -> &CommitReport {
		&self.report
	}

	pub async fn step(&mut self) -> Result<QueueState, Error> {
		let next = match self.state {
			QueueState::Start => {
				self.queue = Some(self.manager.table().get_queue()?);
				QueueState::Next
			}
			QueueState::Next => self.next().await?,
			QueueState::Done => QueueState::Done,
		};

		self.state = next;
		Ok(next)
	}

	#[instrument(skip_all, fields(record = %self.manager.record()), err)]
	pub async fn run(mut self) -> Result<CommitReport, Error> {
		while self.state != QueueState::Done {
			self.step().await?;
		}

		info!(
			committed = self.report.committed,
			failed = self.report.failed,
			skipped_locked = self.report.skipped_locked,
			aborted = self.report.aborted,
			cancelled = self.report.cancelled,
			"Commit run finished"
		);

		Ok(self.report)
	}

	async fn next(&mut self) -> Result<QueueState, Error> {
		if self.cancel.is_cancelled() {
			self.report.cancelled = true;
			return Ok(QueueState::Done);
		}

		let Some(change) = self
			.queue
			.as_mut()
			.map(ChangeQueue::next_change)
			.transpose()?
			.flatten()
		else {
			return Ok(QueueState::Done);
		};

		let Some(lock) = self.manager.locks().try_new_auto_lock(change.item_id()) else {
			debug!(item_id = %change.item_id(), "Item is locked, leaving its change for later");
			self.report.skipped_locked += 1;
			return Ok(QueueState::Next);
		};

		self.commit_change(change, lock).await
	}

	async fn commit_change(
		&mut self,
		change: Change,
		mut lock: AutoLock,
	) -> Result<QueueState, Error> {
		let table = self.manager.table();
		let (type_id, item_id) = (change.type_id.clone(), change.key.id.clone());

		loop {
			if self.cancel.is_cancelled() {
				self.report.cancelled = true;
				return Ok(QueueState::Done);
			}

			// Persisted first, so a crash mid-attempt still counts it
			let Some(change) = table.update(&type_id, &item_id, |change| change.attempt_count += 1)?
			else {
				trace!(%item_id, "Change vanished before its commit, skipping");
				return Ok(QueueState::Next);
			};

			let res = ItemCommit::new(
				self.manager.remote(),
				self.manager.record(),
				self.manager.error_handler(),
				&self.cancel,
				&change,
			)
			.run()
			.await;

			match res {
				Ok(outcome) => {
					self.committed(&change, &outcome, &mut lock)?;
					return Ok(QueueState::Next);
				}

				Err(Error::Cancelled) => {
					table.update(&type_id, &item_id, |change| {
						change.attempt_count = change.attempt_count.saturating_sub(1);
					})?;
					self.report.cancelled = true;
					return Ok(QueueState::Done);
				}

				Err(Error::Remote(e)) => {
					match self.manager.error_handler().on_commit_failure(&change, &e) {
						CommitAction::RetryNow => {
							debug!(change_id = %change.change_id, %e, "Retrying change");
						}
						CommitAction::Skip => {
							self.report.failed += 1;
							self.report_failure(&change, &e);
							return Ok(QueueState::Next);
						}
						CommitAction::Abort => {
							self.report.failed += 1;
							self.report_failure(&change, &e);
							self.report.aborted = true;
							return Ok(QueueState::Done);
						}
						CommitAction::Discard => {
							warn!(change_id = %change.change_id, %e, "Discarding change");
							table.remove_if_current(&type_id, &item_id, &change.change_id)?;
							self.report.discarded += 1;
							self.report_failure(&change, &e);
							return Ok(QueueState::Next);
						}
					}
				}

				Err(e @ Error::MissingSnapshot(_)) => {
					self.report.failed += 1;
					self.report_failure(&change, &e);
					return Ok(QueueState::Next);
				}

				Err(e) => return Err(e),
			}
		}
	}

	fn committed(
		&mut self,
		change: &Change,
		outcome: &CommitOutcome,
		lock: &mut AutoLock,
	) -> Result<(), Error> {
		if lock.is_valid() || *outcome == CommitOutcome::Removed {
			self.manager.apply_commit(change, outcome)?;
			self.report.committed += 1;

			let key = match outcome {
				CommitOutcome::Put { item } => item.key.clone(),
				CommitOutcome::Removed => change.current_key().clone(),
			};

			self.manager.events().emit(VaultEvent::ChangeCommitSucceeded {
				record: self.manager.record().clone(),
				change_id: change.change_id.clone(),
				type_id: change.type_id.clone(),
				key,
			});
		} else if let CommitOutcome::Put { item } = outcome {
			// The item was edited while committing: keep the change, now aimed at the new version
			debug!(key = %item.key, "Lock lost during commit, keeping change");
			self.manager
				.table()
				.update(&change.type_id, change.item_id(), |pending| {
					pending.updated_key = Some(item.key.clone());
					pending.updated_item = Some(item.clone());
					pending.attempt_count = 0;
				})?;
			self.report.lock_lost += 1;
		}

		lock.release();
		Ok(())
	}

	fn report_failure(&self, change: &Change, e: &impl std::fmt::Display) {
		warn!(change_id = %change.change_id, attempt = change.attempt_count, %e, "Change commit failed");

		self.manager.events().emit(VaultEvent::ChangeCommitFailed {
			record: self.manager.record().clone(),
			change_id: change.change_id.clone(),
			type_id: change.type_id.clone(),
			item_id: change.key.id.clone(),
			error: e.to_string(),
		});
	}
}
