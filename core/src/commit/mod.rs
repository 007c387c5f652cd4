//! Replays pending changes against the remote vault.
//!
//! [`QueueProcess`] walks the change queue and hands every change to an [`ItemCommit`], both
//! explicit state machines advanced one `step` at a time.

use serde::Serialize;

mod error_handler;
mod item;
mod queue;

pub use error_handler::{CommitAction, CommitErrorHandler, DefaultCommitErrorHandler};
pub use item::{CommitOutcome, ItemCommit, ItemCommitState};
pub use queue::{QueueProcess, QueueState};

/// Tally of one commit run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
	pub committed: usize,
	/// Left queued after the error handler gave up on them
	pub failed: usize,
	pub discarded: usize,
	/// Not attempted because someone else held the item's lock
	pub skipped_locked: usize,
	/// Committed, but the item was edited meanwhile so the change stays queued
	pub lock_lost: usize,
	pub aborted: bool,
	pub cancelled: bool,
}
