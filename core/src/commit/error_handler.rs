use tracing::debug;

use crate::{change::Change, RemoteError};

/// What to do with a change whose commit attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
	/// Try the same change again right away
	RetryNow,
	/// Leave the change queued and move on to the next one
	Skip,
	/// Leave the change queued and stop the run
	Abort,
	/// Drop the change for good
	Discard,
}

/// Decides how the commit pipeline reacts to remote failures.
pub trait CommitErrorHandler: Send + Sync + 'static {
	fn max_attempts_per_change(&self) -> u32;

	/// Failures that make every following change fail too, like a dead network.
	fn is_halting_error(&self, error: &RemoteError) -> bool {
		error.is_network() || error.is_token_error()
	}

	fn should_retry_change(&self, change: &Change, error: &RemoteError) -> bool {
		error.is_transient() && change.attempt_count < self.max_attempts_per_change()
	}

	/// Whether an update whose item changed or vanished remotely should be written as a new item.
	fn should_create_new_item_for_conflict(&self, _change: &Change, error: &RemoteError) -> bool {
		error.is_conflict()
	}

	fn on_commit_failure(&self, change: &Change, error: &RemoteError) -> CommitAction {
		let action = if self.is_halting_error(error) {
			CommitAction::Abort
		} else if self.should_retry_change(change, error) {
			CommitAction::RetryNow
		} else {
			CommitAction::Skip
		};

		debug!(
			change_id = %change.change_id,
			attempt = change.attempt_count,
			?action,
			%error,
			"Commit failure handled"
		);

		action
	}
}

#[derive(Debug, Clone)]
pub struct DefaultCommitErrorHandler {
	max_attempts_per_change: u32,
}

impl DefaultCommitErrorHandler {
	#[must_use]
	pub const fn new(max_attempts_per_change: u32) -> Self {
		Self {
			max_attempts_per_change,
		}
	}
}

impl Default for DefaultCommitErrorHandler {
	fn default() -> Self {
		Self::new(3)
	}
}

impl CommitErrorHandler for DefaultCommitErrorHandler {
	fn max_attempts_per_change(&self) -> u32 {
		self.max_attempts_per_change
	}
}
