//! Commit lifecycle notifications
//!
//! Events are fire-and-forget: nothing in the vault depends on anyone listening.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{commit::CommitReport, ItemKey, RecordId};

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultEvent {
	CommitStarting {
		record: RecordId,
	},
	CommitFinished {
		record: RecordId,
		report: CommitReport,
	},
	ChangeCommitSucceeded {
		record: RecordId,
		change_id: String,
		type_id: String,
		key: ItemKey,
	},
	ChangeCommitFailed {
		record: RecordId,
		change_id: String,
		type_id: String,
		item_id: String,
		error: String,
	},
	/// A commit run stopped on a local failure
	CommitException {
		record: RecordId,
		error: String,
	},
}

impl VaultEvent {
	#[must_use]
	pub const fn record(&self) -> &RecordId {
		match self {
			Self::CommitStarting { record }
			| Self::CommitFinished { record, .. }
			| Self::ChangeCommitSucceeded { record, .. }
			| Self::ChangeCommitFailed { record, .. }
			| Self::CommitException { record, .. } => record,
		}
	}

	#[must_use]
	pub const fn event_type(&self) -> &'static str {
		match self {
			Self::CommitStarting { .. } => "CommitStarting",
			Self::CommitFinished { .. } => "CommitFinished",
			Self::ChangeCommitSucceeded { .. } => "ChangeCommitSucceeded",
			Self::ChangeCommitFailed { .. } => "ChangeCommitFailed",
			Self::CommitException { .. } => "CommitException",
		}
	}
}

#[derive(Debug, Clone)]
pub struct EventBus {
	sender: broadcast::Sender<VaultEvent>,
	enabled: bool,
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(true)
	}
}

impl EventBus {
	#[must_use]
	pub fn new(enabled: bool) -> Self {
		let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
		Self { sender, enabled }
	}

	/// Returns how many subscribers received the event.
	pub fn emit(&self, event: VaultEvent) -> usize {
		if !self.enabled {
			trace!(event_type = event.event_type(), "Vault events disabled, dropping");
			return 0;
		}

		let event_type = event.event_type();
		let record = event.record().clone();

		self.sender.send(event).map_or_else(
			|_| {
				trace!(event_type, %record, "Vault event emitted but no subscribers");
				0
			},
			|count| {
				debug!(event_type, %record, subscribers = count, "Vault event emitted");
				count
			},
		)
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
		self.sender.subscribe()
	}

	#[must_use]
	pub fn subscriber_count(&self) -> usize {
		self.sender.receiver_count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn events_reach_subscribers_only_when_enabled() {
		let record = RecordId::new("r1");

		let bus = EventBus::new(true);
		assert_eq!(
			bus.emit(VaultEvent::CommitStarting {
				record: record.clone()
			}),
			0
		);

		let mut rx = bus.subscribe();
		assert_eq!(
			bus.emit(VaultEvent::CommitStarting {
				record: record.clone()
			}),
			1
		);
		assert!(matches!(
			rx.recv().await,
			Ok(VaultEvent::CommitStarting { .. })
		));

		let muted = EventBus::new(false);
		let _rx = muted.subscribe();
		assert_eq!(muted.emit(VaultEvent::CommitStarting { record }), 0);
	}
}
