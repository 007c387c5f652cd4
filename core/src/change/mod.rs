use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Item, ItemKey};

mod queue;
mod table;

pub use queue::ChangeQueue;
pub use table::ChangeTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
	Put,
	Remove,
}

/// A local mutation waiting to be replayed against the remote vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
	pub change_id: String,
	pub change_type: ChangeType,
	pub type_id: String,
	pub key: ItemKey,
	/// Remote key produced by a commit whose result couldn't be applied locally
	pub updated_key: Option<ItemKey>,
	pub local_item: Option<Item>,
	pub updated_item: Option<Item>,
	pub timestamp: DateTime<Utc>,
	pub attempt_count: u32,
}

impl Change {
	pub(crate) fn new(
		change_type: ChangeType,
		type_id: impl Into<String>,
		key: ItemKey,
		local_item: Option<Item>,
		timestamp: DateTime<Utc>,
	) -> Self {
		Self {
			change_id: Uuid::new_v4().to_string(),
			change_type,
			type_id: type_id.into(),
			key,
			updated_key: None,
			local_item,
			updated_item: None,
			timestamp,
			attempt_count: 0,
		}
	}

	#[must_use]
	pub fn item_id(&self) -> &str {
		&self.key.id
	}

	#[must_use]
	pub fn is_change_for_type(&self, type_id: &str) -> bool {
		self.type_id == type_id
	}

	/// The key a commit should write against: the newest one this change knows about.
	#[must_use]
	pub fn current_key(&self) -> &ItemKey {
		self.updated_key.as_ref().unwrap_or(&self.key)
	}

	/// Oldest first, change id breaks ties.
	#[must_use]
	pub fn queue_order(&self, other: &Self) -> Ordering {
		self.timestamp
			.cmp(&other.timestamp)
			.then_with(|| self.change_id.cmp(&other.change_id))
	}
}
