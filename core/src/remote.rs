//! Boundary with the remote method-call layer.
//!
//! Transport, authentication and the wire format live elsewhere. This module only describes
//! what the offline store needs from them and how their failures are classified.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Item, ItemKey, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuerySections {
	/// Only keys and effective dates.
	KeysOnly,
	#[default]
	Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemQuery {
	#[serde(default)]
	pub type_ids: Vec<String>,
	#[serde(default)]
	pub item_ids: Vec<String>,
	#[serde(default)]
	pub keys: Vec<ItemKey>,
	#[serde(default)]
	pub client_ids: Vec<String>,
	#[serde(default)]
	pub effective_date_min: Option<DateTime<Utc>>,
	#[serde(default)]
	pub effective_date_max: Option<DateTime<Utc>>,
	#[serde(default)]
	pub sections: QuerySections,
	#[serde(default)]
	pub max_results: Option<usize>,
	/// Results past this many come back as [`PendingItem`]s.
	#[serde(default)]
	pub max_full: Option<usize>,
}

impl ItemQuery {
	pub fn for_type(type_id: impl Into<String>) -> Self {
		Self {
			type_ids: vec![type_id.into()],
			..Default::default()
		}
	}

	#[must_use]
	pub fn keys_only(mut self) -> Self {
		self.sections = QuerySections::KeysOnly;
		self
	}

	#[must_use]
	pub fn full(mut self) -> Self {
		self.sections = QuerySections::Full;
		self
	}

	#[must_use]
	pub fn with_item_ids(mut self, item_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.item_ids = item_ids.into_iter().map(Into::into).collect();
		self
	}

	#[must_use]
	pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
		self.client_ids = vec![client_id.into()];
		self
	}

	#[must_use]
	pub const fn with_max_results(mut self, max_results: usize) -> Self {
		self.max_results = Some(max_results);
		self
	}

	#[must_use]
	pub const fn with_date_range(
		mut self,
		min: Option<DateTime<Utc>>,
		max: Option<DateTime<Utc>>,
	) -> Self {
		self.effective_date_min = min;
		self.effective_date_max = max;
		self
	}

	/// Whether `item` satisfies every criterion of this query. Paging limits are not criteria.
	#[must_use]
	pub fn matches(&self, item: &Item) -> bool {
		(self.type_ids.is_empty() || self.type_ids.contains(&item.type_id))
			&& (self.item_ids.is_empty() || self.item_ids.contains(&item.key.id))
			&& (self.keys.is_empty() || self.keys.contains(&item.key))
			&& (self.client_ids.is_empty()
				|| item
					.client_id
					.as_ref()
					.is_some_and(|id| self.client_ids.contains(id)))
			&& self
				.effective_date_min
				.map_or(true, |min| item.effective_date >= min)
			&& self
				.effective_date_max
				.map_or(true, |max| item.effective_date <= max)
	}
}

/// A matching item the service returned only the key for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingItem {
	pub key: ItemKey,
	pub effective_date: DateTime<Utc>,
}

impl From<&Item> for PendingItem {
	fn from(item: &Item) -> Self {
		Self {
			key: item.key.clone(),
			effective_date: item.effective_date,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
	pub items: Vec<Item>,
	pub pending: Vec<PendingItem>,
}

impl QueryResult {
	#[must_use]
	pub fn len(&self) -> usize {
		self.items.len() + self.pending.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.items.is_empty() && self.pending.is_empty()
	}

	/// Keys and dates of everything in the result, full items first.
	pub fn keys(&self) -> impl Iterator<Item = PendingItem> + '_ {
		self.items
			.iter()
			.map(PendingItem::from)
			.chain(self.pending.iter().cloned())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
	ItemNotFound,
	AccessDenied,
	InvalidItem,
	VersionStampMismatch,
	InvalidToken,
	ServerError,
	RequestTooLarge,
	Other(i32),
}

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
	#[error("network failure: {0}")]
	Network(String),
	#[error("request timed out")]
	Timeout,
	#[error("server rejected request <status={status:?}>: {message}")]
	Server {
		status: ServerStatus,
		message: String,
	},
	#[error("failed to serialize request: {0}")]
	Serialization(String),
}

impl RemoteError {
	pub fn server(status: ServerStatus, message: impl Into<String>) -> Self {
		Self::Server {
			status,
			message: message.into(),
		}
	}

	#[must_use]
	pub const fn status(&self) -> Option<ServerStatus> {
		match self {
			Self::Server { status, .. } => Some(*status),
			_ => None,
		}
	}

	#[must_use]
	pub const fn is_network(&self) -> bool {
		matches!(self, Self::Network(_) | Self::Timeout)
	}

	/// Failures where trying again later may succeed without changing the request.
	#[must_use]
	pub const fn is_transient(&self) -> bool {
		self.is_network() || matches!(self.status(), Some(ServerStatus::ServerError))
	}

	#[must_use]
	pub const fn is_item_not_found(&self) -> bool {
		matches!(self.status(), Some(ServerStatus::ItemNotFound))
	}

	#[must_use]
	pub const fn is_token_error(&self) -> bool {
		matches!(self.status(), Some(ServerStatus::InvalidToken))
	}

	#[must_use]
	pub const fn is_access_denied(&self) -> bool {
		matches!(self.status(), Some(ServerStatus::AccessDenied))
	}

	/// The item was changed or deleted remotely since the local copy was taken.
	#[must_use]
	pub const fn is_conflict(&self) -> bool {
		matches!(
			self.status(),
			Some(ServerStatus::ItemNotFound | ServerStatus::VersionStampMismatch)
		)
	}

	#[must_use]
	pub const fn is_client_error(&self) -> bool {
		matches!(self, Self::Serialization(_))
			|| matches!(
				self.status(),
				Some(ServerStatus::InvalidItem | ServerStatus::RequestTooLarge)
			)
	}
}

/// The remote method-call layer.
///
/// `put_items` creates every item whose key [is local](ItemKey::is_local) and updates the rest,
/// answering with the new key of each item in request order.
#[async_trait::async_trait]
pub trait RemoteVault: Send + Sync + 'static {
	async fn get_items(&self, record: &RecordId, query: &ItemQuery)
		-> Result<QueryResult, RemoteError>;

	async fn put_items(&self, record: &RecordId, items: &[Item])
		-> Result<Vec<ItemKey>, RemoteError>;

	async fn remove_items(&self, record: &RecordId, keys: &[ItemKey]) -> Result<(), RemoteError>;
}

pub trait NetworkReachability: Send + Sync + 'static {
	fn is_reachable(&self) -> bool;
}

impl<F: Fn() -> bool + Send + Sync + 'static> NetworkReachability for F {
	fn is_reachable(&self) -> bool {
		self()
	}
}
