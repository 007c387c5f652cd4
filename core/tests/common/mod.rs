#![allow(dead_code)]

use hv_core::{
	Item, ItemKey, ItemQuery, LocalVault, QueryResult, QuerySections, RecordId, RemoteError,
	RemoteVault, ServerStatus, VaultConfig,
};
use hv_object_store::MemoryStore;

use std::{
	collections::{HashMap, VecDeque},
	sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;

pub const WEIGHT: &str = "weight";
pub const HEIGHT: &str = "height";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
	Get,
	Put,
	Remove,
}

#[derive(Debug, Clone)]
enum Failure {
	Always(RemoteError),
	Once(RemoteError),
	/// Applies the write, then reports `error` as if the answer got lost
	AppliedOnce(RemoteError),
}

#[derive(Default)]
struct State {
	items: HashMap<String, Item>,
	next_id: u64,
	next_version: u64,
	failures: HashMap<(Op, String), VecDeque<Failure>>,
	offline: bool,
	max_full: Option<usize>,
	calls: Vec<(Op, Vec<String>)>,
}

impl State {
	fn next_version(&mut self) -> String {
		self.next_version += 1;
		format!("v{}", self.next_version)
	}

	fn take_failure(&mut self, op: Op, id: &str) -> Option<Failure> {
		let queue = self.failures.get_mut(&(op, id.to_string()))?;
		match queue.front()? {
			Failure::Always(e) => Some(Failure::Always(e.clone())),
			Failure::Once(_) | Failure::AppliedOnce(_) => queue.pop_front(),
		}
	}
}

/// In-memory remote vault with failure injection per operation and item id.
#[derive(Default)]
pub struct MockRemote {
	state: Mutex<State>,
}

impl MockRemote {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Stores `item` as if another client had created it, assigning it a server key.
	pub fn seed(&self, mut item: Item) -> Item {
		let mut state = self.state.lock();
		state.next_id += 1;
		let id = format!("srv-{}", state.next_id);
		item.key = ItemKey::new(id.clone(), state.next_version());
		state.items.insert(id, item.clone());
		item
	}

	/// Bumps the version of a stored item, as an edit made elsewhere would.
	pub fn touch(&self, item_id: &str) -> Option<ItemKey> {
		let mut state = self.state.lock();
		let version = state.next_version();
		let item = state.items.get_mut(item_id)?;
		item.key.version = version;
		Some(item.key.clone())
	}

	pub fn delete(&self, item_id: &str) -> Option<Item> {
		self.state.lock().items.remove(item_id)
	}

	pub fn items_of_type(&self, type_id: &str) -> Vec<Item> {
		let mut items = self
			.state
			.lock()
			.items
			.values()
			.filter(|item| item.type_id == type_id)
			.cloned()
			.collect::<Vec<_>>();
		items.sort_by(|a, b| a.key.id.cmp(&b.key.id));
		items
	}

	pub fn item(&self, item_id: &str) -> Option<Item> {
		self.state.lock().items.get(item_id).cloned()
	}

	pub fn fail_always(&self, op: Op, item_id: &str, error: RemoteError) {
		self.push_failure(op, item_id, Failure::Always(error));
	}

	pub fn fail_once(&self, op: Op, item_id: &str, error: RemoteError) {
		self.push_failure(op, item_id, Failure::Once(error));
	}

	/// The next put of `item_id` goes through but the caller sees `error`.
	pub fn apply_then_fail_once(&self, item_id: &str, error: RemoteError) {
		self.push_failure(Op::Put, item_id, Failure::AppliedOnce(error));
	}

	fn push_failure(&self, op: Op, item_id: &str, failure: Failure) {
		self.state
			.lock()
			.failures
			.entry((op, item_id.to_string()))
			.or_default()
			.push_back(failure);
	}

	pub fn set_offline(&self, offline: bool) {
		self.state.lock().offline = offline;
	}

	/// Answers with at most `max_full` bodies per request, the rest as keys only.
	pub fn cap_full_items(&self, max_full: Option<usize>) {
		self.state.lock().max_full = max_full;
	}

	pub fn calls(&self, op: Op) -> usize {
		self.state
			.lock()
			.calls
			.iter()
			.filter(|(call, _)| *call == op)
			.count()
	}

	fn write(state: &mut State, mut item: Item) -> Result<ItemKey, RemoteError> {
		if item.key.is_local() {
			state.next_id += 1;
			item.key = ItemKey::new(format!("srv-{}", state.next_id), state.next_version());
		} else {
			let Some(current) = state.items.get(&item.key.id) else {
				return Err(RemoteError::server(ServerStatus::ItemNotFound, "no such item"));
			};

			if current.key.version != item.key.version {
				return Err(RemoteError::server(
					ServerStatus::VersionStampMismatch,
					"stale version",
				));
			}

			item.key.version = state.next_version();
		}

		let key = item.key.clone();
		state.items.insert(key.id.clone(), item);

		Ok(key)
	}
}

#[async_trait]
impl RemoteVault for MockRemote {
	async fn get_items(
		&self,
		_record: &RecordId,
		query: &ItemQuery,
	) -> Result<QueryResult, RemoteError> {
		let mut state = self.state.lock();
		state.calls.push((Op::Get, query.item_ids.clone()));

		if state.offline {
			return Err(RemoteError::Network("offline".into()));
		}

		for id in &query.item_ids {
			match state.take_failure(Op::Get, id) {
				Some(Failure::Always(e) | Failure::Once(e) | Failure::AppliedOnce(e)) => {
					return Err(e)
				}
				None => {}
			}
		}

		let mut items = state
			.items
			.values()
			.filter(|item| query.matches(item))
			.cloned()
			.collect::<Vec<_>>();

		items.sort_by(|a, b| {
			b.effective_date
				.cmp(&a.effective_date)
				.then_with(|| a.key.id.cmp(&b.key.id))
		});

		if let Some(max) = query.max_results {
			items.truncate(max);
		}

		let full = match query.sections {
			QuerySections::KeysOnly => 0,
			QuerySections::Full => query
				.max_full
				.unwrap_or(usize::MAX)
				.min(state.max_full.unwrap_or(usize::MAX)),
		};

		let pending = items.split_off(full.min(items.len()));

		Ok(QueryResult {
			items,
			pending: pending.iter().map(Into::into).collect(),
		})
	}

	async fn put_items(
		&self,
		_record: &RecordId,
		items: &[Item],
	) -> Result<Vec<ItemKey>, RemoteError> {
		let mut state = self.state.lock();
		state
			.calls
			.push((Op::Put, items.iter().map(|item| item.key.id.clone()).collect()));

		if state.offline {
			return Err(RemoteError::Network("offline".into()));
		}

		let mut keys = Vec::with_capacity(items.len());

		for item in items {
			match state.take_failure(Op::Put, &item.key.id) {
				Some(Failure::Always(e) | Failure::Once(e)) => return Err(e),
				Some(Failure::AppliedOnce(e)) => {
					Self::write(&mut state, item.clone())?;
					return Err(e);
				}
				None => keys.push(Self::write(&mut state, item.clone())?),
			}
		}

		Ok(keys)
	}

	async fn remove_items(&self, _record: &RecordId, keys: &[ItemKey]) -> Result<(), RemoteError> {
		let mut state = self.state.lock();
		state
			.calls
			.push((Op::Remove, keys.iter().map(|key| key.id.clone()).collect()));

		if state.offline {
			return Err(RemoteError::Network("offline".into()));
		}

		for key in keys {
			match state.take_failure(Op::Remove, &key.id) {
				Some(Failure::Always(e) | Failure::Once(e) | Failure::AppliedOnce(e)) => {
					return Err(e)
				}
				None => {}
			}

			if state.items.remove(&key.id).is_none() {
				return Err(RemoteError::server(ServerStatus::ItemNotFound, "no such item"));
			}
		}

		Ok(())
	}
}

/// A remote vault that never answers a write.
pub struct StalledRemote;

#[async_trait]
impl RemoteVault for StalledRemote {
	async fn get_items(
		&self,
		_record: &RecordId,
		_query: &ItemQuery,
	) -> Result<QueryResult, RemoteError> {
		Ok(QueryResult::default())
	}

	async fn put_items(
		&self,
		_record: &RecordId,
		_items: &[Item],
	) -> Result<Vec<ItemKey>, RemoteError> {
		std::future::pending().await
	}

	async fn remove_items(&self, _record: &RecordId, _keys: &[ItemKey]) -> Result<(), RemoteError> {
		std::future::pending().await
	}
}

pub fn record() -> RecordId {
	RecordId::new("3f1c2a90-record")
}

pub fn day(day: u32) -> DateTime<Utc> {
	Utc.with_ymd_and_hms(2024, 3, day, 8, 0, 0).unwrap()
}

pub fn weight(kg: f64, date: DateTime<Utc>) -> Item {
	Item::new(WEIGHT, date, json!({ "kg": kg }))
}

pub fn memory_vault(remote: &Arc<MockRemote>) -> LocalVault {
	memory_vault_with_config(remote, VaultConfig::default())
}

pub fn memory_vault_with_config(remote: &Arc<MockRemote>, config: VaultConfig) -> LocalVault {
	LocalVault::with_store(
		Arc::new(MemoryStore::new()),
		config,
		Arc::clone(remote) as Arc<dyn RemoteVault>,
	)
}
