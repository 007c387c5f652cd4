use std::{
	cmp::Ordering,
	collections::{HashMap, HashSet},
	ops::Range,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{remote::PendingItem, Item, ItemKey, QueryResult};

/// Lightweight projection of a remote item held by a type view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeViewItem {
	pub key: ItemKey,
	pub effective_date: DateTime<Utc>,
	/// Set while a download of the full item is in flight
	#[serde(skip)]
	pub is_load_pending: bool,
}

impl TypeViewItem {
	#[must_use]
	pub const fn new(key: ItemKey, effective_date: DateTime<Utc>) -> Self {
		Self {
			key,
			effective_date,
			is_load_pending: false,
		}
	}

	#[must_use]
	pub fn id(&self) -> &str {
		&self.key.id
	}

	/// Newest first, item id breaks ties.
	#[must_use]
	pub fn view_order(&self, other: &Self) -> Ordering {
		view_order(self.effective_date, &self.key.id, other.effective_date, &other.key.id)
	}

	fn same_content(&self, other: &Self) -> bool {
		self.key == other.key && self.effective_date == other.effective_date
	}
}

fn view_order(
	date_a: DateTime<Utc>,
	id_a: &str,
	date_b: DateTime<Utc>,
	id_b: &str,
) -> Ordering {
	date_b.cmp(&date_a).then_with(|| id_a.cmp(id_b))
}

impl From<&Item> for TypeViewItem {
	fn from(item: &Item) -> Self {
		Self::new(item.key.clone(), item.effective_date)
	}
}

impl From<PendingItem> for TypeViewItem {
	fn from(PendingItem { key, effective_date }: PendingItem) -> Self {
		Self::new(key, effective_date)
	}
}

/// Sorted collection of [`TypeViewItem`]s with an id to position index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<TypeViewItem>", into = "Vec<TypeViewItem>")]
pub struct TypeViewItems {
	items: Vec<TypeViewItem>,
	positions: HashMap<String, usize>,
}

impl From<Vec<TypeViewItem>> for TypeViewItems {
	fn from(items: Vec<TypeViewItem>) -> Self {
		let mut view_items = Self::default();
		for item in items {
			view_items.add_item(item);
		}

		view_items
	}
}

impl From<TypeViewItems> for Vec<TypeViewItem> {
	fn from(view_items: TypeViewItems) -> Self {
		view_items.items
	}
}

impl TypeViewItems {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.items.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &TypeViewItem> + '_ {
		self.items.iter()
	}

	#[must_use]
	pub fn get(&self, index: usize) -> Option<&TypeViewItem> {
		self.items.get(index)
	}

	pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut TypeViewItem> {
		self.items.get_mut(index)
	}

	#[must_use]
	pub fn get_by_id(&self, item_id: &str) -> Option<&TypeViewItem> {
		self.index_of_id(item_id).and_then(|index| self.items.get(index))
	}

	#[must_use]
	pub fn index_of_id(&self, item_id: &str) -> Option<usize> {
		self.positions.get(item_id).copied()
	}

	#[must_use]
	pub fn contains_id(&self, item_id: &str) -> bool {
		self.positions.contains_key(item_id)
	}

	fn reindex_from(&mut self, start: usize) {
		for (index, item) in self.items.iter().enumerate().skip(start) {
			self.positions.insert(item.key.id.clone(), index);
		}
	}

	/// Inserts at the position that keeps the collection sorted, replacing any entry with the
	/// same id. Returns the new position.
	pub fn insert_in_order(&mut self, item: TypeViewItem) -> usize {
		self.remove_by_id(item.id());

		let index = self
			.items
			.partition_point(|existing| existing.view_order(&item) == Ordering::Less);

		self.items.insert(index, item);
		self.reindex_from(index);

		index
	}

	pub fn remove_at(&mut self, index: usize) -> Option<TypeViewItem> {
		if index >= self.items.len() {
			return None;
		}

		let removed = self.items.remove(index);
		self.positions.remove(removed.id());
		self.reindex_from(index);

		Some(removed)
	}

	pub fn remove_by_id(&mut self, item_id: &str) -> Option<TypeViewItem> {
		self.index_of_id(item_id)
			.and_then(|index| self.remove_at(index))
	}

	/// Adds or updates one entry. Returns whether the collection changed.
	pub fn add_item(&mut self, item: TypeViewItem) -> bool {
		if self
			.get_by_id(item.id())
			.is_some_and(|existing| existing.same_content(&item))
		{
			return false;
		}

		self.insert_in_order(item);
		true
	}

	/// Moves an entry to where its (possibly new) key and date belong.
	/// Returns `(new_index, previous_index)`.
	pub fn update_item(&mut self, item: TypeViewItem) -> (usize, Option<usize>) {
		let previous = self.index_of_id(item.id());
		(self.insert_in_order(item), previous)
	}

	pub fn add_pending(&mut self, pending: impl IntoIterator<Item = PendingItem>) -> bool {
		pending
			.into_iter()
			.fold(false, |changed, item| self.add_item(item.into()) || changed)
	}

	pub fn add_query_result(&mut self, result: &QueryResult) -> bool {
		self.add_pending(result.keys())
	}

	pub fn set_date_for_item_id(&mut self, item_id: &str, date: DateTime<Utc>) -> bool {
		match self.get_by_id(item_id) {
			Some(existing) if existing.effective_date != date => {
				let mut item = existing.clone();
				item.effective_date = date;
				self.insert_in_order(item);
				true
			}
			_ => false,
		}
	}

	/// Clamps `range` to the collection bounds.
	#[must_use]
	pub fn correct_range(&self, range: Range<usize>) -> Range<usize> {
		let end = range.end.min(self.items.len());
		range.start.min(end)..end
	}

	#[must_use]
	pub fn select_range(&self, range: Range<usize>) -> &[TypeViewItem] {
		&self.items[self.correct_range(range)]
	}

	#[must_use]
	pub fn select_ids_in_range(&self, range: Range<usize>) -> Vec<String> {
		self.select_range(range)
			.iter()
			.map(|item| item.key.id.clone())
			.collect()
	}

	/// Entries whose id is not in `item_ids`.
	#[must_use]
	pub fn items_not_in(&self, item_ids: &HashSet<&str>) -> Vec<TypeViewItem> {
		self.items
			.iter()
			.filter(|item| !item_ids.contains(item.id()))
			.cloned()
			.collect()
	}

	/// Position of the first entry dated at or before `date`.
	#[must_use]
	pub fn index_of_closest_date(&self, date: DateTime<Utc>) -> usize {
		self.items
			.partition_point(|item| item.effective_date > date)
			.min(self.items.len().saturating_sub(1))
	}

	#[must_use]
	pub fn min_date(&self) -> Option<DateTime<Utc>> {
		self.items.last().map(|item| item.effective_date)
	}

	#[must_use]
	pub fn max_date(&self) -> Option<DateTime<Utc>> {
		self.items.first().map(|item| item.effective_date)
	}

	pub fn clear(&mut self) {
		self.items.clear();
		self.positions.clear();
	}

	/// Whether every adjacent pair is in view order.
	#[must_use]
	pub fn is_sorted(&self) -> bool {
		self.items
			.windows(2)
			.all(|pair| pair[0].view_order(&pair[1]) == Ordering::Less)
	}
}
