use std::collections::VecDeque;

use tracing::trace;

use super::{Change, ChangeTable};
use crate::Error;

/// Walks pending changes type by type, oldest first within a type.
///
/// The list of types is fixed when the queue is created and each type's order is captured when
/// the queue reaches it. Every change is re-read right before it is handed out, so changes
/// removed in the meantime are skipped and updated ones are returned in their latest state.
pub struct ChangeQueue<'table> {
	table: &'table ChangeTable,
	types: VecDeque<String>,
	current: VecDeque<(String, String)>,
}

impl<'table> ChangeQueue<'table> {
	pub(super) fn new(table: &'table ChangeTable, types: Vec<String>) -> Self {
		Self {
			table,
			types: types.into(),
			current: VecDeque::new(),
		}
	}

	fn load_next_type(&mut self) -> Result<bool, Error> {
		while let Some(type_id) = self.types.pop_front() {
			let changes = self.table.get_all_for_type(&type_id)?;
			if changes.is_empty() {
				continue;
			}

			trace!(%type_id, count = changes.len(), "Queued changes for type");
			self.current = changes
				.into_iter()
				.map(|change| (change.type_id, change.key.id))
				.collect();

			return Ok(true);
		}

		Ok(false)
	}

	pub fn next_change(&mut self) -> Result<Option<Change>, Error> {
		loop {
			while let Some((type_id, item_id)) = self.current.pop_front() {
				if let Some(change) = self.table.get(&type_id, &item_id)? {
					return Ok(Some(change));
				}
			}

			if !self.load_next_type()? {
				return Ok(None);
			}
		}
	}
}
