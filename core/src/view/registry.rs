use hv_object_store::ObjectStore;

use std::{
	collections::HashMap,
	sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{view_key, view_name_from_key, PersistedView, TypeView, TypeViewItem, TypeViewItems};
use crate::Error;

/// Open and saved views of one record, so committed changes can be reflected in all of them.
pub struct ViewRegistry {
	metadata: Arc<dyn ObjectStore>,
	open: Mutex<HashMap<String, Weak<TypeView>>>,
}

fn apply_put(items: &mut TypeViewItems, previous_id: &str, entry: &TypeViewItem) -> bool {
	let had_previous = previous_id != entry.id() && items.remove_by_id(previous_id).is_some();

	if had_previous || items.contains_id(entry.id()) {
		items.add_item(entry.clone()) || had_previous
	} else {
		false
	}
}

impl ViewRegistry {
	pub fn new(metadata: Arc<dyn ObjectStore>) -> Self {
		Self {
			metadata,
			open: Mutex::default(),
		}
	}

	pub fn register(&self, view: &Arc<TypeView>) {
		self.open
			.lock()
			.insert(view.name().to_string(), Arc::downgrade(view));
	}

	#[must_use]
	pub fn get_open(&self, name: &str) -> Option<Arc<TypeView>> {
		let mut open = self.open.lock();
		let view = open.get(name).and_then(Weak::upgrade);
		if view.is_none() {
			open.remove(name);
		}

		view
	}

	#[must_use]
	pub fn open_views(&self) -> Vec<Arc<TypeView>> {
		let mut open = self.open.lock();
		open.retain(|_, view| view.strong_count() > 0);
		open.values().filter_map(Weak::upgrade).collect()
	}

	pub fn saved_view_names(&self) -> Result<Vec<String>, Error> {
		Ok(self
			.metadata
			.all_keys()?
			.iter()
			.filter_map(|key| view_name_from_key(key))
			.map(ToString::to_string)
			.collect())
	}

	/// Runs `apply` over the entries of every view of `type_id`, open or saved, and saves the
	/// views it changed.
	fn apply(
		&self,
		type_id: &str,
		apply: impl Fn(&mut TypeViewItems) -> bool,
	) -> Result<(), Error> {
		let open = self.open_views();

		for view in open.iter().filter(|view| view.type_id() == type_id) {
			let changed = apply(&mut view.state.write().items);
			if changed {
				view.save()?;
			}
		}

		for name in self.saved_view_names()? {
			if open.iter().any(|view| view.name() == name) {
				continue;
			}

			let Some(mut persisted) = PersistedView::load(self.metadata.as_ref(), &name)? else {
				continue;
			};

			if persisted.type_id == type_id && apply(&mut persisted.items) {
				persisted.save(self.metadata.as_ref())?;
				debug!(view = %name, "Updated saved view");
			}
		}

		Ok(())
	}

	/// Reflects a committed put: the entry known as `previous_id` now is `entry`.
	pub fn apply_put(
		&self,
		type_id: &str,
		previous_id: &str,
		entry: &TypeViewItem,
	) -> Result<(), Error> {
		self.apply(type_id, |items| apply_put(items, previous_id, entry))
	}

	pub fn apply_remove(&self, type_id: &str, item_id: &str) -> Result<(), Error> {
		self.apply(type_id, |items| items.remove_by_id(item_id).is_some())
	}

	pub fn delete_view(&self, name: &str) -> Result<bool, Error> {
		self.open.lock().remove(name);
		self.metadata.delete_key(&view_key(name)).map_err(Into::into)
	}

	/// Empties open views and deletes saved ones.
	pub fn reset(&self) -> Result<(), Error> {
		for view in self.open_views() {
			view.reset();
		}

		for name in self.saved_view_names()? {
			if let Err(e) = self.metadata.delete_key(&view_key(&name)) {
				warn!(view = %name, ?e, "Failed to delete saved view");
			}
		}

		Ok(())
	}
}
