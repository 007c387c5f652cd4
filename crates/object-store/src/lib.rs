#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! Key/value persistence used by the offline store.
//!
//! An [`ObjectStore`] maps string keys to opaque blobs and can be namespaced into child
//! stores. Typed objects are written through [`ObjectStoreExt`], which tags every payload with
//! a name so a reader can tell what it is looking at before decoding it.
//!
//! Every operation is synchronous and may be called from any thread.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

mod caching;
mod directory;
mod error;
mod memory;
mod object;
mod partitioned;

pub use caching::CachingStore;
pub use directory::Directory;
pub use error::{report_error, Error, FileIOError};
pub use memory::MemoryStore;
pub use object::{decode_object, encode_object};
pub use partitioned::PartitionedObjectStore;

pub trait ObjectStore: Send + Sync + 'static {
	/// All keys directly held by this store, child stores excluded.
	fn all_keys(&self) -> Result<Vec<String>, Error>;

	fn key_exists(&self, key: &str) -> bool;

	fn create_date(&self, key: &str) -> Result<Option<DateTime<Utc>>, Error>;

	fn update_date(&self, key: &str) -> Result<Option<DateTime<Utc>>, Error>;

	/// Returns `false` if there was nothing to delete.
	fn delete_key(&self, key: &str) -> Result<bool, Error>;

	fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

	fn put_blob(&self, key: &str, blob: &[u8]) -> Result<(), Error>;

	/// Same as [`ObjectStore::get_blob`], but skips any in-memory cache layered on top.
	fn refresh_and_get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
		self.get_blob(key)
	}

	/// Opens the named child store, creating it if needed.
	fn new_child_store(&self, name: &str) -> Result<Arc<dyn ObjectStore>, Error>;

	fn child_store_exists(&self, name: &str) -> bool;

	fn child_store_names(&self) -> Result<Vec<String>, Error>;

	/// Returns `false` if there was no such child store.
	fn delete_child_store(&self, name: &str) -> Result<bool, Error>;

	fn clear_cache(&self) {}
}

/// Typed access on top of any [`ObjectStore`].
pub trait ObjectStoreExt: ObjectStore {
	fn get_object<T: DeserializeOwned>(&self, key: &str, name: &str) -> Result<Option<T>, Error> {
		self.get_blob(key)?
			.map(|blob| decode_object(key, name, &blob))
			.transpose()
	}

	fn refresh_and_get_object<T: DeserializeOwned>(
		&self,
		key: &str,
		name: &str,
	) -> Result<Option<T>, Error> {
		self.refresh_and_get_blob(key)?
			.map(|blob| decode_object(key, name, &blob))
			.transpose()
	}

	fn put_object<T: Serialize + ?Sized>(
		&self,
		key: &str,
		name: &str,
		object: &T,
	) -> Result<(), Error> {
		self.put_blob(key, &encode_object(key, name, object)?)
	}
}

impl<S: ObjectStore + ?Sized> ObjectStoreExt for S {}

/// Keys and child store names end up as file names, so they're restricted to a single
/// path component.
pub fn validate_key(key: &str) -> Result<(), Error> {
	if key.is_empty()
		|| key.starts_with('.')
		|| key.contains(['/', '\\', '\0'])
		|| key.len() > 200
	{
		return Err(Error::InvalidKey(key.to_string()));
	}

	Ok(())
}
