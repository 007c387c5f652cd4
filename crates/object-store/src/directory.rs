use std::{
	fs, io,
	path::{Path, PathBuf},
	sync::Arc,
	time::SystemTime,
};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{validate_key, Error, FileIOError, ObjectStore};

/// An [`ObjectStore`] over a filesystem directory.
///
/// Each key is a file and each child store is a sub-directory.
#[derive(Debug, Clone)]
pub struct Directory {
	path: PathBuf,
}

impl Directory {
	/// Opens the directory at `path`, creating it and any missing parents.
	pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
		let path = path.as_ref();

		fs::create_dir_all(path)
			.map_err(|e| FileIOError::from((path, e, "create the store directory")))?;

		Ok(Self { path: path.into() })
	}

	#[must_use]
	pub fn path(&self) -> &Path {
		&self.path
	}

	fn file_path(&self, key: &str) -> Result<PathBuf, Error> {
		validate_key(key)?;
		Ok(self.path.join(key))
	}

	fn metadata(&self, key: &str) -> Result<Option<fs::Metadata>, Error> {
		let path = self.file_path(key)?;

		match fs::metadata(&path) {
			Ok(metadata) if metadata.is_file() => Ok(Some(metadata)),
			Ok(_) => Ok(None),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(FileIOError::from((path, e)).into()),
		}
	}

	fn entries(&self, want_dirs: bool) -> Result<Vec<String>, Error> {
		let read_dir = match fs::read_dir(&self.path) {
			Ok(read_dir) => read_dir,
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
			Err(e) => return Err(FileIOError::from((&self.path, e)).into()),
		};

		let mut names = Vec::new();
		for entry in read_dir {
			let entry = entry.map_err(|e| FileIOError::from((&self.path, e)))?;
			let file_type = entry
				.file_type()
				.map_err(|e| FileIOError::from((entry.path(), e)))?;

			if file_type.is_dir() != want_dirs {
				continue;
			}

			// Skip leftovers of interrupted writes and anything we couldn't have written.
			if let Some(name) = entry.file_name().to_str() {
				if validate_key(name).is_ok() {
					names.push(name.to_string());
				}
			}
		}

		names.sort_unstable();

		Ok(names)
	}
}

fn to_utc(time: io::Result<SystemTime>) -> Option<DateTime<Utc>> {
	time.ok().map(DateTime::<Utc>::from)
}

impl ObjectStore for Directory {
	fn all_keys(&self) -> Result<Vec<String>, Error> {
		self.entries(false)
	}

	fn key_exists(&self, key: &str) -> bool {
		matches!(self.metadata(key), Ok(Some(_)))
	}

	fn create_date(&self, key: &str) -> Result<Option<DateTime<Utc>>, Error> {
		Ok(self
			.metadata(key)?
			.and_then(|metadata| to_utc(metadata.created()).or_else(|| to_utc(metadata.modified()))))
	}

	fn update_date(&self, key: &str) -> Result<Option<DateTime<Utc>>, Error> {
		Ok(self
			.metadata(key)?
			.and_then(|metadata| to_utc(metadata.modified())))
	}

	fn delete_key(&self, key: &str) -> Result<bool, Error> {
		let path = self.file_path(key)?;

		match fs::remove_file(&path) {
			Ok(()) => {
				trace!(path = %path.display(), "Deleted key");
				Ok(true)
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(FileIOError::from((path, e)).into()),
		}
	}

	fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
		let path = self.file_path(key)?;

		match fs::read(&path) {
			Ok(blob) => Ok(Some(blob)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(FileIOError::from((path, e)).into()),
		}
	}

	fn put_blob(&self, key: &str, blob: &[u8]) -> Result<(), Error> {
		let path = self.file_path(key)?;

		fs::create_dir_all(&self.path).map_err(|e| FileIOError::from((&self.path, e)))?;

		// Write then rename, so readers never observe a partially written blob
		let tmp_path = self.path.join(format!(".{key}.{}.tmp", Uuid::new_v4()));

		fs::write(&tmp_path, blob)
			.map_err(|e| FileIOError::from((&tmp_path, e, "write a temporary file")))?;

		if let Err(e) = fs::rename(&tmp_path, &path) {
			// Best effort, the original error is the one worth reporting
			let _ = fs::remove_file(&tmp_path);
			return Err(FileIOError::from((path, e, "replace the stored blob")).into());
		}

		Ok(())
	}

	fn new_child_store(&self, name: &str) -> Result<Arc<dyn ObjectStore>, Error> {
		validate_key(name)?;
		Ok(Arc::new(Self::open(self.path.join(name))?))
	}

	fn child_store_exists(&self, name: &str) -> bool {
		validate_key(name).is_ok() && self.path.join(name).is_dir()
	}

	fn child_store_names(&self) -> Result<Vec<String>, Error> {
		self.entries(true)
	}

	fn delete_child_store(&self, name: &str) -> Result<bool, Error> {
		validate_key(name)?;
		let path = self.path.join(name);

		match fs::remove_dir_all(&path) {
			Ok(()) => {
				debug!(path = %path.display(), "Deleted child store");
				Ok(true)
			}
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(FileIOError::from((path, e)).into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ObjectStoreExt;

	use tempfile::tempdir;

	#[test]
	fn blobs_round_trip_through_files() {
		let dir = tempdir().unwrap();
		let store = Directory::open(dir.path().join("root")).unwrap();

		assert!(!store.key_exists("a"));
		assert_eq!(store.get_blob("a").unwrap(), None);

		store.put_blob("a", b"hello").unwrap();
		store.put_blob("a", b"hello again").unwrap();

		assert!(store.key_exists("a"));
		assert_eq!(store.get_blob("a").unwrap().as_deref(), Some(&b"hello again"[..]));
		assert!(store.update_date("a").unwrap().is_some());
		assert!(store.create_date("a").unwrap().is_some());
		assert_eq!(store.all_keys().unwrap(), vec!["a".to_string()]);

		assert!(store.delete_key("a").unwrap());
		assert!(!store.delete_key("a").unwrap());
		assert!(store.all_keys().unwrap().is_empty());
	}

	#[test]
	fn child_stores_are_separate_namespaces() {
		let dir = tempdir().unwrap();
		let store = Directory::open(dir.path()).unwrap();

		let child = store.new_child_store("metadata").unwrap();
		child.put_object("view", "TypeView", &vec![1_u8, 2, 3]).unwrap();

		assert!(store.child_store_exists("metadata"));
		assert!(!store.key_exists("view"));
		assert!(store.all_keys().unwrap().is_empty());
		assert_eq!(store.child_store_names().unwrap(), vec!["metadata".to_string()]);

		let reopened = store.new_child_store("metadata").unwrap();
		assert_eq!(
			reopened.get_object::<Vec<u8>>("view", "TypeView").unwrap(),
			Some(vec![1, 2, 3])
		);

		assert!(store.delete_child_store("metadata").unwrap());
		assert!(!store.child_store_exists("metadata"));
		assert!(!store.delete_child_store("metadata").unwrap());
	}

	#[test]
	fn invalid_keys_never_touch_the_filesystem() {
		let dir = tempdir().unwrap();
		let store = Directory::open(dir.path()).unwrap();

		assert!(store.put_blob("../escape", b"x").is_err());
		assert!(!store.key_exists("../escape"));
		assert!(store.new_child_store("a/b").is_err());
	}
}
