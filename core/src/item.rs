use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Version given to keys of items that only exist locally.
pub const LOCAL_VERSION: &str = "local";

/// Identifies the health record that items belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RecordId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Identifies one version of a remote item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
	pub id: String,
	pub version: String,
}

impl ItemKey {
	pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			version: version.into(),
		}
	}

	/// A placeholder key for an item the remote vault has never seen.
	#[must_use]
	pub fn new_local() -> Self {
		Self::new(Uuid::new_v4().to_string(), LOCAL_VERSION)
	}

	#[must_use]
	pub fn is_local(&self) -> bool {
		self.version == LOCAL_VERSION
	}
}

impl fmt::Display for ItemKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}@{}", self.id, self.version)
	}
}

/// A typed payload that can travel inside an [`Item`].
pub trait ItemType: Serialize + DeserializeOwned {
	const TYPE_ID: &'static str;

	fn effective_date(&self) -> DateTime<Utc>;
}

/// A full item body. The payload is kept opaque, only [`ItemType`] implementors interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
	pub key: ItemKey,
	pub type_id: String,
	pub effective_date: DateTime<Utc>,
	/// Correlation id stamped on every write, used to detect a put that already happened.
	#[serde(default)]
	pub client_id: Option<String>,
	#[serde(default)]
	pub data: serde_json::Value,
}

impl Item {
	pub fn new(
		type_id: impl Into<String>,
		effective_date: DateTime<Utc>,
		data: serde_json::Value,
	) -> Self {
		Self {
			key: ItemKey::new_local(),
			type_id: type_id.into(),
			effective_date,
			client_id: None,
			data,
		}
	}

	/// Wraps a typed payload in a new local item.
	pub fn from_typed<T: ItemType>(payload: &T) -> Result<Self, Error> {
		let data = serde_json::to_value(payload).map_err(|source| Error::Payload {
			type_id: T::TYPE_ID.to_string(),
			source,
		})?;

		Ok(Self::new(T::TYPE_ID, payload.effective_date(), data))
	}

	pub fn typed<T: ItemType>(&self) -> Result<T, Error> {
		if self.type_id != T::TYPE_ID {
			return Err(Error::TypeMismatch {
				expected: T::TYPE_ID.to_string(),
				found: self.type_id.clone(),
			});
		}

		serde_json::from_value(self.data.clone()).map_err(|source| Error::Payload {
			type_id: self.type_id.clone(),
			source,
		})
	}

	/// Replaces the payload, keeping key and correlation id.
	pub fn set_typed<T: ItemType>(&mut self, payload: &T) -> Result<(), Error> {
		let Self {
			type_id,
			effective_date,
			data,
			..
		} = Self::from_typed(payload)?;

		self.type_id = type_id;
		self.effective_date = effective_date;
		self.data = data;

		Ok(())
	}

	#[must_use]
	pub fn id(&self) -> &str {
		&self.key.id
	}

	/// Same type, date and payload, whatever the key or correlation id.
	#[must_use]
	pub fn has_same_content(&self, other: &Self) -> bool {
		self.type_id == other.type_id
			&& self.effective_date == other.effective_date
			&& self.data == other.data
	}
}

/// Type ids the application knows about, with a display name for each.
#[derive(Debug, Clone, Default)]
pub struct ItemTypeRegistry {
	names: HashMap<String, String>,
}

impl ItemTypeRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn with<T: ItemType>(mut self, name: impl Into<String>) -> Self {
		self.register::<T>(name);
		self
	}

	pub fn register<T: ItemType>(&mut self, name: impl Into<String>) {
		self.register_id(T::TYPE_ID, name);
	}

	pub fn register_id(&mut self, type_id: impl Into<String>, name: impl Into<String>) {
		self.names.insert(type_id.into(), name.into());
	}

	#[must_use]
	pub fn name_for(&self, type_id: &str) -> Option<&str> {
		self.names.get(type_id).map(String::as_str)
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.names.is_empty()
	}

	/// An empty registry accepts every type id.
	pub fn validate(&self, type_id: &str) -> Result<(), Error> {
		if self.names.is_empty() || self.names.contains_key(type_id) {
			Ok(())
		} else {
			Err(Error::UnknownType(type_id.to_string()))
		}
	}
}
