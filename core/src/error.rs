use hv_object_store::FileIOError;

use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Store(#[from] hv_object_store::Error),
	#[error(transparent)]
	Remote(#[from] RemoteError),

	#[error("lock is no longer valid <key='{0}'>")]
	LockLost(String),
	#[error("item is locked by another writer <key='{0}'>")]
	ItemLocked(String),
	#[error(
		"a remove is pending for item <type_id='{type_id}', item_id='{item_id}'>, \
		it must be committed before the item can be put again"
	)]
	PendingRemove { type_id: String, item_id: String },
	#[error("put change has no item snapshot <change_id='{0}'>")]
	MissingSnapshot(String),
	#[error("commit cancelled")]
	Cancelled,

	#[error("unknown item type <type_id='{0}'>")]
	UnknownType(String),
	#[error("item type mismatch: expected '{expected}', found '{found}'")]
	TypeMismatch { expected: String, found: String },
	#[error("failed to convert item payload <type_id='{type_id}'>: {source}")]
	Payload {
		type_id: String,
		#[source]
		source: serde_json::Error,
	},

	#[error("failed to parse vault config: {0}")]
	ConfigParse(#[source] serde_json::Error),
	#[error("vault config version {found} is newer than the supported version {supported}")]
	ConfigVersion { found: u32, supported: u32 },
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

impl Error {
	/// The remote failure behind this error, if any.
	#[must_use]
	pub const fn as_remote(&self) -> Option<&RemoteError> {
		match self {
			Self::Remote(e) => Some(e),
			_ => None,
		}
	}
}
