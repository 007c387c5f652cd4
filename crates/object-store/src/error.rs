use std::{fmt::Display, io, path::Path};

use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid store key: <key='{0}'>")]
	InvalidKey(String),
	#[error("object <key='{key}'> was stored as '{found}' but was read as '{expected}'")]
	UnexpectedName {
		key: String,
		expected: String,
		found: String,
	},
	#[error("failed to encode object <key='{key}'>: {source}")]
	Encode {
		key: String,
		#[source]
		source: rmp_serde::encode::Error,
	},
	#[error("failed to decode object <key='{key}'>: {source}")]
	Decode {
		key: String,
		#[source]
		source: rmp_serde::decode::Error,
	},

	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

/// Report an error with tracing
pub fn report_error<T>(res: &Result<T, impl Display>) {
	if let Err(e) = res {
		error!("{e:#}");
	}
}

/// An I/O failure on a store file or directory, with the path it happened on.
///
/// Built from `(path, io::Error)`, or `(path, io::Error, context)` to say what was being done.
#[derive(Error, Debug)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: io::Error,
	pub context: Option<&'static str>,
}

impl Display for FileIOError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "I/O error <path='{}'>", self.path.display())?;

		if let Some(context) = self.context {
			write!(f, " while trying to {context}")?;
		}

		write!(f, ": {}", self.source)
	}
}

impl<P: AsRef<Path>> From<(P, io::Error)> for FileIOError {
	fn from((path, source): (P, io::Error)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			context: None,
		}
	}
}

impl<P: AsRef<Path>> From<(P, io::Error, &'static str)> for FileIOError {
	fn from((path, source, context): (P, io::Error, &'static str)) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			context: Some(context),
		}
	}
}
