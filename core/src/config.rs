//! Vault configuration

use hv_object_store::FileIOError;

use std::{
	fs,
	io,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::Error;

pub const CONFIG_FILE_NAME: &str = "vault.json";

/// Versioned configuration that knows how to upgrade itself.
pub trait Migrate {
	fn current_version(&self) -> u32;

	fn target_version() -> u32;

	fn migrate(&mut self) -> Result<(), Error>;
}

/// Offline store configuration, handed explicitly to [`crate::LocalVault`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
	/// Config schema version
	pub version: u32,

	#[serde(default)]
	pub commit: CommitConfig,

	#[serde(default)]
	pub scheduler: SchedulerConfig,

	#[serde(default)]
	pub views: ViewsConfig,

	/// Keep recently read objects in memory
	#[serde(default = "default_true")]
	pub cache_enabled: bool,
}

const fn default_true() -> bool {
	true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitConfig {
	/// Explicit commit requests are ignored when disabled
	pub enabled: bool,

	/// A change that fails this many times is skipped until the next run
	pub max_attempts_per_change: u32,

	/// Publish commit progress on the vault event bus
	pub broadcast_events: bool,
}

impl Default for CommitConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			max_attempts_per_change: 3,
			broadcast_events: true,
		}
	}
}

/// Background commits stay off until an application opts in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
	pub enabled: bool,

	/// Seconds between timer driven commits, 0 commits only on demand
	pub commit_frequency_secs: u64,

	/// Skip a run when the network is known to be unreachable
	pub check_network: bool,
}

impl SchedulerConfig {
	#[must_use]
	pub const fn commit_frequency(&self) -> Option<Duration> {
		if self.commit_frequency_secs == 0 {
			None
		} else {
			Some(Duration::from_secs(self.commit_frequency_secs))
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadAheadMode {
	/// Fetch the whole chunk aligned window around the requested range
	#[default]
	Page,
	/// Fetch the chunk following the requested range
	Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewsConfig {
	pub read_ahead_chunk_size: usize,
	pub read_ahead_mode: ReadAheadMode,

	/// The service caps how many items a single request may ask for
	pub max_download_batch: usize,

	#[serde(default)]
	pub default_max_items: Option<usize>,
}

impl Default for ViewsConfig {
	fn default() -> Self {
		Self {
			read_ahead_chunk_size: 50,
			read_ahead_mode: ReadAheadMode::Page,
			max_download_batch: 240,
			default_max_items: None,
		}
	}
}

impl Default for VaultConfig {
	fn default() -> Self {
		Self {
			version: Self::target_version(),
			commit: CommitConfig::default(),
			scheduler: SchedulerConfig::default(),
			views: ViewsConfig::default(),
			cache_enabled: true,
		}
	}
}

impl VaultConfig {
	/// Load configuration from `dir`, migrating and re-saving older versions.
	pub fn load_from(dir: impl AsRef<Path>) -> Result<Self, Error> {
		let path = config_path(dir.as_ref());

		info!(path = %path.display(), "Loading vault config");
		let json = fs::read_to_string(&path).map_err(|e| FileIOError::from((&path, e)))?;
		let mut config = serde_json::from_str::<Self>(&json).map_err(Error::ConfigParse)?;

		if config.current_version() > Self::target_version() {
			return Err(Error::ConfigVersion {
				found: config.current_version(),
				supported: Self::target_version(),
			});
		}

		if config.current_version() < Self::target_version() {
			info!(
				"Migrating vault config from v{} to v{}",
				config.version,
				Self::target_version()
			);
			config.migrate()?;
			config.save_to(dir)?;
		}

		Ok(config)
	}

	/// Load configuration from `dir`, writing the defaults there if there is none yet.
	pub fn load_or_create(dir: impl AsRef<Path>) -> Result<Self, Error> {
		let dir = dir.as_ref();

		match Self::load_from(dir) {
			Err(Error::FileIO(FileIOError { source, .. }))
				if source.kind() == io::ErrorKind::NotFound =>
			{
				warn!(dir = %dir.display(), "No vault config found, creating default");
				let config = Self::default();
				config.save_to(dir)?;
				Ok(config)
			}
			res => res,
		}
	}

	pub fn save_to(&self, dir: impl AsRef<Path>) -> Result<(), Error> {
		let dir = dir.as_ref();
		fs::create_dir_all(dir).map_err(|e| FileIOError::from((dir, e)))?;

		let path = config_path(dir);
		let json = serde_json::to_string_pretty(self).map_err(Error::ConfigParse)?;
		fs::write(&path, json).map_err(|e| FileIOError::from((&path, e)))?;

		info!(path = %path.display(), "Saved vault config");
		Ok(())
	}
}

fn config_path(dir: &Path) -> PathBuf {
	dir.join(CONFIG_FILE_NAME)
}

impl Migrate for VaultConfig {
	fn current_version(&self) -> u32 {
		self.version
	}

	fn target_version() -> u32 {
		2
	}

	fn migrate(&mut self) -> Result<(), Error> {
		match self.version {
			0 => {
				self.version = 1;
				self.migrate()
			}
			1 => {
				// v2 introduced the views section
				self.views = ViewsConfig::default();
				self.version = 2;
				Ok(())
			}
			_ => Ok(()),
		}
	}
}
