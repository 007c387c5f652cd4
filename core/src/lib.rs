//! Offline store for health records.
//!
//! Items of a record are read through [`TypeView`]s, ordered projections of what the remote
//! vault holds for one item type, with item bodies cached locally and downloaded on demand.
//! Local edits go through a [`SynchronizedType`]: they apply to the local store right away and
//! are journaled as [`Change`]s, which the [`ChangeManager`] later replays against the remote
//! vault, reconciling the local state with what the server answered.
//!
//! Everything hangs off a [`LocalVault`], built from an explicit [`VaultConfig`] and a
//! [`RemoteVault`] implementation.

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

mod change;
mod change_manager;
mod commit;
mod config;
mod error;
mod event;
mod item;
mod lock_table;
mod record_store;
mod remote;
mod scheduler;
mod synchronized_store;
mod synchronized_type;
mod vault;
mod view;

pub use change::{Change, ChangeQueue, ChangeTable, ChangeType};
pub use change_manager::{ChangeManager, CHANGE_STORE_KEY};
pub use commit::{
	CommitAction, CommitErrorHandler, CommitOutcome, CommitReport, DefaultCommitErrorHandler,
	ItemCommit, ItemCommitState, QueueProcess, QueueState,
};
pub use config::{
	CommitConfig, Migrate, ReadAheadMode, SchedulerConfig, VaultConfig, ViewsConfig,
	CONFIG_FILE_NAME,
};
pub use error::Error;
pub use event::{EventBus, VaultEvent};
pub use item::{Item, ItemKey, ItemType, ItemTypeRegistry, RecordId, LOCAL_VERSION};
pub use lock_table::{AutoLock, LockId, LockTable};
pub use record_store::LocalRecordStore;
pub use remote::{
	ItemQuery, NetworkReachability, PendingItem, QueryResult, QuerySections, RemoteError,
	RemoteVault, ServerStatus,
};
pub use scheduler::CommitScheduler;
pub use synchronized_store::{Downloaded, SynchronizedStore};
pub use synchronized_type::{ItemEditOperation, SynchronizedType};
pub use vault::LocalVault;
pub use view::{
	RefreshReport, RefresherReport, TypeView, TypeViewEvent, TypeViewItem, TypeViewItems,
	TypeViewRefresher, ViewRegistry,
};

pub use hv_object_store as object_store;
