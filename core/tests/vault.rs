use hv_core::{
	CommitScheduler, Error, Item, ItemQuery, ItemType, ItemTypeRegistry, LocalVault, RemoteVault,
	SchedulerConfig, VaultConfig,
};

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::tempdir;
use tracing_test::traced_test;

mod common;

use common::{day, memory_vault, record, weight, MockRemote, Op, HEIGHT, WEIGHT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Weight {
	kg: f64,
	when: DateTime<Utc>,
}

impl ItemType for Weight {
	const TYPE_ID: &'static str = WEIGHT;

	fn effective_date(&self) -> DateTime<Utc> {
		self.when
	}
}

#[tokio::test]
#[traced_test]
async fn pending_changes_survive_a_restart() -> Result<(), Box<dyn std::error::Error>> {
	let dir = tempdir()?;
	let remote = MockRemote::new();

	let config = VaultConfig::load_or_create(dir.path())?;
	let records_dir = dir.path().join("records");

	let local = {
		let vault = LocalVault::open(
			&records_dir,
			config.clone(),
			Arc::clone(&remote) as Arc<dyn RemoteVault>,
		)?;
		let store = vault.record_store(&record())?;
		let weights = store.synchronized_type_for(WEIGHT)?;

		let item = Item::from_typed(&Weight {
			kg: 70.5,
			when: day(1),
		})?;
		weights.add_new_item(item)?
	};

	let vault = LocalVault::open(
		&records_dir,
		VaultConfig::load_from(dir.path())?,
		Arc::clone(&remote) as Arc<dyn RemoteVault>,
	)?;
	assert_eq!(vault.record_ids()?, vec![record()]);

	let store = vault.record_store(&record())?;
	assert!(store.changes().has_pending_changes_for_item(WEIGHT, local.id()));

	let view = store.load_view(WEIGHT)?.expect("view was saved");
	assert!(view.contains_id(local.id()));
	assert_eq!(
		view.get_local_item_at_index(0)
			.map(|item| item.typed::<Weight>())
			.transpose()?,
		Some(Weight {
			kg: 70.5,
			when: day(1)
		})
	);

	let reports = vault.commit_offline_changes().await?;
	assert_eq!(reports.len(), 1);
	assert_eq!(reports[0].0, record());
	assert_eq!(reports[0].1.committed, 1);

	let committed = remote.items_of_type(WEIGHT);
	assert_eq!(committed[0].typed::<Weight>()?.kg, 70.5);
	assert_eq!(view.keys(), vec![committed[0].key.clone()]);

	Ok(())
}

#[tokio::test]
async fn record_level_blobs_and_reset() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;

	assert!(store.personal_image()?.is_none());
	store.put_personal_image(b"\x89PNG")?;
	assert_eq!(store.personal_image()?.as_deref(), Some(&b"\x89PNG"[..]));

	let weights = store.synchronized_type_for(WEIGHT)?;
	let item = weights.add_new_item(weight(70.0, day(1)))?;
	assert!(store.store().get_local_item(&item.key)?.is_some());

	store.reset()?;

	assert!(!store.changes().has_pending_changes()?);
	assert!(store.store().get_local_item(&item.key)?.is_none());
	assert!(weights.view().is_empty());
	assert!(store.views().saved_view_names()?.is_empty());

	// Reset is about item data, the personal image stays
	assert!(store.delete_personal_image()?);
	assert!(!store.delete_personal_image()?);

	Ok(())
}

#[tokio::test]
async fn record_stores_are_shared_until_evicted() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);

	let first = vault.record_store(&record())?;
	let second = vault.record_store(&record())?;
	assert!(Arc::ptr_eq(&first, &second));

	vault.did_receive_memory_warning();
	assert!(Arc::ptr_eq(&first, &vault.record_store(&record())?));

	let weak = Arc::downgrade(&first);
	drop((first, second));

	vault.did_receive_memory_warning();
	assert!(weak.upgrade().is_none());

	assert!(vault.delete_record_store(&record())?);
	assert!(vault.record_ids()?.is_empty());

	Ok(())
}

#[tokio::test]
async fn unknown_types_are_refused() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault =
		memory_vault(&remote).with_type_registry(ItemTypeRegistry::new().with::<Weight>("Weight"));
	let store = vault.record_store(&record())?;

	assert!(store
		.create_view("weights", WEIGHT, ItemQuery::for_type(WEIGHT))
		.is_ok());
	assert!(matches!(
		store.create_view("heights", HEIGHT, ItemQuery::for_type(HEIGHT)),
		Err(Error::UnknownType(type_id)) if type_id == HEIGHT
	));

	let weights = store.synchronized_type_for(WEIGHT)?;
	let height = Item::new(HEIGHT, day(1), serde_json::json!({ "m": 1.8 }));
	assert!(matches!(
		weights.add_new_item(height),
		Err(Error::TypeMismatch { .. })
	));

	Ok(())
}

#[tokio::test]
async fn scheduler_is_disabled_by_default() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = Arc::new(memory_vault(&remote));

	vault
		.record_store(&record())?
		.synchronized_type_for(WEIGHT)?
		.add_new_item(weight(70.0, day(1)))?;

	let scheduler = Arc::new(CommitScheduler::new(
		Arc::clone(&vault),
		SchedulerConfig::default(),
	));

	assert!(!scheduler.is_enabled());
	assert!(!scheduler.start());
	assert!(scheduler.commit_changes().await.is_none());
	assert_eq!(remote.calls(Op::Put), 0);
	assert!(vault.record_store(&record())?.changes().has_pending_changes()?);

	Ok(())
}

#[tokio::test]
async fn scheduler_waits_for_the_network() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = Arc::new(memory_vault(&remote));

	vault
		.record_store(&record())?
		.synchronized_type_for(WEIGHT)?
		.add_new_item(weight(70.0, day(1)))?;

	let config = SchedulerConfig {
		enabled: true,
		commit_frequency_secs: 0,
		check_network: true,
	};

	let offline = CommitScheduler::new(Arc::clone(&vault), config.clone())
		.with_reachability(Arc::new(|| false));
	assert!(offline.commit_changes().await.is_none());
	assert_eq!(remote.calls(Op::Put), 0);

	let online = CommitScheduler::new(Arc::clone(&vault), config).with_reachability(Arc::new(|| true));
	let reports = online.commit_changes().await.expect("scheduler is enabled");
	assert_eq!(reports.len(), 1);
	assert_eq!(reports[0].1.committed, 1);

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn scheduler_commits_on_its_timer() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = Arc::new(memory_vault(&remote));
	let store = vault.record_store(&record())?;

	store
		.synchronized_type_for(WEIGHT)?
		.add_new_item(weight(70.0, day(1)))?;

	let scheduler = Arc::new(CommitScheduler::new(
		Arc::clone(&vault),
		SchedulerConfig {
			enabled: true,
			commit_frequency_secs: 30,
			check_network: false,
		},
	));

	assert!(scheduler.start());
	assert!(scheduler.is_running());
	assert!(!scheduler.start());

	tokio::time::sleep(Duration::from_secs(45)).await;

	assert!(!store.changes().has_pending_changes()?);
	assert_eq!(remote.items_of_type(WEIGHT).len(), 1);

	scheduler.shutdown().await;
	assert!(!scheduler.is_running());

	Ok(())
}
