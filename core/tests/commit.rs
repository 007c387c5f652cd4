use hv_core::{
	ChangeType, CommitReport, Error, LocalVault, QueueProcess, RemoteError, RemoteVault,
	ServerStatus, VaultConfig, VaultEvent,
};
use hv_object_store::MemoryStore;

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

mod common;

use common::{
	day, memory_vault, memory_vault_with_config, record, weight, MockRemote, Op, StalledRemote,
	WEIGHT,
};

#[tokio::test]
#[traced_test]
async fn permanent_rejection_does_not_block_the_queue() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;

	let a = weights.add_new_item(weight(70.0, day(1)))?;
	let b = weights.add_new_item(weight(71.0, day(2)))?;

	remote.fail_always(
		Op::Put,
		a.id(),
		RemoteError::server(ServerStatus::InvalidItem, "bad weight"),
	);

	let report = store
		.commit_offline_changes()
		.await?
		.expect("commits are enabled");

	assert_eq!(report.committed, 1);
	assert_eq!(report.failed, 1);
	assert!(!report.aborted);

	let pending = store
		.changes()
		.get_change(WEIGHT, a.id())?
		.expect("rejected change stays queued");
	assert_eq!(pending.attempt_count, 1);
	assert!(store.changes().get_change(WEIGHT, b.id())?.is_none());

	let committed = remote.items_of_type(WEIGHT);
	assert_eq!(committed.len(), 1);
	assert_eq!(committed[0].data, json!({ "kg": 71.0 }));

	let view = weights.view();
	assert!(view.keys().contains(&committed[0].key));
	assert!(!view.contains_id(b.id()));
	assert!(view.contains_id(a.id()));

	// The committed body replaced the local one
	assert!(store.store().get_local_item(&committed[0].key)?.is_some());
	assert!(store.store().get_local_item_by_id(b.id())?.is_none());

	Ok(())
}

#[tokio::test]
async fn removing_an_uncommitted_item_leaves_nothing_to_commit(
) -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;

	let item = weights.add_new_item(weight(70.0, day(1)))?;
	assert!(weights.has_pending_changes()?);

	assert!(weights.remove_item_with_key(&item.key)?);
	assert!(!store.changes().has_pending_changes()?);
	assert!(weights.view().is_empty());

	let report = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(report, CommitReport::default());
	assert_eq!(remote.calls(Op::Put), 0);
	assert_eq!(remote.calls(Op::Remove), 0);

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn removing_an_edited_remote_item_collapses_to_a_remove(
) -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let seeded = remote.seed(weight(70.0, day(1)));

	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;
	weights.refresh().await?.expect("nothing pending yet");

	let mut edit = weights
		.open_item_for_edit(0)
		.await?
		.expect("seeded item is in the view");
	edit.item_mut().data = json!({ "kg": 80.0 });
	assert!(edit.is_modified());
	edit.commit()?;

	let change = store
		.changes()
		.get_change(WEIGHT, seeded.id())?
		.expect("edit was tracked");
	assert_eq!(change.change_type, ChangeType::Put);

	assert!(weights.remove_item_with_key(&seeded.key)?);

	let changes = store.changes().table().get_all()?;
	assert_eq!(changes.len(), 1);
	assert_eq!(changes[0].change_type, ChangeType::Remove);
	assert_eq!(changes[0].change_id, change.change_id);

	// Puts are refused until the remove is committed
	let lock = store.changes().locks().acquire_lock(seeded.id());
	assert!(matches!(
		weights.put_item(&seeded, lock),
		Err(Error::PendingRemove { .. })
	));
	store.changes().locks().release_lock(lock, seeded.id());

	let report = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(report.committed, 1);
	assert!(remote.item(seeded.id()).is_none());
	assert_eq!(remote.calls(Op::Put), 0);
	assert!(!store.changes().has_pending_changes()?);

	Ok(())
}

#[tokio::test]
async fn committed_changes_are_never_resubmitted() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;

	weights.add_new_item(weight(70.0, day(1)))?;

	let first = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(first.committed, 1);

	let second = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(second, CommitReport::default());

	assert_eq!(remote.calls(Op::Put), 1);
	assert_eq!(remote.items_of_type(WEIGHT).len(), 1);

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn retry_adopts_a_create_that_already_happened() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;

	let item = weights.add_new_item(weight(70.0, day(1)))?;
	remote.apply_then_fail_once(item.id(), RemoteError::Timeout);

	let first = store.commit_offline_changes().await?.expect("commit ran");
	assert!(first.aborted);
	assert_eq!(first.committed, 0);
	assert_eq!(remote.items_of_type(WEIGHT).len(), 1);

	let second = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(second.committed, 1);

	let committed = remote.items_of_type(WEIGHT);
	assert_eq!(committed.len(), 1, "retry must not create a duplicate");
	assert_eq!(remote.calls(Op::Put), 1);
	assert!(weights.view().keys().contains(&committed[0].key));
	assert!(!store.changes().has_pending_changes()?);

	Ok(())
}

#[tokio::test]
async fn edits_made_after_a_lost_reply_are_still_written() -> Result<(), Box<dyn std::error::Error>>
{
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;

	let item = weights.add_new_item(weight(70.0, day(1)))?;
	remote.apply_then_fail_once(item.id(), RemoteError::Timeout);

	let first = store.commit_offline_changes().await?.expect("commit ran");
	assert!(first.aborted);
	assert_eq!(remote.items_of_type(WEIGHT).len(), 1);

	let mut edit = weights
		.open_item_for_edit_with_key(&item.key)
		.await?
		.expect("item is cached");
	edit.item_mut().data = json!({ "kg": 75.0 });
	edit.commit()?;

	let second = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(second.committed, 1);

	let committed = remote.items_of_type(WEIGHT);
	assert_eq!(committed.len(), 1, "the first write is updated, not duplicated");
	assert_eq!(committed[0].data, json!({ "kg": 75.0 }));
	assert_eq!(remote.calls(Op::Put), 2);

	assert!(!store.changes().has_pending_changes()?);
	assert_eq!(
		store
			.store()
			.get_local_item(&committed[0].key)?
			.map(|item| item.data),
		Some(json!({ "kg": 75.0 }))
	);

	Ok(())
}

#[tokio::test]
async fn retry_adopts_an_update_that_already_happened() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let seeded = remote.seed(weight(70.0, day(1)));

	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;
	weights.refresh().await?;

	let mut edit = weights
		.open_item_for_edit_with_key(&seeded.key)
		.await?
		.expect("seeded item exists");
	edit.item_mut().data = json!({ "kg": 68.5 });
	edit.commit()?;

	remote.apply_then_fail_once(seeded.id(), RemoteError::Network("reset".into()));

	let first = store.commit_offline_changes().await?.expect("commit ran");
	assert!(first.aborted);

	let second = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(second.committed, 1);
	assert_eq!(remote.calls(Op::Put), 1);

	let stored = remote.item(seeded.id()).expect("still there");
	assert_eq!(stored.data, json!({ "kg": 68.5 }));
	assert_ne!(stored.key, seeded.key);
	assert_eq!(weights.view().keys(), vec![stored.key]);

	Ok(())
}

#[tokio::test]
async fn network_failure_aborts_the_run() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;

	let first = weights.add_new_item(weight(70.0, day(1)))?;
	let second = weights.add_new_item(weight(71.0, day(2)))?;

	remote.set_offline(true);

	let report = store.commit_offline_changes().await?.expect("commit ran");
	assert!(report.aborted);
	assert_eq!(report.failed, 1);
	assert_eq!(report.committed, 0);

	let changes = store.changes();
	assert_eq!(
		changes.get_change(WEIGHT, first.id())?.map(|c| c.attempt_count),
		Some(1)
	);
	assert_eq!(
		changes.get_change(WEIGHT, second.id())?.map(|c| c.attempt_count),
		Some(0)
	);

	remote.set_offline(false);

	let report = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(report.committed, 2);
	assert_eq!(remote.items_of_type(WEIGHT).len(), 2);

	Ok(())
}

#[tokio::test]
async fn transient_server_errors_are_retried_up_to_the_limit(
) -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;

	let item = weights.add_new_item(weight(70.0, day(1)))?;
	remote.fail_always(
		Op::Put,
		item.id(),
		RemoteError::server(ServerStatus::ServerError, "busy"),
	);

	let report = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(report.failed, 1);
	assert!(!report.aborted);

	let max_attempts = VaultConfig::default().commit.max_attempts_per_change;
	assert_eq!(remote.calls(Op::Put), max_attempts as usize);
	assert_eq!(
		store
			.changes()
			.get_change(WEIGHT, item.id())?
			.map(|c| c.attempt_count),
		Some(max_attempts)
	);

	Ok(())
}

#[tokio::test]
async fn locked_items_are_left_for_the_next_run() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;

	let item = weights.add_new_item(weight(70.0, day(1)))?;
	let lock = store.changes().locks().acquire_lock(item.id());

	let report = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(report.skipped_locked, 1);
	assert_eq!(remote.calls(Op::Put), 0);
	assert!(store.changes().has_pending_changes()?);

	assert!(store.changes().locks().release_lock(lock, item.id()));

	let report = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(report.committed, 1);

	Ok(())
}

#[tokio::test]
#[traced_test]
async fn update_of_a_vanished_item_is_written_as_new() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let seeded = remote.seed(weight(70.0, day(1)));

	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;
	weights.refresh().await?;

	let mut edit = weights
		.open_item_for_edit(0)
		.await?
		.expect("seeded item is in the view");
	edit.item_mut().data = json!({ "kg": 75.0 });
	edit.commit()?;

	remote.delete(seeded.id());

	let report = store.commit_offline_changes().await?.expect("commit ran");
	assert_eq!(report.committed, 1);

	let committed = remote.items_of_type(WEIGHT);
	assert_eq!(committed.len(), 1);
	assert_ne!(committed[0].key.id, seeded.key.id);
	assert_eq!(committed[0].data, json!({ "kg": 75.0 }));

	let view = weights.view();
	assert_eq!(view.keys(), vec![committed[0].key.clone()]);
	assert!(!view.contains_id(seeded.id()));

	Ok(())
}

#[tokio::test]
async fn cancelled_run_leaves_changes_untouched() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);
	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;

	let item = weights.add_new_item(weight(70.0, day(1)))?;

	let cancel = CancellationToken::new();
	cancel.cancel();

	let report = QueueProcess::new(store.changes(), cancel).run().await?;
	assert!(report.cancelled);
	assert_eq!(report.committed, 0);
	assert_eq!(remote.calls(Op::Put), 0);
	assert_eq!(
		store
			.changes()
			.get_change(WEIGHT, item.id())?
			.map(|c| c.attempt_count),
		Some(0)
	);

	assert!(!store.changes().cancel_active_commits());

	Ok(())
}

#[tokio::test]
async fn disabled_commits_do_nothing() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();

	let mut config = VaultConfig::default();
	config.commit.enabled = false;

	let vault = memory_vault_with_config(&remote, config);
	let store = vault.record_store(&record())?;
	store
		.synchronized_type_for(WEIGHT)?
		.add_new_item(weight(70.0, day(1)))?;

	assert!(store.commit_offline_changes().await?.is_none());
	assert!(store.changes().has_pending_changes()?);

	Ok(())
}

#[tokio::test]
async fn commit_lifecycle_is_broadcast() -> Result<(), Box<dyn std::error::Error>> {
	let remote = MockRemote::new();
	let vault = memory_vault(&remote);
	let mut events = vault.subscribe();

	let store = vault.record_store(&record())?;
	let weights = store.synchronized_type_for(WEIGHT)?;

	let good = weights.add_new_item(weight(70.0, day(1)))?;
	let bad = weights.add_new_item(weight(-1.0, day(2)))?;
	remote.fail_always(
		Op::Put,
		bad.id(),
		RemoteError::server(ServerStatus::InvalidItem, "negative weight"),
	);

	store.commit_offline_changes().await?;

	let mut received = Vec::new();
	while let Ok(event) = events.try_recv() {
		assert_eq!(event.record(), &record());
		received.push(event);
	}

	assert_eq!(received.len(), 4);
	assert!(matches!(received[0], VaultEvent::CommitStarting { .. }));
	assert!(matches!(
		&received[1],
		VaultEvent::ChangeCommitSucceeded { type_id, .. } if type_id == WEIGHT
	));
	assert!(matches!(
		&received[2],
		VaultEvent::ChangeCommitFailed { item_id, .. } if item_id == bad.id()
	));
	assert!(matches!(
		&received[3],
		VaultEvent::CommitFinished { report, .. } if report.committed == 1 && report.failed == 1
	));

	assert_ne!(good.id(), bad.id());

	Ok(())
}

#[tokio::test(start_paused = true)]
async fn abandoned_run_leaves_nothing_to_cancel() -> Result<(), Box<dyn std::error::Error>> {
	let vault = LocalVault::with_store(
		Arc::new(MemoryStore::new()),
		VaultConfig::default(),
		Arc::new(StalledRemote) as Arc<dyn RemoteVault>,
	);
	let store = vault.record_store(&record())?;
	store
		.synchronized_type_for(WEIGHT)?
		.add_new_item(weight(70.0, day(1)))?;

	let abandoned =
		tokio::time::timeout(Duration::from_secs(30), store.commit_offline_changes()).await;
	assert!(abandoned.is_err(), "the write never answers");

	assert!(!store.changes().is_busy());
	assert!(!store.changes().cancel_active_commits());
	assert!(store.changes().has_pending_changes()?);

	Ok(())
}
