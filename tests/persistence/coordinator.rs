use std::sync::Arc;
use std::time::Duration;

use listsync::{
    BatchPolicy, CoordinatorOptions, PersistError, PersistenceCoordinator, PersistenceMode,
    RecordStore, StoreSide, TransitionOutcome, ValidationReason, WriteOutcome,
};

use crate::common::{item_in, list_at, Fault, FaultyStore, Harness};

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn crud_before_initialize_is_rejected() {
    let h = Harness::new(CoordinatorOptions::default());
    let err = h.coordinator.get_all_lists().await.unwrap_err();
    assert!(matches!(err, PersistError::NotInitialized));
}

#[tokio::test]
async fn initial_mode_follows_session() {
    let guest = Harness::guest().await;
    assert_eq!(guest.coordinator.mode(), PersistenceMode::LocalOnly);

    let user = Harness::signed_in().await;
    assert_eq!(user.coordinator.mode(), PersistenceMode::CloudWithLocalBackup);
}

// ============================================================================
// LocalOnly
// ============================================================================

#[tokio::test]
async fn local_only_never_touches_cloud() {
    let h = Harness::guest().await;
    h.coordinator.save_list(list_at("l1", "Errands", 1)).await.unwrap();
    h.coordinator
        .save_item(item_in("l1", "i1", "Stamps"))
        .await
        .unwrap();

    assert_eq!(h.local.len(), 2);
    assert!(h.remote.is_empty());
    assert_eq!(h.coordinator.get_items_by_list_id("l1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn save_on_existing_id_matches_update() {
    let saved = Harness::guest().await;
    let updated = Harness::guest().await;
    let original = list_at("l1", "Draft", 1);
    let edited = list_at("l1", "Final", 2);

    saved.coordinator.save_list(original.clone()).await.unwrap();
    saved.coordinator.save_list(edited.clone()).await.unwrap();
    updated.coordinator.save_list(original).await.unwrap();
    updated.coordinator.update_list(edited).await.unwrap();

    assert_eq!(saved.local.snapshot(), updated.local.snapshot());
    assert_eq!(saved.coordinator.get_persistence_stats().upsert_conversions, 1);
}

#[tokio::test]
async fn save_item_on_existing_id_updates_title() {
    let h = Harness::guest().await;
    h.coordinator.save_list(list_at("l1", "Errands", 1)).await.unwrap();
    h.coordinator.save_item(item_in("l1", "i1", "Old")).await.unwrap();

    let outcome = h.coordinator.save_item(item_in("l1", "i1", "X")).await.unwrap();
    assert!(outcome.is_applied());

    let items = h.local.snapshot().items;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "X");
}

#[tokio::test]
async fn item_without_parent_is_rejected() {
    let h = Harness::guest().await;
    let err = h
        .coordinator
        .save_item(item_in("missing", "i1", "Orphan"))
        .await
        .unwrap_err();
    let PersistError::Validation(issues) = err else {
        panic!("expected validation error, got {err:?}");
    };
    assert_eq!(issues[0].reason, ValidationReason::DanglingList("missing".into()));
    assert!(h.local.is_empty());
}

#[tokio::test]
async fn empty_title_is_rejected_before_write() {
    let h = Harness::guest().await;
    let err = h.coordinator.save_list(list_at("l1", "", 1)).await.unwrap_err();
    assert!(matches!(err, PersistError::Validation(_)));
    assert!(h.local.is_empty());
    assert_eq!(h.coordinator.get_persistence_stats().validation_failures, 1);
}

#[tokio::test]
async fn delete_list_tombstones_its_items() {
    let h = Harness::guest().await;
    h.coordinator.save_list(list_at("l1", "Trip", 1)).await.unwrap();
    h.coordinator.save_item(item_in("l1", "i1", "Tent")).await.unwrap();
    h.coordinator.save_item(item_in("l1", "i2", "Stove")).await.unwrap();

    h.coordinator.delete_list("l1").await.unwrap();

    assert!(h.coordinator.get_all_lists().await.unwrap().is_empty());
    assert!(h.coordinator.get_items_by_list_id("l1").await.unwrap().is_empty());
    // Still there as tombstones so the delete can be reconciled.
    let snapshot = h.local.snapshot();
    assert!(snapshot.lists[0].deleted);
    assert!(snapshot.items.iter().all(|i| i.deleted_at.is_some()));
}

#[tokio::test]
async fn deleting_unknown_record_reports_not_found() {
    let h = Harness::guest().await;
    let err = h.coordinator.delete_item("nope").await.unwrap_err();
    assert!(err.to_string().contains("deleteItem"));
    assert!(err.to_string().contains("nope"));
}

#[tokio::test]
async fn items_come_back_ranked() {
    let h = Harness::guest().await;
    h.coordinator.save_list(list_at("l1", "Chores", 1)).await.unwrap();
    for (id, rank) in [("a", 1.0), ("b", 3.0), ("c", 2.0)] {
        let mut item = item_in("l1", id, id);
        item.rank = rank;
        h.coordinator.save_item(item).await.unwrap();
    }
    let ids: Vec<String> = h
        .coordinator
        .get_items_by_list_id("l1")
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(ids, ["b", "c", "a"]);
}

// ============================================================================
// Batches
// ============================================================================

#[tokio::test]
async fn batch_persists_valid_items_and_reports_invalid_ones() {
    let h = Harness::guest().await;
    h.coordinator.save_list(list_at("l1", "Groceries", 1)).await.unwrap();

    let report = h
        .coordinator
        .save_multiple_items(vec![item_in("l1", "ok", "Milk"), item_in("l1", "bad", "")])
        .await
        .unwrap();

    assert_eq!(report.saved, ["ok"]);
    assert_eq!(report.failed_ids(), ["bad"]);
    assert!(h.local.snapshot().items.iter().any(|i| i.id == "ok"));
    assert!(!h.local.snapshot().items.iter().any(|i| i.id == "bad"));
}

#[tokio::test]
async fn reject_all_policy_aborts_before_any_write() {
    let h = Harness::new(CoordinatorOptions {
        batch_policy: BatchPolicy::RejectAll,
        ..Default::default()
    });
    h.coordinator.initialize(false).await.unwrap();
    h.coordinator.save_list(list_at("l1", "Groceries", 1)).await.unwrap();
    let writes_before = h.local.write_count();

    let err = h
        .coordinator
        .save_multiple_items(vec![item_in("l1", "ok", "Milk"), item_in("l1", "bad", "")])
        .await
        .unwrap_err();
    assert!(matches!(err, PersistError::Validation(ref issues) if issues.len() == 1));
    assert_eq!(h.local.write_count(), writes_before);
}

#[tokio::test]
async fn batch_write_failure_keeps_earlier_items() {
    let h = Harness::signed_in().await;
    h.coordinator.save_list(list_at("l1", "Groceries", 1)).await.unwrap();
    h.remote.fail_writes_for("i2");

    let report = h
        .coordinator
        .save_multiple_items(vec![
            item_in("l1", "i1", "Milk"),
            item_in("l1", "i2", "Eggs"),
            item_in("l1", "i3", "Bread"),
        ])
        .await
        .unwrap();

    assert_eq!(report.saved, ["i1", "i3"]);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].error.is_permission_denied());
    assert!(h.remote.snapshot().items.iter().any(|i| i.id == "i1"));
}

// ============================================================================
// CloudWithLocalBackup
// ============================================================================

#[tokio::test]
async fn unreachable_cloud_read_falls_back_to_local() {
    let h = Harness::signed_in().await;
    h.local.seed_list(&list_at("l1", "Offline copy", 1)).await;
    h.remote.fail_reads(Fault::Unreachable);

    let lists = h.coordinator.get_all_lists().await.unwrap();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].title, "Offline copy");
    assert_eq!(h.coordinator.get_persistence_stats().fallbacks, 1);
}

#[tokio::test]
async fn permission_denied_is_surfaced_not_masked() {
    let h = Harness::signed_in().await;
    h.remote.fail_writes(Fault::PermissionDenied);

    let err = h.coordinator.save_list(list_at("l1", "Shared", 1)).await.unwrap_err();
    assert!(err.is_permission_denied());
    let msg = err.to_string();
    assert!(msg.contains("saveList"));
    assert!(msg.contains("l1"));
    assert!(msg.contains("cloud_with_local_backup"));
    assert!(h.local.is_empty());
    assert!(err.user_message().contains("permission"));
}

#[tokio::test]
async fn cloud_writes_are_mirrored_locally() {
    let h = Harness::signed_in().await;
    h.coordinator.save_list(list_at("l1", "Synced", 1)).await.unwrap();
    h.coordinator.wait_for_mirror().await;

    assert_eq!(h.remote.len(), 1);
    assert_eq!(h.local.len(), 1);
    let stats = h.coordinator.get_persistence_stats();
    assert_eq!(stats.mirror_completed, 1);
    assert_eq!(stats.mirror_pending, 0);
}

#[tokio::test]
async fn mirror_failure_is_recorded_not_raised() {
    let h = Harness::signed_in().await;
    h.local.fail_writes(Fault::Unknown);

    let outcome = h.coordinator.save_list(list_at("l1", "Cloud only", 1)).await.unwrap();
    assert!(outcome.is_applied());
    h.coordinator.wait_for_mirror().await;

    let stats = h.coordinator.get_persistence_stats();
    assert_eq!(stats.mirror_failed, 1);
    assert_eq!(stats.recent_mirror_failures[0].id, "l1");
}

#[tokio::test]
async fn unreachable_cloud_write_lands_locally_and_flags_sync() {
    let h = Harness::signed_in().await;
    h.remote.fail_writes(Fault::Unreachable);

    let outcome = h.coordinator.save_list(list_at("l1", "Later", 1)).await.unwrap();
    assert!(outcome.is_applied());
    assert_eq!(h.local.len(), 1);
    assert!(h.remote.is_empty());
    assert!(h.coordinator.is_sync_required().await.unwrap());
}

#[tokio::test]
async fn queued_mirror_write_never_replaces_newer_local_edit() {
    let h = Harness::signed_in().await;
    // v1 reaches the cloud; its local mirror write is slow.
    h.local.slow_writes(Duration::from_millis(100));
    h.coordinator.save_list(list_at("l1", "v1", 10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // v2 falls back to the local store while the v1 job is still in flight.
    h.local.heal();
    h.remote.fail_writes(Fault::Unreachable);
    h.coordinator.save_list(list_at("l1", "v2", 20)).await.unwrap();
    h.coordinator.wait_for_mirror().await;

    assert_eq!(h.local.get_list("l1").await.unwrap().unwrap().title, "v2");
    assert_eq!(h.remote.get_list("l1").await.unwrap().unwrap().title, "v1");

    h.remote.heal();
    h.coordinator.force_sync_all().await.unwrap();
    assert_eq!(h.remote.get_list("l1").await.unwrap().unwrap().title, "v2");
}

#[tokio::test]
async fn stale_mirror_job_is_skipped_and_counted() {
    let h = Harness::signed_in().await;
    h.local.seed_list(&list_at("l1", "Edited offline", 30)).await;

    h.coordinator.save_list(list_at("l1", "Older cloud edit", 5)).await.unwrap();
    h.coordinator.wait_for_mirror().await;

    assert_eq!(h.local.get_list("l1").await.unwrap().unwrap().title, "Edited offline");
    let stats = h.coordinator.get_persistence_stats();
    assert_eq!(stats.mirror_superseded, 1);
    assert_eq!(stats.mirror_failed, 0);
}

#[tokio::test]
async fn remote_timeout_falls_back_through_the_wrapped_backend() {
    let local = Arc::new(FaultyStore::new("local"));
    let backend = FaultyStore::new("cloud");
    backend.slow_reads(Duration::from_millis(500));
    backend.slow_writes(Duration::from_millis(500));
    let options = CoordinatorOptions {
        remote_timeout_ms: 20,
        remote_retries: 0,
        ..CoordinatorOptions::default()
    };
    let coordinator = PersistenceCoordinator::with_remote_backend(local.clone(), backend, options);
    coordinator.initialize(true).await.unwrap();
    local.seed_list(&list_at("l1", "On device", 1)).await;

    let lists = coordinator.get_all_lists().await.unwrap();
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].title, "On device");

    let outcome = coordinator.save_list(list_at("l2", "Written offline", 2)).await.unwrap();
    assert!(outcome.is_applied());
    assert_eq!(local.len(), 2);
    assert_eq!(coordinator.get_persistence_stats().fallbacks, 2);
}

// ============================================================================
// Hybrid
// ============================================================================

#[tokio::test]
async fn hybrid_reads_merge_both_stores() {
    let h = Harness::signed_in().await;
    h.coordinator.set_mode(PersistenceMode::Hybrid).await.unwrap();
    h.local.seed_list(&list_at("l1", "Groceries", 10)).await;
    h.remote.seed_list(&list_at("l1", "Shopping", 12)).await;
    h.remote.seed_list(&list_at("l2", "Cloud only", 1)).await;

    let lists = h.coordinator.get_all_lists().await.unwrap();
    assert_eq!(lists.len(), 2);
    assert_eq!(lists[0].title, "Shopping");
}

#[tokio::test]
async fn hybrid_partial_failure_is_reported() {
    let h = Harness::signed_in().await;
    h.coordinator.set_mode(PersistenceMode::Hybrid).await.unwrap();
    h.remote.fail_writes(Fault::Unreachable);

    let outcome = h.coordinator.save_list(list_at("l1", "Half", 1)).await.unwrap();
    let WriteOutcome::Partial { failed, error } = outcome else {
        panic!("expected partial failure, got {outcome:?}");
    };
    assert_eq!(failed, StoreSide::Cloud);
    assert!(error.is_transient());
    assert_eq!(h.local.len(), 1);
    assert_eq!(h.coordinator.get_persistence_stats().partial_failures, 1);
}

#[tokio::test]
async fn hybrid_denied_write_leaves_no_local_copy() {
    let h = Harness::signed_in().await;
    h.coordinator.set_mode(PersistenceMode::Hybrid).await.unwrap();
    h.remote.fail_writes(Fault::PermissionDenied);

    let err = h.coordinator.save_list(list_at("l1", "Not mine", 1)).await.unwrap_err();
    assert!(err.is_permission_denied());
    assert!(h.local.is_empty());
    assert!(h.coordinator.get_all_lists().await.unwrap().is_empty());
}

#[tokio::test]
async fn hybrid_fails_when_both_sides_fail() {
    let h = Harness::signed_in().await;
    h.coordinator.set_mode(PersistenceMode::Hybrid).await.unwrap();
    h.local.fail_writes(Fault::Unknown);
    h.remote.fail_writes(Fault::Unreachable);

    let err = h.coordinator.save_list(list_at("l1", "Lost", 1)).await.unwrap_err();
    assert!(matches!(err, PersistError::Store { .. }));
}

// ============================================================================
// Mode & session
// ============================================================================

#[tokio::test]
async fn cloud_modes_require_a_session() {
    let h = Harness::guest().await;
    let err = h.coordinator.set_mode(PersistenceMode::Hybrid).await.unwrap_err();
    assert!(matches!(err, PersistError::NotAuthenticated));
    assert_eq!(h.coordinator.mode(), PersistenceMode::LocalOnly);
}

#[tokio::test]
async fn sign_out_keeps_cloud_data() {
    let h = Harness::signed_in().await;
    h.coordinator.save_list(list_at("l1", "Kept", 1)).await.unwrap();

    let outcome = h.coordinator.update_authentication_state(false, None).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::SignedOut);
    assert_eq!(h.coordinator.mode(), PersistenceMode::LocalOnly);
    assert_eq!(h.remote.len(), 1);
    // The mirror drained before the switch.
    assert_eq!(h.local.len(), 1);
}

#[tokio::test]
async fn repeated_auth_state_is_a_no_op() {
    let h = Harness::signed_in().await;
    let outcome = h.coordinator.update_authentication_state(true, None).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Unchanged);
}

// ============================================================================
// Reload & stats
// ============================================================================

#[tokio::test]
async fn reload_returns_live_records_only() {
    let h = Harness::guest().await;
    h.coordinator.save_list(list_at("l1", "Keep", 1)).await.unwrap();
    h.coordinator.save_list(list_at("l2", "Drop", 1)).await.unwrap();
    h.coordinator.save_item(item_in("l1", "i1", "a")).await.unwrap();
    h.coordinator.save_item(item_in("l2", "i2", "b")).await.unwrap();
    h.coordinator.delete_list("l2").await.unwrap();

    let snapshot = h.coordinator.force_reload_from_persistence().await.unwrap();
    assert_eq!(snapshot.lists.len(), 1);
    assert_eq!(snapshot.items.len(), 1);
    assert_eq!(snapshot.items[0].id, "i1");
}

#[tokio::test]
async fn stats_are_a_plain_map() {
    let h = Harness::guest().await;
    h.coordinator.save_list(list_at("l1", "x", 1)).await.unwrap();
    h.coordinator.get_all_lists().await.unwrap();

    let map = h.coordinator.get_persistence_stats().to_map();
    assert_eq!(map["mode"], "LocalOnly");
    assert_eq!(map["writes"], 1);
    assert!(map["reads"].as_u64().unwrap() >= 1);
    assert_eq!(map["migration_state"], "idle");
}

#[tokio::test]
async fn stats_have_no_side_effects() {
    let h = Harness::guest().await;
    let first = h.coordinator.get_persistence_stats().to_map();
    let second = h.coordinator.get_persistence_stats().to_map();
    assert_eq!(first, second);
    assert!(h.local.last_modified().await.unwrap().is_none());
}
