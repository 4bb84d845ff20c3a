use std::time::Duration;

use listsync::{CoordinatorOptions, PersistError, PersistenceMode, RecordStore, SyncOptions, SyncScheduler};

use crate::common::{item_in, list_at, Fault, Harness};

#[tokio::test]
async fn later_title_wins_on_both_devices() {
    let h = Harness::signed_in().await;
    // Device A edited offline at t=10, device B reached the cloud at t=12.
    h.local.seed_list(&list_at("l1", "Groceries", 10)).await;
    h.remote.seed_list(&list_at("l1", "Shopping", 12)).await;

    let report = h.coordinator.force_sync_all().await.unwrap();
    assert_eq!(report.conflicts, 1);

    assert_eq!(h.local.get_list("l1").await.unwrap().unwrap().title, "Shopping");
    assert_eq!(h.remote.get_list("l1").await.unwrap().unwrap().title, "Shopping");
}

#[tokio::test]
async fn second_sync_changes_nothing() {
    let h = Harness::signed_in().await;
    h.local.seed_list(&list_at("a", "Local", 5)).await;
    h.local.seed_item(&item_in("a", "i1", "Milk")).await;
    h.remote.seed_list(&list_at("b", "Remote", 7)).await;
    h.remote.seed_list(&list_at("a", "Older", 1)).await;

    h.coordinator.force_sync_all().await.unwrap();
    let after_first = (h.local.snapshot(), h.remote.snapshot());

    let second = h.coordinator.force_sync_all().await.unwrap();
    assert_eq!(second.writes(), 0);
    assert_eq!((h.local.snapshot(), h.remote.snapshot()), after_first);
    assert_eq!(after_first.0, after_first.1);
}

#[tokio::test]
async fn sync_cursor_settles_after_a_quiet_pass() {
    let h = Harness::signed_in().await;
    h.local.seed_list(&list_at("a", "Local", 5)).await;
    assert!(h.coordinator.is_sync_required().await.unwrap());

    h.coordinator.force_sync_all().await.unwrap();
    h.coordinator.force_sync_all().await.unwrap();
    assert!(!h.coordinator.is_sync_required().await.unwrap());
    assert!(h.coordinator.sync_cursor().last_sync_at.is_some());

    h.local.seed_list(&list_at("b", "New", 6)).await;
    assert!(h.coordinator.is_sync_required().await.unwrap());
}

#[tokio::test]
async fn a_pass_absorbs_its_own_writes() {
    let h = Harness::signed_in().await;
    h.local.seed_list(&list_at("a", "Local", 5)).await;
    h.remote.seed_list(&list_at("b", "Remote", 7)).await;

    let report = h.coordinator.force_sync_all().await.unwrap();
    assert_eq!(report.writes(), 2);
    assert!(!h.coordinator.is_sync_required().await.unwrap());

    h.coordinator.save_list(list_at("c", "After", 9)).await.unwrap();
    assert!(h.coordinator.is_sync_required().await.unwrap());
}

#[tokio::test]
async fn scheduler_uses_the_configured_interval() {
    let h = Harness::new(CoordinatorOptions {
        sync_interval_ms: 10,
        ..CoordinatorOptions::default()
    });
    h.coordinator.initialize(true).await.unwrap();
    h.local.seed_list(&list_at("a", "Offline", 3)).await;

    let scheduler = SyncScheduler::spawn_default(&h.coordinator);
    assert!(scheduler.is_running());
    for _ in 0..100 {
        if !h.remote.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.shutdown().await;

    assert_eq!(h.remote.len(), 1);
    assert!(!h.coordinator.is_sync_required().await.unwrap());
}

#[tokio::test]
async fn guests_cannot_sync() {
    let h = Harness::guest().await;
    let err = h.coordinator.force_sync_all().await.unwrap_err();
    assert!(matches!(err, PersistError::NotAuthenticated));
    assert!(!h.coordinator.is_sync_required().await.unwrap());
}

#[tokio::test]
async fn tombstones_propagate() {
    let h = Harness::signed_in().await;
    h.coordinator.set_mode(PersistenceMode::LocalOnly).await.unwrap();
    h.coordinator.save_list(list_at("l1", "Old plans", 1)).await.unwrap();
    h.coordinator.force_sync_all().await.unwrap();
    assert_eq!(h.remote.len(), 1);

    h.coordinator.delete_list("l1").await.unwrap();
    h.coordinator.force_sync_all().await.unwrap();
    assert!(h.remote.snapshot().lists[0].deleted);
}

#[tokio::test]
async fn failed_snapshot_read_aborts_and_can_be_rerun() {
    let h = Harness::signed_in().await;
    h.local.seed_list(&list_at("a", "Local", 5)).await;
    h.remote.fail_reads(Fault::Unreachable);

    let err = h.coordinator.force_sync_all().await.unwrap_err();
    assert!(matches!(err, PersistError::Sync(_)));
    assert!(h.remote.is_empty());

    h.remote.heal();
    h.coordinator.force_sync_all().await.unwrap();
    assert_eq!(h.remote.len(), 1);
}

#[tokio::test]
async fn per_record_errors_are_collected() {
    let h = Harness::signed_in().await;
    h.local.seed_list(&list_at("a", "Fine", 5)).await;
    h.local.seed_list(&list_at("b", "Forbidden", 5)).await;
    h.remote.fail_writes_for("b");

    let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = seen.clone();
    let report = h
        .coordinator
        .force_sync_with(SyncOptions {
            on_error: Some(std::sync::Arc::new(move |_: &listsync::sync::SyncErrorEvent| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(report.lists_pushed, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].id.as_deref(), Some("b"));
    assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_stops_a_running_sync_between_records() {
    let h = Harness::signed_in().await;
    for i in 0..20 {
        h.local.seed_list(&list_at(&format!("l{i:02}"), "x", 1)).await;
    }
    h.remote.slow_writes(Duration::from_millis(20));

    let coordinator = h.coordinator.clone();
    let running = tokio::spawn(async move { coordinator.force_sync_all().await });
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.coordinator.cancel();

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, PersistError::Cancelled));
    let pushed = h.remote.len();
    assert!(pushed > 0 && pushed < 20, "pushed {pushed}");

    // Re-running from scratch finishes the job.
    h.remote.heal();
    h.coordinator.force_sync_all().await.unwrap();
    assert_eq!(h.remote.len(), 20);
}
