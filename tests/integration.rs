//! Integration tests for the keepsafe manager
//!
//! Each test drives a real manager over a temporary database file.


use keepsafe::KeepError;
use keepsafe::maintenance::HealthStatus;
use keepsafe::maintenance::backup::list_pre_restore_snapshots;
use keepsafe::manager::RecoveryOutcome;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use test_utils::{TestContext, smash_header};

#[tokio::test]
async fn test_pool_is_bounded_and_times_out() {
    let ctx = TestContext::new().await;

    let first = ctx.manager.acquire().await.unwrap();
    let second = ctx.manager.acquire().await.unwrap();

    let start = Instant::now();
    let third = ctx.manager.acquire().await;
    let waited = start.elapsed();
    assert!(matches!(third, Err(KeepError::PoolTimeout(_))), "got {third:?}");
    assert!(waited >= Duration::from_millis(900), "gave up after {waited:?}");
    assert!(waited < Duration::from_secs(5));

    drop(first);
    let third = ctx.manager.acquire().await.unwrap();
    assert_ne!(third.id(), second.id());
}

#[tokio::test]
async fn test_backup_and_restore_round_trip() {
    let ctx = TestContext::new().await;
    ctx.seed(5).await;

    let backup = ctx.manager.create_backup(Some("before")).await.unwrap();
    assert_eq!(backup.name, "before.db");
    assert!(backup.size_bytes > 0);

    ctx.seed(5).await;
    assert_eq!(ctx.item_count().await, 10);

    let report = ctx.manager.restore("before").await.unwrap();
    assert!(report.integrity.is_healthy());
    assert!(report.pre_restore_snapshot.is_some());
    assert_eq!(ctx.item_count().await, 5);

    let snapshots = list_pre_restore_snapshots(&ctx.backup_dir()).unwrap();
    assert_eq!(snapshots.len(), 1);
    // Snapshots are not offered as restore sources
    assert_eq!(ctx.manager.list_backups().unwrap().len(), 1);

    assert_eq!(
        ctx.manager.system_info_get("last_restore").await.unwrap().as_deref(),
        Some("before.db")
    );
}

#[tokio::test]
async fn test_corruption_is_detected_and_recovered() {
    let ctx = TestContext::new().await;
    ctx.seed(3).await;
    ctx.manager.create_backup(None).await.unwrap();
    ctx.manager.checkpoint().await.unwrap();

    smash_header(&ctx.db_path());

    let result = ctx.manager.check_integrity().await;
    assert_eq!(result.status, HealthStatus::Corrupted);

    let cycle = ctx.manager.run_integrity_cycle().await;
    assert_eq!(cycle.integrity.status, HealthStatus::Corrupted);
    assert!(
        matches!(cycle.recovery, Some(RecoveryOutcome::Restored { .. })),
        "got {:?}",
        cycle.recovery
    );
    assert!(cycle.succeeded());

    assert_eq!(ctx.item_count().await, 3);
    assert_eq!(ctx.manager.check_integrity().await.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_corruption_without_backup_needs_an_operator() {
    let ctx = TestContext::new().await;
    ctx.manager.checkpoint().await.unwrap();
    smash_header(&ctx.db_path());

    let cycle = ctx.manager.run_integrity_cycle().await;
    assert!(matches!(cycle.recovery, Some(RecoveryOutcome::NoBackup)));
    assert!(!cycle.succeeded());
}

#[tokio::test]
async fn test_retention_keeps_newest_backups() {
    let ctx = TestContext::new().await;
    ctx.seed(1).await;

    let mut created = Vec::new();
    for _ in 0..8 {
        created.push(ctx.manager.create_backup(None).await.unwrap().name);
    }

    let kept: Vec<String> = ctx
        .manager
        .list_backups()
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect();
    let newest: Vec<String> = created.iter().rev().take(3).cloned().collect();
    assert_eq!(kept, newest);
}

#[tokio::test]
async fn test_health_log_is_capped() {
    let ctx = TestContext::with_config(|config| config.health_log_cap = 4).await;

    for _ in 0..7 {
        ctx.manager.check_integrity().await;
    }

    let history = ctx.manager.health_history(100).await.unwrap();
    assert_eq!(history.len(), 4);
    assert!(history.windows(2).all(|pair| pair[0].id > pair[1].id));
}

#[tokio::test]
async fn test_vacuum_respects_threshold() {
    let ctx = TestContext::new().await;
    ctx.manager
        .interact(|conn| {
            conn.execute_batch("CREATE TABLE blobs(id INTEGER PRIMARY KEY, data BLOB)")?;
            let tx = conn.transaction()?;
            for _ in 0..300 {
                tx.execute("INSERT INTO blobs(data) VALUES (zeroblob(4000))", [])?;
            }
            tx.commit()?;
            conn.execute("DELETE FROM blobs WHERE id > 30", [])?;
            Ok(())
        })
        .await
        .unwrap();

    let result = ctx.manager.vacuum(false).await.unwrap();
    assert!(result.vacuumed, "fragmentation was {}", result.fragmentation_before);
    assert!(result.fragmentation_after < result.fragmentation_before);
    assert!(result.size_after_bytes < result.size_before_bytes);

    let again = ctx.manager.vacuum(false).await.unwrap();
    assert!(!again.vacuumed);
}

#[tokio::test]
async fn test_readers_never_see_a_half_restored_file() {
    let ctx = TestContext::new().await;
    ctx.seed(5).await;
    ctx.manager.create_backup(Some("five")).await.unwrap();
    ctx.seed(5).await;

    let restored = AtomicBool::new(false);
    let restore = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = ctx.manager.restore("five").await;
        restored.store(true, Ordering::SeqCst);
        report
    };
    let reader = async {
        let mut seen = Vec::new();
        while !restored.load(Ordering::SeqCst) {
            let counted = ctx
                .manager
                .interact(|conn| {
                    conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get::<_, i64>(0))
                        .map_err(Into::into)
                })
                .await;
            match counted {
                Ok(n) => seen.push(n),
                // Checked out just before the pool closed, or queued behind it
                Err(KeepError::ConnectionClosed | KeepError::PoolTimeout(_)) => {}
                Err(e) => panic!("reader failed during restore: {e}"),
            }
        }
        seen
    };

    let (report, seen) = tokio::join!(restore, reader);
    report.unwrap();

    assert!(!seen.is_empty());
    assert!(seen.iter().all(|n| *n == 5 || *n == 10), "saw {seen:?}");
    assert_eq!(ctx.item_count().await, 5);
}

#[tokio::test]
async fn test_empty_backup_cannot_replace_live_data() {
    let ctx = TestContext::new().await;
    ctx.seed(5).await;
    std::fs::write(ctx.backup_dir().join("empty.db"), b"").unwrap();

    let result = ctx.manager.restore("empty").await;

    assert!(matches!(result, Err(KeepError::RestoreFailed(_))), "got {result:?}");
    assert_eq!(ctx.item_count().await, 5);
    assert!(list_pre_restore_snapshots(&ctx.backup_dir()).unwrap().is_empty());
}

#[tokio::test]
async fn test_unfinished_backup_is_not_restorable() {
    let ctx = TestContext::new().await;
    ctx.seed(2).await;
    ctx.manager.create_backup(Some("done")).await.unwrap();
    let unfinished = ctx.backup_dir().join("late.db.partial");
    std::fs::copy(ctx.backup_dir().join("done.db"), &unfinished).unwrap();

    let names: Vec<String> = ctx
        .manager
        .list_backups()
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect();
    assert_eq!(names, vec!["done.db".to_string()]);
    assert!(ctx.manager.restore("late").await.is_err());

    // Left over from an interrupted run: swept on the next open
    let ctx = ctx.reopen().await;
    assert!(!unfinished.exists());
    assert_eq!(ctx.manager.list_backups().unwrap().len(), 1);
}

#[tokio::test]
async fn test_damaged_file_can_be_restored_after_restart() {
    let ctx = TestContext::new().await;
    ctx.seed(3).await;
    ctx.manager.create_backup(Some("good")).await.unwrap();
    ctx.manager.shutdown().await;
    smash_header(&ctx.db_path());

    let ctx = ctx.reopen().await;
    let status = ctx.manager.status().await.unwrap();
    assert!(status.recovery_pending);
    assert_eq!(status.backup_count, 1);
    assert_eq!(ctx.manager.check_integrity().await.status, HealthStatus::Corrupted);

    let report = ctx.manager.restore("good").await.unwrap();
    assert!(report.integrity.is_healthy());
    assert!(report.pre_restore_snapshot.is_some());
    assert_eq!(ctx.item_count().await, 3);
    assert!(!ctx.manager.status().await.unwrap().recovery_pending);
}

#[tokio::test]
async fn test_integrity_cycle_recovers_a_file_damaged_while_down() {
    let ctx = TestContext::new().await;
    ctx.seed(4).await;
    ctx.manager.create_backup(None).await.unwrap();
    ctx.manager.shutdown().await;
    smash_header(&ctx.db_path());

    let ctx = ctx.reopen().await;
    let cycle = ctx.manager.run_integrity_cycle().await;

    assert_eq!(cycle.integrity.status, HealthStatus::Corrupted);
    assert!(
        matches!(cycle.recovery, Some(RecoveryOutcome::Restored { .. })),
        "got {:?}",
        cycle.recovery
    );
    assert_eq!(ctx.item_count().await, 4);
    assert_eq!(ctx.manager.check_integrity().await.status, HealthStatus::Healthy);
}
