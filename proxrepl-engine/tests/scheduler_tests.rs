//! Scheduler Tests
//! Cron evaluation, next-fire bookkeeping and retry displacement against a
//! real job store.

use chrono::{TimeZone, Utc};
use proxrepl_engine::db::nodes::NewNode;
use proxrepl_engine::db::sync_jobs::SyncJob;
use proxrepl_engine::db::{nodes, settings, sync_jobs, Database};
use proxrepl_engine::scheduler::{next_fire_after, summary_due, ScheduleBook};
use proxrepl_common::{NotifyMode, SyncMethod};

async fn test_db() -> Database {
    let db = Database::new("sqlite://:memory:").await.unwrap();
    db.migrate().await.unwrap();
    db
}

fn node(name: &str, hostname: &str) -> NewNode {
    NewNode {
        name: name.to_string(),
        hostname: hostname.to_string(),
        ssh_port: 22,
        ssh_user: "root".to_string(),
        ssh_key_path: "/root/.ssh/id_rsa".to_string(),
        ..Default::default()
    }
}

fn sync_job(name: &str, source: i64, dest: i64, schedule: &str) -> SyncJob {
    SyncJob {
        id: 0,
        name: name.to_string(),
        source_node_id: source,
        dest_node_id: dest,
        source_dataset: "rpool/data/vm-100-disk-0".to_string(),
        dest_dataset: "rpool/data/vm-100-disk-0".to_string(),
        method: SyncMethod::ZfsSyncoid,
        recursive: false,
        compress: None,
        mbuffer_size: None,
        no_sync_snap: false,
        force_delete: false,
        extra_args: None,
        convert_to_subvolume: false,
        schedule: Some(schedule.to_string()),
        is_active: true,
        retention_keep: 0,
        prune_source: false,
        register_vm: false,
        vm_id: None,
        vm_type: None,
        source_storage: None,
        dest_storage: None,
        dest_vm_id: None,
        vm_group_id: None,
        retry_on_failure: true,
        max_retries: 3,
        retry_delay_minutes: 15,
        notify_mode: NotifyMode::Daily,
        last_run: None,
        last_status: None,
        last_duration: None,
        last_transferred: None,
        last_sync_type: None,
        run_count: 0,
        error_count: 0,
        consecutive_failures: 0,
    }
}

#[tokio::test]
async fn test_scheduled_jobs_feed_the_book() {
    let db = test_db().await;
    let pool = db.pool();
    let src = nodes::create_node(pool, &node("pve1", "10.0.0.11")).await.unwrap();
    let dst = nodes::create_node(pool, &node("pve2", "10.0.0.12")).await.unwrap();
    sync_jobs::create_sync_job(pool, &sync_job("five-min", src, dst, "*/5 * * * *"))
        .await
        .unwrap();

    let jobs = sync_jobs::list_scheduled(pool).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];

    let mut book = ScheduleBook::new();
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();

    // First evaluation anchors on now (no last_run); not due yet
    assert!(!book.due(
        &format!("sync_{}", job.id),
        job.schedule.as_deref().unwrap(),
        job.last_run,
        t0
    ));

    // Due at the next 5-minute boundary, exactly once
    let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 5, 0).unwrap();
    assert!(book.due(&format!("sync_{}", job.id), "*/5 * * * *", job.last_run, t1));
    assert!(!book.due(&format!("sync_{}", job.id), "*/5 * * * *", job.last_run, t1));
}

#[tokio::test]
async fn test_retry_uses_job_statistics() {
    let db = test_db().await;
    let pool = db.pool();
    let src = nodes::create_node(pool, &node("pve1", "10.0.0.11")).await.unwrap();
    let dst = nodes::create_node(pool, &node("pve2", "10.0.0.12")).await.unwrap();
    let id = sync_jobs::create_sync_job(pool, &sync_job("retrying", src, dst, "0 2 * * *"))
        .await
        .unwrap();

    // Record a failed run
    sync_jobs::try_mark_running(pool, id).await.unwrap();
    sync_jobs::finish_run(pool, id, false, 30, None, None).await.unwrap();

    let job = sync_jobs::get_sync_job(pool, id).await.unwrap();
    assert_eq!(job.last_status.as_deref(), Some("failed"));
    assert_eq!(job.consecutive_failures, 1);

    let mut book = ScheduleBook::new();
    let failed_at = Utc.timestamp_opt(job.last_run.unwrap(), 0).unwrap();

    // Before the delay elapses the retry is not due
    assert!(!book.retry_due(
        "retry_sync",
        job.last_run,
        job.last_status.as_deref(),
        job.retry_on_failure,
        job.consecutive_failures,
        job.max_retries,
        job.retry_delay_minutes,
        failed_at + chrono::Duration::minutes(5),
    ));

    // After the displacement it fires once
    assert!(book.retry_due(
        "retry_sync",
        job.last_run,
        job.last_status.as_deref(),
        job.retry_on_failure,
        job.consecutive_failures,
        job.max_retries,
        job.retry_delay_minutes,
        failed_at + chrono::Duration::minutes(16),
    ));
    assert!(!book.retry_due(
        "retry_sync",
        job.last_run,
        job.last_status.as_deref(),
        job.retry_on_failure,
        job.consecutive_failures,
        job.max_retries,
        job.retry_delay_minutes,
        failed_at + chrono::Duration::minutes(17),
    ));
}

#[tokio::test]
async fn test_retry_budget_exhaustion_stops_dispatch() {
    let db = test_db().await;
    let pool = db.pool();
    let src = nodes::create_node(pool, &node("pve1", "10.0.0.11")).await.unwrap();
    let dst = nodes::create_node(pool, &node("pve2", "10.0.0.12")).await.unwrap();
    let id = sync_jobs::create_sync_job(pool, &sync_job("exhausted", src, dst, "0 2 * * *"))
        .await
        .unwrap();

    for _ in 0..3 {
        sync_jobs::try_mark_running(pool, id).await.unwrap();
        sync_jobs::finish_run(pool, id, false, 30, None, None).await.unwrap();
    }

    let job = sync_jobs::get_sync_job(pool, id).await.unwrap();
    assert_eq!(job.consecutive_failures, 3);

    let mut book = ScheduleBook::new();
    let much_later = Utc.timestamp_opt(job.last_run.unwrap() + 86_400, 0).unwrap();
    assert!(!book.retry_due(
        "retry_sync",
        job.last_run,
        job.last_status.as_deref(),
        job.retry_on_failure,
        job.consecutive_failures,
        job.max_retries,
        job.retry_delay_minutes,
        much_later,
    ));
}

#[tokio::test]
async fn test_daily_summary_config_round_trip() {
    let db = test_db().await;
    let pool = db.pool();
    settings::init_defaults(pool).await.unwrap();

    let hour = settings::get_int(pool, "daily_summary_hour", 0).await as u32;
    let enabled = settings::get_bool(pool, "daily_summary_enabled", false).await;
    assert_eq!(hour, 8);
    assert!(enabled);

    let at_eight = Utc.with_ymd_and_hms(2025, 3, 1, 8, 1, 0).unwrap();
    assert!(summary_due(enabled, hour, None, at_eight));
    assert!(!summary_due(enabled, hour, Some(at_eight.date_naive()), at_eight));

    // Reconfiguring the hour takes effect on the next evaluation
    settings::set_value(pool, "daily_summary_hour", "20").await.unwrap();
    let hour = settings::get_int(pool, "daily_summary_hour", 0).await as u32;
    assert!(!summary_due(enabled, hour, None, at_eight));
}

#[test]
fn test_cron_advancement_is_monotonic() {
    let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let mut anchor = start;

    for _ in 0..48 {
        let next = next_fire_after("0 * * * *", anchor).unwrap();
        assert!(next > anchor);
        anchor = next;
    }

    assert_eq!(anchor, start + chrono::Duration::hours(48));
}
