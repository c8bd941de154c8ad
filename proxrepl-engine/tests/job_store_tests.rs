//! Job Store Tests
//! Cross-entity invariants: single-flight, the recovery state machine,
//! failure counters and run-log ordering.

use proxrepl_common::{
    BackupCompression, BackupMode, GuestType, NodeKind, NotifyMode, RecoveryStatus, RunStatus,
};
use proxrepl_engine::db::job_logs::{self, LogCompletion, NewJobLog};
use proxrepl_engine::db::nodes::{self, NewNode};
use proxrepl_engine::db::recovery_jobs::{self, RecoveryJob};
use proxrepl_engine::db::Database;

async fn test_db() -> Database {
    let db = Database::new("sqlite://:memory:").await.unwrap();
    db.migrate().await.unwrap();
    db
}

fn node(name: &str, hostname: &str, kind: NodeKind) -> NewNode {
    NewNode {
        name: name.to_string(),
        hostname: hostname.to_string(),
        ssh_port: 22,
        ssh_user: "root".to_string(),
        ssh_key_path: "/root/.ssh/id_rsa".to_string(),
        node_type: Some(kind),
        ..Default::default()
    }
}

fn recovery_job(name: &str, source: i64, pbs: i64, dest: i64) -> RecoveryJob {
    RecoveryJob {
        id: 0,
        name: name.to_string(),
        source_node_id: source,
        vm_id: 110,
        vm_type: GuestType::Qemu,
        pbs_node_id: pbs,
        datastore: "ds0".to_string(),
        pbs_storage_id: None,
        dest_node_id: dest,
        dest_vm_id: None,
        dest_vm_name_suffix: Some("-dr".to_string()),
        dest_storage: None,
        backup_mode: BackupMode::Snapshot,
        backup_compress: BackupCompression::Zstd,
        include_all_disks: true,
        start_after: false,
        unique_ids: true,
        overwrite_existing: true,
        backup_schedule: None,
        restore_schedule: None,
        is_active: true,
        retry_on_failure: false,
        max_retries: 3,
        retry_delay_minutes: 15,
        notify_mode: NotifyMode::Daily,
        current_status: RecoveryStatus::Pending,
        last_backup_id: None,
        last_run: None,
        last_status: None,
        last_duration: None,
        run_count: 0,
        error_count: 0,
        consecutive_failures: 0,
    }
}

async fn recovery_fixture() -> (Database, i64) {
    let db = test_db().await;
    let pool = db.pool();
    let src = nodes::create_node(pool, &node("pve1", "10.0.0.11", NodeKind::Pve)).await.unwrap();
    let pbs = nodes::create_node(pool, &node("pbs1", "10.0.0.20", NodeKind::Pbs)).await.unwrap();
    let dst = nodes::create_node(pool, &node("pve3", "10.0.0.13", NodeKind::Pve)).await.unwrap();
    let id = recovery_jobs::create_recovery_job(pool, &recovery_job("dr-110", src, pbs, dst))
        .await
        .unwrap();
    (db, id)
}

#[tokio::test]
async fn test_concurrent_triggers_yield_one_run() {
    let (db, id) = recovery_fixture().await;
    let pool = db.pool();

    let (a, b) = tokio::join!(
        recovery_jobs::try_begin(pool, id),
        recovery_jobs::try_begin(pool, id)
    );

    // Exactly one trigger wins; the other gets the "already in execution"
    // conflict.
    assert!(a.is_ok() != b.is_ok());
    let conflict = if a.is_err() { a } else { b };
    match conflict {
        Err(proxrepl_common::Error::Conflict(msg)) => {
            assert!(msg.contains("already in execution"));
        }
        other => panic!("expected a conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_recovery_state_machine_path() {
    let (db, id) = recovery_fixture().await;
    let pool = db.pool();

    // pending -> backing_up -> restoring -> registering -> completed
    recovery_jobs::try_begin(pool, id).await.unwrap();
    let job = recovery_jobs::get_recovery_job(pool, id).await.unwrap();
    assert_eq!(job.current_status, RecoveryStatus::BackingUp);

    recovery_jobs::set_status(pool, id, RecoveryStatus::Restoring).await.unwrap();
    recovery_jobs::set_status(pool, id, RecoveryStatus::Registering).await.unwrap();
    recovery_jobs::finish_run(pool, id, true, 300, Some("vm/110/2025-01-01T00:00:00Z"))
        .await
        .unwrap();

    let job = recovery_jobs::get_recovery_job(pool, id).await.unwrap();
    assert_eq!(job.current_status, RecoveryStatus::Completed);
    assert_eq!(job.consecutive_failures, 0);
    assert_eq!(job.last_backup_id.as_deref(), Some("vm/110/2025-01-01T00:00:00Z"));
}

#[tokio::test]
async fn test_failure_counters_strictly_grow_then_reset() {
    let (db, id) = recovery_fixture().await;
    let pool = db.pool();

    let mut previous = 0;
    for _ in 0..3 {
        recovery_jobs::try_begin(pool, id).await.unwrap();
        recovery_jobs::finish_run(pool, id, false, 10, None).await.unwrap();

        let job = recovery_jobs::get_recovery_job(pool, id).await.unwrap();
        assert!(job.consecutive_failures > previous);
        previous = job.consecutive_failures;
    }

    recovery_jobs::try_begin(pool, id).await.unwrap();
    recovery_jobs::finish_run(pool, id, true, 10, None).await.unwrap();
    let job = recovery_jobs::get_recovery_job(pool, id).await.unwrap();
    assert_eq!(job.consecutive_failures, 0);
    assert_eq!(job.error_count, 3);
}

#[tokio::test]
async fn test_run_logs_one_main_plus_phases_in_order() {
    let db = test_db().await;
    let pool = db.pool();
    let run_id = "run-recovery-1";

    // The shape the recovery pipeline writes: one main log plus one row per
    // phase, all sharing the run id.
    let main = job_logs::start_log(
        pool,
        &NewJobLog {
            run_id: run_id.to_string(),
            job_type: "recovery".to_string(),
            job_id: 7,
            phase: "main".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    for phase in ["backup", "restore", "registering"] {
        let log = job_logs::start_log(
            pool,
            &NewJobLog {
                run_id: run_id.to_string(),
                job_type: "recovery".to_string(),
                job_id: 7,
                phase: phase.to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        job_logs::complete_log(pool, log, RunStatus::Success, &LogCompletion::default())
            .await
            .unwrap();
    }

    job_logs::complete_log(
        pool,
        main,
        RunStatus::Success,
        &LogCompletion {
            backup_id: Some("vm/110/2025-01-01T00:00:00Z".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let rows = job_logs::logs_for_run(pool, run_id).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].phase, "main");
    assert_eq!(
        rows.iter().skip(1).map(|r| r.phase.as_str()).collect::<Vec<_>>(),
        vec!["backup", "restore", "registering"]
    );
    assert!(rows.iter().skip(1).all(|r| r.status == "success"));
    assert!(rows.windows(2).all(|w| w[0].started_at <= w[1].started_at));
}
