//! Application State
//!
//! Shared state of the proxrepl engine: one explicit init-on-startup
//! lifecycle, handles passed as parameters rather than implicit globals.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::hostbackup::HostBackupPipeline;
use crate::inventory::RemoteInventory;
use crate::migration::MigrationPipeline;
use crate::notify::NotificationTrigger;
use crate::pbs::PbsObserver;
use crate::probe::NodeProbe;
use crate::recovery::RecoveryPipeline;
use crate::retention::Pruner;
use crate::sanoid::SanoidManager;
use crate::snapshots::SnapshotManager;
use crate::ssh::SshExecutor;
use crate::sync::SyncPipeline;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub database: Arc<Database>,
    pub executor: Arc<SshExecutor>,
    pub probe: Arc<NodeProbe>,
    pub inventory: Arc<RemoteInventory>,
    pub pbs: Arc<PbsObserver>,
    pub sanoid: Arc<SanoidManager>,
    pub snapshots: Arc<SnapshotManager>,
    pub pruner: Arc<Pruner>,
    pub notifier: Arc<NotificationTrigger>,
    pub sync_pipeline: Arc<SyncPipeline>,
    pub recovery_pipeline: Arc<RecoveryPipeline>,
    pub migration_pipeline: Arc<MigrationPipeline>,
    pub host_backup_pipeline: Arc<HostBackupPipeline>,
}

impl AppState {
    /// Wire up every component against an open database
    pub fn new(config: EngineConfig, database: Database) -> Self {
        let config = Arc::new(config);
        let database = Arc::new(database);
        let executor = Arc::new(SshExecutor::new());
        let probe = Arc::new(NodeProbe::new(executor.clone()));
        let inventory = Arc::new(RemoteInventory::new(executor.clone()));
        let pbs = Arc::new(PbsObserver::new(executor.clone()));
        let sanoid = Arc::new(SanoidManager::new(executor.clone()));
        let snapshots = Arc::new(SnapshotManager::new(executor.clone(), inventory.clone()));
        let pruner = Arc::new(Pruner::new(executor.clone()));
        let notifier = Arc::new(NotificationTrigger::new());

        let sync_pipeline = Arc::new(SyncPipeline::new(
            executor.clone(),
            pruner.clone(),
            notifier.clone(),
        ));
        let recovery_pipeline = Arc::new(RecoveryPipeline::new(executor.clone(), notifier.clone()));
        let migration_pipeline = Arc::new(MigrationPipeline::new(executor.clone(), notifier.clone()));
        let host_backup_pipeline = Arc::new(HostBackupPipeline::new(
            executor.clone(),
            pruner.clone(),
            notifier.clone(),
        ));

        Self {
            config,
            database,
            executor,
            probe,
            inventory,
            pbs,
            sanoid,
            snapshots,
            pruner,
            notifier,
            sync_pipeline,
            recovery_pipeline,
            migration_pipeline,
            host_backup_pipeline,
        }
    }

    /// Build the scheduler over this state's pipelines
    pub fn scheduler(&self) -> crate::scheduler::Scheduler {
        crate::scheduler::Scheduler::new(
            self.database.clone(),
            self.sync_pipeline.clone(),
            self.recovery_pipeline.clone(),
            self.migration_pipeline.clone(),
            self.host_backup_pipeline.clone(),
            self.notifier.clone(),
        )
    }
}
