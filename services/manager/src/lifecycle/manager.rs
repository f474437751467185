//! The lifecycle manager.
//!
//! Owns the process table: one entry per infrastructure that currently has a
//! running maintenance worker. At most one entry exists per `InfraId`.
//!
//! Every mutating operation on an id first takes that id's lock from a keyed
//! registry, so start, stop and teardown of the same infrastructure run one at
//! a time in arrival order. The table lock itself is only held for the
//! insert-if-absent and remove-if-present steps, never across a termination
//! wait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use infravisor_id::InfraId;
use infravisor_reconcile::{
    Compiler, DescriptionCompiler, EnactorFactory, InfraStore, MemoryStore, ProcessStrategy,
    ProcessorFactory, ReconcilerFactory, ScalingQueue, StaticDescription,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use super::error::{LifecycleOp, ManagerError};
use super::locks::KeyedLocks;
use super::termination::{graceful_terminate, ExecutionUnit, TaskUnit, TerminationReport};
use super::worker::{MaintenanceWorker, WorkerState, WorkerStats};

/// Collaborators the manager works with, built once at startup.
#[derive(Clone)]
pub struct ManagerContext {
    pub compiler: Arc<dyn Compiler>,
    pub store: Arc<dyn InfraStore>,
    pub reconcilers: Arc<dyn ReconcilerFactory>,
    pub processors: Arc<dyn ProcessorFactory>,
    pub scaling: Arc<ScalingQueue>,
}

impl ManagerContext {
    /// Wire the in-memory collaborators around a processor factory.
    pub fn in_memory(processors: Arc<dyn ProcessorFactory>) -> Self {
        let store: Arc<dyn InfraStore> = Arc::new(MemoryStore::new());
        let scaling = Arc::new(ScalingQueue::new());
        let reconcilers = Arc::new(EnactorFactory::new(
            Arc::clone(&store),
            Arc::clone(&processors),
            Arc::clone(&scaling),
        ));
        Self {
            compiler: Arc::new(DescriptionCompiler),
            store,
            reconcilers,
            processors,
            scaling,
        }
    }
}

/// Settings applied to every maintenance worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Pause between reconciliation passes.
    pub interval: Duration,

    pub strategy: ProcessStrategy,

    /// How long `detach` waits for a worker before killing it.
    pub detach_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            interval: infravisor_reconcile::DEFAULT_RECONCILE_INTERVAL,
            strategy: ProcessStrategy::Sequential,
            detach_timeout: Duration::from_secs(60),
        }
    }
}

/// A process table entry.
struct ManagedHandle {
    unit: TaskUnit,
    started_at: DateTime<Utc>,
    interval: Duration,
    strategy: ProcessStrategy,
    stats: Arc<WorkerStats>,
}

/// Point-in-time view of a managed infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedInfo {
    pub infra_id: InfraId,
    pub started_at: DateTime<Utc>,
    pub interval_ms: u64,
    pub strategy: ProcessStrategy,
    pub state: WorkerState,
    pub passes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub running: bool,
}

impl ManagedInfo {
    fn snapshot(infra_id: InfraId, handle: &ManagedHandle) -> Self {
        Self {
            infra_id,
            started_at: handle.started_at,
            interval_ms: handle.interval.as_millis() as u64,
            strategy: handle.strategy,
            state: handle.stats.state(),
            passes: handle.stats.passes(),
            failures: handle.stats.failures(),
            last_error: handle.stats.last_error(),
            last_pass_at: handle.stats.last_pass_at(),
            running: handle.unit.is_running(),
        }
    }
}

/// Supervises one maintenance worker per managed infrastructure.
pub struct LifecycleManager {
    ctx: ManagerContext,
    settings: WorkerSettings,
    table: RwLock<HashMap<InfraId, ManagedHandle>>,
    locks: KeyedLocks<InfraId>,
    /// Set by `shutdown`; only read or written under the table write lock.
    closed: AtomicBool,
}

impl LifecycleManager {
    pub fn new(ctx: ManagerContext, settings: WorkerSettings) -> Self {
        Self {
            ctx,
            settings,
            table: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &ManagerContext {
        &self.ctx
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Compile and persist a description without starting maintenance.
    pub async fn submit(&self, raw: &str) -> Result<InfraId, ManagerError> {
        let description = self.ctx.compiler.compile(raw)?;
        let infra_id = description.infra_id;

        self.ctx
            .store
            .add_infrastructure(description)
            .await
            .map_err(ManagerError::store(infra_id, LifecycleOp::Submit))?;

        info!(infra_id = %infra_id, "Infrastructure submitted");
        Ok(infra_id)
    }

    /// Start a maintenance worker for a submitted infrastructure.
    #[instrument(skip(self), fields(infra_id = %infra_id))]
    pub async fn start_provisioning(&self, infra_id: InfraId) -> Result<(), ManagerError> {
        let _guard = self.locks.lock(infra_id).await;

        if self.table.read().await.contains_key(&infra_id) {
            return Err(ManagerError::AlreadyManaged { infra_id });
        }

        self.ctx
            .store
            .get_infrastructure(infra_id)
            .await
            .map_err(ManagerError::store(infra_id, LifecycleOp::StartProvisioning))?
            .ok_or_else(|| ManagerError::not_found(infra_id, LifecycleOp::StartProvisioning))?;

        let mut table = self.table.write().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(ManagerError::ShuttingDown { infra_id });
        }
        if table.contains_key(&infra_id) {
            return Err(ManagerError::AlreadyManaged { infra_id });
        }

        let stats = Arc::new(WorkerStats::default());
        let worker = MaintenanceWorker::new(
            infra_id,
            self.settings.interval,
            self.settings.strategy,
            self.ctx.reconcilers.create(infra_id, self.settings.strategy),
            Arc::clone(&stats),
        );
        let unit = TaskUnit::spawn(|stop| worker.run(stop));

        table.insert(
            infra_id,
            ManagedHandle {
                unit,
                started_at: Utc::now(),
                interval: self.settings.interval,
                strategy: self.settings.strategy,
                stats,
            },
        );

        info!(managed = table.len(), "Started maintenance worker");
        Ok(())
    }

    /// Submit a description and start maintaining it.
    ///
    /// If starting fails the description stays persisted and can be attached
    /// later.
    pub async fn add(&self, raw: &str) -> Result<InfraId, ManagerError> {
        let infra_id = self.submit(raw).await?;
        self.start_provisioning(infra_id).await?;
        Ok(infra_id)
    }

    /// Resume maintenance of a submitted infrastructure.
    pub async fn attach(&self, infra_id: InfraId) -> Result<(), ManagerError> {
        self.start_provisioning(infra_id).await
    }

    /// Stop the maintenance worker. Provisioned resources are left alone.
    #[instrument(skip(self), fields(infra_id = %infra_id))]
    pub async fn stop_provisioning(
        &self,
        infra_id: InfraId,
        wait_timeout: Duration,
    ) -> Result<TerminationReport, ManagerError> {
        let _guard = self.locks.lock(infra_id).await;

        let handle = self
            .table
            .write()
            .await
            .remove(&infra_id)
            .ok_or_else(|| ManagerError::not_found(infra_id, LifecycleOp::StopProvisioning))?;

        Ok(terminate(infra_id, handle, wait_timeout).await)
    }

    /// Stop the maintenance worker with the configured detach timeout.
    pub async fn detach(&self, infra_id: InfraId) -> Result<TerminationReport, ManagerError> {
        self.stop_provisioning(infra_id, self.settings.detach_timeout)
            .await
    }

    pub async fn get(&self, infra_id: InfraId) -> Result<ManagedInfo, ManagerError> {
        let table = self.table.read().await;
        table
            .get(&infra_id)
            .map(|handle| ManagedInfo::snapshot(infra_id, handle))
            .ok_or_else(|| ManagerError::not_found(infra_id, LifecycleOp::Get))
    }

    /// IDs of all managed infrastructures, sorted.
    pub async fn list(&self) -> Vec<InfraId> {
        let mut ids: Vec<_> = self.table.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn is_managed(&self, infra_id: InfraId) -> bool {
        self.table.read().await.contains_key(&infra_id)
    }

    /// The persisted description of a submitted infrastructure.
    pub async fn description(&self, infra_id: InfraId) -> Result<StaticDescription, ManagerError> {
        self.ctx
            .store
            .get_infrastructure(infra_id)
            .await
            .map_err(ManagerError::store(infra_id, LifecycleOp::Describe))?
            .ok_or_else(|| ManagerError::not_found(infra_id, LifecycleOp::Describe))
    }

    /// Drop every provisioned resource and forget the infrastructure.
    ///
    /// Refuses while a worker is running; detach first. If a drop fails the
    /// description is kept so teardown can be retried.
    #[instrument(skip(self), fields(infra_id = %infra_id))]
    pub async fn tear_down(&self, infra_id: InfraId) -> Result<(), ManagerError> {
        let _guard = self.locks.lock(infra_id).await;

        if self.is_managed(infra_id).await {
            return Err(ManagerError::StillManaged { infra_id });
        }

        let store = &self.ctx.store;
        let description = store
            .get_infrastructure(infra_id)
            .await
            .map_err(ManagerError::store(infra_id, LifecycleOp::TearDown))?
            .ok_or_else(|| ManagerError::not_found(infra_id, LifecycleOp::TearDown))?;
        let state = store
            .dynamic_state(infra_id)
            .await
            .map_err(ManagerError::store(infra_id, LifecycleOp::TearDown))?;

        let processor = self.ctx.processors.instantiate();
        let teardown = |source| ManagerError::Teardown { infra_id, source };

        // Dependents go first.
        for node in description.nodes.iter().rev() {
            let Some(node_state) = state.node(&node.name) else {
                continue;
            };
            for instance in node_state.instances.values() {
                processor.drop_node(instance).await.map_err(teardown)?;
                store
                    .remove_instance(infra_id, &instance.node_name, instance.node_id)
                    .await
                    .map_err(ManagerError::store(infra_id, LifecycleOp::TearDown))?;
            }
        }
        processor
            .drop_infrastructure(infra_id)
            .await
            .map_err(teardown)?;

        self.ctx.scaling.forget(infra_id).await;
        store
            .remove_infrastructure(infra_id)
            .await
            .map_err(ManagerError::store(infra_id, LifecycleOp::TearDown))?;

        info!(instances = state.instance_count(), "Infrastructure torn down");
        Ok(())
    }

    /// Stop every worker, concurrently.
    ///
    /// Resources are never torn down here; every infrastructure that was
    /// managed stays provisioned and is logged as such. The manager is closed
    /// afterwards: `start_provisioning` fails with `ShuttingDown`.
    pub async fn shutdown(&self, wait_timeout: Duration) -> Vec<TerminationReport> {
        let handles: Vec<_> = {
            let mut table = self.table.write().await;
            self.closed.store(true, Ordering::SeqCst);
            table.drain().collect()
        };
        if handles.is_empty() {
            return Vec::new();
        }

        info!(count = handles.len(), "Stopping all maintenance workers");
        let reports = join_all(
            handles
                .into_iter()
                .map(|(infra_id, handle)| terminate(infra_id, handle, wait_timeout)),
        )
        .await;

        for report in &reports {
            warn!(
                infra_id = %report.infra_id,
                "Infrastructure left provisioned; attach it again or tear it down"
            );
        }
        reports
    }
}

async fn terminate(
    infra_id: InfraId,
    handle: ManagedHandle,
    wait_timeout: Duration,
) -> TerminationReport {
    let ManagedHandle {
        mut unit, stats, ..
    } = handle;
    let report = graceful_terminate(infra_id, &mut unit, wait_timeout).await;
    stats.set_state(WorkerState::Terminated);
    report
}
