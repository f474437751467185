//! Lifecycle manager integration tests.
//!
//! Timing-sensitive tests run on a paused clock, so "60 seconds" elapse
//! instantly and elapsed times are exact.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use infravisor_id::{InfraId, NodeInstanceId};
use infravisor_manager::lifecycle::{
    LifecycleManager, LifecycleOp, ManagerContext, ManagerError, TerminationOutcome,
    TerminationPhase, WorkerSettings, WorkerState,
};
use infravisor_reconcile::{
    CompileError, Compiler, DescriptionCompiler, DynamicState, EnactorFactory, InfraStore,
    MemoryStore, NodeInstance, PassReport, ProcessStrategy, ReconcileError, Reconciler,
    ReconcilerFactory, ScalingQueue, SimulatedProcessorFactory, StaticDescription, StoreError,
};
use tokio::time::Instant;

const DEMO: &str = r#"
name: demo
nodes:
  - name: db
  - name: web
    depends_on: [db]
    scaling: { min: 2, max: 4 }
"#;

// =============================================================================
// Test Collaborators
// =============================================================================

/// What a reconciler does when asked to cancel.
#[derive(Debug, Clone, Copy)]
enum OnCancel {
    Return,
    Sleep(Duration),
    Hang,
}

#[derive(Default)]
struct Probe {
    reconcilers_created: AtomicU64,
    passes: AtomicU64,
    fail: AtomicBool,
}

struct ProbeReconciler {
    probe: Arc<Probe>,
    on_cancel: OnCancel,
}

#[async_trait]
impl Reconciler for ProbeReconciler {
    async fn reconcile(&self, infra_id: InfraId) -> Result<PassReport, ReconcileError> {
        self.probe.passes.fetch_add(1, Ordering::SeqCst);
        if self.probe.fail.load(Ordering::SeqCst) {
            return Err(ReconcileError::DescriptionMissing(infra_id));
        }
        Ok(PassReport::default())
    }

    async fn cancel_pending(&self) {
        match self.on_cancel {
            OnCancel::Return => {}
            OnCancel::Sleep(d) => tokio::time::sleep(d).await,
            OnCancel::Hang => std::future::pending::<()>().await,
        }
    }
}

struct ProbeFactory {
    probe: Arc<Probe>,
    on_cancel: OnCancel,
}

impl ReconcilerFactory for ProbeFactory {
    fn create(&self, _infra_id: InfraId, _strategy: ProcessStrategy) -> Box<dyn Reconciler> {
        self.probe.reconcilers_created.fetch_add(1, Ordering::SeqCst);
        Box::new(ProbeReconciler {
            probe: Arc::clone(&self.probe),
            on_cancel: self.on_cancel,
        })
    }
}

#[derive(Default)]
struct CountingCompiler {
    compilations: AtomicU64,
}

impl Compiler for CountingCompiler {
    fn compile(&self, raw: &str) -> Result<StaticDescription, CompileError> {
        self.compilations.fetch_add(1, Ordering::SeqCst);
        DescriptionCompiler.compile(raw)
    }
}

/// Memory store with injectable slowness and failures.
#[derive(Default)]
struct InstrumentedStore {
    inner: MemoryStore,
    upsert_delay: Duration,
    fail_next_get: AtomicBool,
}

#[async_trait]
impl InfraStore for InstrumentedStore {
    async fn add_infrastructure(&self, description: StaticDescription) -> Result<(), StoreError> {
        self.inner.add_infrastructure(description).await
    }

    async fn get_infrastructure(
        &self,
        infra_id: InfraId,
    ) -> Result<Option<StaticDescription>, StoreError> {
        if self.fail_next_get.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("connection reset".into()));
        }
        self.inner.get_infrastructure(infra_id).await
    }

    async fn remove_infrastructure(&self, infra_id: InfraId) -> Result<(), StoreError> {
        self.inner.remove_infrastructure(infra_id).await
    }

    async fn list_infrastructures(&self) -> Result<Vec<InfraId>, StoreError> {
        self.inner.list_infrastructures().await
    }

    async fn dynamic_state(&self, infra_id: InfraId) -> Result<DynamicState, StoreError> {
        self.inner.dynamic_state(infra_id).await
    }

    async fn upsert_instance(&self, instance: NodeInstance) -> Result<(), StoreError> {
        tokio::time::sleep(self.upsert_delay).await;
        self.inner.upsert_instance(instance).await
    }

    async fn remove_instance(
        &self,
        infra_id: InfraId,
        node_name: &str,
        node_id: NodeInstanceId,
    ) -> Result<(), StoreError> {
        self.inner.remove_instance(infra_id, node_name, node_id).await
    }

    async fn set_target(
        &self,
        infra_id: InfraId,
        node_name: &str,
        target: u32,
    ) -> Result<(), StoreError> {
        self.inner.set_target(infra_id, node_name, target).await
    }
}

/// A manager wired to the real enactor over an [`InstrumentedStore`].
fn enacting_manager(
    store: Arc<InstrumentedStore>,
    processors: SimulatedProcessorFactory,
) -> LifecycleManager {
    let scaling = Arc::new(ScalingQueue::new());
    let processors = Arc::new(processors);
    let ctx = ManagerContext {
        compiler: Arc::new(DescriptionCompiler),
        store: store.clone(),
        reconcilers: Arc::new(EnactorFactory::new(
            store,
            processors.clone(),
            Arc::clone(&scaling),
        )),
        processors,
        scaling,
    };
    LifecycleManager::new(ctx, WorkerSettings::default())
}

struct Harness {
    manager: Arc<LifecycleManager>,
    probe: Arc<Probe>,
    compiler: Arc<CountingCompiler>,
    store: Arc<MemoryStore>,
}

fn harness(on_cancel: OnCancel) -> Harness {
    let probe = Arc::new(Probe::default());
    let compiler = Arc::new(CountingCompiler::default());
    let store = Arc::new(MemoryStore::new());

    let ctx = ManagerContext {
        compiler: compiler.clone(),
        store: store.clone(),
        reconcilers: Arc::new(ProbeFactory {
            probe: Arc::clone(&probe),
            on_cancel,
        }),
        processors: Arc::new(SimulatedProcessorFactory::default()),
        scaling: Arc::new(ScalingQueue::new()),
    };

    Harness {
        manager: Arc::new(LifecycleManager::new(ctx, WorkerSettings::default())),
        probe,
        compiler,
        store,
    }
}

/// Let spawned workers run their first pass.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// =============================================================================
// Uniqueness
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_second_start_fails_with_already_managed() {
    let h = harness(OnCancel::Return);
    let infra_id = h.manager.submit(DEMO).await.unwrap();

    h.manager.start_provisioning(infra_id).await.unwrap();
    let err = h.manager.start_provisioning(infra_id).await.unwrap_err();

    assert!(matches!(err, ManagerError::AlreadyManaged { infra_id: id } if id == infra_id));
    assert_eq!(h.manager.list().await, vec![infra_id]);
    assert_eq!(h.probe.reconcilers_created.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_starts_have_exactly_one_winner() {
    let h = harness(OnCancel::Return);
    let infra_id = h.manager.submit(DEMO).await.unwrap();

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let manager = Arc::clone(&h.manager);
            tokio::spawn(async move { manager.start_provisioning(infra_id).await })
        })
        .collect();

    let mut successes = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(()) => successes += 1,
            Err(ManagerError::AlreadyManaged { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(h.manager.list().await.len(), 1);
    assert_eq!(h.probe.reconcilers_created.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Unknown IDs
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_unknown_ids_are_not_found() {
    let h = harness(OnCancel::Return);
    let unknown = InfraId::new();

    let err = h
        .manager
        .stop_provisioning(unknown, Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ManagerError::NotFound { operation: LifecycleOp::StopProvisioning, .. }
    ));

    let err = h.manager.get(unknown).await.unwrap_err();
    assert!(matches!(err, ManagerError::NotFound { operation: LifecycleOp::Get, .. }));

    let err = h.manager.tear_down(unknown).await.unwrap_err();
    assert!(matches!(err, ManagerError::NotFound { operation: LifecycleOp::TearDown, .. }));

    let err = h.manager.start_provisioning(unknown).await.unwrap_err();
    assert!(matches!(
        err,
        ManagerError::NotFound { operation: LifecycleOp::StartProvisioning, .. }
    ));
    assert!(h.manager.list().await.is_empty());
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_tear_down_while_managed_is_refused() {
    let h = harness(OnCancel::Return);
    let infra_id = h.manager.add(DEMO).await.unwrap();

    let err = h.manager.tear_down(infra_id).await.unwrap_err();
    assert!(matches!(err, ManagerError::StillManaged { .. }));

    assert!(h.store.get_infrastructure(infra_id).await.unwrap().is_some());
    assert!(h.manager.is_managed(infra_id).await);
}

#[tokio::test(start_paused = true)]
async fn test_tear_down_drops_every_instance() {
    let processors = SimulatedProcessorFactory::default();
    let stats = processors.stats();
    let ctx = ManagerContext::in_memory(Arc::new(processors));
    let store = Arc::clone(&ctx.store);
    let manager = LifecycleManager::new(ctx, WorkerSettings::default());

    let infra_id = manager.add(DEMO).await.unwrap();
    settle().await;
    assert_eq!(store.dynamic_state(infra_id).await.unwrap().instance_count(), 3);

    manager.detach(infra_id).await.unwrap();
    manager.tear_down(infra_id).await.unwrap();

    assert_eq!(stats.dropped(), 3);
    assert_eq!(stats.infrastructures_dropped(), 1);
    assert!(store.get_infrastructure(infra_id).await.unwrap().is_none());
}

// =============================================================================
// Graceful Termination
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_detach_of_cooperative_worker_is_not_escalated() {
    let h = harness(OnCancel::Sleep(Duration::from_secs(2)));
    let infra_id = h.manager.add(DEMO).await.unwrap();
    settle().await;

    let report = h
        .manager
        .stop_provisioning(infra_id, Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(report.outcome, TerminationOutcome::Graceful);
    assert!(!report.phases.contains(&TerminationPhase::Escalated));
    assert_eq!(report.phases.last(), Some(&TerminationPhase::Reaped));
    assert!(report.elapsed >= Duration::from_secs(2));
    assert!(report.elapsed < Duration::from_secs(3));
    assert!(!h.manager.is_managed(infra_id).await);
}

#[tokio::test(start_paused = true)]
async fn test_detach_of_stuck_worker_escalates_once_after_timeout() {
    let h = harness(OnCancel::Hang);
    let infra_id = h.manager.add(DEMO).await.unwrap();
    settle().await;

    let started = Instant::now();
    let report = h
        .manager
        .stop_provisioning(infra_id, Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(report.outcome, TerminationOutcome::Escalated);
    let escalations = report
        .phases
        .iter()
        .filter(|p| **p == TerminationPhase::Escalated)
        .count();
    assert_eq!(escalations, 1);
    assert_eq!(report.phases.last(), Some(&TerminationPhase::Reaped));
    assert!(report.elapsed >= Duration::from_secs(60));
    assert!(started.elapsed() < Duration::from_secs(61));

    // The killed worker no longer reconciles.
    let passes = h.probe.passes.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.probe.passes.load(Ordering::SeqCst), passes);
}

#[tokio::test(start_paused = true)]
async fn test_detach_during_reconcile_sleep_leaves_entry_removed() {
    let h = harness(OnCancel::Return);
    let infra_id = h.manager.add(DEMO).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let report = h.manager.detach(infra_id).await.unwrap();
    assert_eq!(report.outcome, TerminationOutcome::Graceful);
    assert!(report.elapsed < Duration::from_secs(1));

    let err = h.manager.get(infra_id).await.unwrap_err();
    assert!(err.is_not_found());
}

// =============================================================================
// Attach / Detach
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_attach_after_detach_resumes_without_recompiling() {
    let h = harness(OnCancel::Return);
    let infra_id = h.manager.add(DEMO).await.unwrap();
    settle().await;

    h.manager.detach(infra_id).await.unwrap();
    let passes_before = h.probe.passes.load(Ordering::SeqCst);

    h.manager.attach(infra_id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(15)).await;

    assert!(h.probe.passes.load(Ordering::SeqCst) > passes_before);
    assert_eq!(h.compiler.compilations.load(Ordering::SeqCst), 1);
    assert_eq!(h.probe.reconcilers_created.load(Ordering::SeqCst), 2);

    let info = h.manager.get(infra_id).await.unwrap();
    assert_eq!(info.state, WorkerState::Running);
    assert!(info.running);
}

#[tokio::test(start_paused = true)]
async fn test_failed_submit_persists_nothing() {
    let h = harness(OnCancel::Return);

    let err = h.manager.add("name: broken\nnodes: []").await.unwrap_err();
    assert!(matches!(err, ManagerError::Compilation(CompileError::NoNodes)));
    assert!(h.store.list_infrastructures().await.unwrap().is_empty());
    assert!(h.manager.list().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_start_after_submit_keeps_description() {
    let store = Arc::new(InstrumentedStore::default());
    let manager = enacting_manager(Arc::clone(&store), SimulatedProcessorFactory::default());

    store.fail_next_get.store(true, Ordering::SeqCst);
    let err = manager.add(DEMO).await.unwrap_err();
    let ManagerError::Store {
        infra_id,
        operation,
        ..
    } = &err
    else {
        panic!("expected a store error, got {err:?}");
    };
    let infra_id = *infra_id;
    assert_eq!(*operation, LifecycleOp::StartProvisioning);
    assert!(!manager.is_managed(infra_id).await);
    assert_eq!(store.list_infrastructures().await.unwrap(), vec![infra_id]);

    manager.attach(infra_id).await.unwrap();
    assert!(manager.is_managed(infra_id).await);
}

// =============================================================================
// Worker Behavior
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_detach_mid_pass_leaves_no_unrecorded_instances() {
    let store = Arc::new(InstrumentedStore {
        upsert_delay: Duration::from_secs(1),
        ..Default::default()
    });
    let processors = SimulatedProcessorFactory::default();
    let stats = processors.stats();
    let manager = enacting_manager(Arc::clone(&store), processors);

    let infra_id = manager.add(DEMO).await.unwrap();
    // The first instance is created and its record is still being written.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let report = manager.detach(infra_id).await.unwrap();
    assert_eq!(report.outcome, TerminationOutcome::Graceful);
    assert!(stats.created() >= 1);
    assert_eq!(
        store.dynamic_state(infra_id).await.unwrap().instance_count() as u64,
        stats.created()
    );

    manager.tear_down(infra_id).await.unwrap();
    assert_eq!(stats.dropped(), stats.created());
    assert!(store.get_infrastructure(infra_id).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_worker_keeps_retrying_after_errors() {
    let h = harness(OnCancel::Return);
    h.probe.fail.store(true, Ordering::SeqCst);
    let infra_id = h.manager.add(DEMO).await.unwrap();

    tokio::time::sleep(Duration::from_secs(35)).await;

    let info = h.manager.get(infra_id).await.unwrap();
    assert_eq!(info.failures, 4);
    assert_eq!(info.passes, 0);
    assert!(info.last_error.is_some());
    assert!(info.running);
    assert_eq!(info.state, WorkerState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_reaps_every_worker() {
    let h = harness(OnCancel::Hang);
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(h.manager.add(DEMO).await.unwrap());
    }
    settle().await;

    let started = Instant::now();
    let reports = h.manager.shutdown(Duration::from_secs(5)).await;

    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.escalated()));
    // Workers are terminated concurrently, not one after another.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(h.manager.list().await.is_empty());

    // Descriptions survive for a later attach.
    for id in ids {
        assert!(h.store.get_infrastructure(id).await.unwrap().is_some());
    }
}

// =============================================================================
// End-to-End Scenario
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_submit_attach_detach_teardown_scenario() {
    let h = harness(OnCancel::Sleep(Duration::from_secs(2)));

    let x = h.manager.submit(DEMO).await.unwrap();
    h.manager.start_provisioning(x).await.unwrap();
    assert!(matches!(
        h.manager.start_provisioning(x).await,
        Err(ManagerError::AlreadyManaged { .. })
    ));
    settle().await;

    let report = h.manager.stop_provisioning(x, Duration::from_secs(60)).await.unwrap();
    assert_eq!(report.outcome, TerminationOutcome::Graceful);
    assert!(report.elapsed >= Duration::from_secs(2));
    assert!(report.elapsed < Duration::from_secs(3));

    h.manager.tear_down(x).await.unwrap();
    assert!(h.store.get_infrastructure(x).await.unwrap().is_none());

    let y = InfraId::new();
    assert!(h.manager.tear_down(y).await.unwrap_err().is_not_found());

    let z = InfraId::new();
    assert!(h.manager.detach(z).await.unwrap_err().is_not_found());
}
