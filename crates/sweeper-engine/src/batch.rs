//! Density-ordered, bounded-parallel processing of spatial partitions
//!
//! A batch ranks its partitions by object count, starts them densest first
//! under a FIFO semaphore, and isolates failures: a bad object is counted
//! against its partition, and a bad partition is reported in the outcome
//! without affecting its siblings.

use crate::clock::{TimeProvider, Timestamp};
use crate::context::EngineContext;
use crate::error::SweepError;
use crate::metrics::{names, MetricCounters};
use crate::pool::WorkerPoolManager;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use sweeper_domain::{ObjectQuery, ObjectRef, PartitionId, Position, WorldAdapter};
use tokio::sync::Semaphore;

/// Reason recorded for partitions stopped by the kill switch
pub const INTERRUPTED: &str = "interrupted";

/// Per-partition selection and per-object work of a batch
#[async_trait]
pub trait PartitionVisitor: Send + Sync + 'static {
    /// Choose which listed objects to visit; all of them by default
    fn select(&self, _partition: PartitionId, objects: Vec<ObjectRef>) -> Vec<ObjectRef> {
        objects
    }

    /// Handle one object; `Ok(true)` when the object was acted on
    async fn visit(&self, object: ObjectRef) -> Result<bool, SweepError>;
}

/// Ranking entry for one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionLoad {
    /// Partition
    pub partition: PartitionId,
    /// Objects reported by the world; zero when counting failed
    pub object_count: usize,
    /// `min(object_count, cap)`
    pub priority_score: usize,
}

/// Outcome for one partition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionResult {
    /// Partition
    pub partition: PartitionId,
    /// False when listing failed, the worker died, or the batch was interrupted
    pub success: bool,
    /// Objects listed
    pub listed: u64,
    /// Objects chosen by the visitor
    pub selected: u64,
    /// Objects the visitor acted on
    pub affected: u64,
    /// Objects whose visit failed
    pub failed_objects: u64,
    /// Wall time spent on the partition
    pub duration_ms: u64,
    /// Failure reason
    pub error: Option<String>,
}

impl PartitionResult {
    fn empty(partition: PartitionId) -> Self {
        Self {
            partition,
            success: true,
            listed: 0,
            selected: 0,
            affected: 0,
            failed_objects: 0,
            duration_ms: 0,
            error: None,
        }
    }

    /// Failed partition with no work done
    pub fn failure(partition: PartitionId, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            ..Self::empty(partition)
        }
    }

    /// Whether the kill switch stopped this partition
    pub fn was_interrupted(&self) -> bool {
        self.error.as_deref() == Some(INTERRUPTED)
    }
}

/// Live progress of one batch, shared by all of its partition workers
#[derive(Debug)]
pub struct ProcessingProgress {
    total_units: usize,
    processed_units: AtomicUsize,
    successful_units: AtomicUsize,
    failed_units: AtomicUsize,
    total_time_ms: AtomicU64,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    started_at: Timestamp,
    started: Instant,
}

impl ProcessingProgress {
    fn new(total_units: usize, started_at: Timestamp) -> Self {
        Self {
            total_units,
            processed_units: AtomicUsize::new(0),
            successful_units: AtomicUsize::new(0),
            failed_units: AtomicUsize::new(0),
            total_time_ms: AtomicU64::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            started_at,
            started: Instant::now(),
        }
    }

    fn unit_started(&self) {
        let now_running = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_running.fetch_max(now_running, Ordering::AcqRel);
    }

    fn unit_finished(&self, result: &PartitionResult, ran: bool) {
        if ran {
            let _ = self
                .running
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
        self.total_time_ms.fetch_add(result.duration_ms, Ordering::Relaxed);
        if result.success {
            self.successful_units.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_units.fetch_add(1, Ordering::Relaxed);
        }
        self.processed_units.fetch_add(1, Ordering::AcqRel);
    }

    /// Partitions in the batch
    pub fn total_units(&self) -> usize {
        self.total_units
    }

    /// Partitions finished so far
    pub fn processed_units(&self) -> usize {
        self.processed_units.load(Ordering::Acquire)
    }

    /// Partitions that succeeded
    pub fn successful_units(&self) -> usize {
        self.successful_units.load(Ordering::Relaxed)
    }

    /// Partitions that failed
    pub fn failed_units(&self) -> usize {
        self.failed_units.load(Ordering::Relaxed)
    }

    /// Partitions being worked on right now
    pub fn running_units(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Most partitions ever worked on at once
    pub fn peak_running_units(&self) -> usize {
        self.peak_running.load(Ordering::Acquire)
    }

    /// Completion percentage
    pub fn progress_percent(&self) -> f64 {
        if self.total_units == 0 {
            return 100.0;
        }
        self.processed_units() as f64 / self.total_units as f64 * 100.0
    }

    /// Whether every partition has finished
    pub fn is_complete(&self) -> bool {
        self.processed_units() >= self.total_units
    }

    /// Mean time per finished partition
    pub fn average_unit_ms(&self) -> f64 {
        let done = self.processed_units();
        if done == 0 {
            return 0.0;
        }
        self.total_time_ms.load(Ordering::Relaxed) as f64 / done as f64
    }

    /// When the batch started
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// Time since the batch started
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }
}

impl fmt::Display for ProcessingProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} partitions ({:.1}%), {} ok, {} failed, {:.1} ms avg",
            self.processed_units(),
            self.total_units,
            self.progress_percent(),
            self.successful_units(),
            self.failed_units(),
            self.average_unit_ms()
        )
    }
}

/// Everything a finished batch produced
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    /// Registry id the batch ran under
    pub operation_id: u64,
    /// One result per partition, in start order (densest first)
    pub results: Vec<PartitionResult>,
    /// Whether the kill switch stopped the batch early
    pub interrupted: bool,
    /// Most partitions worked on at once
    pub peak_parallelism: usize,
    /// Wall time of the whole batch
    pub duration_ms: u64,
}

impl BatchOutcome {
    /// Partitions that failed for any reason
    pub fn failed_partitions(&self) -> Vec<PartitionId> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.partition)
            .collect()
    }

    /// Objects acted on across the batch
    pub fn objects_affected(&self) -> u64 {
        self.results.iter().map(|r| r.affected).sum()
    }

    /// Objects whose visit failed across the batch
    pub fn objects_failed(&self) -> u64 {
        self.results.iter().map(|r| r.failed_objects).sum()
    }

    /// Objects chosen across the batch
    pub fn objects_selected(&self) -> u64 {
        self.results.iter().map(|r| r.selected).sum()
    }

    /// Whether anything failed while the batch still completed
    pub fn is_partial_failure(&self) -> bool {
        self.results.iter().any(|r| !r.success || r.failed_objects > 0)
    }
}

/// Runs visitors over spatial partitions on the worker pools
pub struct SpatialBatchProcessor<W: WorldAdapter> {
    world: Arc<W>,
    pools: Arc<WorkerPoolManager>,
    metrics: Arc<MetricCounters>,
    clock: Arc<dyn TimeProvider>,
    max_parallel: Option<usize>,
    priority_cap: usize,
    operations: DashMap<u64, Arc<ProcessingProgress>>,
    next_operation: AtomicU64,
}

impl<W: WorldAdapter> SpatialBatchProcessor<W> {
    /// Create a processor reading from `world`
    pub fn new(world: Arc<W>, context: &EngineContext) -> Self {
        Self {
            world,
            pools: Arc::clone(&context.pools),
            metrics: Arc::clone(&context.metrics),
            clock: Arc::clone(&context.clock),
            max_parallel: context.config.batch.max_parallel_partitions,
            priority_cap: context.config.batch.priority_cap.max(1),
            operations: DashMap::new(),
            next_operation: AtomicU64::new(1),
        }
    }

    /// Process every loaded partition covering `center ± radius`
    ///
    /// Fails only when the partitions cannot be enumerated or the pools are
    /// shut down; everything after that is reported per partition.
    pub async fn process_in_range<V: PartitionVisitor>(
        &self,
        center: Position,
        radius: f64,
        query: ObjectQuery,
        visitor: Arc<V>,
        kill_switch: Arc<AtomicBool>,
    ) -> Result<BatchOutcome, SweepError> {
        let world = Arc::clone(&self.world);
        let partitions = self
            .pools
            .spawn_io(move || world.enumerate_partitions(center, radius))
            .await?
            .map_err(|e| SweepError::World(e.to_string()))?;
        tracing::debug!(
            "Enumerated {} partitions around {} (radius {})",
            partitions.len(),
            center,
            radius
        );
        self.process_partitions(partitions, query, visitor, kill_switch)
            .await
    }

    /// Process an explicit list of partitions
    pub async fn process_partitions<V: PartitionVisitor>(
        &self,
        partitions: Vec<PartitionId>,
        query: ObjectQuery,
        visitor: Arc<V>,
        kill_switch: Arc<AtomicBool>,
    ) -> Result<BatchOutcome, SweepError> {
        let started = Instant::now();
        let loads = self.rank(partitions).await?;

        let available = self.max_parallel.unwrap_or_else(|| self.pools.compute_threads());
        let bound = loads.len().min(available).max(1);
        let semaphore = Arc::new(Semaphore::new(bound));

        let operation_id = self.next_operation.fetch_add(1, Ordering::Relaxed);
        let progress = Arc::new(ProcessingProgress::new(loads.len(), self.clock.now()));
        self.operations.insert(operation_id, Arc::clone(&progress));
        tracing::debug!(
            "Batch {} started: {} partitions, parallelism {}",
            operation_id,
            loads.len(),
            bound
        );

        let mut pending = Vec::with_capacity(loads.len());
        let mut interrupted = false;
        for load in &loads {
            // Acquired in ranked order, so starts follow density order
            let permit = if interrupted {
                None
            } else {
                Arc::clone(&semaphore).acquire_owned().await.ok()
            };
            if kill_switch.load(Ordering::Acquire) {
                interrupted = true;
            }
            let Some(permit) = permit.filter(|_| !interrupted) else {
                let result = PartitionResult::failure(load.partition, INTERRUPTED);
                progress.unit_finished(&result, false);
                pending.push(Err(result));
                continue;
            };

            let unit = PartitionUnit {
                world: Arc::clone(&self.world),
                pools: Arc::clone(&self.pools),
                metrics: Arc::clone(&self.metrics),
                visitor: Arc::clone(&visitor),
                query: query.clone(),
                kill_switch: Arc::clone(&kill_switch),
                progress: Arc::clone(&progress),
            };
            let partition = load.partition;
            let handle = self.pools.spawn_compute(async move {
                let result = unit.run(partition).await;
                drop(permit);
                result
            });
            pending.push(Ok((partition, handle)));
        }

        let mut results = Vec::with_capacity(pending.len());
        for entry in pending {
            match entry {
                Ok((partition, handle)) => match handle.await {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        tracing::error!("Worker for partition {} failed: {}", partition, e);
                        let result = PartitionResult::failure(partition, e.to_string());
                        progress.unit_finished(&result, true);
                        results.push(result);
                    }
                },
                Err(result) => results.push(result),
            }
        }

        self.operations.remove(&operation_id);
        let interrupted = interrupted || results.iter().any(PartitionResult::was_interrupted);
        let outcome = BatchOutcome {
            operation_id,
            results,
            interrupted,
            peak_parallelism: progress.peak_running_units(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            "Batch {} finished: {} partitions, {} failed, {} objects affected in {} ms",
            operation_id,
            outcome.results.len(),
            outcome.failed_partitions().len(),
            outcome.objects_affected(),
            outcome.duration_ms
        );
        Ok(outcome)
    }

    /// Count objects per partition and sort densest first
    async fn rank(&self, partitions: Vec<PartitionId>) -> Result<Vec<PartitionLoad>, SweepError> {
        let counts = partitions.into_iter().map(|partition| {
            let world = Arc::clone(&self.world);
            let handle = self
                .pools
                .spawn_io(move || world.count_objects_in(partition).map_err(|e| e.to_string()));
            async move { (partition, handle.await) }
        });

        let mut loads = Vec::new();
        for (partition, counted) in futures::future::join_all(counts).await {
            let object_count = match counted {
                Ok(Ok(count)) => count,
                Ok(Err(e)) => {
                    tracing::warn!("Could not count objects in {}: {}", partition, e);
                    0
                }
                Err(e @ SweepError::Shutdown(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!("Counting objects in {} failed: {}", partition, e);
                    0
                }
            };
            loads.push(PartitionLoad {
                partition,
                object_count,
                priority_score: object_count.min(self.priority_cap),
            });
        }
        // Stable, so equal scores keep enumeration order
        loads.sort_by(|a, b| b.priority_score.cmp(&a.priority_score));
        Ok(loads)
    }

    /// Batches currently running
    pub fn active_operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Progress of a running batch
    pub fn progress(&self, operation_id: u64) -> Option<Arc<ProcessingProgress>> {
        self.operations
            .get(&operation_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// One line per running batch
    pub fn processing_summary(&self) -> String {
        if self.operations.is_empty() {
            return "No active batch operations".to_string();
        }
        let mut lines: Vec<(u64, String)> = self
            .operations
            .iter()
            .map(|entry| (*entry.key(), format!("batch {}: {}", entry.key(), entry.value())))
            .collect();
        lines.sort_by_key(|(id, _)| *id);
        lines
            .into_iter()
            .map(|(_, line)| line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What one partition worker needs, moved onto the compute pool
struct PartitionUnit<W: WorldAdapter, V: PartitionVisitor> {
    world: Arc<W>,
    pools: Arc<WorkerPoolManager>,
    metrics: Arc<MetricCounters>,
    visitor: Arc<V>,
    query: ObjectQuery,
    kill_switch: Arc<AtomicBool>,
    progress: Arc<ProcessingProgress>,
}

impl<W: WorldAdapter, V: PartitionVisitor> PartitionUnit<W, V> {
    async fn run(self, partition: PartitionId) -> PartitionResult {
        let started = Instant::now();
        self.progress.unit_started();
        let mut result = self.work(partition).await;
        result.duration_ms = started.elapsed().as_millis() as u64;

        self.metrics.increment(names::PARTITIONS_PROCESSED);
        self.metrics.add(names::OBJECTS_PROCESSED, result.affected);
        self.progress.unit_finished(&result, true);
        tracing::debug!(
            "Partition {} done: {}/{} affected, {} failed",
            partition,
            result.affected,
            result.selected,
            result.failed_objects
        );
        result
    }

    async fn work(&self, partition: PartitionId) -> PartitionResult {
        if self.kill_switch.load(Ordering::Acquire) {
            return PartitionResult::failure(partition, INTERRUPTED);
        }

        let world = Arc::clone(&self.world);
        let query = self.query.clone();
        let listed = match self
            .pools
            .spawn_io(move || world.list_objects_in(partition, &query).map_err(|e| e.to_string()))
            .await
        {
            Ok(Ok(objects)) => objects,
            Ok(Err(e)) => {
                tracing::warn!("Listing partition {} failed: {}", partition, e);
                return PartitionResult::failure(partition, e);
            }
            Err(e) => return PartitionResult::failure(partition, e.to_string()),
        };

        let mut result = PartitionResult::empty(partition);
        result.listed = listed.len() as u64;
        let selected = self.visitor.select(partition, listed);
        result.selected = selected.len() as u64;

        for object in selected {
            if self.kill_switch.load(Ordering::Acquire) {
                result.success = false;
                result.error = Some(INTERRUPTED.to_string());
                break;
            }
            let object_id = object.id;
            match self.visitor.visit(object).await {
                Ok(true) => result.affected += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Object {} in {} failed: {}", object_id, partition, e);
                    result.failed_objects += 1;
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::MemoryWorld;
    use parking_lot::Mutex;
    use std::time::Duration;
    use sweeper_domain::ObjectKind;

    fn context(max_parallel: Option<usize>) -> EngineContext {
        let mut config = EngineConfig::default();
        config.pool.compute_threads = 4;
        config.batch.max_parallel_partitions = max_parallel;
        EngineContext::new(config).unwrap()
    }

    /// Visits every object, sleeping a little, failing on chosen type keys
    #[derive(Default)]
    struct SlowVisitor {
        fail_type: Option<String>,
        visited: Mutex<Vec<ObjectRef>>,
    }

    #[async_trait]
    impl PartitionVisitor for SlowVisitor {
        async fn visit(&self, object: ObjectRef) -> Result<bool, SweepError> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            if self.fail_type.as_deref() == Some(object.type_key.as_str()) {
                return Err(SweepError::World("cannot touch".into()));
            }
            self.visited.lock().push(object);
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_density_order_and_bounded_parallelism() {
        let ctx = context(Some(2));
        let world = Arc::new(MemoryWorld::new());
        let counts = [50, 5, 30, 1];
        let partitions: Vec<PartitionId> = (0..4).map(|i| PartitionId::new(i, 0)).collect();
        for (partition, count) in partitions.iter().zip(counts) {
            world.add(*partition, ObjectKind::Item, count, 10);
        }

        let processor = SpatialBatchProcessor::new(Arc::clone(&world), &ctx);
        let outcome = processor
            .process_partitions(
                partitions.clone(),
                ObjectQuery::all(),
                Arc::new(SlowVisitor::default()),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        let order: Vec<i32> = outcome.results.iter().map(|r| r.partition.x).collect();
        assert_eq!(order, vec![0, 2, 1, 3]);
        assert!(outcome.peak_parallelism <= 2);
        assert_eq!(outcome.objects_affected(), 86);
        assert!(!outcome.is_partial_failure());
        assert_eq!(processor.active_operation_count(), 0);
        assert_eq!(ctx.metrics.get(names::PARTITIONS_PROCESSED), 4);
        ctx.pools.shutdown_now();
    }

    #[tokio::test]
    async fn test_failing_partition_is_isolated() {
        let ctx = context(None);
        let world = Arc::new(MemoryWorld::new());
        let partitions: Vec<PartitionId> = (0..5).map(|i| PartitionId::new(0, i)).collect();
        for partition in &partitions {
            world.add(*partition, ObjectKind::Item, 3, 10);
        }
        world.fail_listing(partitions[2]);

        let processor = SpatialBatchProcessor::new(Arc::clone(&world), &ctx);
        let outcome = processor
            .process_partitions(
                partitions,
                ObjectQuery::all(),
                Arc::new(SlowVisitor::default()),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 5);
        assert_eq!(outcome.failed_partitions(), vec![PartitionId::new(0, 2)]);
        assert_eq!(outcome.objects_affected(), 12);
        assert!(outcome.is_partial_failure());
        ctx.pools.shutdown_now();
    }

    #[tokio::test]
    async fn test_failing_object_does_not_abort_partition() {
        let ctx = context(None);
        let world = Arc::new(MemoryWorld::new());
        let partition = PartitionId::new(3, 3);
        world.add(partition, ObjectKind::Item, 4, 10);
        world.add(partition, ObjectKind::Actor, 2, 10);

        let visitor = Arc::new(SlowVisitor {
            fail_type: Some("cow".to_string()),
            ..Default::default()
        });
        let processor = SpatialBatchProcessor::new(world, &ctx);
        let outcome = processor
            .process_partitions(
                vec![partition],
                ObjectQuery::all(),
                Arc::clone(&visitor),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        let result = &outcome.results[0];
        assert!(result.success);
        assert_eq!(result.affected, 4);
        assert_eq!(result.failed_objects, 2);
        assert_eq!(visitor.visited.lock().len(), 4);
        ctx.pools.shutdown_now();
    }

    #[tokio::test]
    async fn test_range_enumerates_loaded_partitions() {
        let ctx = context(None);
        let world = Arc::new(MemoryWorld::new());
        world.add(PartitionId::new(0, 0), ObjectKind::Item, 2, 10);
        world.add(PartitionId::new(-1, 0), ObjectKind::Item, 2, 10);
        world.add(PartitionId::new(40, 40), ObjectKind::Item, 2, 10);

        let processor = SpatialBatchProcessor::new(world, &ctx);
        let outcome = processor
            .process_in_range(
                Position::new(0.0, 64.0, 0.0),
                20.0,
                ObjectQuery::only(ObjectKind::Item),
                Arc::new(SlowVisitor::default()),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.objects_affected(), 4);
        ctx.pools.shutdown_now();
    }

    #[tokio::test]
    async fn test_kill_switch_interrupts_unstarted_partitions() {
        let ctx = context(Some(1));
        let world = Arc::new(MemoryWorld::new());
        let partitions: Vec<PartitionId> = (0..3).map(|i| PartitionId::new(i, i)).collect();
        for partition in &partitions {
            world.add(*partition, ObjectKind::Item, 2, 10);
        }

        let processor = SpatialBatchProcessor::new(world, &ctx);
        let outcome = processor
            .process_partitions(
                partitions,
                ObjectQuery::all(),
                Arc::new(SlowVisitor::default()),
                Arc::new(AtomicBool::new(true)),
            )
            .await
            .unwrap();
        assert!(outcome.interrupted);
        assert!(outcome.results.iter().all(PartitionResult::was_interrupted));
        assert_eq!(outcome.objects_affected(), 0);
        ctx.pools.shutdown_now();
    }

    #[test]
    fn test_progress_accounting() {
        let progress = ProcessingProgress::new(2, chrono::Utc::now());
        assert_eq!(progress.progress_percent(), 0.0);
        progress.unit_started();
        let mut ok = PartitionResult::empty(PartitionId::new(0, 0));
        ok.duration_ms = 10;
        progress.unit_finished(&ok, true);
        progress.unit_finished(&PartitionResult::failure(PartitionId::new(1, 0), "x"), false);

        assert!(progress.is_complete());
        assert_eq!(progress.successful_units(), 1);
        assert_eq!(progress.failed_units(), 1);
        assert_eq!(progress.average_unit_ms(), 5.0);
        assert_eq!(progress.running_units(), 0);
        assert!(progress.to_string().starts_with("2/2 partitions"));
    }
}
