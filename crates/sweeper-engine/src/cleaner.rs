//! Cleanup pipeline: filters, strategies, and authoritative removal
//!
//! For each partition the visitor runs the per-kind filters, then the active
//! strategy, and removes what is left through the world gateway, keeping a
//! snapshot of every removed object for undo. In dry-run mode the selection
//! is logged and nothing is removed.

use crate::authority::WorldGateway;
use crate::batch::{BatchOutcome, PartitionVisitor, SpatialBatchProcessor};
use crate::config::CleaningConfig;
use crate::context::EngineContext;
use crate::error::SweepError;
use crate::execution::TaskResult;
use crate::metrics::{names, MetricCounters};
use crate::request::{CleaningRequest, CleaningScope};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use sweeper_domain::{
    ActorDensityFilter, CleaningStrategy, ItemFilter, ObjectKind, ObjectQuery, ObjectRef,
    ObjectSnapshot, PartitionId, TaskId, WorldAdapter,
};

/// Visitor that selects and removes objects for one cleanup task
pub struct CleaningVisitor<W: WorldAdapter> {
    gateway: WorldGateway<W>,
    metrics: Arc<MetricCounters>,
    items: Option<(ItemFilter, Option<CleaningStrategy>)>,
    actors: Option<(ActorDensityFilter, Option<CleaningStrategy>)>,
    dry_run: bool,
    matched: AtomicU64,
    items_removed: AtomicU64,
    actors_removed: AtomicU64,
    snapshots: Mutex<Vec<ObjectSnapshot>>,
}

impl<W: WorldAdapter> CleaningVisitor<W> {
    /// Build the visitor for `request` under `config`
    ///
    /// A kind is cleaned only when both the request and the configuration
    /// enable it. A strategy on the request replaces the configured ones.
    pub fn new(
        config: &CleaningConfig,
        request: &CleaningRequest,
        gateway: WorldGateway<W>,
        metrics: Arc<MetricCounters>,
    ) -> Self {
        let items = (request.clean_items && config.items.enabled).then(|| {
            (
                ItemFilter::new(config.items.min_age_ticks, config.items.keep_types.clone()),
                request.strategy.clone().or_else(|| config.items.strategy.clone()),
            )
        });
        let actors = (request.clean_actors && config.actors.enabled).then(|| {
            (
                ActorDensityFilter::new(
                    config.actors.density_threshold,
                    config.actors.protect_flagged,
                ),
                request.strategy.clone().or_else(|| config.actors.strategy.clone()),
            )
        });
        Self {
            gateway,
            metrics,
            items,
            actors,
            dry_run: config.dry_run,
            matched: AtomicU64::new(0),
            items_removed: AtomicU64::new(0),
            actors_removed: AtomicU64::new(0),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    /// Object kinds this visitor needs listed
    pub fn query(&self) -> ObjectQuery {
        let mut kinds = Vec::new();
        if self.items.is_some() {
            kinds.push(ObjectKind::Item);
        }
        if self.actors.is_some() {
            kinds.push(ObjectKind::Actor);
        }
        ObjectQuery { kinds }
    }

    /// Snapshots captured so far, leaving the visitor empty
    pub fn take_snapshots(&self) -> Vec<ObjectSnapshot> {
        std::mem::take(&mut *self.snapshots.lock())
    }
}

#[async_trait]
impl<W: WorldAdapter> PartitionVisitor for CleaningVisitor<W> {
    fn select(&self, partition: PartitionId, objects: Vec<ObjectRef>) -> Vec<ObjectRef> {
        let (items, actors): (Vec<_>, Vec<_>) = objects
            .into_iter()
            .partition(|o| o.kind == ObjectKind::Item);

        let mut selected = Vec::new();
        if let Some((filter, strategy)) = &self.items {
            let candidates = filter.select(items);
            selected.extend(match strategy {
                Some(strategy) => strategy.apply(candidates),
                None => candidates,
            });
        }
        if let Some((filter, strategy)) = &self.actors {
            let candidates = filter.select(actors);
            selected.extend(match strategy {
                Some(strategy) => strategy.apply(candidates),
                None => candidates,
            });
        }

        self.matched.fetch_add(selected.len() as u64, Ordering::Relaxed);
        if self.dry_run && !selected.is_empty() {
            tracing::info!(
                "DRY RUN: would remove {} objects in partition {}",
                selected.len(),
                partition
            );
        }
        selected
    }

    async fn visit(&self, object: ObjectRef) -> Result<bool, SweepError> {
        if self.dry_run {
            tracing::debug!(
                "DRY RUN: would remove {} {} at {}",
                object.kind,
                object.type_key,
                object.position
            );
            return Ok(false);
        }

        let kind = object.kind;
        let Some(snapshot) = self.gateway.remove_with_snapshot(object).await? else {
            return Ok(false);
        };
        self.snapshots.lock().push(snapshot);
        match kind {
            ObjectKind::Item => self.items_removed.fetch_add(1, Ordering::Relaxed),
            ObjectKind::Actor => self.actors_removed.fetch_add(1, Ordering::Relaxed),
        };
        self.metrics.increment(names::OBJECTS_REMOVED);
        Ok(true)
    }
}

/// What a cleanup achieved
#[derive(Debug, Clone)]
pub struct CleaningOutcome {
    /// Items removed
    pub items_removed: u64,
    /// Actors removed
    pub actors_removed: u64,
    /// Objects that passed filters and strategy
    pub objects_matched: u64,
    /// Whether nothing was actually removed on purpose
    pub dry_run: bool,
    /// Snapshots of every removed object
    pub snapshots: Vec<ObjectSnapshot>,
    /// Per-partition detail
    pub batch: BatchOutcome,
}

impl CleaningOutcome {
    /// Objects removed across kinds
    pub fn removed(&self) -> u64 {
        self.items_removed + self.actors_removed
    }

    /// Summarize as a successful task result
    ///
    /// Partition and object failures are reported in the statistics; the
    /// result itself is still a success because the batch completed.
    pub fn to_result(&self, task_id: TaskId) -> TaskResult {
        let failed_partitions = self.batch.failed_partitions();
        let message = if self.dry_run {
            format!(
                "DRY RUN: would remove {} objects across {} partitions",
                self.objects_matched,
                self.batch.results.len()
            )
        } else {
            format!(
                "Removed {} items and {} actors across {} partitions",
                self.items_removed,
                self.actors_removed,
                self.batch.results.len()
            )
        };
        let processed = if self.dry_run {
            self.objects_matched
        } else {
            self.removed()
        };

        TaskResult::success(task_id, message)
            .with_counts(processed, self.batch.objects_failed())
            .with_duration(self.batch.duration_ms)
            .with_statistic("items_removed", self.items_removed)
            .with_statistic("actors_removed", self.actors_removed)
            .with_statistic("objects_matched", self.objects_matched)
            .with_statistic("partitions_processed", self.batch.results.len() as u64)
            .with_statistic("failed_partitions", failed_partitions.len() as u64)
            .with_statistic("peak_parallelism", self.batch.peak_parallelism as u64)
            .with_statistic("interrupted", self.batch.interrupted)
            .with_statistic("dry_run", self.dry_run)
    }
}

/// Runs cleanup requests through the batch processor
pub struct Cleaner<W: WorldAdapter> {
    processor: Arc<SpatialBatchProcessor<W>>,
    gateway: WorldGateway<W>,
    context: EngineContext,
}

impl<W: WorldAdapter> Cleaner<W> {
    /// Create a cleaner
    pub fn new(
        processor: Arc<SpatialBatchProcessor<W>>,
        gateway: WorldGateway<W>,
        context: EngineContext,
    ) -> Self {
        Self {
            processor,
            gateway,
            context,
        }
    }

    /// The batch processor used for every request
    pub fn processor(&self) -> &Arc<SpatialBatchProcessor<W>> {
        &self.processor
    }

    /// Execute `request`, stopping early when `kill_switch` is set
    ///
    /// Snapshots of objects removed before an interruption are still
    /// returned so they can be undone.
    pub async fn clean(
        &self,
        request: &CleaningRequest,
        kill_switch: Arc<AtomicBool>,
    ) -> Result<CleaningOutcome, SweepError> {
        let config = &self.context.config.cleaning;
        let visitor = Arc::new(CleaningVisitor::new(
            config,
            request,
            self.gateway.clone(),
            Arc::clone(&self.context.metrics),
        ));
        let query = visitor.query();

        let batch = if query.is_empty() {
            tracing::debug!("Cleaning request selects no object kinds, nothing to do");
            BatchOutcome {
                operation_id: 0,
                results: Vec::new(),
                interrupted: false,
                peak_parallelism: 0,
                duration_ms: 0,
            }
        } else {
            match &request.scope {
                CleaningScope::Radius { center, radius } => {
                    let radius = if radius.is_finite() && *radius > 0.0 {
                        *radius
                    } else {
                        config.default_radius
                    };
                    let radius = if radius > config.max_radius {
                        tracing::warn!(
                            "Cleaning radius {} exceeds the limit, clamped to {}",
                            radius,
                            config.max_radius
                        );
                        config.max_radius
                    } else {
                        radius
                    };
                    self.processor
                        .process_in_range(*center, radius, query, Arc::clone(&visitor), kill_switch)
                        .await?
                }
                CleaningScope::Partitions { partitions } => {
                    self.processor
                        .process_partitions(
                            partitions.clone(),
                            query,
                            Arc::clone(&visitor),
                            kill_switch,
                        )
                        .await?
                }
            }
        };

        Ok(CleaningOutcome {
            items_removed: visitor.items_removed.load(Ordering::Relaxed),
            actors_removed: visitor.actors_removed.load(Ordering::Relaxed),
            objects_matched: visitor.matched.load(Ordering::Relaxed),
            dry_run: config.dry_run,
            snapshots: visitor.take_snapshots(),
            batch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::MemoryWorld;
    use sweeper_domain::Position;

    struct Fixture {
        world: Arc<MemoryWorld>,
        context: EngineContext,
        cleaner: Cleaner<MemoryWorld>,
        _authority: std::thread::JoinHandle<()>,
    }

    fn setup(config: EngineConfig) -> Fixture {
        let world = Arc::new(MemoryWorld::new());
        let context = EngineContext::new(config).unwrap();
        let (gateway, mailbox) = WorldGateway::channel(Arc::clone(&world));
        let authority = mailbox.spawn_dedicated("test-authority").unwrap();
        let processor = Arc::new(SpatialBatchProcessor::new(Arc::clone(&world), &context));
        let cleaner = Cleaner::new(processor, gateway, context.clone());
        Fixture {
            world,
            context,
            cleaner,
            _authority: authority,
        }
    }

    #[tokio::test]
    async fn test_items_respect_age_and_keep_list() {
        let mut config = EngineConfig::default();
        config.cleaning.items.keep_types = vec!["diamond".to_string()];
        let f = setup(config);
        let partition = PartitionId::new(0, 0);
        f.world.add(partition, ObjectKind::Item, 5, 7000);
        f.world.add(partition, ObjectKind::Item, 3, 100);
        f.world.partitions.lock().get_mut(&partition).unwrap()[0].type_key = "diamond".into();

        let request = CleaningRequest::in_partitions(vec![partition]);
        let outcome = f
            .cleaner
            .clean(&request, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        assert_eq!(outcome.items_removed, 4);
        assert_eq!(outcome.snapshots.len(), 4);
        assert_eq!(f.world.count(partition), 4);
        assert_eq!(f.context.metrics.get(names::OBJECTS_REMOVED), 4);

        let result = outcome.to_result(TaskId::new());
        assert!(result.success);
        assert_eq!(result.processed_items, 4);
        assert_eq!(result.statistics["items_removed"], 4);
        f.context.pools.shutdown_now();
    }

    #[tokio::test]
    async fn test_actor_density_needs_request_and_config() {
        let mut config = EngineConfig::default();
        config.cleaning.actors.density_threshold = 3;
        let f = setup(config);
        let partition = PartitionId::new(1, 0);
        f.world.add(partition, ObjectKind::Actor, 8, 50);

        let request = CleaningRequest::in_partitions(vec![partition])
            .with_items(false)
            .with_actors(true);
        let outcome = f
            .cleaner
            .clean(&request, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        // Actors are disabled in the default configuration
        assert_eq!(outcome.removed(), 0);
        assert!(outcome.batch.results.is_empty());
        f.context.pools.shutdown_now();

        let mut config = EngineConfig::aggressive();
        config.cleaning.actors.density_threshold = 3;
        let f = setup(config);
        f.world.add(partition, ObjectKind::Actor, 8, 50);
        let outcome = f
            .cleaner
            .clean(&request, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(outcome.actors_removed, 5);
        assert_eq!(f.world.count(partition), 3);
        f.context.pools.shutdown_now();
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let mut config = EngineConfig::default();
        config.cleaning.dry_run = true;
        let f = setup(config);
        let partition = PartitionId::new(0, 0);
        f.world.add(partition, ObjectKind::Item, 6, 9000);

        let request = CleaningRequest::around(Position::new(1.0, 64.0, 1.0), 8.0);
        let outcome = f
            .cleaner
            .clean(&request, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(outcome.objects_matched, 6);
        assert_eq!(outcome.removed(), 0);
        assert!(outcome.snapshots.is_empty());
        assert_eq!(f.world.count(partition), 6);
        assert!(outcome.to_result(TaskId::new()).message.starts_with("DRY RUN"));
        f.context.pools.shutdown_now();
    }

    #[tokio::test]
    async fn test_request_strategy_overrides_config() {
        let f = setup(EngineConfig::default());
        let partition = PartitionId::new(0, 0);
        f.world.add(partition, ObjectKind::Item, 10, 7000);

        let request = CleaningRequest::in_partitions(vec![partition]).with_strategy(
            CleaningStrategy::DistanceBased {
                origin: Position::new(0.0, 64.0, 0.0),
                max_distance: 4.5,
            },
        );
        let outcome = f
            .cleaner
            .clean(&request, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        // Items sit at x = 0..9 on the same row; those past 4.5 go
        assert_eq!(outcome.items_removed, 5);
        f.context.pools.shutdown_now();
    }

    #[tokio::test]
    async fn test_oversized_radius_is_clamped() {
        let mut config = EngineConfig::default();
        config.cleaning.default_radius = 16.0;
        config.cleaning.max_radius = 20.0;
        let f = setup(config);
        let near = PartitionId::new(0, 0);
        let far = PartitionId::new(5, 0);
        f.world.add(near, ObjectKind::Item, 3, 9000);
        f.world.add(far, ObjectKind::Item, 3, 9000);

        let request = CleaningRequest::around(Position::new(0.0, 64.0, 0.0), 10_000.0);
        let outcome = f
            .cleaner
            .clean(&request, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(outcome.items_removed, 3);
        assert_eq!(f.world.count(near), 0);
        assert_eq!(f.world.count(far), 3);
        f.context.pools.shutdown_now();
    }
}
