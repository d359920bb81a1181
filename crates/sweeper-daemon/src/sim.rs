//! In-memory world used by the daemon
//!
//! Objects live in a map keyed by partition. Ages are derived from the tick
//! an object spawned on, so they grow as the tick loop advances.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use sweeper_domain::{
    ObjectId, ObjectKind, ObjectQuery, ObjectRef, ObjectSnapshot, PartitionId, Position,
    WorldAdapter,
};
use sweeper_engine::WorldMailbox;
use thiserror::Error;

const ITEM_TYPES: [&str; 6] = [
    "cobblestone",
    "dirt",
    "rotten_flesh",
    "arrow",
    "bone",
    "diamond",
];
const ACTOR_TYPES: [&str; 3] = ["cow", "sheep", "chicken"];

/// Ticks of history the world starts with
const START_TICK: u64 = 24_000;

/// Errors raised by the simulated world
#[derive(Error, Debug)]
pub enum SimError {
    /// A snapshot could not be encoded or decoded
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// The partition lies outside the generated world
    #[error("Partition {0} is not loaded")]
    NotLoaded(PartitionId),
}

#[derive(Debug, Clone)]
struct Resident {
    object: ObjectRef,
    spawned_at: u64,
}

/// Simulated tick-driven world
pub struct SimWorld {
    partitions: Mutex<BTreeMap<PartitionId, Vec<Resident>>>,
    tick: AtomicU64,
    partition_size: u32,
    domain_key: String,
}

impl SimWorld {
    /// Empty world with every partition within `extent` of the origin loaded
    pub fn empty(extent: i32, partition_size: u32, domain_key: impl Into<String>) -> Self {
        let mut partitions = BTreeMap::new();
        for x in -extent..=extent {
            for z in -extent..=extent {
                partitions.insert(PartitionId::new(x, z), Vec::new());
            }
        }
        Self {
            partitions: Mutex::new(partitions),
            tick: AtomicU64::new(START_TICK),
            partition_size,
            domain_key: domain_key.into(),
        }
    }

    /// World populated with a deterministic mix of litter and herds
    ///
    /// Item counts vary per partition so densest-first ordering has something
    /// to do; every fourth diagonal holds a crowded herd of actors, one in
    /// five of them name-tagged.
    pub fn generate(extent: i32, partition_size: u32, domain_key: impl Into<String>) -> Self {
        let world = Self::empty(extent, partition_size, domain_key);
        let loaded: Vec<PartitionId> = world.partitions.lock().keys().copied().collect();
        for partition in loaded {
            let items = (partition.x * 7 + partition.z * 13).rem_euclid(23) as usize;
            for i in 0..items {
                let type_key = ITEM_TYPES[(i + partition.x.unsigned_abs() as usize) % ITEM_TYPES.len()];
                let age = (i as u64 * 997) % START_TICK;
                world.spawn_aged(partition, ObjectKind::Item, type_key, i, age, false);
            }
            if (partition.x + partition.z).rem_euclid(4) == 0 {
                for i in 0..14 {
                    let type_key = ACTOR_TYPES[i % ACTOR_TYPES.len()];
                    let age = (i as u64 * 1_511) % START_TICK;
                    world.spawn_aged(partition, ObjectKind::Actor, type_key, i, age, i % 5 == 0);
                }
            }
        }
        world
    }

    fn spawn_aged(
        &self,
        partition: PartitionId,
        kind: ObjectKind,
        type_key: &str,
        slot: usize,
        age: u64,
        protected: bool,
    ) -> ObjectId {
        let size = f64::from(self.partition_size);
        let cells = self.partition_size.max(1) as usize;
        let position = Position::new(
            f64::from(partition.x) * size + (slot % cells) as f64 + 0.5,
            64.0,
            f64::from(partition.z) * size + ((slot / cells) % cells) as f64 + 0.5,
        );
        let object = ObjectRef {
            id: ObjectId::new(),
            kind,
            type_key: type_key.to_string(),
            position,
            partition,
            age_ticks: 0,
            protected,
        };
        let id = object.id;
        let now = self.current_tick();
        self.partitions
            .lock()
            .entry(partition)
            .or_default()
            .push(Resident {
                object,
                spawned_at: now.saturating_sub(age),
            });
        id
    }

    /// Drop a fresh item into the world at `position`
    pub fn drop_item(&self, position: Position, type_key: &str) -> ObjectId {
        let partition = PartitionId::containing(&position, self.partition_size);
        let slot = self.count_in(partition);
        self.spawn_aged(partition, ObjectKind::Item, type_key, slot, 0, false)
    }

    /// Current world tick
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Advance the world clock by `ticks`
    pub fn advance(&self, ticks: u64) {
        self.tick.fetch_add(ticks, Ordering::AcqRel);
    }

    /// Objects currently alive, per kind
    pub fn population(&self) -> (usize, usize) {
        let partitions = self.partitions.lock();
        let mut items = 0;
        let mut actors = 0;
        for resident in partitions.values().flatten() {
            match resident.object.kind {
                ObjectKind::Item => items += 1,
                ObjectKind::Actor => actors += 1,
            }
        }
        (items, actors)
    }

    fn count_in(&self, partition: PartitionId) -> usize {
        self.partitions
            .lock()
            .get(&partition)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn aged(&self, resident: &Resident, now: u64) -> ObjectRef {
        let mut object = resident.object.clone();
        object.age_ticks = now.saturating_sub(resident.spawned_at);
        object
    }
}

impl WorldAdapter for SimWorld {
    type Error = SimError;

    fn enumerate_partitions(&self, center: Position, radius: f64) -> Result<Vec<PartitionId>, SimError> {
        let partitions = self.partitions.lock();
        Ok(PartitionId::covering(&center, radius, self.partition_size)
            .into_iter()
            .filter(|p| partitions.contains_key(p))
            .collect())
    }

    fn count_objects_in(&self, partition: PartitionId) -> Result<usize, SimError> {
        self.partitions
            .lock()
            .get(&partition)
            .map(Vec::len)
            .ok_or(SimError::NotLoaded(partition))
    }

    fn list_objects_in(&self, partition: PartitionId, query: &ObjectQuery) -> Result<Vec<ObjectRef>, SimError> {
        let now = self.current_tick();
        let partitions = self.partitions.lock();
        let residents = partitions
            .get(&partition)
            .ok_or(SimError::NotLoaded(partition))?;
        Ok(residents
            .iter()
            .filter(|r| query.matches(&r.object))
            .map(|r| self.aged(r, now))
            .collect())
    }

    fn remove_object(&self, object: &ObjectRef) -> Result<bool, SimError> {
        let mut partitions = self.partitions.lock();
        let Some(residents) = partitions.get_mut(&object.partition) else {
            return Ok(false);
        };
        let before = residents.len();
        residents.retain(|r| r.object.id != object.id);
        Ok(residents.len() < before)
    }

    fn serialize(&self, object: &ObjectRef) -> Result<ObjectSnapshot, SimError> {
        let serialized_state =
            serde_json::to_vec(object).map_err(|e| SimError::Snapshot(e.to_string()))?;
        Ok(ObjectSnapshot {
            object_kind: object.kind,
            object_id: object.id,
            position: object.position,
            domain_key: self.domain_key.clone(),
            serialized_state,
        })
    }

    fn deserialize_and_spawn(&self, snapshot: &ObjectSnapshot) -> Result<ObjectRef, SimError> {
        if snapshot.domain_key != self.domain_key {
            return Err(SimError::Snapshot(format!(
                "snapshot belongs to '{}', not '{}'",
                snapshot.domain_key, self.domain_key
            )));
        }
        let object: ObjectRef = serde_json::from_slice(&snapshot.serialized_state)
            .map_err(|e| SimError::Snapshot(e.to_string()))?;
        let now = self.current_tick();
        let mut partitions = self.partitions.lock();
        let residents = partitions
            .get_mut(&object.partition)
            .ok_or(SimError::NotLoaded(object.partition))?;
        residents.push(Resident {
            object: object.clone(),
            spawned_at: now.saturating_sub(object.age_ticks),
        });
        Ok(object)
    }
}

/// The world's update loop: advances the clock and drains engine mutations
pub struct TickLoop {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TickLoop {
    /// Start ticking `world` every `tick` on a dedicated thread
    ///
    /// `litter_every` drops a fresh item near the origin every that many
    /// ticks; zero disables it.
    pub fn spawn(
        world: Arc<SimWorld>,
        mut mailbox: WorldMailbox<SimWorld>,
        tick: Duration,
        litter_every: u64,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name("world-tick".into())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    world.advance(1);
                    let tick_number = world.current_tick();
                    if litter_every > 0 && tick_number % litter_every == 0 {
                        let offset = (tick_number % 32) as f64 - 16.0;
                        world.drop_item(Position::new(offset, 64.0, -offset), "rotten_flesh");
                    }
                    let applied = mailbox.drain_pending();
                    if applied > 0 {
                        tracing::trace!("Tick {}: applied {} world mutations", tick_number, applied);
                    }
                    std::thread::sleep(tick);
                }
                // Flush whatever arrived during the final sleep
                mailbox.drain_pending();
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Stop the loop and wait for the thread to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("World tick thread panicked");
            }
        }
    }
}

impl Drop for TickLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
