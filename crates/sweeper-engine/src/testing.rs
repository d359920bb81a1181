//! In-memory world used by unit tests

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use sweeper_domain::{
    ObjectId, ObjectKind, ObjectQuery, ObjectRef, ObjectSnapshot, PartitionId, Position,
    WorldAdapter,
};

#[derive(Default)]
pub(crate) struct MemoryWorld {
    pub(crate) partitions: Mutex<BTreeMap<PartitionId, Vec<ObjectRef>>>,
    pub(crate) failing_lists: Mutex<HashSet<PartitionId>>,
    pub(crate) fail_restores: AtomicBool,
}

impl MemoryWorld {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, partition: PartitionId, kind: ObjectKind, count: usize, age_ticks: u64) {
        let mut partitions = self.partitions.lock();
        let objects = partitions.entry(partition).or_default();
        for i in 0..count {
            let position = Position::new(
                f64::from(partition.x) * 16.0 + (i % 16) as f64,
                64.0,
                f64::from(partition.z) * 16.0 + (i / 16 % 16) as f64,
            );
            objects.push(ObjectRef {
                id: ObjectId::new(),
                kind,
                type_key: match kind {
                    ObjectKind::Item => "stone".to_string(),
                    ObjectKind::Actor => "cow".to_string(),
                },
                position,
                partition,
                age_ticks,
                protected: false,
            });
        }
    }

    pub(crate) fn count(&self, partition: PartitionId) -> usize {
        self.partitions
            .lock()
            .get(&partition)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub(crate) fn total(&self) -> usize {
        self.partitions.lock().values().map(Vec::len).sum()
    }

    pub(crate) fn fail_listing(&self, partition: PartitionId) {
        self.failing_lists.lock().insert(partition);
    }
}

impl WorldAdapter for MemoryWorld {
    type Error = String;

    fn enumerate_partitions(&self, center: Position, radius: f64) -> Result<Vec<PartitionId>, String> {
        let loaded = self.partitions.lock();
        Ok(PartitionId::covering(&center, radius, 16)
            .into_iter()
            .filter(|p| loaded.contains_key(p))
            .collect())
    }

    fn count_objects_in(&self, partition: PartitionId) -> Result<usize, String> {
        Ok(self.count(partition))
    }

    fn list_objects_in(&self, partition: PartitionId, query: &ObjectQuery) -> Result<Vec<ObjectRef>, String> {
        if self.failing_lists.lock().contains(&partition) {
            return Err(format!("partition {} is corrupted", partition));
        }
        Ok(self
            .partitions
            .lock()
            .get(&partition)
            .map(|objects| objects.iter().filter(|o| query.matches(o)).cloned().collect())
            .unwrap_or_default())
    }

    fn remove_object(&self, object: &ObjectRef) -> Result<bool, String> {
        let mut partitions = self.partitions.lock();
        let Some(objects) = partitions.get_mut(&object.partition) else {
            return Ok(false);
        };
        let before = objects.len();
        objects.retain(|o| o.id != object.id);
        Ok(objects.len() < before)
    }

    fn serialize(&self, object: &ObjectRef) -> Result<ObjectSnapshot, String> {
        Ok(ObjectSnapshot {
            object_kind: object.kind,
            object_id: object.id,
            position: object.position,
            domain_key: "overworld".to_string(),
            serialized_state: serde_json::to_vec(object).map_err(|e| e.to_string())?,
        })
    }

    fn deserialize_and_spawn(&self, snapshot: &ObjectSnapshot) -> Result<ObjectRef, String> {
        if self.fail_restores.load(Ordering::SeqCst) {
            return Err("spawn refused".to_string());
        }
        let object: ObjectRef =
            serde_json::from_slice(&snapshot.serialized_state).map_err(|e| e.to_string())?;
        self.partitions
            .lock()
            .entry(object.partition)
            .or_default()
            .push(object.clone());
        Ok(object)
    }
}
