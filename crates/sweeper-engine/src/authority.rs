//! Single-writer access to the world
//!
//! Workers never mutate the world themselves. They send a job through a
//! [`WorldGateway`] and await its reply; the host drains the matching
//! [`WorldMailbox`] on the world's authoritative context, either once per
//! tick or from a dedicated thread.

use crate::error::SweepError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use sweeper_domain::{ObjectRef, ObjectSnapshot, WorldAdapter};
use tokio::sync::{mpsc, oneshot};

type WorldJob<W> = Box<dyn FnOnce(&W) + Send>;

/// Sending half; cheap to clone and share across workers
pub struct WorldGateway<W: WorldAdapter> {
    jobs: mpsc::UnboundedSender<WorldJob<W>>,
}

impl<W: WorldAdapter> Clone for WorldGateway<W> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

/// Receiving half, owned by the authoritative context
pub struct WorldMailbox<W: WorldAdapter> {
    world: Arc<W>,
    jobs: mpsc::UnboundedReceiver<WorldJob<W>>,
}

fn authority_gone() -> SweepError {
    SweepError::Shutdown("world authority is no longer accepting work".to_string())
}

impl<W: WorldAdapter> WorldGateway<W> {
    /// Create a connected gateway and mailbox for `world`
    pub fn channel(world: Arc<W>) -> (Self, WorldMailbox<W>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { jobs: tx }, WorldMailbox { world, jobs: rx })
    }

    /// Run `job` on the authoritative context and return its output
    pub async fn call<R, F>(&self, job: F) -> Result<R, SweepError>
    where
        F: FnOnce(&W) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.jobs
            .send(Box::new(move |world: &W| {
                let _ = reply_tx.send(job(world));
            }))
            .map_err(|_| authority_gone())?;

        reply_rx
            .await
            .map_err(|_| SweepError::World("world job panicked or was dropped".to_string()))
    }

    /// Capture a snapshot of `object` and remove it, in one authoritative step
    ///
    /// `Ok(None)` means the object was already gone.
    pub async fn remove_with_snapshot(
        &self,
        object: ObjectRef,
    ) -> Result<Option<ObjectSnapshot>, SweepError> {
        self.call(move |world| {
            let snapshot = world
                .serialize(&object)
                .map_err(|e| SweepError::Serialization(e.to_string()))?;
            let removed = world
                .remove_object(&object)
                .map_err(|e| SweepError::World(e.to_string()))?;
            Ok(removed.then_some(snapshot))
        })
        .await?
    }

    /// Respawn an object from a snapshot
    pub async fn restore(&self, snapshot: ObjectSnapshot) -> Result<ObjectRef, SweepError> {
        self.call(move |world| {
            world
                .deserialize_and_spawn(&snapshot)
                .map_err(|e| SweepError::Serialization(e.to_string()))
        })
        .await?
    }

    /// Whether the mailbox has been dropped
    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

impl<W: WorldAdapter> WorldMailbox<W> {
    /// The world jobs run against
    pub fn world(&self) -> &Arc<W> {
        &self.world
    }

    fn run_job(&self, job: WorldJob<W>) {
        let world = &*self.world;
        if std::panic::catch_unwind(AssertUnwindSafe(|| job(world))).is_err() {
            tracing::error!("World job panicked; the authority keeps running");
        }
    }

    /// Run every job queued so far without waiting; returns jobs run
    ///
    /// Intended to be called once per world tick.
    pub fn drain_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.jobs.try_recv() {
            self.run_job(job);
            ran += 1;
        }
        ran
    }

    /// Block the current thread running jobs until every gateway is dropped
    ///
    /// Must not be called from inside an async context.
    pub fn run(mut self) {
        while let Some(job) = self.jobs.blocking_recv() {
            self.run_job(job);
        }
        tracing::debug!("World authority stopped, all gateways dropped");
    }

    /// Run the mailbox on a dedicated named thread
    pub fn spawn_dedicated(self, name: &str) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use sweeper_domain::{ObjectId, ObjectKind, ObjectQuery, PartitionId, Position};

    #[derive(Default)]
    struct ThreadCheckedWorld {
        objects: Mutex<HashMap<ObjectId, ObjectRef>>,
        mutating_threads: Mutex<Vec<String>>,
    }

    impl ThreadCheckedWorld {
        fn note_thread(&self) {
            let name = std::thread::current().name().unwrap_or("unnamed").to_string();
            self.mutating_threads.lock().push(name);
        }
    }

    impl WorldAdapter for ThreadCheckedWorld {
        type Error = String;

        fn enumerate_partitions(&self, _: Position, _: f64) -> Result<Vec<PartitionId>, String> {
            Ok(vec![PartitionId::new(0, 0)])
        }

        fn count_objects_in(&self, _: PartitionId) -> Result<usize, String> {
            Ok(self.objects.lock().len())
        }

        fn list_objects_in(&self, _: PartitionId, _: &ObjectQuery) -> Result<Vec<ObjectRef>, String> {
            Ok(self.objects.lock().values().cloned().collect())
        }

        fn remove_object(&self, object: &ObjectRef) -> Result<bool, String> {
            self.note_thread();
            Ok(self.objects.lock().remove(&object.id).is_some())
        }

        fn serialize(&self, object: &ObjectRef) -> Result<ObjectSnapshot, String> {
            Ok(ObjectSnapshot {
                object_kind: object.kind,
                object_id: object.id,
                position: object.position,
                domain_key: "test".to_string(),
                serialized_state: serde_json::to_vec(object).map_err(|e| e.to_string())?,
            })
        }

        fn deserialize_and_spawn(&self, snapshot: &ObjectSnapshot) -> Result<ObjectRef, String> {
            self.note_thread();
            let object: ObjectRef =
                serde_json::from_slice(&snapshot.serialized_state).map_err(|e| e.to_string())?;
            self.objects.lock().insert(object.id, object.clone());
            Ok(object)
        }
    }

    fn sample_object() -> ObjectRef {
        ObjectRef {
            id: ObjectId::new(),
            kind: ObjectKind::Item,
            type_key: "stone".to_string(),
            position: Position::new(1.0, 2.0, 3.0),
            partition: PartitionId::new(0, 0),
            age_ticks: 10,
            protected: false,
        }
    }

    #[tokio::test]
    async fn test_mutations_run_on_authority_thread() {
        let world = Arc::new(ThreadCheckedWorld::default());
        let object = sample_object();
        world.objects.lock().insert(object.id, object.clone());

        let (gateway, mailbox) = WorldGateway::channel(Arc::clone(&world));
        let authority = mailbox.spawn_dedicated("world-authority").unwrap();

        let snapshot = gateway
            .remove_with_snapshot(object.clone())
            .await
            .unwrap()
            .expect("object existed");
        assert!(world.objects.lock().is_empty());

        let missing = gateway.remove_with_snapshot(object.clone()).await.unwrap();
        assert!(missing.is_none());

        let restored = gateway.restore(snapshot).await.unwrap();
        assert_eq!(restored, object);

        drop(gateway);
        authority.join().unwrap();
        let threads = world.mutating_threads.lock().clone();
        assert!(threads.iter().all(|t| t == "world-authority"), "{:?}", threads);
    }

    #[tokio::test]
    async fn test_drain_pending_per_tick() {
        let world = Arc::new(ThreadCheckedWorld::default());
        let (gateway, mut mailbox) = WorldGateway::channel(Arc::clone(&world));
        assert_eq!(mailbox.drain_pending(), 0);

        let pending = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.call(|w| w.objects.lock().len()).await }
        });
        // Let the job reach the mailbox, then "tick"
        while mailbox.drain_pending() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pending.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_is_contained() {
        let world = Arc::new(ThreadCheckedWorld::default());
        let (gateway, mailbox) = WorldGateway::channel(world);
        let authority = mailbox.spawn_dedicated("world-authority").unwrap();

        let err = gateway
            .call(|_| -> usize { panic!("bad job") })
            .await
            .unwrap_err();
        assert!(matches!(err, SweepError::World(_)));
        assert_eq!(gateway.call(|w| w.objects.lock().len()).await.unwrap(), 0);

        drop(gateway);
        authority.join().unwrap();
    }

    #[tokio::test]
    async fn test_closed_mailbox_rejects() {
        let world = Arc::new(ThreadCheckedWorld::default());
        let (gateway, mailbox) = WorldGateway::channel(world);
        drop(mailbox);
        assert!(gateway.is_closed());
        let err = gateway.call(|_| ()).await.unwrap_err();
        assert!(matches!(err, SweepError::Shutdown(_)));
    }
}
