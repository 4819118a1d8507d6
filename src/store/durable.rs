use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::model::*;
use crate::wal::{self, Wal, WalCommand};

use super::{BookingStore, InsertError, StoreError};

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// In-memory booking state, optionally backed by a group-commit WAL.
///
/// Each resource sits behind its own `RwLock`. A confirmed insert re-checks
/// overlap, appends to the WAL and applies to memory while holding that
/// resource's write lock, so the exclusion invariant holds across any number
/// of concurrent engines sharing one store.
///
/// Log append and memory apply run together on a spawned task that owns the
/// write guard. A caller that gives up waiting (a timeout, a dropped future)
/// cannot leave an event on disk that memory never saw.
pub struct DurableStore {
    resources: Arc<DashMap<Ulid, SharedResourceState>>,
    /// Reverse lookup: booking id → resource id
    booking_index: Arc<DashMap<Ulid, Ulid>>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Held by registrations and compaction so a snapshot never misses a new resource.
    registry: Arc<Mutex<()>>,
    clock: Arc<dyn Clock>,
    lock_wait: Duration,
}

/// Apply a booking event to a ResourceState (no locking — caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event) {
    match event {
        Event::BookingRecorded { booking } => rs.insert_booking(booking.clone()),
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = rs.booking_mut(id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        // Registration is handled at the DashMap level, not here
        Event::ResourceRegistered { .. } => {}
    }
}

/// Send one event to the group-commit writer and wait until it is fsynced.
async fn wal_append(wal_tx: Option<&mpsc::Sender<WalCommand>>, event: Event) -> Result<(), StoreError> {
    let Some(wal_tx) = wal_tx else {
        return Ok(());
    };
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { event, response: tx })
        .await
        .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
        .map_err(|e| StoreError::Io(e.to_string()))
}

fn commit_task_failed(e: tokio::task::JoinError) -> StoreError {
    StoreError::Unavailable(format!("commit task failed: {e}"))
}

impl DurableStore {
    /// Store with no persistence. State is lost on drop.
    pub fn in_memory(clock: Arc<dyn Clock>, lock_wait: Duration) -> Self {
        Self {
            resources: Arc::new(DashMap::new()),
            booking_index: Arc::new(DashMap::new()),
            wal_tx: None,
            registry: Arc::new(Mutex::new(())),
            clock,
            lock_wait,
        }
    }

    /// Replay `<data_dir>/bookings.wal` and start the background WAL writer.
    /// Must be called from inside a tokio runtime.
    pub fn open(config: &StoreConfig, clock: Arc<dyn Clock>) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let wal_path = config.wal_path();
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        // Replay into plain maps first; nothing else can see this state yet.
        let mut states: HashMap<Ulid, ResourceState> = HashMap::new();
        let booking_index = DashMap::new();
        for event in &events {
            match event {
                Event::ResourceRegistered { resource } => {
                    states.insert(resource.id, ResourceState::new(resource.clone()));
                }
                Event::BookingRecorded { booking } => {
                    let Some(rs) = states.get_mut(&booking.resource_id) else {
                        continue;
                    };
                    let clash = rs
                        .confirmed_overlapping(&booking.span)
                        .next()
                        .map(|b| b.id)
                        .filter(|_| booking.is_confirmed());
                    if let Some(existing) = clash {
                        warn!(
                            "skipping replayed booking {}: overlaps confirmed booking {existing}",
                            booking.id
                        );
                        continue;
                    }
                    apply_to_resource(rs, event);
                    booking_index.insert(booking.id, booking.resource_id);
                }
                Event::BookingCancelled { resource_id, .. } => {
                    if let Some(rs) = states.get_mut(resource_id) {
                        apply_to_resource(rs, event);
                    }
                }
            }
        }

        info!(
            "replayed {} WAL events: {} resources, {} bookings",
            events.len(),
            states.len(),
            booking_index.len()
        );

        Ok(Self::with_wal(wal, states, booking_index, clock, config.lock_wait))
    }

    /// Start the writer task for `wal` and wrap already-replayed state.
    fn with_wal(
        wal: Wal,
        states: HashMap<Ulid, ResourceState>,
        booking_index: DashMap<Ulid, Ulid>,
        clock: Arc<dyn Clock>,
        lock_wait: Duration,
    ) -> Self {
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal::writer_loop(wal, wal_rx));

        let resources = DashMap::new();
        for (id, rs) in states {
            resources.insert(id, Arc::new(RwLock::new(rs)));
        }
        Self {
            resources: Arc::new(resources),
            booking_index: Arc::new(booking_index),
            wal_tx: Some(wal_tx),
            registry: Arc::new(Mutex::new(())),
            clock,
            lock_wait,
        }
    }

    /// Entry point for the fleet side. Bookings never create resources.
    pub async fn register_resource(&self, resource: Resource) -> Result<(), StoreError> {
        let registry = self.registry.clone().lock_owned().await;
        if self.resources.contains_key(&resource.id) {
            return Err(StoreError::Duplicate(resource.id));
        }
        let wal_tx = self.wal_tx.clone();
        let resources = self.resources.clone();
        tokio::spawn(async move {
            let _registry = registry;
            let event = Event::ResourceRegistered {
                resource: resource.clone(),
            };
            wal_append(wal_tx.as_ref(), event).await?;
            resources.insert(resource.id, Arc::new(RwLock::new(ResourceState::new(resource))));
            Ok::<_, StoreError>(())
        })
        .await
        .map_err(commit_task_failed)?
    }

    /// All bookings on a resource, cancelled ones included, ordered by start.
    pub async fn bookings_for(&self, resource_id: &Ulid) -> Vec<Booking> {
        match self.resource_state(resource_id) {
            Some(rs) => rs.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }

    fn resource_state(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    async fn lock_write(
        &self,
        rs: &SharedResourceState,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, Duration> {
        tokio::time::timeout(self.lock_wait, rs.clone().write_owned())
            .await
            .map_err(|_| self.lock_wait)
    }

    /// Log `event`, then apply it under `guard`, as one unit that runs to
    /// completion even if the caller stops waiting.
    async fn commit(
        &self,
        mut guard: OwnedRwLockWriteGuard<ResourceState>,
        event: Event,
    ) -> Result<(), StoreError> {
        let wal_tx = self.wal_tx.clone();
        let booking_index = self.booking_index.clone();
        tokio::spawn(async move {
            wal_append(wal_tx.as_ref(), event.clone()).await?;
            if let Event::BookingRecorded { booking } = &event {
                booking_index.insert(booking.id, booking.resource_id);
            }
            apply_to_resource(&mut guard, &event);
            Ok::<_, StoreError>(())
        })
        .await
        .map_err(commit_task_failed)?
    }

    /// Compact the WAL down to one record per resource and per booking.
    /// No-op for an in-memory store.
    ///
    /// Resource locks are held only while the snapshot is taken and queued.
    /// The writer task handles commands in order, so any append queued after
    /// the snapshot lands in the compacted file.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let registry = self.registry.lock().await;

        let mut states: Vec<(Ulid, SharedResourceState)> = self
            .resources
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_by_key(|(id, _)| *id);

        // Read guards stay held until the snapshot is queued so no append slips in between.
        let mut guards = Vec::with_capacity(states.len());
        for (_, rs) in &states {
            guards.push(rs.clone().read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ResourceRegistered {
                resource: guard.resource.clone(),
            });
            for booking in &guard.bookings {
                events.push(Event::BookingRecorded {
                    booking: booking.clone(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        drop(guards);
        drop(registry);

        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Io(e.to_string()))?;

        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl BookingStore for DurableStore {
    async fn resource_exists(&self, id: &Ulid) -> Result<bool, StoreError> {
        Ok(self.resources.contains_key(id))
    }

    async fn get_resource(&self, id: &Ulid) -> Result<Option<Resource>, StoreError> {
        match self.resource_state(id) {
            Some(rs) => Ok(Some(rs.read().await.resource.clone())),
            None => Ok(None),
        }
    }

    async fn has_overlap(&self, resource_id: &Ulid, span: &Span) -> Result<bool, StoreError> {
        match self.resource_state(resource_id) {
            Some(rs) => Ok(rs.read().await.confirmed_overlapping(span).next().is_some()),
            None => Ok(false),
        }
    }

    async fn insert_confirmed(&self, new: NewBooking) -> Result<Booking, InsertError> {
        let rs = self
            .resource_state(&new.resource_id)
            .ok_or(StoreError::ResourceMissing(new.resource_id))?;
        let guard = self.lock_write(&rs).await.map_err(|waited| {
            InsertError::TransientConflict(format!(
                "lock on resource {} not acquired within {waited:?}",
                new.resource_id
            ))
        })?;

        if let Some(existing) = guard.confirmed_overlapping(&new.span).next() {
            return Err(InsertError::ExclusionViolation {
                conflicting: existing.id,
            });
        }

        let booking = Booking {
            id: Ulid::new(),
            resource_id: new.resource_id,
            owner_id: new.owner_id,
            span: new.span,
            status: BookingStatus::Confirmed,
            created_at: self.clock.now(),
        };
        let event = Event::BookingRecorded {
            booking: booking.clone(),
        };
        self.commit(guard, event).await?;
        Ok(booking)
    }

    async fn find_by_id(&self, id: &Ulid) -> Result<Option<Booking>, StoreError> {
        let Some(resource_id) = self.booking_index.get(id).map(|e| *e.value()) else {
            return Ok(None);
        };
        match self.resource_state(&resource_id) {
            Some(rs) => Ok(rs.read().await.booking(id).cloned()),
            None => Ok(None),
        }
    }

    async fn save(&self, booking: &Booking) -> Result<Booking, StoreError> {
        let rs = self
            .booking_index
            .get(&booking.id)
            .map(|e| *e.value())
            .and_then(|rid| self.resource_state(&rid))
            .ok_or(StoreError::BookingMissing(booking.id))?;
        let guard = self
            .lock_write(&rs)
            .await
            .map_err(|_| StoreError::Timeout(format!("save of booking {}", booking.id)))?;

        let current = guard
            .booking(&booking.id)
            .cloned()
            .ok_or(StoreError::BookingMissing(booking.id))?;

        match (current.status, booking.status) {
            (from, to) if from == to => Ok(current),
            (BookingStatus::Confirmed, BookingStatus::Cancelled) => {
                let event = Event::BookingCancelled {
                    id: current.id,
                    resource_id: current.resource_id,
                };
                self.commit(guard, event).await?;
                Ok(Booking {
                    status: BookingStatus::Cancelled,
                    ..current
                })
            }
            _ => Err(StoreError::InvalidTransition(booking.id)),
        }
    }

    async fn available_resources(&self, span: &Span) -> Result<Vec<Resource>, StoreError> {
        let states: Vec<SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        let mut free = Vec::new();
        for rs in states {
            let guard = rs.read().await;
            if guard.confirmed_overlapping(span).next().is_none() {
                free.push(guard.resource.clone());
            }
        }
        free.sort_by(|a, b| {
            (&a.make, &a.model, &a.license_plate).cmp(&(&b.make, &b.model, &b.license_plate))
        });
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use futures::FutureExt;
    use std::path::{Path, PathBuf};

    const H: Ms = HOUR_MS;

    fn vehicle(make: &str, model: &str, plate: &str) -> Resource {
        Resource {
            id: Ulid::new(),
            make: make.into(),
            model: model.into(),
            license_plate: plate.into(),
        }
    }

    fn memory_store() -> DurableStore {
        DurableStore::in_memory(Arc::new(ManualClock::new(0)), Duration::from_millis(200))
    }

    fn new_booking(resource_id: Ulid, start: Ms, end: Ms) -> NewBooking {
        NewBooking {
            resource_id,
            owner_id: Ulid::new(),
            span: Span::new(start, end),
        }
    }

    fn test_config(name: &str) -> StoreConfig {
        let dir = std::env::temp_dir().join("fleetbook_test_store").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        StoreConfig {
            data_dir: PathBuf::from(dir),
            lock_wait: Duration::from_millis(200),
            compact_threshold: 1000,
        }
    }

    #[tokio::test]
    async fn insert_assigns_identity_and_creation_time() {
        let clock = Arc::new(ManualClock::new(5_000));
        let store = DurableStore::in_memory(clock, Duration::from_millis(200));
        let car = vehicle("Fiat", "500", "FI-1");
        let rid = car.id;
        store.register_resource(car).await.unwrap();

        let b = store.insert_confirmed(new_booking(rid, 10 * H, 12 * H)).await.unwrap();
        assert_eq!(b.status, BookingStatus::Confirmed);
        assert_eq!(b.created_at, 5_000);
        assert_eq!(store.find_by_id(&b.id).await.unwrap(), Some(b));
    }

    #[tokio::test]
    async fn insert_overlapping_is_exclusion_violation() {
        let store = memory_store();
        let car = vehicle("Fiat", "500", "FI-1");
        let rid = car.id;
        store.register_resource(car).await.unwrap();

        let first = store.insert_confirmed(new_booking(rid, 10 * H, 12 * H)).await.unwrap();
        let err = store
            .insert_confirmed(new_booking(rid, 11 * H, 14 * H))
            .await
            .unwrap_err();
        assert_eq!(err, InsertError::ExclusionViolation { conflicting: first.id });

        // Adjacent is fine (half-open)
        store.insert_confirmed(new_booking(rid, 12 * H, 14 * H)).await.unwrap();
    }

    #[tokio::test]
    async fn insert_unknown_resource_is_access_failure() {
        let store = memory_store();
        let rid = Ulid::new();
        let err = store
            .insert_confirmed(new_booking(rid, 10 * H, 12 * H))
            .await
            .unwrap_err();
        assert_eq!(err, InsertError::Access(StoreError::ResourceMissing(rid)));
    }

    #[tokio::test]
    async fn held_lock_reports_transient_conflict() {
        let store = memory_store();
        let car = vehicle("Fiat", "500", "FI-1");
        let rid = car.id;
        store.register_resource(car).await.unwrap();

        let rs = store.resource_state(&rid).unwrap();
        let _held = rs.write().await;
        let err = store
            .insert_confirmed(new_booking(rid, 10 * H, 12 * H))
            .await
            .unwrap_err();
        assert!(matches!(err, InsertError::TransientConflict(_)));
    }

    #[tokio::test]
    async fn cancelled_booking_frees_the_slot() {
        let store = memory_store();
        let car = vehicle("Fiat", "500", "FI-1");
        let rid = car.id;
        store.register_resource(car).await.unwrap();

        let b = store.insert_confirmed(new_booking(rid, 10 * H, 12 * H)).await.unwrap();
        assert!(store.has_overlap(&rid, &Span::new(11 * H, 13 * H)).await.unwrap());

        let cancelled = store
            .save(&Booking { status: BookingStatus::Cancelled, ..b.clone() })
            .await
            .unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert_eq!(cancelled.span, b.span);
        assert!(!store.has_overlap(&rid, &Span::new(11 * H, 13 * H)).await.unwrap());
        assert_eq!(store.bookings_for(&rid).await.len(), 1);
    }

    #[tokio::test]
    async fn save_cannot_reconfirm() {
        let store = memory_store();
        let car = vehicle("Fiat", "500", "FI-1");
        let rid = car.id;
        store.register_resource(car).await.unwrap();

        let b = store.insert_confirmed(new_booking(rid, 10 * H, 12 * H)).await.unwrap();
        let cancelled = store
            .save(&Booking { status: BookingStatus::Cancelled, ..b })
            .await
            .unwrap();
        let err = store
            .save(&Booking { status: BookingStatus::Confirmed, ..cancelled.clone() })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::InvalidTransition(cancelled.id));
    }

    #[tokio::test]
    async fn save_ignores_interval_changes() {
        let store = memory_store();
        let car = vehicle("Fiat", "500", "FI-1");
        let rid = car.id;
        store.register_resource(car).await.unwrap();

        let b = store.insert_confirmed(new_booking(rid, 10 * H, 12 * H)).await.unwrap();
        let saved = store
            .save(&Booking { span: Span::new(20 * H, 30 * H), ..b.clone() })
            .await
            .unwrap();
        assert_eq!(saved, b);
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let store = memory_store();
        let car = vehicle("Fiat", "500", "FI-1");
        let id = car.id;
        store.register_resource(car.clone()).await.unwrap();
        assert_eq!(store.register_resource(car).await, Err(StoreError::Duplicate(id)));
        assert!(store.resource_exists(&id).await.unwrap());
        assert_eq!(store.get_resource(&id).await.unwrap().unwrap().make, "Fiat");
    }

    #[tokio::test]
    async fn available_resources_sorted_and_filtered() {
        let store = memory_store();
        let volvo = vehicle("Volvo", "XC40", "V-1");
        let audi_b = vehicle("Audi", "A4", "A-2");
        let audi_a = vehicle("Audi", "A4", "A-1");
        let busy = volvo.id;
        for car in [volvo, audi_b, audi_a] {
            store.register_resource(car).await.unwrap();
        }
        store.insert_confirmed(new_booking(busy, 10 * H, 12 * H)).await.unwrap();

        let free = store.available_resources(&Span::new(11 * H, 13 * H)).await.unwrap();
        let plates: Vec<&str> = free.iter().map(|r| r.license_plate.as_str()).collect();
        assert_eq!(plates, vec!["A-1", "A-2"]);

        let later = store.available_resources(&Span::new(12 * H, 14 * H)).await.unwrap();
        assert_eq!(later.len(), 3);
    }

    #[tokio::test]
    async fn wal_replay_restores_bookings_and_cancellations() {
        let config = test_config("replay");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let car = vehicle("Kia", "Ceed", "K-1");
        let rid = car.id;

        let (kept, dropped) = {
            let store = DurableStore::open(&config, clock.clone()).unwrap();
            store.register_resource(car).await.unwrap();
            let kept = store.insert_confirmed(new_booking(rid, 10 * H, 12 * H)).await.unwrap();
            let dropped = store.insert_confirmed(new_booking(rid, 20 * H, 22 * H)).await.unwrap();
            store
                .save(&Booking { status: BookingStatus::Cancelled, ..dropped.clone() })
                .await
                .unwrap();
            (kept, dropped)
        };

        let store = DurableStore::open(&config, clock).unwrap();
        assert!(store.resource_exists(&rid).await.unwrap());
        assert_eq!(store.find_by_id(&kept.id).await.unwrap(), Some(kept));
        let reloaded = store.find_by_id(&dropped.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, BookingStatus::Cancelled);
        assert!(!store.has_overlap(&rid, &dropped.span).await.unwrap());
    }

    #[tokio::test]
    async fn compaction_keeps_state_and_resets_counter() {
        let config = test_config("compact");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let car = vehicle("Kia", "Ceed", "K-1");
        let rid = car.id;

        {
            let store = DurableStore::open(&config, clock.clone()).unwrap();
            store.register_resource(car).await.unwrap();
            for i in 0..5 {
                let b = store
                    .insert_confirmed(new_booking(rid, i * 10 * H, i * 10 * H + 2 * H))
                    .await
                    .unwrap();
                if i % 2 == 0 {
                    store
                        .save(&Booking { status: BookingStatus::Cancelled, ..b })
                        .await
                        .unwrap();
                }
            }
            assert_eq!(store.wal_appends_since_compact().await, 9);
            store.compact_wal().await.unwrap();
            assert_eq!(store.wal_appends_since_compact().await, 0);
        }

        assert_eq!(Wal::replay(&config.wal_path()).unwrap().len(), 6);
        let store = DurableStore::open(&config, clock).unwrap();
        let bookings = store.bookings_for(&rid).await;
        assert_eq!(bookings.len(), 5);
        assert_eq!(bookings.iter().filter(|b| b.is_confirmed()).count(), 2);
    }

    #[tokio::test]
    async fn abandoned_insert_still_commits_and_replays() {
        let mut config = test_config("abandoned_insert");
        config.lock_wait = Duration::from_secs(5);
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let car = vehicle("Kia", "Ceed", "K-1");
        let rid = car.id;

        let before_restart = {
            let store = DurableStore::open(&config, clock.clone()).unwrap();
            store.register_resource(car).await.unwrap();

            // Polled once, then dropped while waiting on the WAL
            let abandoned = store
                .insert_confirmed(new_booking(rid, 10 * H, 12 * H))
                .now_or_never();
            assert!(abandoned.is_none());

            let err = store
                .insert_confirmed(new_booking(rid, 11 * H, 13 * H))
                .await
                .unwrap_err();
            assert!(matches!(err, InsertError::ExclusionViolation { .. }));
            store.bookings_for(&rid).await
        };
        assert_eq!(before_restart.len(), 1);
        assert_eq!(before_restart[0].span, Span::new(10 * H, 12 * H));

        let store = DurableStore::open(&config, clock).unwrap();
        assert_eq!(store.bookings_for(&rid).await, before_restart);
        assert_eq!(
            store.find_by_id(&before_restart[0].id).await.unwrap().as_ref(),
            before_restart.first()
        );
    }

    #[tokio::test]
    async fn abandoned_cancellation_still_commits_and_replays() {
        let mut config = test_config("abandoned_cancel");
        config.lock_wait = Duration::from_secs(5);
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let car = vehicle("Kia", "Ceed", "K-1");
        let rid = car.id;

        let (b, rebooked) = {
            let store = DurableStore::open(&config, clock.clone()).unwrap();
            store.register_resource(car).await.unwrap();
            let b = store.insert_confirmed(new_booking(rid, 10 * H, 12 * H)).await.unwrap();

            let abandoned = store
                .save(&Booking { status: BookingStatus::Cancelled, ..b.clone() })
                .now_or_never();
            assert!(abandoned.is_none());

            // Waits for the abandoned write, then finds the slot free
            let rebooked = store.insert_confirmed(new_booking(rid, 11 * H, 13 * H)).await.unwrap();
            let reloaded = store.find_by_id(&b.id).await.unwrap().unwrap();
            assert_eq!(reloaded.status, BookingStatus::Cancelled);
            (b, rebooked)
        };

        let store = DurableStore::open(&config, clock).unwrap();
        let reloaded = store.find_by_id(&b.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, BookingStatus::Cancelled);
        assert_eq!(store.find_by_id(&rebooked.id).await.unwrap(), Some(rebooked));
    }

    #[tokio::test]
    async fn insert_racing_compaction_lands_in_compacted_log() {
        let config = test_config("compact_race");
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let car = vehicle("Kia", "Ceed", "K-1");
        let rid = car.id;

        let (early, late) = {
            let store = DurableStore::open(&config, clock.clone()).unwrap();
            store.register_resource(car).await.unwrap();
            let early = store.insert_confirmed(new_booking(rid, 10 * H, 12 * H)).await.unwrap();

            // The insert takes the resource lock as soon as the snapshot is queued
            let (compacted, late) = tokio::join!(
                store.compact_wal(),
                store.insert_confirmed(new_booking(rid, 20 * H, 22 * H))
            );
            compacted.unwrap();
            (early, late.unwrap())
        };

        assert_eq!(Wal::replay(&config.wal_path()).unwrap().len(), 3);
        let store = DurableStore::open(&config, clock).unwrap();
        assert_eq!(store.bookings_for(&rid).await, vec![early, late]);
    }

    #[tokio::test]
    async fn replay_skips_overlapping_confirmed_record() {
        let config = test_config("replay_overlap");
        std::fs::create_dir_all(&config.data_dir).unwrap();
        let car = vehicle("Kia", "Ceed", "K-1");
        let rid = car.id;
        let booking = |start: Ms, end: Ms| Booking {
            id: Ulid::new(),
            resource_id: rid,
            owner_id: Ulid::new(),
            span: Span::new(start, end),
            status: BookingStatus::Confirmed,
            created_at: 0,
        };
        let first = booking(10 * H, 12 * H);
        let clashing = booking(11 * H, 13 * H);
        {
            let mut wal = Wal::open(&config.wal_path()).unwrap();
            wal.append(&Event::ResourceRegistered { resource: car }).unwrap();
            wal.append(&Event::BookingRecorded { booking: first.clone() }).unwrap();
            wal.append(&Event::BookingRecorded { booking: clashing.clone() }).unwrap();
        }

        let store = DurableStore::open(&config, Arc::new(ManualClock::new(0))).unwrap();
        assert_eq!(store.bookings_for(&rid).await, vec![first]);
        assert_eq!(store.find_by_id(&clashing.id).await.unwrap(), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_wal_flush_leaves_memory_untouched() {
        let car = vehicle("Kia", "Ceed", "K-1");
        let rid = car.id;
        let states = HashMap::from([(rid, ResourceState::new(car))]);
        // Every write to /dev/full fails with ENOSPC
        let wal = Wal::open(Path::new("/dev/full")).unwrap();
        let store = DurableStore::with_wal(
            wal,
            states,
            DashMap::new(),
            Arc::new(ManualClock::new(0)),
            Duration::from_secs(5),
        );

        let err = store
            .insert_confirmed(new_booking(rid, 10 * H, 12 * H))
            .await
            .unwrap_err();
        assert!(matches!(err, InsertError::Access(StoreError::Io(_))));
        assert!(store.bookings_for(&rid).await.is_empty());
        assert!(!store.has_overlap(&rid, &Span::new(10 * H, 12 * H)).await.unwrap());

        let other = vehicle("Kia", "Rio", "K-2");
        let other_id = other.id;
        assert!(matches!(store.register_resource(other).await, Err(StoreError::Io(_))));
        assert!(!store.resource_exists(&other_id).await.unwrap());
    }
}
