use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::{MAX_USERS, MAX_VEHICLE_TYPES, WAL_QUEUE_DEPTH};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use super::writer::{wal_writer_loop, WalCommand};
use super::{ParkingStore, RateCatalog, StoreError, UserStore};

type SharedPlateState = Arc<RwLock<PlateState>>;

/// Per-plate slot. Its write lock is what serializes entry and exit for one
/// plate. A slot is registered only while its plate has an open record.
#[derive(Debug, Default)]
struct PlateState {
    /// Id of the plate's open record, if the vehicle is inside.
    open: Option<Ulid>,
}

/// A write-locked plate slot that was still registered when the lock was taken.
/// Dropping it while vacant unregisters the slot before the lock is released.
struct HeldPlate {
    inner: Arc<Inner>,
    plate: String,
    slot: SharedPlateState,
    guard: OwnedRwLockWriteGuard<PlateState>,
}

impl Drop for HeldPlate {
    fn drop(&mut self) {
        if self.guard.open.is_none() {
            self.inner
                .plates
                .remove_if(&self.plate, |_, registered| Arc::ptr_eq(registered, &self.slot));
        }
    }
}

struct Inner {
    records: DashMap<Ulid, ParkingRecord>,
    plates: DashMap<String, SharedPlateState>,
    vehicle_types: DashMap<Ulid, VehicleType>,
    users: DashMap<Ulid, UserAccount>,
    /// Serializes catalog mutations so name, size and reference checks see a stable catalog.
    catalog_lock: Mutex<()>,
    /// Same for account mutations.
    users_lock: Mutex<()>,
    /// Commits hold this shared; compaction holds it exclusively while it
    /// snapshots and rewrites the log.
    compaction: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
}

/// Durable in-process store for parking records, the rate catalog and staff
/// accounts.
///
/// Every mutation is appended to the WAL before it becomes visible in memory.
/// Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct LotStore {
    inner: Arc<Inner>,
}

impl LotStore {
    /// Replay the WAL at `wal_path` and start its writer task. Must run inside a tokio runtime.
    pub fn open(wal_path: &Path, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::recover(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_QUEUE_DEPTH);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let inner = Inner {
            records: DashMap::new(),
            plates: DashMap::new(),
            vehicle_types: DashMap::new(),
            users: DashMap::new(),
            catalog_lock: Mutex::new(()),
            users_lock: Mutex::new(()),
            compaction: RwLock::new(()),
            wal_tx,
            notify,
        };

        let mut open_by_plate: HashMap<String, Ulid> = HashMap::new();
        for event in &events {
            match event {
                Event::EntryRecorded { record } if record.is_open() => {
                    open_by_plate.insert(record.license_plate.clone(), record.id);
                }
                Event::ExitRecorded { id, .. } => {
                    if let Some(plate) = inner.records.get(id).map(|r| r.license_plate.clone())
                        && open_by_plate.get(&plate) == Some(id)
                    {
                        open_by_plate.remove(&plate);
                    }
                }
                _ => {}
            }
            inner.apply(event);
        }
        for (plate, id) in open_by_plate {
            inner
                .plates
                .insert(plate, Arc::new(RwLock::new(PlateState { open: Some(id) })));
        }

        tracing::info!(
            "lot store replayed {} events: {} records, {} vehicle types, {} users",
            events.len(),
            inner.records.len(),
            inner.vehicle_types.len(),
            inner.users.len()
        );
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn open_count(&self) -> usize {
        self.inner.records.iter().filter(|r| r.is_open()).count()
    }

    pub fn record_count(&self) -> usize {
        self.inner.records.len()
    }

    /// Write-lock the registered slot for `plate`, registering a vacant one if
    /// there is none. A slot unregistered by an exit while we waited is stale,
    /// so we retry with whatever is registered now.
    async fn lock_plate(&self, plate: &str) -> HeldPlate {
        loop {
            let slot = self.inner.plates.entry(plate.to_string()).or_default().value().clone();
            if let Some(held) = self.hold_if_registered(plate, slot).await {
                return held;
            }
        }
    }

    /// Like `lock_plate`, but `None` when the plate has no slot.
    async fn lock_existing_plate(&self, plate: &str) -> Option<HeldPlate> {
        loop {
            let slot = self.inner.plates.get(plate).map(|e| e.value().clone())?;
            if let Some(held) = self.hold_if_registered(plate, slot).await {
                return Some(held);
            }
        }
    }

    async fn hold_if_registered(&self, plate: &str, slot: SharedPlateState) -> Option<HeldPlate> {
        let guard = slot.clone().write_owned().await;
        let registered = self
            .inner
            .plates
            .get(plate)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &slot));
        registered.then(|| HeldPlate {
            inner: self.inner.clone(),
            plate: plate.to_string(),
            slot,
            guard,
        })
    }

    /// WAL-append + apply + notify, run to completion in its own task so a
    /// caller that stops waiting cannot leave the log ahead of memory.
    /// `slot` is the held plate to update once the event is applied.
    async fn commit(&self, event: Event, slot: Option<(HeldPlate, Option<Ulid>)>) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _shared = inner.compaction.read().await;
            inner.wal_append(&event).await?;
            inner.apply(&event);
            if let Some((mut held, open)) = slot {
                held.guard.open = open;
            }
            inner.notify.send(&event);
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("commit task failed: {e}")))?
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.inner.compaction.write().await;

        let mut users: Vec<UserAccount> = self.inner.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        let mut vehicle_types: Vec<VehicleType> =
            self.inner.vehicle_types.iter().map(|e| e.value().clone()).collect();
        vehicle_types.sort_by_key(|vt| vt.id);
        let mut records: Vec<ParkingRecord> = self.inner.records.iter().map(|e| e.value().clone()).collect();
        records.sort_by_key(|r| r.id);

        let mut events = Vec::with_capacity(users.len() + vehicle_types.len() + records.len());
        events.extend(users.into_iter().map(|user| Event::UserCreated { user }));
        events.extend(
            vehicle_types
                .into_iter()
                .map(|vehicle_type| Event::VehicleTypeCreated { vehicle_type }),
        );
        events.extend(records.into_iter().map(|record| Event::EntryRecorded { record }));
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Rewrite { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

impl Inner {
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Apply an event to the record, catalog and account maps. Plate slots are the caller's job.
    fn apply(&self, event: &Event) {
        match event {
            Event::VehicleTypeCreated { vehicle_type } | Event::VehicleTypeUpdated { vehicle_type } => {
                self.vehicle_types.insert(vehicle_type.id, vehicle_type.clone());
            }
            Event::VehicleTypeDeleted { id } => {
                self.vehicle_types.remove(id);
            }
            Event::EntryRecorded { record } => {
                self.records.insert(record.id, record.clone());
            }
            Event::ExitRecorded { id, closure } => {
                if let Some(mut record) = self.records.get_mut(id) {
                    record.stay = Stay::Closed(closure.clone());
                }
            }
            Event::UserCreated { user } | Event::UserUpdated { user } => {
                self.users.insert(user.id, user.clone());
            }
            Event::UserDeleted { id } => {
                self.users.remove(id);
            }
        }
    }

    fn record(&self, id: &Ulid) -> Option<ParkingRecord> {
        self.records.get(id).map(|e| e.value().clone())
    }

    fn name_taken(&self, name: &str, except: Option<Ulid>) -> bool {
        let wanted = name.to_lowercase();
        self.vehicle_types
            .iter()
            .any(|vt| Some(vt.id) != except && vt.name.to_lowercase() == wanted)
    }

    fn username_taken(&self, username: &str, except: Option<Ulid>) -> bool {
        self.users
            .iter()
            .any(|u| Some(u.id) != except && u.username == username)
    }
}

#[async_trait]
impl ParkingStore for LotStore {
    async fn create_entry(&self, record: &ParkingRecord) -> Result<(), StoreError> {
        if !record.is_open() {
            return Err(StoreError::Invalid("new parking records must be open"));
        }
        let held = self.lock_plate(&record.license_plate).await;
        if held.guard.open.is_some() {
            return Err(StoreError::OpenRecordExists(record.license_plate.clone()));
        }
        let event = Event::EntryRecorded { record: record.clone() };
        self.commit(event, Some((held, Some(record.id)))).await
    }

    async fn find_by_id(&self, id: Ulid) -> Result<ParkingRecord, StoreError> {
        self.inner.record(&id).ok_or(StoreError::NotFound)
    }

    async fn find_open_by_license_plate(&self, plate: &str) -> Result<ParkingRecord, StoreError> {
        let slot = self
            .inner
            .plates
            .get(plate)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound)?;
        // A slot unregistered meanwhile is vacant, so this still answers correctly.
        let open = slot.read().await.open;
        let id = open.ok_or(StoreError::NotFound)?;
        self.inner.record(&id).ok_or(StoreError::NotFound)
    }

    async fn update_exit(&self, id: Ulid, closure: Closure) -> Result<ParkingRecord, StoreError> {
        let plate = self
            .inner
            .record(&id)
            .map(|r| r.license_plate)
            .ok_or(StoreError::NotFound)?;
        let held = self.lock_existing_plate(&plate).await.ok_or(StoreError::NotFound)?;
        // Closed (or superseded) while we waited for the slot.
        if held.guard.open != Some(id) {
            return Err(StoreError::NotFound);
        }
        self.commit(Event::ExitRecorded { id, closure }, Some((held, None)))
            .await?;
        self.inner.record(&id).ok_or(StoreError::NotFound)
    }

    async fn list_current(&self) -> Result<Vec<ParkingRecord>, StoreError> {
        let mut open: Vec<ParkingRecord> = self
            .inner
            .records
            .iter()
            .filter(|r| r.is_open())
            .map(|r| r.value().clone())
            .collect();
        open.sort_by(|a, b| b.entry_time.cmp(&a.entry_time).then(b.id.cmp(&a.id)));
        Ok(open)
    }

    async fn list_history(&self) -> Result<Vec<ParkingRecord>, StoreError> {
        let mut closed: Vec<ParkingRecord> = self
            .inner
            .records
            .iter()
            .filter(|r| !r.is_open())
            .map(|r| r.value().clone())
            .collect();
        closed.sort_by(|a, b| b.exit_time().cmp(&a.exit_time()).then(b.id.cmp(&a.id)));
        Ok(closed)
    }
}

#[async_trait]
impl RateCatalog for LotStore {
    async fn find_by_id(&self, id: Ulid) -> Result<VehicleType, StoreError> {
        self.inner
            .vehicle_types
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn list_all(&self) -> Result<Vec<VehicleType>, StoreError> {
        let mut all: Vec<VehicleType> = self.inner.vehicle_types.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn insert(&self, vehicle_type: &VehicleType) -> Result<(), StoreError> {
        let _catalog = self.inner.catalog_lock.lock().await;
        if self.inner.vehicle_types.len() >= MAX_VEHICLE_TYPES {
            return Err(StoreError::LimitReached("too many vehicle types"));
        }
        if self.inner.vehicle_types.contains_key(&vehicle_type.id) {
            return Err(StoreError::Invalid("vehicle type id already exists"));
        }
        if self.inner.name_taken(&vehicle_type.name, None) {
            return Err(StoreError::NameTaken(vehicle_type.name.clone()));
        }
        self.commit(Event::VehicleTypeCreated { vehicle_type: vehicle_type.clone() }, None)
            .await
    }

    async fn update(&self, vehicle_type: &VehicleType) -> Result<(), StoreError> {
        let _catalog = self.inner.catalog_lock.lock().await;
        if !self.inner.vehicle_types.contains_key(&vehicle_type.id) {
            return Err(StoreError::NotFound);
        }
        if self.inner.name_taken(&vehicle_type.name, Some(vehicle_type.id)) {
            return Err(StoreError::NameTaken(vehicle_type.name.clone()));
        }
        self.commit(Event::VehicleTypeUpdated { vehicle_type: vehicle_type.clone() }, None)
            .await
    }

    async fn delete(&self, id: Ulid) -> Result<(), StoreError> {
        let _catalog = self.inner.catalog_lock.lock().await;
        if !self.inner.vehicle_types.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        if self.inner.records.iter().any(|r| r.vehicle_type_id == id) {
            return Err(StoreError::InUse);
        }
        self.commit(Event::VehicleTypeDeleted { id }, None).await
    }
}

#[async_trait]
impl UserStore for LotStore {
    async fn find_user(&self, id: Ulid) -> Result<UserAccount, StoreError> {
        self.inner
            .users
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn find_user_by_username(&self, username: &str) -> Result<UserAccount, StoreError> {
        self.inner
            .users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn list_users(&self) -> Result<Vec<UserAccount>, StoreError> {
        let mut all: Vec<UserAccount> = self.inner.users.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.username.cmp(&b.username).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn insert_user(&self, user: &UserAccount) -> Result<(), StoreError> {
        let _users = self.inner.users_lock.lock().await;
        if self.inner.users.len() >= MAX_USERS {
            return Err(StoreError::LimitReached("too many user accounts"));
        }
        if self.inner.users.contains_key(&user.id) {
            return Err(StoreError::Invalid("user id already exists"));
        }
        if self.inner.username_taken(&user.username, None) {
            return Err(StoreError::NameTaken(user.username.clone()));
        }
        self.commit(Event::UserCreated { user: user.clone() }, None).await
    }

    async fn update_user(&self, user: &UserAccount) -> Result<(), StoreError> {
        let _users = self.inner.users_lock.lock().await;
        if !self.inner.users.contains_key(&user.id) {
            return Err(StoreError::NotFound);
        }
        if self.inner.username_taken(&user.username, Some(user.id)) {
            return Err(StoreError::NameTaken(user.username.clone()));
        }
        self.commit(Event::UserUpdated { user: user.clone() }, None).await
    }

    async fn delete_user(&self, id: Ulid) -> Result<(), StoreError> {
        let _users = self.inner.users_lock.lock().await;
        if !self.inner.users.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        self.commit(Event::UserDeleted { id }, None).await
    }
}
