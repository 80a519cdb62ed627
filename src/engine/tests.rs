use super::*;

use std::path::PathBuf;

use async_trait::async_trait;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::engine::charge::now_ms;
use crate::limits::{MAX_HOURLY_RATE, MAX_VEHICLE_TYPES};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::LotStore;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("parkade_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn make_engine(name: &str) -> (ParkingEngine, LotStore) {
    let store = LotStore::open(&test_wal_path(name), Arc::new(NotifyHub::new())).unwrap();
    let engine = ParkingEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Duration::from_secs(5),
    );
    (engine, store)
}

fn rate(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// An open record that entered `minutes_ago` minutes before now.
async fn park_since(store: &LotStore, plate: &str, vehicle_type_id: Ulid, minutes_ago: i64) -> ParkingRecord {
    let record = ParkingRecord::open(
        Ulid::new(),
        "clerk".into(),
        vehicle_type_id,
        plate.into(),
        truncate_to_second(now_ms()) - minutes_ago * MINUTE_MS,
    );
    store.create_entry(&record).await.unwrap();
    record
}

// ── Entry ────────────────────────────────────────────────────

#[tokio::test]
async fn entry_opens_record() {
    let (engine, store) = make_engine("entry_opens.wal");
    let car = engine.create_vehicle_type("car", rate(1500), "").await.unwrap();

    let before = truncate_to_second(now_ms());
    let record = engine.record_entry("clerk", car.id, "ABC123").await.unwrap();
    assert!(record.is_open());
    assert_eq!(record.user_id, "clerk");
    assert_eq!(record.vehicle_type_id, car.id);
    assert_eq!(record.license_plate, "ABC123");
    assert!(record.entry_time >= before);
    assert_eq!(record.entry_time % SECOND_MS, 0);

    assert_eq!(store.find_open_by_license_plate("ABC123").await.unwrap(), record);
}

#[tokio::test]
async fn second_entry_for_parked_plate_rejected() {
    let (engine, store) = make_engine("entry_dup.wal");
    let car = engine.create_vehicle_type("car", rate(1500), "").await.unwrap();
    engine.record_entry("clerk", car.id, "DUP1").await.unwrap();

    assert_eq!(
        engine.record_entry("other", car.id, "DUP1").await,
        Err(EngineError::ActiveParkingAlreadyExists("DUP1".into()))
    );
    assert_eq!(store.record_count(), 1);
}

#[tokio::test]
async fn entry_with_unknown_type_changes_nothing() {
    let (engine, store) = make_engine("entry_unknown_type.wal");
    let ghost = Ulid::new();
    assert_eq!(
        engine.record_entry("clerk", ghost, "NT1").await,
        Err(EngineError::VehicleTypeNotFound(ghost))
    );
    assert_eq!(store.record_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_entries_admit_exactly_one() {
    let (engine, store) = make_engine("entry_race.wal");
    let engine = Arc::new(engine);
    let car = engine.create_vehicle_type("car", rate(1500), "").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.record_entry(&format!("clerk{i}"), car.id, "RACE1").await
        }));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(EngineError::ActiveParkingAlreadyExists(_)) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(rejected, 15);
    assert_eq!(store.open_count(), 1);
}

// ── Exit ─────────────────────────────────────────────────────

#[tokio::test]
async fn exit_without_open_record() {
    let (engine, _) = make_engine("exit_none.wal");
    assert_eq!(
        engine.record_exit("clerk", "NOPE").await,
        Err(EngineError::ActiveParkingNotFound("NOPE".into()))
    );
}

#[tokio::test]
async fn exit_rounds_half_hour_up() {
    let (engine, store) = make_engine("exit_round_up.wal");
    let van = engine.create_vehicle_type("van", rate(500), "").await.unwrap();
    let parked = park_since(&store, "VAN1", van.id, 90).await;

    let closed = engine.record_exit("clerk", "VAN1").await.unwrap();
    assert_eq!(closed.id, parked.id);
    let closure = closed.closure().unwrap();
    assert_eq!(closure.calculated_hours, 2);
    assert_eq!(closure.total_charge, rate(1000));
    assert_eq!(closure.exit_time % SECOND_MS, 0);
    assert!(closure.exit_time >= parked.entry_time);
}

#[tokio::test]
async fn exit_rounds_short_remainder_down() {
    let (engine, store) = make_engine("exit_round_down.wal");
    let car = engine.create_vehicle_type("car", rate(1500), "").await.unwrap();
    park_since(&store, "CAR1", car.id, 89).await;

    let closure = engine.record_exit("clerk", "CAR1").await.unwrap().closure().cloned().unwrap();
    assert_eq!(closure.calculated_hours, 1);
    assert_eq!(closure.total_charge, rate(1500));
}

#[tokio::test]
async fn fee_exempt_exit_is_free() {
    let (engine, store) = make_engine("exit_exempt.wal");
    let bike = engine.create_vehicle_type("bicycle", Decimal::ZERO, "").await.unwrap();
    park_since(&store, "BIKE1", bike.id, 150).await;

    let closure = engine.record_exit("clerk", "BIKE1").await.unwrap().closure().cloned().unwrap();
    assert_eq!(closure.calculated_hours, 3);
    assert_eq!(closure.total_charge, Decimal::ZERO);
}

#[tokio::test]
async fn exit_frees_plate_for_reentry() {
    let (engine, _) = make_engine("exit_reentry.wal");
    let car = engine.create_vehicle_type("car", rate(1500), "").await.unwrap();
    engine.record_entry("clerk", car.id, "RE1").await.unwrap();
    engine.record_exit("clerk", "RE1").await.unwrap();

    assert_eq!(
        engine.record_exit("clerk", "RE1").await,
        Err(EngineError::ActiveParkingNotFound("RE1".into()))
    );
    engine.record_entry("clerk", car.id, "RE1").await.unwrap();
}

#[tokio::test]
async fn exit_charges_current_rate() {
    let (engine, store) = make_engine("exit_rate_change.wal");
    let car = engine.create_vehicle_type("car", rate(1500), "").await.unwrap();
    park_since(&store, "UPD1", car.id, 60).await;
    engine.update_vehicle_type(car.id, "car", rate(2000), "").await.unwrap();

    let closure = engine.record_exit("clerk", "UPD1").await.unwrap().closure().cloned().unwrap();
    assert_eq!(closure.total_charge, rate(2000));
}

#[tokio::test]
async fn exit_with_vanished_vehicle_type_is_internal() {
    let (engine, store) = make_engine("exit_vanished_type.wal");
    let parked = park_since(&store, "GONE1", Ulid::new(), 30).await;

    let err = tokio_test::assert_err!(engine.record_exit("clerk", "GONE1").await);
    assert!(matches!(err, EngineError::Internal(_)));
    assert!(!err.is_domain());
    assert!(ParkingStore::find_by_id(&store, parked.id).await.unwrap().is_open());
}

#[tokio::test]
async fn exit_with_overflowing_charge_is_internal_and_stays_open() {
    let (engine, store) = make_engine("exit_overflow.wal");
    // Only reachable through data written before the rate cap existed.
    let limo = VehicleType {
        id: Ulid::new(),
        name: "limo".into(),
        hourly_rate: Decimal::MAX,
        description: String::new(),
    };
    RateCatalog::insert(&store, &limo).await.unwrap();
    let parked = park_since(&store, "LIMO1", limo.id, 120).await;

    let err = tokio_test::assert_err!(engine.record_exit("clerk", "LIMO1").await);
    assert!(matches!(err, EngineError::Internal(_)));
    assert_eq!(store.find_open_by_license_plate("LIMO1").await.unwrap(), parked);
}

// ── Queries ──────────────────────────────────────────────────

#[tokio::test]
async fn current_and_history_split_by_state() {
    let (engine, _) = make_engine("queries.wal");
    let car = engine.create_vehicle_type("car", rate(1500), "").await.unwrap();
    let stays = engine.record_entry("clerk", car.id, "Q1").await.unwrap();
    let leaves = engine.record_entry("clerk", car.id, "Q2").await.unwrap();
    engine.record_exit("clerk", "Q2").await.unwrap();

    let current = engine.currently_parked().await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].id, stays.id);

    let history = engine.history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, leaves.id);
    assert!(!history[0].is_open());

    assert_eq!(engine.record_by_id(stays.id).await.unwrap(), stays);
}

#[tokio::test]
async fn record_by_unknown_id() {
    let (engine, _) = make_engine("record_unknown.wal");
    let id = Ulid::new();
    assert_eq!(engine.record_by_id(id).await, Err(EngineError::ParkingRecordNotFound(id)));
}

// ── Catalog ──────────────────────────────────────────────────

#[tokio::test]
async fn negative_rate_rejected() {
    let (engine, _) = make_engine("catalog_negative.wal");
    assert_eq!(
        engine.create_vehicle_type("truck", rate(-100), "").await,
        Err(EngineError::InvalidRate(rate(-100)))
    );
    let car = engine.create_vehicle_type("car", rate(1500), "").await.unwrap();
    assert_eq!(
        engine.update_vehicle_type(car.id, "car", rate(-1), "").await,
        Err(EngineError::InvalidRate(rate(-1)))
    );
    tokio_test::assert_ok!(engine.create_vehicle_type("free", rate(-0), "").await);
}

#[tokio::test]
async fn rate_above_cap_rejected() {
    let (engine, _) = make_engine("catalog_cap_rate.wal");
    assert_eq!(
        engine.create_vehicle_type("limo", Decimal::MAX, "").await,
        Err(EngineError::InvalidRate(Decimal::MAX))
    );
    let cap = Decimal::from(MAX_HOURLY_RATE);
    let limo = engine.create_vehicle_type("limo", cap, "").await.unwrap();
    assert_eq!(
        engine.update_vehicle_type(limo.id, "limo", cap + rate(1), "").await,
        Err(EngineError::InvalidRate(cap + rate(1)))
    );
}

#[tokio::test]
async fn catalog_size_is_capped() {
    let (engine, _) = make_engine("catalog_cap_size.wal");
    for i in 0..MAX_VEHICLE_TYPES {
        engine.create_vehicle_type(&format!("type{i}"), rate(100), "").await.unwrap();
    }
    assert!(matches!(
        engine.create_vehicle_type("one-more", rate(100), "").await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn names_are_trimmed_and_unique() {
    let (engine, _) = make_engine("catalog_names.wal");
    let car = engine.create_vehicle_type("  Car ", rate(1500), " four wheels ").await.unwrap();
    assert_eq!(car.name, "Car");
    assert_eq!(car.description, "four wheels");

    assert_eq!(
        engine.create_vehicle_type("car", rate(100), "").await,
        Err(EngineError::VehicleTypeNameExists("car".into()))
    );
}

#[tokio::test]
async fn update_and_delete_unknown_type() {
    let (engine, _) = make_engine("catalog_unknown.wal");
    let id = Ulid::new();
    assert_eq!(
        engine.update_vehicle_type(id, "x", rate(100), "").await,
        Err(EngineError::VehicleTypeNotFound(id))
    );
    assert_eq!(engine.delete_vehicle_type(id).await, Err(EngineError::VehicleTypeNotFound(id)));
}

#[tokio::test]
async fn delete_referenced_type_rejected() {
    let (engine, _) = make_engine("catalog_in_use.wal");
    let car = engine.create_vehicle_type("car", rate(1500), "").await.unwrap();
    engine.record_entry("clerk", car.id, "USE1").await.unwrap();
    engine.record_exit("clerk", "USE1").await.unwrap();

    assert_eq!(engine.delete_vehicle_type(car.id).await, Err(EngineError::VehicleTypeInUse(car.id)));

    let spare = engine.create_vehicle_type("spare", rate(100), "").await.unwrap();
    engine.delete_vehicle_type(spare.id).await.unwrap();
    assert_eq!(engine.list_vehicle_types().await.unwrap().len(), 1);
}

#[tokio::test]
async fn seeding_fills_only_an_empty_catalog() {
    let (engine, _) = make_engine("catalog_seed.wal");
    assert_eq!(engine.seed_default_catalog().await.unwrap(), 3);
    assert_eq!(engine.seed_default_catalog().await.unwrap(), 0);

    let names: Vec<String> = engine.list_vehicle_types().await.unwrap().into_iter().map(|vt| vt.name).collect();
    assert_eq!(names, vec!["bicycle", "car", "motorcycle"]);
    let car = engine
        .list_vehicle_types()
        .await
        .unwrap()
        .into_iter()
        .find(|vt| vt.name == "car")
        .unwrap();
    assert_eq!(car.hourly_rate.to_string(), "15.00");
}

// ── Timeouts ─────────────────────────────────────────────────

/// A store that never answers in time.
struct SlowStore;

#[async_trait]
impl ParkingStore for SlowStore {
    async fn create_entry(&self, _record: &ParkingRecord) -> Result<(), StoreError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn find_by_id(&self, _id: Ulid) -> Result<ParkingRecord, StoreError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Err(StoreError::NotFound)
    }

    async fn find_open_by_license_plate(&self, _plate: &str) -> Result<ParkingRecord, StoreError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Err(StoreError::NotFound)
    }

    async fn update_exit(&self, _id: Ulid, _closure: Closure) -> Result<ParkingRecord, StoreError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Err(StoreError::NotFound)
    }

    async fn list_current(&self) -> Result<Vec<ParkingRecord>, StoreError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Vec::new())
    }

    async fn list_history(&self) -> Result<Vec<ParkingRecord>, StoreError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn slow_store_times_out() {
    let store = LotStore::open(&test_wal_path("timeout.wal"), Arc::new(NotifyHub::new())).unwrap();
    let engine = ParkingEngine::new(Arc::new(SlowStore), Arc::new(store), Duration::from_millis(20));

    assert_eq!(
        engine.record_entry("clerk", Ulid::new(), "SLOW1").await,
        Err(EngineError::Timeout("find_open_by_license_plate"))
    );
    assert_eq!(engine.currently_parked().await, Err(EngineError::Timeout("list_current")));
    assert_eq!(engine.record_by_id(Ulid::new()).await, Err(EngineError::Timeout("find_record")));
}

// ── Store rejections ─────────────────────────────────────────

/// A store whose writes always lose the race: `create_entry` finds the plate
/// taken and `update_exit` finds the record already closed.
struct RacingStore {
    open: Option<ParkingRecord>,
}

#[async_trait]
impl ParkingStore for RacingStore {
    async fn create_entry(&self, record: &ParkingRecord) -> Result<(), StoreError> {
        Err(StoreError::OpenRecordExists(record.license_plate.clone()))
    }

    async fn find_by_id(&self, _id: Ulid) -> Result<ParkingRecord, StoreError> {
        Err(StoreError::NotFound)
    }

    async fn find_open_by_license_plate(&self, _plate: &str) -> Result<ParkingRecord, StoreError> {
        self.open.clone().ok_or(StoreError::NotFound)
    }

    async fn update_exit(&self, _id: Ulid, _closure: Closure) -> Result<ParkingRecord, StoreError> {
        Err(StoreError::NotFound)
    }

    async fn list_current(&self) -> Result<Vec<ParkingRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn list_history(&self) -> Result<Vec<ParkingRecord>, StoreError> {
        Ok(Vec::new())
    }
}

fn car() -> VehicleType {
    VehicleType {
        id: Ulid::new(),
        name: "car".into(),
        hourly_rate: rate(1500),
        description: String::new(),
    }
}

async fn racing_engine(name: &str, car: &VehicleType, open: Option<ParkingRecord>) -> ParkingEngine {
    let rates = LotStore::open(&test_wal_path(name), Arc::new(NotifyHub::new())).unwrap();
    RateCatalog::insert(&rates, car).await.unwrap();
    ParkingEngine::new(Arc::new(RacingStore { open }), Arc::new(rates), Duration::from_secs(5))
}

#[tokio::test]
async fn entry_losing_the_plate_race_is_a_conflict() {
    let car = car();
    let engine = racing_engine("race_entry.wal", &car, None).await;
    assert_eq!(
        engine.record_entry("clerk", car.id, "RACE1").await,
        Err(EngineError::ActiveParkingAlreadyExists("RACE1".into()))
    );
}

#[tokio::test]
async fn exit_of_record_closed_meanwhile_is_not_found() {
    let car = car();
    let record = ParkingRecord::open(
        Ulid::new(),
        "clerk".into(),
        car.id,
        "RACE2".into(),
        truncate_to_second(now_ms()) - 30 * MINUTE_MS,
    );
    let engine = racing_engine("race_exit.wal", &car, Some(record.clone())).await;
    assert_eq!(
        engine.record_exit("clerk", "RACE2").await,
        Err(EngineError::ParkingRecordNotFound(record.id))
    );
}
