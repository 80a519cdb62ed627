//! Collaborator contracts consumed by the parking engine and the staff
//! directory, and the lot store that implements them.

mod lot;
mod writer;

pub use lot::LotStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Closure, ParkingRecord, UserAccount, VehicleType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    /// The plate already has an open record.
    OpenRecordExists(String),
    /// Another vehicle type or account already uses this name.
    NameTaken(String),
    /// Still referenced by parking records.
    InUse,
    /// The collection is at its size cap.
    LimitReached(&'static str),
    /// Rejected input that should have been validated upstream.
    Invalid(&'static str),
    /// The log could not be written, or a commit task died.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "not found"),
            StoreError::OpenRecordExists(plate) => write!(f, "open record already exists for plate {plate}"),
            StoreError::NameTaken(name) => write!(f, "name already taken: {name}"),
            StoreError::InUse => write!(f, "still referenced by parking records"),
            StoreError::LimitReached(what) => write!(f, "limit reached: {what}"),
            StoreError::Invalid(msg) => write!(f, "invalid: {msg}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence for parking records.
///
/// Implementations own the one-open-record-per-plate invariant: `create_entry`
/// must be a serialized check-and-insert per plate, and `update_exit` must
/// only close the record if it is still the open record of its plate.
#[async_trait]
pub trait ParkingStore: Send + Sync {
    /// Insert an open record. `OpenRecordExists` if the plate is occupied.
    async fn create_entry(&self, record: &ParkingRecord) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: Ulid) -> Result<ParkingRecord, StoreError>;

    /// The open record for a plate, if any (`NotFound` otherwise).
    async fn find_open_by_license_plate(&self, plate: &str) -> Result<ParkingRecord, StoreError>;

    /// Close the open record `id`. `NotFound` when no such record is open any more.
    async fn update_exit(&self, id: Ulid, closure: Closure) -> Result<ParkingRecord, StoreError>;

    /// Open records, most recent entry first.
    async fn list_current(&self) -> Result<Vec<ParkingRecord>, StoreError>;

    /// Closed records, most recent exit first.
    async fn list_history(&self) -> Result<Vec<ParkingRecord>, StoreError>;
}

/// Vehicle types and their hourly rates.
#[async_trait]
pub trait RateCatalog: Send + Sync {
    async fn find_by_id(&self, id: Ulid) -> Result<VehicleType, StoreError>;

    /// All types, ordered by name.
    async fn list_all(&self) -> Result<Vec<VehicleType>, StoreError>;

    /// `NameTaken` on a case-insensitive name clash, `LimitReached` once the
    /// catalog holds `MAX_VEHICLE_TYPES` types.
    async fn insert(&self, vehicle_type: &VehicleType) -> Result<(), StoreError>;

    /// `NotFound` for an unknown id, `NameTaken` if the new name belongs to another type.
    async fn update(&self, vehicle_type: &VehicleType) -> Result<(), StoreError>;

    /// `InUse` while any parking record, open or closed, points at the type.
    async fn delete(&self, id: Ulid) -> Result<(), StoreError>;
}

/// Staff accounts. Usernames are unique and compared exactly.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: Ulid) -> Result<UserAccount, StoreError>;

    async fn find_user_by_username(&self, username: &str) -> Result<UserAccount, StoreError>;

    /// All accounts, ordered by username.
    async fn list_users(&self) -> Result<Vec<UserAccount>, StoreError>;

    /// `NameTaken` if the username is in use, `LimitReached` at `MAX_USERS` accounts.
    async fn insert_user(&self, user: &UserAccount) -> Result<(), StoreError>;

    /// Replace the account with `user.id`. `NotFound` for an unknown id,
    /// `NameTaken` if the username belongs to another account.
    async fn update_user(&self, user: &UserAccount) -> Result<(), StoreError>;

    async fn delete_user(&self, id: Ulid) -> Result<(), StoreError>;
}
