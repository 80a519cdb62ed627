use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const SECOND_MS: Ms = 1_000;
pub const MINUTE_MS: Ms = 60 * SECOND_MS;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Drop the sub-second part of a timestamp. Stored entry/exit times are always whole seconds.
pub fn truncate_to_second(t: Ms) -> Ms {
    t - t.rem_euclid(SECOND_MS)
}

/// Everything that is known about a stay once the vehicle has left.
/// The three fields only ever exist together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub exit_time: Ms,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_charge: Decimal,
    pub calculated_hours: u32,
}

/// Open while the vehicle is inside the lot, closed exactly once on exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stay {
    Open,
    Closed(Closure),
}

/// One vehicle's stay in the lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkingRecord {
    pub id: Ulid,
    /// Staff member who recorded the entry.
    pub user_id: String,
    pub vehicle_type_id: Ulid,
    pub license_plate: String,
    pub entry_time: Ms,
    pub stay: Stay,
}

impl ParkingRecord {
    pub fn open(id: Ulid, user_id: String, vehicle_type_id: Ulid, license_plate: String, entry_time: Ms) -> Self {
        Self {
            id,
            user_id,
            vehicle_type_id,
            license_plate,
            entry_time,
            stay: Stay::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.stay, Stay::Open)
    }

    pub fn closure(&self) -> Option<&Closure> {
        match &self.stay {
            Stay::Open => None,
            Stay::Closed(c) => Some(c),
        }
    }

    pub fn exit_time(&self) -> Option<Ms> {
        self.closure().map(|c| c.exit_time)
    }
}

/// Rate-catalog entry. An hourly rate of zero marks a fee-exempt category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleType {
    pub id: Ulid,
    pub name: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub hourly_rate: Decimal,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Common,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Common => "common",
        }
    }
}

/// A staff account. Inactive accounts are kept but cannot log in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: Ulid,
    pub username: String,
    pub password: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: Ms,
}

/// The event types, flat with no nesting. This is the WAL record format and
/// what the notify hub broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    VehicleTypeCreated { vehicle_type: VehicleType },
    VehicleTypeUpdated { vehicle_type: VehicleType },
    VehicleTypeDeleted { id: Ulid },
    /// Carries the full record. Compaction rewrites closed records through this
    /// variant too, so replay must not assume `Stay::Open`.
    EntryRecorded { record: ParkingRecord },
    ExitRecorded { id: Ulid, closure: Closure },
    UserCreated { user: UserAccount },
    UserUpdated { user: UserAccount },
    UserDeleted { id: Ulid },
}
