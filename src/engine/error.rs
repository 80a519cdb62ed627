use rust_decimal::Decimal;
use ulid::Ulid;

use crate::limits::MAX_HOURLY_RATE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The plate already has an open record.
    ActiveParkingAlreadyExists(String),
    /// Exit requested for a plate with no open record.
    ActiveParkingNotFound(String),
    VehicleTypeNotFound(Ulid),
    /// The record is gone, or was closed by a concurrent exit.
    ParkingRecordNotFound(Ulid),
    VehicleTypeNameExists(String),
    VehicleTypeInUse(Ulid),
    InvalidRate(Decimal),
    LimitExceeded(&'static str),
    /// A collaborator call did not finish within the engine's timeout.
    Timeout(&'static str),
    /// Unexpected collaborator failure or broken data. Detail is for logs only.
    Internal(String),
}

impl EngineError {
    /// Expected outcome of a valid request hitting a business rule.
    pub fn is_domain(&self) -> bool {
        !matches!(self, EngineError::Timeout(_) | EngineError::Internal(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ActiveParkingAlreadyExists(plate) => {
                write!(f, "an open parking record already exists for plate {plate}")
            }
            EngineError::ActiveParkingNotFound(plate) => {
                write!(f, "no open parking record for plate {plate}")
            }
            EngineError::VehicleTypeNotFound(id) => write!(f, "vehicle type not found: {id}"),
            EngineError::ParkingRecordNotFound(id) => write!(f, "parking record not found: {id}"),
            EngineError::VehicleTypeNameExists(name) => {
                write!(f, "vehicle type name already exists: {name}")
            }
            EngineError::VehicleTypeInUse(id) => {
                write!(f, "vehicle type {id} is referenced by parking records")
            }
            EngineError::InvalidRate(rate) => {
                write!(f, "hourly rate must be between 0 and {MAX_HOURLY_RATE}: {rate}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Timeout(op) => write!(f, "timed out during {op}"),
            EngineError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
