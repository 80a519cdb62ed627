use rust_decimal::Decimal;
use tracing::info;
use ulid::Ulid;

use crate::limits::MAX_HOURLY_RATE;
use crate::model::*;
use crate::store::StoreError;

use super::{internal, EngineError, ParkingEngine};

/// Catalog seeded into an empty lot: `(name, hourly rate, description)`.
pub fn default_catalog() -> Vec<(&'static str, Decimal, &'static str)> {
    vec![
        ("car", Decimal::new(1500, 2), "Cars, vans and pickups"),
        ("motorcycle", Decimal::ZERO, "Motorcycles and scooters, fee-exempt"),
        ("bicycle", Decimal::ZERO, "Bicycles, fee-exempt"),
    ]
}

fn check_rate(rate: Decimal) -> Result<(), EngineError> {
    let negative = rate.is_sign_negative() && !rate.is_zero();
    if negative || rate > Decimal::from(MAX_HOURLY_RATE) {
        return Err(EngineError::InvalidRate(rate));
    }
    Ok(())
}

impl ParkingEngine {
    pub async fn list_vehicle_types(&self) -> Result<Vec<VehicleType>, EngineError> {
        self.bounded("list_vehicle_types", self.rates.list_all())
            .await?
            .map_err(|e| internal("listing vehicle types", e))
    }

    pub async fn create_vehicle_type(
        &self,
        name: &str,
        hourly_rate: Decimal,
        description: &str,
    ) -> Result<VehicleType, EngineError> {
        check_rate(hourly_rate)?;

        let vehicle_type = VehicleType {
            id: Ulid::new(),
            name: name.trim().to_string(),
            hourly_rate,
            description: description.trim().to_string(),
        };
        match self.bounded("insert_vehicle_type", self.rates.insert(&vehicle_type)).await? {
            Ok(()) => {}
            Err(StoreError::NameTaken(name)) => return Err(EngineError::VehicleTypeNameExists(name)),
            Err(StoreError::LimitReached(what)) => return Err(EngineError::LimitExceeded(what)),
            Err(e) => return Err(internal("saving vehicle type", e)),
        }
        info!("vehicle type {} created: {} at {}/h", vehicle_type.id, vehicle_type.name, vehicle_type.hourly_rate);
        Ok(vehicle_type)
    }

    /// Replace name, rate and description. Open stays are charged the new rate when they exit.
    pub async fn update_vehicle_type(
        &self,
        id: Ulid,
        name: &str,
        hourly_rate: Decimal,
        description: &str,
    ) -> Result<VehicleType, EngineError> {
        check_rate(hourly_rate)?;
        let vehicle_type = VehicleType {
            id,
            name: name.trim().to_string(),
            hourly_rate,
            description: description.trim().to_string(),
        };
        match self.bounded("update_vehicle_type", self.rates.update(&vehicle_type)).await? {
            Ok(()) => {}
            Err(StoreError::NotFound) => return Err(EngineError::VehicleTypeNotFound(id)),
            Err(StoreError::NameTaken(name)) => return Err(EngineError::VehicleTypeNameExists(name)),
            Err(e) => return Err(internal("updating vehicle type", e)),
        }
        info!("vehicle type {id} updated: {} at {}/h", vehicle_type.name, vehicle_type.hourly_rate);
        Ok(vehicle_type)
    }

    pub async fn delete_vehicle_type(&self, id: Ulid) -> Result<(), EngineError> {
        match self.bounded("delete_vehicle_type", self.rates.delete(id)).await? {
            Ok(()) => {
                info!("vehicle type {id} deleted");
                Ok(())
            }
            Err(StoreError::NotFound) => Err(EngineError::VehicleTypeNotFound(id)),
            Err(StoreError::InUse) => Err(EngineError::VehicleTypeInUse(id)),
            Err(e) => Err(internal("deleting vehicle type", e)),
        }
    }

    /// Create the default catalog if the lot has no vehicle types yet.
    /// Returns how many types were created.
    pub async fn seed_default_catalog(&self) -> Result<usize, EngineError> {
        if !self.list_vehicle_types().await?.is_empty() {
            return Ok(0);
        }
        let defaults = default_catalog();
        let count = defaults.len();
        for (name, rate, description) in defaults {
            self.create_vehicle_type(name, rate, description).await?;
        }
        Ok(count)
    }
}
