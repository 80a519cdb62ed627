use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::store::StoreError;

use super::charge::{calculate_charge, now_ms};
use super::{internal, EngineError, ParkingEngine};

impl ParkingEngine {
    /// Open a stay for `license_plate`.
    ///
    /// The lookup below is only a fast path; two concurrent entries can both
    /// pass it. The store's per-plate check-and-insert is what actually admits
    /// one of them, and its rejection is reported the same way.
    pub async fn record_entry(
        &self,
        user_id: &str,
        vehicle_type_id: Ulid,
        license_plate: &str,
    ) -> Result<ParkingRecord, EngineError> {
        match self
            .bounded("find_open_by_license_plate", self.records.find_open_by_license_plate(license_plate))
            .await?
        {
            Ok(_) => return Err(EngineError::ActiveParkingAlreadyExists(license_plate.to_string())),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(internal("checking for an open record", e)),
        }

        match self.bounded("find_vehicle_type", self.rates.find_by_id(vehicle_type_id)).await? {
            Ok(_) => {}
            Err(StoreError::NotFound) => return Err(EngineError::VehicleTypeNotFound(vehicle_type_id)),
            Err(e) => return Err(internal("looking up vehicle type", e)),
        }

        let record = ParkingRecord::open(
            Ulid::new(),
            user_id.to_string(),
            vehicle_type_id,
            license_plate.to_string(),
            truncate_to_second(now_ms()),
        );

        match self.bounded("create_entry", self.records.create_entry(&record)).await? {
            Ok(()) => {}
            Err(StoreError::OpenRecordExists(_)) => {
                return Err(EngineError::ActiveParkingAlreadyExists(license_plate.to_string()));
            }
            Err(e) => return Err(internal("saving entry", e)),
        }

        info!("entry {} plate={} by {user_id}", record.id, record.license_plate);
        metrics::counter!(observability::ENTRIES_TOTAL).increment(1);
        Ok(record)
    }

    /// Close the open stay for `license_plate`, charging the vehicle type's
    /// current rate.
    pub async fn record_exit(&self, user_id: &str, license_plate: &str) -> Result<ParkingRecord, EngineError> {
        let record = match self
            .bounded("find_open_by_license_plate", self.records.find_open_by_license_plate(license_plate))
            .await?
        {
            Ok(r) => r,
            Err(StoreError::NotFound) => {
                return Err(EngineError::ActiveParkingNotFound(license_plate.to_string()));
            }
            Err(e) => return Err(internal("looking up open record", e)),
        };

        // The type was validated at entry. If it is gone now the data is broken,
        // which is not something the caller can fix.
        let vehicle_type = match self
            .bounded("find_vehicle_type", self.rates.find_by_id(record.vehicle_type_id))
            .await?
        {
            Ok(vt) => vt,
            Err(StoreError::NotFound) => {
                return Err(internal(
                    "resolving hourly rate",
                    format!("vehicle type {} of record {} no longer exists", record.vehicle_type_id, record.id),
                ));
            }
            Err(e) => return Err(internal("resolving hourly rate", e)),
        };

        let exit_instant = now_ms();
        let (calculated_hours, total_charge) =
            calculate_charge(record.entry_time, exit_instant, vehicle_type.hourly_rate)
                .map_err(|e| internal("computing charge", format!("record {}: {e}", record.id)))?;
        let closure = Closure {
            exit_time: truncate_to_second(exit_instant),
            total_charge,
            calculated_hours,
        };

        let closed = match self.bounded("update_exit", self.records.update_exit(record.id, closure)).await? {
            Ok(closed) => closed,
            Err(StoreError::NotFound) => return Err(EngineError::ParkingRecordNotFound(record.id)),
            Err(e) => return Err(internal("saving exit", e)),
        };

        info!(
            "exit {} plate={} by {user_id}: {calculated_hours}h, charge {total_charge}",
            closed.id, closed.license_plate
        );
        metrics::counter!(observability::EXITS_TOTAL).increment(1);
        Ok(closed)
    }
}
