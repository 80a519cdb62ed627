use ulid::Ulid;

use crate::model::*;
use crate::store::StoreError;

use super::{internal, EngineError, ParkingEngine};

impl ParkingEngine {
    /// Vehicles inside the lot, most recent entry first.
    pub async fn currently_parked(&self) -> Result<Vec<ParkingRecord>, EngineError> {
        self.bounded("list_current", self.records.list_current())
            .await?
            .map_err(|e| internal("listing current records", e))
    }

    /// Closed stays, most recent exit first.
    pub async fn history(&self) -> Result<Vec<ParkingRecord>, EngineError> {
        self.bounded("list_history", self.records.list_history())
            .await?
            .map_err(|e| internal("listing history", e))
    }

    pub async fn record_by_id(&self, id: Ulid) -> Result<ParkingRecord, EngineError> {
        match self.bounded("find_record", self.records.find_by_id(id)).await? {
            Ok(record) => Ok(record),
            Err(StoreError::NotFound) => Err(EngineError::ParkingRecordNotFound(id)),
            Err(e) => Err(internal("looking up record", e)),
        }
    }
}
