mod catalog;
mod charge;
mod error;
mod lifecycle;
mod queries;
#[cfg(test)]
mod tests;

pub use catalog::default_catalog;
pub use charge::{calculate_charge, ChargeOverflow};
pub use error::EngineError;

pub(crate) use charge::now_ms;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::observability;
use crate::store::{ParkingStore, RateCatalog, StoreError};

/// The parking lifecycle engine: entry/exit transitions, fee computation and
/// catalog rules.
///
/// Holds no mutable state of its own. Everything lives behind the injected
/// collaborators, so one engine is built at startup and shared across all
/// connections.
pub struct ParkingEngine {
    records: Arc<dyn ParkingStore>,
    rates: Arc<dyn RateCatalog>,
    /// Upper bound on every single collaborator call.
    timeout: Duration,
}

impl ParkingEngine {
    pub fn new(records: Arc<dyn ParkingStore>, rates: Arc<dyn RateCatalog>, timeout: Duration) -> Self {
        Self { records, rates, timeout }
    }

    /// Run one collaborator call under the engine timeout. The outer error is
    /// the timeout; the inner result is the collaborator's own answer.
    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<Result<T, StoreError>, EngineError> {
        tokio::time::timeout(self.timeout, call).await.map_err(|_| {
            tracing::warn!("{op} did not finish within {:?}", self.timeout);
            metrics::counter!(observability::STORE_TIMEOUTS_TOTAL, "op" => op).increment(1);
            EngineError::Timeout(op)
        })
    }
}

/// Log an unexpected collaborator failure and wrap it.
fn internal(context: &str, err: impl std::fmt::Display) -> EngineError {
    tracing::error!("{context}: {err}");
    EngineError::Internal(format!("{context}: {err}"))
}
