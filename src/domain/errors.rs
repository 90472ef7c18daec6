use thiserror::Error;

use crate::infrastructure::broker::BrokerError;
use crate::persistence::DatabaseError;

/// Application-level error unifying the layers below it.
///
/// Event handlers log these and return; reconciliation converges whatever an
/// abandoned event left behind.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("missing fill data: {0}")]
    MissingFillData(String),
}
