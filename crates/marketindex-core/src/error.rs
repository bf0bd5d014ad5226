//! Error types for the marketindex pipeline.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors that can occur while indexing chains or mutating marketplace state.
#[derive(Debug, Error)]
pub enum MarketError {
    /// A chain read failed transiently (RPC timeout, rate limit). The poll
    /// scheduler retries the same window on its next tick.
    #[error("source unavailable: {reason}")]
    SourceUnavailable { reason: String },

    /// A referenced entity does not exist. Surfaced to the caller, not retried.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A precondition was violated (wrong listing type, wrong status, stale
    /// action). Surfaced to the caller, not retried.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Bid does not exceed the listing's current price.
    #[error("bid {amount} does not exceed current price {current}")]
    BidTooLow { amount: Decimal, current: Decimal },

    /// An optimistic write batch lost a race with a concurrent mutation.
    /// Retried internally with bounded backoff before surfacing.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// An event is missing expected fields. Logged and skipped; never fails
    /// a batch.
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl MarketError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Returns `true` if the error is transient and worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::SourceUnavailable { .. })
    }

    /// Returns `true` if the caller sent a bad request (the 4xx-equivalent
    /// half of the taxonomy); everything else is service-side.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::InvalidState(_) | Self::BidTooLow { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(MarketError::Conflict("version".into()).is_transient());
        assert!(MarketError::SourceUnavailable { reason: "timeout".into() }.is_transient());
        assert!(!MarketError::not_found("listing", "0xabc").is_transient());
    }

    #[test]
    fn caller_error_classification() {
        assert!(MarketError::not_found("listing", "0xabc").is_caller_error());
        assert!(MarketError::InvalidState("not active".into()).is_caller_error());
        assert!(!MarketError::Storage("io".into()).is_caller_error());
        assert!(!MarketError::Conflict("version".into()).is_caller_error());
    }
}
