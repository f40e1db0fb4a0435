//! Errors surfaced by exchange collaborators.

use thiserror::Error;

/// Why a venue refused an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Price moved past the limit / post-only would cross.
    StalePrice,
    /// Size below minimum or misaligned with the increment.
    InvalidSize,
    InsufficientMargin,
    Other,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// Network or venue-side transient failure; safe to retry with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("order rejected ({reason:?}): {message}")]
    Rejected {
        reason: RejectReason,
        message: String,
    },

    #[error("timed out after {0}s waiting for the venue")]
    Timeout(u64),

    #[error("client not connected")]
    NotConnected,

    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transport(_) | ExchangeError::NotConnected)
    }

    pub fn is_stale_price(&self) -> bool {
        matches!(
            self,
            ExchangeError::Rejected {
                reason: RejectReason::StalePrice,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(ExchangeError::Transport("reset".into()).is_transient());
        assert!(!ExchangeError::Timeout(5).is_transient());

        let stale = ExchangeError::Rejected {
            reason: RejectReason::StalePrice,
            message: "post-only would cross".into(),
        };
        assert!(stale.is_stale_price());
        assert!(!stale.is_transient());
    }
}
