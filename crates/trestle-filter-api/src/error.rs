//! Error taxonomy shared by the bridge and filter code.
//!
//! Every failure falls into one of three categories, and the recovery path
//! differs per category: protocol races are swallowed, contract violations
//! and filter faults produce exactly one terminal 500 reply.

use thiserror::Error;

use crate::types::Phase;

/// The three recovery categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Expected races against the engine's own lifecycle (request already
    /// finished, filter destroyed, call landed outside the valid window).
    /// Swallowed at low severity.
    ProtocolRace,
    /// A caller or filter bug: duplicate handle registration, unknown
    /// config id, a view used after its phase ended.
    ContractViolation,
    /// Any other uncaught failure from filter logic.
    FilterFault,
}

/// An error surfaced by a view, a callback handle, or filter logic itself.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The engine already finished this request.
    #[error("request already finished")]
    RequestFinished,

    /// The engine already destroyed the filter for this request.
    #[error("filter already destroyed")]
    FilterDestroyed,

    /// The call happened outside the accepted execution window; the engine
    /// has moved past this request and it is unsafe to touch it further.
    #[error("call outside the accepted execution window")]
    NotInWindow,

    /// The engine rejected the call as invalid for the current phase.
    #[error("engine rejected call as invalid for the current phase")]
    InvalidPhase,

    /// A second request state was registered for a handle that already has
    /// one. Indicates a protocol violation by the engine.
    #[error("duplicate request handle {handle:#x}")]
    DuplicateHandle { handle: usize },

    /// A config id was looked up after destruction, or never existed.
    #[error("unknown config id {0}")]
    UnknownConfig(u64),

    /// A view built for one phase was used after the request advanced past
    /// it; the underlying native memory may already be reused.
    #[error("view for phase {expected} used while request is in {actual}")]
    StaleView { expected: Phase, actual: Phase },

    /// An application-level failure inside filter logic.
    #[error("filter fault: {0}")]
    Fault(#[from] anyhow::Error),
}

impl FilterError {
    /// Classify this error for the recovery guard.
    pub fn category(&self) -> ErrorCategory {
        match self {
            FilterError::RequestFinished
            | FilterError::FilterDestroyed
            | FilterError::NotInWindow => ErrorCategory::ProtocolRace,
            FilterError::DuplicateHandle { .. }
            | FilterError::UnknownConfig(_)
            | FilterError::StaleView { .. } => ErrorCategory::ContractViolation,
            FilterError::InvalidPhase | FilterError::Fault(_) => ErrorCategory::FilterFault,
        }
    }

    /// Shorthand for an application fault with a message.
    pub fn fault(msg: impl Into<String>) -> FilterError {
        FilterError::Fault(anyhow::anyhow!(msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn races_are_protocol_races() {
        assert_eq!(
            FilterError::RequestFinished.category(),
            ErrorCategory::ProtocolRace
        );
        assert_eq!(
            FilterError::FilterDestroyed.category(),
            ErrorCategory::ProtocolRace
        );
        assert_eq!(
            FilterError::NotInWindow.category(),
            ErrorCategory::ProtocolRace
        );
    }

    #[test]
    fn caller_bugs_are_contract_violations() {
        assert_eq!(
            FilterError::DuplicateHandle { handle: 0x1 }.category(),
            ErrorCategory::ContractViolation
        );
        assert_eq!(
            FilterError::UnknownConfig(42).category(),
            ErrorCategory::ContractViolation
        );
        assert_eq!(
            FilterError::StaleView {
                expected: Phase::DecodeHeader,
                actual: Phase::DecodeData,
            }
            .category(),
            ErrorCategory::ContractViolation
        );
    }

    #[test]
    fn everything_else_is_a_filter_fault() {
        assert_eq!(
            FilterError::fault("boom").category(),
            ErrorCategory::FilterFault
        );
        assert_eq!(
            FilterError::InvalidPhase.category(),
            ErrorCategory::FilterFault
        );
    }
}
