//! Fault classification and recovery.
//!
//! Every filter invocation runs under this guard. Protocol races are
//! swallowed (the engine already handled them on its side), out-of-window
//! faults flag the request as untouchable, and everything else produces
//! exactly one terminal 500 reply. A further fault while that safe reply
//! is being attempted is fatal and is never retried.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use trestle_filter_api::{
    ErrorCategory, FilterError, FilterResult, LocalReply, Phase, StatusType,
};

use crate::request::RequestState;

/// Body and detail string of the safe reply, fixed so operators can
/// recognize bridge-recovered faults.
pub(crate) const SAFE_REPLY_BODY: &str = "error happened in filter\r\n";
pub(crate) const SAFE_REPLY_DETAILS: &str = "filter_fault";

/// Run one filter phase method under the recovery guard and translate the
/// outcome into the status reported to the engine.
pub(crate) fn invoke_guarded<F>(state: &Arc<RequestState>, phase: Phase, call: F) -> StatusType
where
    F: FnOnce() -> FilterResult,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(status)) => {
            if status == StatusType::LocalReply {
                // The filter already issued a terminal reply; later phase
                // callbacks for this request become no-ops.
                state.mark_finished();
            }
            status
        }
        Ok(Err(error)) => {
            handle_fault(state, error);
            StatusType::LocalReply
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            handle_fault(
                state,
                FilterError::fault(format!("panic in {phase}: {message}")),
            );
            StatusType::LocalReply
        }
    }
}

/// Classify a fault and drive the matching recovery path. Also reachable
/// from filter tasks via `FilterCallbacks::handle_fault`.
pub(crate) fn handle_fault(state: &Arc<RequestState>, error: FilterError) {
    match error.category() {
        ErrorCategory::ProtocolRace => match error {
            FilterError::NotInWindow => {
                // The engine moved past this request on its own thread;
                // replying now would touch memory it may have reused.
                state.set_no_reply();
                warn!(handle = state.handle.0, %error, "fault outside execution window, no reply attempted");
            }
            _ => {
                trace!(handle = state.handle.0, %error, "request lifecycle race, swallowed");
            }
        },
        ErrorCategory::ContractViolation | ErrorCategory::FilterFault => {
            error!(handle = state.handle.0, %error, category = ?error.category(), "filter fault");
            if state.is_finished() {
                // The request was already terminated or destroyed; a fault
                // from leftover filter work is a harmless late signal.
                debug!(handle = state.handle.0, "fault after request finished, no reply needed");
                return;
            }
            if state.no_reply() {
                warn!(
                    handle = state.handle.0,
                    "request is outside the execution window, dropping safe reply"
                );
                return;
            }
            if !state.enter_safe_reply() {
                // A fault fired while the safe reply was already being
                // attempted. Retrying risks an infinite fault loop.
                error!(
                    handle = state.handle.0,
                    "fatal: fault while sending the safe reply, not retrying"
                );
                return;
            }
            let reply = LocalReply::new(500)
                .with_body(SAFE_REPLY_BODY)
                .with_details(SAFE_REPLY_DETAILS);
            state.send_local_reply(&reply);
            state.mark_finished();
            state.leave_safe_reply();
        }
    }
}

/// Best-effort extraction of a panic payload message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineApi, RequestHandle};
    use crate::mock::MockEngine;

    fn state_on(engine: &Arc<MockEngine>, handle: usize) -> Arc<RequestState> {
        let handle = RequestHandle(handle);
        engine.add_request(handle);
        RequestState::new(handle, Arc::clone(engine) as Arc<dyn EngineApi>)
    }

    #[test]
    fn fault_produces_one_safe_reply() {
        let engine = Arc::new(MockEngine::new());
        let state = state_on(&engine, 1);
        state.enter_phase(Phase::DecodeData);

        handle_fault(&state, FilterError::fault("boom"));
        handle_fault(&state, FilterError::fault("boom again"));

        let replies = engine.local_replies(RequestHandle(1));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status_code, 500);
        assert_eq!(replies[0].details, SAFE_REPLY_DETAILS);
        assert!(state.is_finished());
    }

    #[test]
    fn races_are_swallowed_without_reply() {
        let engine = Arc::new(MockEngine::new());
        let state = state_on(&engine, 2);

        handle_fault(&state, FilterError::RequestFinished);
        handle_fault(&state, FilterError::FilterDestroyed);

        assert!(engine.local_replies(RequestHandle(2)).is_empty());
        assert!(!state.is_finished());
    }

    #[test]
    fn fault_after_request_finished_sends_nothing() {
        let engine = Arc::new(MockEngine::new());
        let state = state_on(&engine, 6);

        state.mark_finished();
        handle_fault(&state, FilterError::fault("leftover worker failed"));

        assert!(engine.local_replies(RequestHandle(6)).is_empty());
    }

    #[test]
    fn out_of_window_fault_blocks_later_replies() {
        let engine = Arc::new(MockEngine::new());
        let state = state_on(&engine, 3);

        handle_fault(&state, FilterError::NotInWindow);
        handle_fault(&state, FilterError::fault("too late"));

        assert!(engine.local_replies(RequestHandle(3)).is_empty());
    }

    #[test]
    fn guard_converts_panics_into_the_safe_reply() {
        let engine = Arc::new(MockEngine::new());
        let state = state_on(&engine, 4);
        state.enter_phase(Phase::DecodeHeader);

        let status = invoke_guarded(&state, Phase::DecodeHeader, || {
            panic!("filter exploded")
        });

        assert_eq!(status, StatusType::LocalReply);
        let replies = engine.local_replies(RequestHandle(4));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status_code, 500);
    }

    #[test]
    fn guard_marks_request_finished_on_filter_local_reply() {
        let engine = Arc::new(MockEngine::new());
        let state = state_on(&engine, 5);
        state.enter_phase(Phase::DecodeHeader);

        let status = invoke_guarded(&state, Phase::DecodeHeader, || Ok(StatusType::LocalReply));

        assert_eq!(status, StatusType::LocalReply);
        assert!(state.is_finished());
    }
}
