//! Per-request state, the handle correlation table, and the callback
//! handle filters use to resume or terminate a request.
//!
//! One `RequestState` exists per in-flight request, created on the first
//! header callback and removed when the engine signals destruction. Phases
//! for one request never run concurrently (the engine serializes them),
//! but they may be initiated from different engine worker threads, and
//! continuations arrive from arbitrary filter tasks, so everything here is
//! atomics and lock-free maps.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use trestle_filter_api::{
    DestroyReason, ErrorCategory, FilterCallbacks, FilterError, HttpFilter, LocalReply, Phase,
    StatusType,
};

use crate::engine::{EngineApi, FinalizeReason, RequestHandle};
use crate::recover;

/// Phase discriminant stored before the first callback.
const PHASE_UNINITIALIZED: i32 = 0;

pub(crate) struct RequestState {
    pub(crate) handle: RequestHandle,
    pub(crate) engine: Arc<dyn EngineApi>,
    /// Exactly one filter instance for the request's whole lifetime. Set
    /// once right after construction; `OnceLock` breaks the cycle between
    /// the state and the callback handle the factory needs.
    filter: OnceLock<Box<dyn HttpFilter>>,
    phase: AtomicI32,
    /// Terminal: a local reply was issued or the request was destroyed.
    /// Later phase callbacks and continuations become no-ops.
    finished: AtomicBool,
    local_reply_sent: AtomicBool,
    /// Set when a fault happened outside the execution window; touching
    /// the request further is unsafe, so no reply is attempted.
    no_reply: AtomicBool,
    safe_reply_in_progress: AtomicBool,
    /// Continuation already fired for the currently suspended phase.
    resumed: AtomicBool,
    destroy_hook_ran: AtomicBool,
    finalized: AtomicBool,
}

impl RequestState {
    pub(crate) fn new(handle: RequestHandle, engine: Arc<dyn EngineApi>) -> Arc<RequestState> {
        Arc::new(RequestState {
            handle,
            engine,
            filter: OnceLock::new(),
            phase: AtomicI32::new(PHASE_UNINITIALIZED),
            finished: AtomicBool::new(false),
            local_reply_sent: AtomicBool::new(false),
            no_reply: AtomicBool::new(false),
            safe_reply_in_progress: AtomicBool::new(false),
            resumed: AtomicBool::new(false),
            destroy_hook_ran: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        })
    }

    pub(crate) fn attach_filter(&self, filter: Box<dyn HttpFilter>) {
        if self.filter.set(filter).is_err() {
            warn!(handle = self.handle.0, "filter already attached, ignoring");
        }
    }

    pub(crate) fn filter(&self) -> Option<&dyn HttpFilter> {
        self.filter.get().map(|f| f.as_ref())
    }

    /// Record the phase the engine is driving and reset the per-phase
    /// continuation guard.
    pub(crate) fn enter_phase(&self, phase: Phase) {
        self.phase.store(phase.code(), Ordering::Release);
        self.resumed.store(false, Ordering::Release);
    }

    pub(crate) fn current_phase(&self) -> Option<Phase> {
        Phase::from_code(self.phase.load(Ordering::Acquire))
    }

    /// Validate that a view built for `expected` is still usable.
    pub(crate) fn check_phase(&self, expected: Phase) -> Result<(), FilterError> {
        if self.is_finished() {
            return Err(FilterError::RequestFinished);
        }
        match self.current_phase() {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => Err(FilterError::StaleView { expected, actual }),
            None => Err(FilterError::RequestFinished),
        }
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn set_no_reply(&self) {
        self.no_reply.store(true, Ordering::Release);
    }

    pub(crate) fn no_reply(&self) -> bool {
        self.no_reply.load(Ordering::Acquire)
    }

    pub(crate) fn enter_safe_reply(&self) -> bool {
        self.safe_reply_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn leave_safe_reply(&self) {
        self.safe_reply_in_progress.store(false, Ordering::Release);
    }

    /// Issue a terminal reply at most once per request. Returns whether
    /// this call won the race to send it.
    pub(crate) fn send_local_reply(&self, reply: &LocalReply) -> bool {
        if self
            .local_reply_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(
                handle = self.handle.0,
                "terminal reply already sent, rejecting another"
            );
            return false;
        }
        if let Err(error) = self.engine.send_local_reply(self.handle, reply) {
            match error.category() {
                ErrorCategory::ProtocolRace => {
                    trace!(handle = self.handle.0, %error, "local reply lost race with engine")
                }
                _ => warn!(handle = self.handle.0, %error, "local reply rejected by engine"),
            }
        }
        self.mark_finished();
        true
    }

    /// Run the filter's destroy hook, exactly once, with the reason
    /// passed through unchanged. A panic in the hook must not stop
    /// finalization.
    pub(crate) fn run_destroy_hook(&self, reason: DestroyReason) {
        if self
            .destroy_hook_ran
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(filter) = self.filter() {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                filter.on_destroy(reason)
            }));
            if let Err(payload) = outcome {
                warn!(
                    handle = self.handle.0,
                    panic = %recover::panic_message(payload.as_ref()),
                    "filter destroy hook panicked"
                );
            }
        }
    }

    /// Drop this state without releasing native resources. Used for a
    /// state that lost the registration race and never owned the handle.
    pub(crate) fn disarm(&self) {
        self.finalized.store(true, Ordering::Release);
    }

    /// Release native resources, exactly once, whichever path gets here
    /// first.
    pub(crate) fn finalize_once(&self, reason: FinalizeReason) {
        if self
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.engine.finalize(self.handle, reason);
        }
    }
}

impl Drop for RequestState {
    fn drop(&mut self) {
        // Fallback release for states that never saw an explicit destroy
        // callback. A no-op when the normal path already ran.
        self.finalize_once(FinalizeReason::GcSweep);
    }
}

/// Concurrency-safe map from engine request handle to request state.
/// At most one entry per handle.
pub struct RequestTable {
    map: DashMap<RequestHandle, Arc<RequestState>>,
}

impl RequestTable {
    pub(crate) fn new() -> RequestTable {
        RequestTable {
            map: DashMap::new(),
        }
    }

    /// Register a state for its handle. A duplicate handle is a protocol
    /// violation by the engine and is surfaced, never overwritten.
    pub(crate) fn insert(&self, state: Arc<RequestState>) -> Result<(), FilterError> {
        match self.map.entry(state.handle) {
            Entry::Occupied(_) => Err(FilterError::DuplicateHandle {
                handle: state.handle.0,
            }),
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, handle: RequestHandle) -> Option<Arc<RequestState>> {
        self.map.get(&handle).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, handle: RequestHandle) -> Option<Arc<RequestState>> {
        self.map.remove(&handle).map(|(_, state)| state)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The [`FilterCallbacks`] handle given to each filter instance.
pub(crate) struct RequestCallbacks(pub(crate) Arc<RequestState>);

impl FilterCallbacks for RequestCallbacks {
    fn continue_request(&self, status: StatusType) {
        let state = &self.0;
        if status == StatusType::LocalReply {
            warn!(
                handle = state.handle.0,
                "LocalReply status is useless in a continuation, ignoring"
            );
            return;
        }
        if state.is_finished() {
            // The engine moved on; a late resume is a harmless signal.
            debug!(handle = state.handle.0, "late continuation ignored");
            return;
        }
        if state.resumed.swap(true, Ordering::AcqRel) {
            warn!(
                handle = state.handle.0,
                "duplicate continuation for this phase rejected"
            );
            return;
        }
        if let Err(error) = state.engine.continue_request(state.handle, status.code()) {
            recover::handle_fault(state, error);
        }
    }

    fn send_local_reply(&self, reply: LocalReply) {
        if self.0.is_finished() {
            debug!(handle = self.0.handle.0, "late terminal reply ignored");
            return;
        }
        self.0.send_local_reply(&reply);
    }

    fn handle_fault(&self, error: FilterError) {
        recover::handle_fault(&self.0, error);
    }

    fn route_name(&self) -> Result<String, FilterError> {
        self.0.engine.route_name(self.0.handle)
    }

    fn get_dynamic_metadata(&self, filter_name: &str) -> Result<serde_json::Value, FilterError> {
        self.0.engine.get_dynamic_metadata(self.0.handle, filter_name)
    }

    fn set_dynamic_metadata(
        &self,
        filter_name: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), FilterError> {
        self.0
            .engine
            .set_dynamic_metadata(self.0.handle, filter_name, key, &value)
    }
}
