//! The phase state machine driving filter invocations.
//!
//! One [`Bridge`] instance owns the config registry and the request
//! correlation table and receives every engine callback. It reconstructs
//! the per-request context, builds the phase-tagged views, invokes the
//! matching filter method under the recovery guard, and hands the
//! resulting status code back to the engine.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use trestle_filter_api::{
    ConfigParser, DestroyReason, FilterCallbacks, FilterError, FilterFactory, Phase, StatusType,
};

use crate::buffer::BufferView;
use crate::config::ConfigRegistry;
use crate::engine::{EngineApi, FinalizeReason, RequestHandle};
use crate::headers::HeaderView;
use crate::recover::{self, SAFE_REPLY_BODY, SAFE_REPLY_DETAILS};
use crate::request::{RequestCallbacks, RequestState, RequestTable};

/// What the engine tells us about a request on every callback: its opaque
/// handle, the config id resolved for the matched route, and the phase
/// being driven.
#[derive(Debug, Clone, Copy)]
pub struct RequestDescriptor {
    pub handle: RequestHandle,
    pub config_id: u64,
    pub phase: i32,
}

pub struct Bridge {
    engine: Arc<dyn EngineApi>,
    configs: ConfigRegistry,
    requests: RequestTable,
    factory: Arc<dyn FilterFactory>,
}

impl Bridge {
    pub fn new(
        engine: Arc<dyn EngineApi>,
        factory: Arc<dyn FilterFactory>,
        parser: Option<Arc<dyn ConfigParser>>,
    ) -> Bridge {
        Bridge {
            engine,
            configs: ConfigRegistry::new(parser),
            requests: RequestTable::new(),
            factory,
        }
    }

    /// The request correlation table, exposed for lifecycle assertions.
    pub fn requests(&self) -> &RequestTable {
        &self.requests
    }

    /// Parse and store a config payload. Returns `0` (never a valid id)
    /// on malformed input.
    pub fn new_config(&self, raw: &[u8]) -> u64 {
        match self.configs.parse(raw) {
            Ok(id) => {
                debug!(config_id = id, bytes = raw.len(), "stored filter config");
                id
            }
            Err(error) => {
                error!(%error, "rejecting malformed filter config");
                0
            }
        }
    }

    /// Idempotent config removal.
    pub fn destroy_config(&self, id: u64) {
        self.configs.destroy(id);
    }

    /// Merge a child config over its parent. Returns `0` if either id is
    /// unknown, which indicates a caller bug rather than a runtime
    /// condition.
    pub fn merge_config(&self, parent_id: u64, child_id: u64) -> u64 {
        match self.configs.merge(parent_id, child_id) {
            Ok(id) => id,
            Err(error) => {
                error!(%error, parent_id, child_id, "config merge failed");
                0
            }
        }
    }

    /// Header or trailer phase callback.
    pub fn on_header(
        &self,
        desc: RequestDescriptor,
        end_stream: bool,
        header_count: u64,
        header_bytes: u64,
    ) -> u64 {
        let Some(phase) = Phase::from_code(desc.phase) else {
            warn!(handle = desc.handle.0, phase = desc.phase, "unknown phase code");
            return StatusType::LocalReply.code();
        };
        let state = if phase == Phase::DecodeHeader {
            match self.create_request(&desc) {
                Ok(state) => state,
                Err(error) => return self.reject_creation(desc.handle, error),
            }
        } else {
            match self.requests.get(desc.handle) {
                Some(state) => state,
                // An early terminal reply may have skipped the whole
                // decode direction; reconstruct lazily.
                None => match self.create_request(&desc) {
                    Ok(state) => state,
                    Err(error) => return self.reject_creation(desc.handle, error),
                },
            }
        };
        if state.is_finished() {
            debug!(handle = desc.handle.0, %phase, "phase callback after terminal reply, ignoring");
            return StatusType::LocalReply.code();
        }
        state.enter_phase(phase);
        let view = HeaderView::new(Arc::clone(&state), phase, header_count, header_bytes);
        let status = recover::invoke_guarded(&state, phase, || {
            let Some(filter) = state.filter() else {
                return Err(FilterError::fault("request has no filter attached"));
            };
            match phase {
                Phase::DecodeHeader => filter.decode_headers(&view, end_stream),
                Phase::DecodeTrailer => filter.decode_trailers(&view),
                Phase::EncodeHeader => filter.encode_headers(&view, end_stream),
                Phase::EncodeTrailer => filter.encode_trailers(&view),
                Phase::DecodeData | Phase::EncodeData => {
                    Err(FilterError::fault("data phase on header callback"))
                }
            }
        });
        status.code()
    }

    /// Body data phase callback.
    pub fn on_data(
        &self,
        desc: RequestDescriptor,
        end_stream: bool,
        buffer: u64,
        length: u64,
    ) -> u64 {
        let Some(phase) = Phase::from_code(desc.phase) else {
            warn!(handle = desc.handle.0, phase = desc.phase, "unknown phase code");
            return StatusType::LocalReply.code();
        };
        let Some(state) = self.requests.get(desc.handle) else {
            trace!(handle = desc.handle.0, "data callback for unknown request, ignoring");
            return StatusType::LocalReply.code();
        };
        if state.is_finished() {
            debug!(handle = desc.handle.0, %phase, "phase callback after terminal reply, ignoring");
            return StatusType::LocalReply.code();
        }
        state.enter_phase(phase);
        let view = BufferView::new(Arc::clone(&state), phase, buffer, length);
        let status = recover::invoke_guarded(&state, phase, || {
            let Some(filter) = state.filter() else {
                return Err(FilterError::fault("request has no filter attached"));
            };
            match phase {
                Phase::DecodeData => filter.decode_data(&view, end_stream),
                Phase::EncodeData => filter.encode_data(&view, end_stream),
                _ => Err(FilterError::fault("non-data phase on data callback")),
            }
        });
        status.code()
    }

    /// Destruction callback: destroy hook first, then native release,
    /// each exactly once.
    pub fn on_destroy(&self, handle: RequestHandle, reason_code: u64) {
        let Some(state) = self.requests.remove(handle) else {
            trace!(handle = handle.0, "destroy for unknown request, ignoring");
            return;
        };
        let reason = DestroyReason::from_code(reason_code).unwrap_or_else(|| {
            warn!(handle = handle.0, reason_code, "unknown destroy reason, treating as terminate");
            DestroyReason::Terminate
        });
        debug!(handle = handle.0, ?reason, "destroying request");
        // Close the continuation window before running filter code.
        state.mark_finished();
        state.run_destroy_hook(reason);
        state.finalize_once(FinalizeReason::Normal);
    }

    fn create_request(&self, desc: &RequestDescriptor) -> Result<Arc<RequestState>, FilterError> {
        let config = self.configs.get(desc.config_id)?;
        let state = RequestState::new(desc.handle, Arc::clone(&self.engine));
        // Reserve the handle before building the filter: a duplicate must
        // fail without factory side effects or an orphaned filter instance.
        if let Err(error) = self.requests.insert(Arc::clone(&state)) {
            // The handle already has an owner; this state never did.
            state.disarm();
            return Err(error);
        }
        let callbacks: Arc<dyn FilterCallbacks> =
            Arc::new(RequestCallbacks(Arc::clone(&state)));
        state.attach_filter(self.factory.create(config, callbacks));
        Ok(state)
    }

    /// Surface a failed request creation. An unknown config gets the safe
    /// 500 reply; a duplicate handle leaves the existing owner untouched.
    fn reject_creation(&self, handle: RequestHandle, error: FilterError) -> u64 {
        error!(handle = handle.0, %error, "failed to create request state");
        if !matches!(error, FilterError::DuplicateHandle { .. }) {
            let reply = trestle_filter_api::LocalReply::new(500)
                .with_body(SAFE_REPLY_BODY)
                .with_details(SAFE_REPLY_DETAILS);
            if let Err(reply_error) = self.engine.send_local_reply(handle, &reply) {
                trace!(handle = handle.0, %reply_error, "safe reply after failed creation lost race");
            }
        }
        StatusType::LocalReply.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEngine;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use trestle_filter_api::{
        FilterConfig, HttpFilter, PassThroughFactory, PassThroughFilter,
    };

    fn bridge_on(engine: &Arc<MockEngine>) -> Bridge {
        Bridge::new(
            Arc::clone(engine) as Arc<dyn EngineApi>,
            Arc::new(PassThroughFactory),
            None,
        )
    }

    fn descriptor(handle: usize, config_id: u64, phase: Phase) -> RequestDescriptor {
        RequestDescriptor {
            handle: RequestHandle(handle),
            config_id,
            phase: phase.code(),
        }
    }

    #[test]
    fn passthrough_request_flows_through_all_phases() {
        let engine = Arc::new(MockEngine::new());
        engine.add_request(RequestHandle(1));
        let bridge = bridge_on(&engine);
        let config = bridge.new_config(b"{}");
        assert_ne!(config, 0);

        let cont = StatusType::Continue.code();
        assert_eq!(
            bridge.on_header(descriptor(1, config, Phase::DecodeHeader), false, 0, 0),
            cont
        );
        assert_eq!(
            bridge.on_data(descriptor(1, config, Phase::DecodeData), true, 0xb0, 0),
            cont
        );
        assert_eq!(
            bridge.on_header(descriptor(1, config, Phase::EncodeHeader), false, 0, 0),
            cont
        );
        assert_eq!(
            bridge.on_data(descriptor(1, config, Phase::EncodeData), true, 0xb1, 0),
            cont
        );
        assert_eq!(bridge.requests().len(), 1);

        bridge.on_destroy(RequestHandle(1), 0);
        assert!(bridge.requests().is_empty());
        assert_eq!(
            engine.finalizations(RequestHandle(1)),
            vec![FinalizeReason::Normal]
        );
    }

    #[test]
    fn encode_header_creates_state_when_decode_was_skipped() {
        let engine = Arc::new(MockEngine::new());
        engine.add_request(RequestHandle(2));
        let bridge = bridge_on(&engine);
        let config = bridge.new_config(b"{}");

        // An early terminal reply skipped the decode direction entirely.
        let status =
            bridge.on_header(descriptor(2, config, Phase::EncodeHeader), true, 0, 0);
        assert_eq!(status, StatusType::Continue.code());
        assert_eq!(bridge.requests().len(), 1);
    }

    #[test]
    fn unknown_config_id_gets_the_safe_reply() {
        let engine = Arc::new(MockEngine::new());
        engine.add_request(RequestHandle(3));
        let bridge = bridge_on(&engine);

        let status = bridge.on_header(descriptor(3, 42, Phase::DecodeHeader), false, 0, 0);
        assert_eq!(status, StatusType::LocalReply.code());
        let replies = engine.local_replies(RequestHandle(3));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].status_code, 500);
        assert!(bridge.requests().is_empty());
    }

    #[test]
    fn data_for_unknown_request_is_a_noop() {
        let engine = Arc::new(MockEngine::new());
        let bridge = bridge_on(&engine);
        let status = bridge.on_data(
            descriptor(9, 1, Phase::DecodeData),
            false,
            0xb0,
            10,
        );
        assert_eq!(status, StatusType::LocalReply.code());
    }

    #[test]
    fn destroy_for_unknown_request_is_a_noop() {
        let engine = Arc::new(MockEngine::new());
        let bridge = bridge_on(&engine);
        bridge.on_destroy(RequestHandle(9), 0);
        assert!(engine.finalizations(RequestHandle(9)).is_empty());
    }

    struct CountingFactory(AtomicUsize);

    impl FilterFactory for CountingFactory {
        fn create(
            &self,
            _config: FilterConfig,
            _callbacks: Arc<dyn FilterCallbacks>,
        ) -> Box<dyn HttpFilter> {
            self.0.fetch_add(1, Ordering::AcqRel);
            Box::new(PassThroughFilter)
        }
    }

    #[test]
    fn duplicate_handle_never_builds_a_second_filter() {
        let engine = Arc::new(MockEngine::new());
        engine.add_request(RequestHandle(5));
        let factory = Arc::new(CountingFactory(AtomicUsize::new(0)));
        let bridge = Bridge::new(
            Arc::clone(&engine) as Arc<dyn EngineApi>,
            Arc::clone(&factory) as Arc<dyn FilterFactory>,
            None,
        );
        let config = bridge.new_config(b"{}");

        let first = bridge.on_header(descriptor(5, config, Phase::DecodeHeader), false, 0, 0);
        assert_eq!(first, StatusType::Continue.code());
        let second = bridge.on_header(descriptor(5, config, Phase::DecodeHeader), false, 0, 0);
        assert_eq!(second, StatusType::LocalReply.code());

        // The losing creation was rejected before any filter existed.
        assert_eq!(factory.0.load(Ordering::Acquire), 1);
        assert_eq!(bridge.requests().len(), 1);
    }

    #[test]
    fn invalid_phase_code_is_rejected() {
        let engine = Arc::new(MockEngine::new());
        let bridge = bridge_on(&engine);
        let desc = RequestDescriptor {
            handle: RequestHandle(4),
            config_id: 1,
            phase: 99,
        };
        assert_eq!(
            bridge.on_header(desc, false, 0, 0),
            StatusType::LocalReply.code()
        );
    }
}
