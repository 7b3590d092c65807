//! End-to-end lifecycle tests driving the bridge the way the engine does:
//! phase callbacks in, status codes out, with filters that suspend, fault,
//! and resume from other tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use trestle::{Bridge, EngineApi, FinalizeReason, MockEngine, RequestDescriptor, RequestHandle};
use trestle_filter_api::{
    BufferInstance, DestroyReason, FilterCallbacks, FilterConfig, FilterError, FilterFactory,
    FilterResult, HeaderMap, HttpFilter, LocalReply, Phase, StatusType,
};

/// Captures the callback handle the factory receives and counts destroy
/// hook invocations, so tests can drive continuations from outside.
#[derive(Default)]
struct Recorder {
    callbacks: Mutex<Option<Arc<dyn FilterCallbacks>>>,
    destroyed: AtomicUsize,
}

impl Recorder {
    fn callbacks(&self) -> Arc<dyn FilterCallbacks> {
        self.callbacks
            .lock()
            .clone()
            .expect("factory was never invoked")
    }
}

enum Script {
    /// Pass everything through.
    Continue,
    /// Suspend in decode-header; a test resumes through the callbacks.
    SuspendOnHeaders,
    /// Panic in decode-data.
    PanicOnData,
    /// Reply 403 from decode-header.
    ReplyOnHeaders,
}

struct ScriptedFilter {
    script: Arc<Script>,
    recorder: Arc<Recorder>,
}

impl HttpFilter for ScriptedFilter {
    fn decode_headers(&self, _headers: &dyn HeaderMap, _end_stream: bool) -> FilterResult {
        match *self.script {
            Script::SuspendOnHeaders => Ok(StatusType::Running),
            Script::ReplyOnHeaders => {
                self.recorder
                    .callbacks()
                    .send_local_reply(LocalReply::new(403).with_body("denied"));
                Ok(StatusType::LocalReply)
            }
            _ => Ok(StatusType::Continue),
        }
    }

    fn decode_data(&self, _data: &dyn BufferInstance, _end_stream: bool) -> FilterResult {
        match *self.script {
            Script::PanicOnData => panic!("filter exploded"),
            _ => Ok(StatusType::Continue),
        }
    }

    fn on_destroy(&self, _reason: DestroyReason) {
        self.recorder.destroyed.fetch_add(1, Ordering::AcqRel);
    }
}

struct ScriptedFactory {
    script: Arc<Script>,
    recorder: Arc<Recorder>,
}

impl FilterFactory for ScriptedFactory {
    fn create(
        &self,
        _config: FilterConfig,
        callbacks: Arc<dyn FilterCallbacks>,
    ) -> Box<dyn HttpFilter> {
        *self.recorder.callbacks.lock() = Some(callbacks);
        Box::new(ScriptedFilter {
            script: Arc::clone(&self.script),
            recorder: Arc::clone(&self.recorder),
        })
    }
}

struct Harness {
    engine: Arc<MockEngine>,
    bridge: Bridge,
    recorder: Arc<Recorder>,
    config_id: u64,
}

impl Harness {
    fn new(script: Script) -> Harness {
        let engine = Arc::new(MockEngine::new());
        let recorder = Arc::new(Recorder::default());
        let factory = Arc::new(ScriptedFactory {
            script: Arc::new(script),
            recorder: Arc::clone(&recorder),
        });
        let bridge = Bridge::new(Arc::clone(&engine) as Arc<dyn EngineApi>, factory, None);
        let config_id = bridge.new_config(b"{}");
        assert_ne!(config_id, 0);
        Harness {
            engine,
            bridge,
            recorder,
            config_id,
        }
    }

    fn descriptor(&self, handle: usize, phase: Phase) -> RequestDescriptor {
        RequestDescriptor {
            handle: RequestHandle(handle),
            config_id: self.config_id,
            phase: phase.code(),
        }
    }
}

#[tokio::test]
async fn suspended_phase_resumes_from_another_task() {
    let harness = Harness::new(Script::SuspendOnHeaders);
    let handle = RequestHandle(1);
    harness.engine.add_request(handle);

    let status = harness
        .bridge
        .on_header(harness.descriptor(1, Phase::DecodeHeader), false, 0, 0);
    assert_eq!(status, StatusType::Running.code());
    assert!(harness.engine.continues(handle).is_empty());

    let callbacks = harness.recorder.callbacks();
    let resume = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        callbacks.continue_request(StatusType::Continue);
    });
    resume.await.expect("resume task panicked");

    assert_eq!(
        harness.engine.continues(handle),
        vec![StatusType::Continue.code()]
    );
}

#[test]
fn panic_in_a_phase_sends_one_safe_reply_and_quiesces_the_request() {
    let harness = Harness::new(Script::PanicOnData);
    let handle = RequestHandle(1);
    harness.engine.add_request(handle);

    let status = harness
        .bridge
        .on_header(harness.descriptor(1, Phase::DecodeHeader), false, 0, 0);
    assert_eq!(status, StatusType::Continue.code());

    let status = harness
        .bridge
        .on_data(harness.descriptor(1, Phase::DecodeData), false, 0xb0, 4);
    assert_eq!(status, StatusType::LocalReply.code());

    let replies = harness.engine.local_replies(handle);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status_code, 500);
    assert_eq!(replies[0].body, "error happened in filter\r\n");
    assert_eq!(replies[0].details, "filter_fault");

    // Anything the engine still drives afterwards is inert.
    let status = harness
        .bridge
        .on_header(harness.descriptor(1, Phase::EncodeHeader), false, 0, 0);
    assert_eq!(status, StatusType::LocalReply.code());
    assert_eq!(harness.engine.local_replies(handle).len(), 1);
    assert!(harness.engine.continues(handle).is_empty());
}

#[test]
fn concurrent_faults_produce_exactly_one_reply() {
    let harness = Harness::new(Script::Continue);
    let handle = RequestHandle(1);
    harness.engine.add_request(handle);

    harness
        .bridge
        .on_header(harness.descriptor(1, Phase::DecodeHeader), false, 0, 0);

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let callbacks = harness.recorder.callbacks();
            std::thread::spawn(move || {
                callbacks.handle_fault(FilterError::fault(format!("worker {i} failed")));
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("fault worker panicked");
    }

    let replies = harness.engine.local_replies(handle);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status_code, 500);
}

#[test]
fn filter_reply_short_circuits_the_remaining_phases() {
    let harness = Harness::new(Script::ReplyOnHeaders);
    let handle = RequestHandle(1);
    harness.engine.add_request(handle);

    let status = harness
        .bridge
        .on_header(harness.descriptor(1, Phase::DecodeHeader), false, 0, 0);
    assert_eq!(status, StatusType::LocalReply.code());

    let replies = harness.engine.local_replies(handle);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status_code, 403);
    assert_eq!(replies[0].body, "denied");

    let status = harness
        .bridge
        .on_data(harness.descriptor(1, Phase::DecodeData), true, 0xb0, 0);
    assert_eq!(status, StatusType::LocalReply.code());
    assert_eq!(harness.engine.local_replies(handle).len(), 1);
}

#[test]
fn destroy_runs_the_hook_then_finalizes_exactly_once() {
    let harness = Harness::new(Script::Continue);
    let handle = RequestHandle(1);
    harness.engine.add_request(handle);

    harness
        .bridge
        .on_header(harness.descriptor(1, Phase::DecodeHeader), false, 0, 0);
    harness.bridge.on_destroy(handle, 0);

    assert_eq!(harness.recorder.destroyed.load(Ordering::Acquire), 1);
    assert_eq!(
        harness.engine.finalizations(handle),
        vec![FinalizeReason::Normal]
    );
    assert!(harness.bridge.requests().is_empty());

    // A second destroy for the same handle must change nothing.
    harness.bridge.on_destroy(handle, 0);
    assert_eq!(harness.recorder.destroyed.load(Ordering::Acquire), 1);
    assert_eq!(
        harness.engine.finalizations(handle),
        vec![FinalizeReason::Normal]
    );
}

#[test]
fn continuation_arriving_after_destroy_is_harmless() {
    let harness = Harness::new(Script::SuspendOnHeaders);
    let handle = RequestHandle(1);
    harness.engine.add_request(handle);

    let status = harness
        .bridge
        .on_header(harness.descriptor(1, Phase::DecodeHeader), false, 0, 0);
    assert_eq!(status, StatusType::Running.code());

    let callbacks = harness.recorder.callbacks();
    harness.bridge.on_destroy(handle, 0);
    callbacks.continue_request(StatusType::Continue);

    assert!(harness.engine.continues(handle).is_empty());
    assert_eq!(
        harness.engine.finalizations(handle),
        vec![FinalizeReason::Normal]
    );
}

#[test]
fn fault_arriving_after_destroy_is_harmless() {
    let harness = Harness::new(Script::Continue);
    let handle = RequestHandle(1);
    harness.engine.add_request(handle);

    harness
        .bridge
        .on_header(harness.descriptor(1, Phase::DecodeHeader), false, 0, 0);
    let callbacks = harness.recorder.callbacks();
    harness.bridge.on_destroy(handle, 0);

    // A worker the filter spawned fails only after the engine tore the
    // request down; nothing may touch the released handle.
    callbacks.handle_fault(FilterError::fault("late worker failure"));

    assert!(harness.engine.local_replies(handle).is_empty());
    assert_eq!(
        harness.engine.finalizations(handle),
        vec![FinalizeReason::Normal]
    );
}

#[test]
fn duplicate_handle_never_disturbs_the_existing_owner() {
    let harness = Harness::new(Script::Continue);
    let handle = RequestHandle(1);
    harness.engine.add_request(handle);

    let first = harness
        .bridge
        .on_header(harness.descriptor(1, Phase::DecodeHeader), false, 0, 0);
    assert_eq!(first, StatusType::Continue.code());

    let second = harness
        .bridge
        .on_header(harness.descriptor(1, Phase::DecodeHeader), false, 0, 0);
    assert_eq!(second, StatusType::LocalReply.code());

    // The owner is untouched: no reply went out, no native release ran.
    assert_eq!(harness.bridge.requests().len(), 1);
    assert!(harness.engine.local_replies(handle).is_empty());
    assert!(harness.engine.finalizations(handle).is_empty());

    harness.bridge.on_destroy(handle, 0);
    assert_eq!(
        harness.engine.finalizations(handle),
        vec![FinalizeReason::Normal]
    );
}
