//! In-memory [`EngineApi`] implementation for tests.
//!
//! Holds native-side request data (headers, trailers, body buffers, route
//! metadata), records every lifecycle call the bridge makes, and can
//! simulate the engine-side races the recovery guard has to handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use trestle_filter_api::{FilterError, LocalReply, RawValue};

use crate::engine::{BufferAction, EngineApi, EngineResult, FinalizeReason, RequestHandle};

#[derive(Default)]
struct MockRequest {
    headers: Vec<(String, String)>,
    trailers: Vec<(String, String)>,
    buffers: HashMap<u64, Vec<u8>>,
    route: String,
    metadata: HashMap<String, serde_json::Map<String, serde_json::Value>>,
    continues: Vec<u64>,
    replies: Vec<LocalReply>,
    finalizations: Vec<FinalizeReason>,
    gone: bool,
    window_closed: bool,
}

#[derive(Default)]
pub struct MockEngine {
    requests: DashMap<RequestHandle, MockRequest>,
    copy_header_calls: AtomicUsize,
    copy_trailer_calls: AtomicUsize,
    /// Keeps zero-copy values alive for the engine's lifetime so the
    /// pointers handed out stay valid, like native memory would be.
    raw_arena: Mutex<Vec<Box<str>>>,
}

impl MockEngine {
    pub fn new() -> MockEngine {
        MockEngine::default()
    }

    pub fn add_request(&self, handle: RequestHandle) {
        self.requests.insert(handle, MockRequest::default());
    }

    pub fn set_headers(&self, handle: RequestHandle, headers: Vec<(String, String)>) {
        if let Some(mut req) = self.requests.get_mut(&handle) {
            req.headers = headers;
        }
    }

    pub fn set_trailers(&self, handle: RequestHandle, trailers: Vec<(String, String)>) {
        if let Some(mut req) = self.requests.get_mut(&handle) {
            req.trailers = trailers;
        }
    }

    pub fn set_buffer_data(&self, handle: RequestHandle, buffer: u64, data: Vec<u8>) {
        if let Some(mut req) = self.requests.get_mut(&handle) {
            req.buffers.insert(buffer, data);
        }
    }

    pub fn set_route_name(&self, handle: RequestHandle, route: impl Into<String>) {
        if let Some(mut req) = self.requests.get_mut(&handle) {
            req.route = route.into();
        }
    }

    /// Simulate the engine having finished the request on its own thread.
    pub fn mark_gone(&self, handle: RequestHandle) {
        if let Some(mut req) = self.requests.get_mut(&handle) {
            req.gone = true;
        }
    }

    /// Simulate a call landing outside the accepted execution window.
    pub fn close_window(&self, handle: RequestHandle) {
        if let Some(mut req) = self.requests.get_mut(&handle) {
            req.window_closed = true;
        }
    }

    pub fn headers(&self, handle: RequestHandle) -> Vec<(String, String)> {
        self.requests
            .get(&handle)
            .map(|req| req.headers.clone())
            .unwrap_or_default()
    }

    pub fn trailers(&self, handle: RequestHandle) -> Vec<(String, String)> {
        self.requests
            .get(&handle)
            .map(|req| req.trailers.clone())
            .unwrap_or_default()
    }

    pub fn buffer_data(&self, handle: RequestHandle, buffer: u64) -> Vec<u8> {
        self.requests
            .get(&handle)
            .and_then(|req| req.buffers.get(&buffer).cloned())
            .unwrap_or_default()
    }

    pub fn continues(&self, handle: RequestHandle) -> Vec<u64> {
        self.requests
            .get(&handle)
            .map(|req| req.continues.clone())
            .unwrap_or_default()
    }

    pub fn local_replies(&self, handle: RequestHandle) -> Vec<LocalReply> {
        self.requests
            .get(&handle)
            .map(|req| req.replies.clone())
            .unwrap_or_default()
    }

    pub fn finalizations(&self, handle: RequestHandle) -> Vec<FinalizeReason> {
        self.requests
            .get(&handle)
            .map(|req| req.finalizations.clone())
            .unwrap_or_default()
    }

    pub fn metadata(
        &self,
        handle: RequestHandle,
        filter_name: &str,
    ) -> serde_json::Map<String, serde_json::Value> {
        self.requests
            .get(&handle)
            .and_then(|req| req.metadata.get(filter_name).cloned())
            .unwrap_or_default()
    }

    pub fn copy_header_calls(&self) -> usize {
        self.copy_header_calls.load(Ordering::Acquire)
    }

    pub fn copy_trailer_calls(&self) -> usize {
        self.copy_trailer_calls.load(Ordering::Acquire)
    }

    fn with_live<T>(
        &self,
        handle: RequestHandle,
        f: impl FnOnce(&mut MockRequest) -> T,
    ) -> EngineResult<T> {
        let Some(mut req) = self.requests.get_mut(&handle) else {
            return Err(FilterError::RequestFinished);
        };
        if req.gone {
            return Err(FilterError::RequestFinished);
        }
        if req.window_closed {
            return Err(FilterError::NotInWindow);
        }
        Ok(f(&mut req))
    }
}

impl EngineApi for MockEngine {
    fn continue_request(&self, handle: RequestHandle, status: u64) -> EngineResult<()> {
        self.with_live(handle, |req| req.continues.push(status))
    }

    fn send_local_reply(&self, handle: RequestHandle, reply: &LocalReply) -> EngineResult<()> {
        self.with_live(handle, |req| req.replies.push(reply.clone()))
    }

    fn get_header(&self, handle: RequestHandle, key: &str) -> EngineResult<RawValue> {
        let value = self.with_live(handle, |req| {
            req.headers
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        })?;
        let Some(value) = value else {
            return Ok(RawValue::new(std::ptr::null(), 0));
        };
        let mut arena = self.raw_arena.lock();
        arena.push(value.into_boxed_str());
        let Some(stored) = arena.last() else {
            return Ok(RawValue::new(std::ptr::null(), 0));
        };
        Ok(RawValue::new(stored.as_ptr(), stored.len()))
    }

    fn copy_headers(
        &self,
        handle: RequestHandle,
        _count: u64,
        _byte_size: u64,
    ) -> EngineResult<Vec<(String, String)>> {
        self.copy_header_calls.fetch_add(1, Ordering::AcqRel);
        self.with_live(handle, |req| req.headers.clone())
    }

    fn set_header(
        &self,
        handle: RequestHandle,
        key: &str,
        value: &str,
        add: bool,
    ) -> EngineResult<()> {
        self.with_live(handle, |req| {
            if !add {
                req.headers.retain(|(k, _)| k != key);
            }
            req.headers.push((key.to_string(), value.to_string()));
        })
    }

    fn remove_header(&self, handle: RequestHandle, key: &str) -> EngineResult<()> {
        self.with_live(handle, |req| {
            req.headers.retain(|(k, _)| k != key);
            req.trailers.retain(|(k, _)| k != key);
        })
    }

    fn copy_trailers(
        &self,
        handle: RequestHandle,
        _count: u64,
        _byte_size: u64,
    ) -> EngineResult<Vec<(String, String)>> {
        self.copy_trailer_calls.fetch_add(1, Ordering::AcqRel);
        self.with_live(handle, |req| req.trailers.clone())
    }

    fn set_trailer(&self, handle: RequestHandle, key: &str, value: &str) -> EngineResult<()> {
        self.with_live(handle, |req| {
            req.trailers.retain(|(k, _)| k != key);
            req.trailers.push((key.to_string(), value.to_string()));
        })
    }

    fn get_buffer(
        &self,
        handle: RequestHandle,
        buffer: u64,
        length: u64,
    ) -> EngineResult<Vec<u8>> {
        self.with_live(handle, |req| {
            let data = req.buffers.get(&buffer).cloned().unwrap_or_default();
            data.into_iter().take(length as usize).collect()
        })
    }

    fn set_buffer(
        &self,
        handle: RequestHandle,
        buffer: u64,
        data: &[u8],
        action: BufferAction,
    ) -> EngineResult<()> {
        self.with_live(handle, |req| {
            let slot = req.buffers.entry(buffer).or_default();
            match action {
                BufferAction::Set => {
                    slot.clear();
                    slot.extend_from_slice(data);
                }
                BufferAction::Append => slot.extend_from_slice(data),
                BufferAction::Prepend => {
                    let mut combined = data.to_vec();
                    combined.extend_from_slice(slot);
                    *slot = combined;
                }
            }
        })
    }

    fn route_name(&self, handle: RequestHandle) -> EngineResult<String> {
        self.with_live(handle, |req| req.route.clone())
    }

    fn get_dynamic_metadata(
        &self,
        handle: RequestHandle,
        filter_name: &str,
    ) -> EngineResult<serde_json::Value> {
        self.with_live(handle, |req| {
            serde_json::Value::Object(req.metadata.get(filter_name).cloned().unwrap_or_default())
        })
    }

    fn set_dynamic_metadata(
        &self,
        handle: RequestHandle,
        filter_name: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> EngineResult<()> {
        self.with_live(handle, |req| {
            req.metadata
                .entry(filter_name.to_string())
                .or_default()
                .insert(key.to_string(), value.clone());
        })
    }

    fn finalize(&self, handle: RequestHandle, reason: FinalizeReason) {
        // The release path has no race reporting; record unconditionally.
        if let Some(mut req) = self.requests.get_mut(&handle) {
            req.finalizations.push(reason);
        }
    }
}
