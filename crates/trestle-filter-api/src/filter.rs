//! The traits a pluggable filter implements and the handles it receives.

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::error::FilterError;
use crate::types::{DestroyReason, RawValue, StatusType};

/// Result of one filter phase method.
///
/// `Err` routes through the bridge's recovery guard: races are swallowed,
/// anything else turns into a single terminal 500 reply.
pub type FilterResult = Result<StatusType, FilterError>;

/// Parsed per-route filter configuration, opaque to the bridge.
pub type FilterConfig = Arc<dyn Any + Send + Sync>;

/// Failure to deserialize a filter config payload.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The payload could not be decoded.
    #[error("malformed filter config: {0}")]
    Malformed(String),
}

/// Deserializes raw config payloads into domain objects, and merges a
/// child (more specific) config over a parent.
///
/// Registering a parser is optional; without one the bridge stores the raw
/// bytes and merge returns the child unchanged.
pub trait ConfigParser: Send + Sync {
    /// Parse a raw payload. Fails only on malformed input.
    fn parse(&self, raw: &[u8]) -> Result<FilterConfig, ConfigError>;

    /// Merge a child config over its parent, producing a new config.
    fn merge(&self, parent: &FilterConfig, child: &FilterConfig) -> FilterConfig;
}

/// A phase-scoped view over native header or trailer data.
///
/// The first read copies all entries in one native round trip into a
/// private cache; later reads hit the cache and mutations update both the
/// cache and the native side. Using a view after its phase ended fails with
/// [`FilterError::StaleView`].
pub trait HeaderMap: Send + Sync {
    /// First value for `key`, if present.
    fn get(&self, key: &str) -> Result<Option<String>, FilterError>;

    /// All values for `key`.
    fn values(&self, key: &str) -> Result<Vec<String>, FilterError>;

    /// All entries. Ordering is unspecified.
    fn entries(&self) -> Result<Vec<(String, String)>, FilterError>;

    /// Replace the value for `key`.
    fn set(&self, key: &str, value: &str) -> Result<(), FilterError>;

    /// Append a value for `key`.
    fn add(&self, key: &str, value: &str) -> Result<(), FilterError>;

    /// Remove all values for `key`.
    fn remove(&self, key: &str) -> Result<(), FilterError>;

    /// Total size of the map in bytes, as reported by the engine.
    fn byte_size(&self) -> u64;

    /// Zero-copy read of the value for `key`, straight out of native
    /// memory. Faster than [`HeaderMap::get`] but the returned bytes are
    /// valid only until the next native mutation.
    ///
    /// # Safety
    ///
    /// See [`RawValue::as_bytes`] for the validity window the caller must
    /// uphold.
    unsafe fn get_raw(&self, key: &str) -> Result<RawValue, FilterError>;
}

/// A phase-scoped view over a native body buffer.
pub trait BufferInstance: Send + Sync {
    /// Copy the current bytes out of the native buffer.
    fn bytes(&self) -> Result<Bytes, FilterError>;

    /// Current length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the buffer contents.
    fn set(&self, data: &[u8]) -> Result<(), FilterError>;

    /// Append to the buffer.
    fn append(&self, data: &[u8]) -> Result<(), FilterError>;

    /// Prepend to the buffer.
    fn prepend(&self, data: &[u8]) -> Result<(), FilterError>;

    fn set_string(&self, data: &str) -> Result<(), FilterError> {
        self.set(data.as_bytes())
    }

    fn append_string(&self, data: &str) -> Result<(), FilterError> {
        self.append(data.as_bytes())
    }

    fn prepend_string(&self, data: &str) -> Result<(), FilterError> {
        self.prepend(data.as_bytes())
    }
}

/// A filter-issued terminal response, ending request processing
/// immediately and bypassing remaining phases.
#[derive(Debug, Clone)]
pub struct LocalReply {
    /// HTTP status code.
    pub status_code: u32,
    /// Response body.
    pub body: String,
    /// Extra response headers.
    pub headers: Vec<(String, String)>,
    /// gRPC status passed through to the engine unchanged.
    pub grpc_status: i64,
    /// Diagnostic detail string recorded by the engine.
    pub details: String,
}

impl LocalReply {
    /// A reply with the given status code and no body.
    pub fn new(status_code: u32) -> LocalReply {
        LocalReply {
            status_code,
            body: String::new(),
            headers: Vec::new(),
            grpc_status: 0,
            details: String::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> LocalReply {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> LocalReply {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> LocalReply {
        self.details = details.into();
        self
    }
}

/// The handle a filter uses to resume a suspended request, issue a
/// terminal reply, and read request metadata.
///
/// The handle is valid for the whole filter lifetime and callable from any
/// task; calls landing after the request was destroyed are harmless no-ops.
pub trait FilterCallbacks: Send + Sync {
    /// Resume a phase that previously returned [`StatusType::Running`].
    ///
    /// Must be called exactly once per suspended phase. Duplicate resumes
    /// and resumes after a terminal reply are rejected and logged.
    fn continue_request(&self, status: StatusType);

    /// Issue a terminal reply. Implicitly continues the request; no other
    /// callback should be invoked afterwards.
    fn send_local_reply(&self, reply: LocalReply);

    /// Funnel a failure from filter-spawned work through the bridge's
    /// recovery path, which issues at most one terminal 500 reply per
    /// request.
    fn handle_fault(&self, error: FilterError);

    /// Name of the route the engine matched for this request.
    fn route_name(&self) -> Result<String, FilterError>;

    /// Per-filter dynamic metadata attached to the stream.
    fn get_dynamic_metadata(&self, filter_name: &str) -> Result<serde_json::Value, FilterError>;

    /// Set one key in a filter's dynamic metadata namespace.
    fn set_dynamic_metadata(
        &self,
        filter_name: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), FilterError>;
}

/// A pluggable HTTP filter: six phase methods and a destroy hook.
///
/// Every method has a pass-through default so a filter implements only the
/// phases it cares about. Methods may return [`StatusType::Running`] and
/// finish later from another task via [`FilterCallbacks`].
pub trait HttpFilter: Send + Sync {
    fn decode_headers(&self, _headers: &dyn HeaderMap, _end_stream: bool) -> FilterResult {
        Ok(StatusType::Continue)
    }

    fn decode_data(&self, _data: &dyn BufferInstance, _end_stream: bool) -> FilterResult {
        Ok(StatusType::Continue)
    }

    fn decode_trailers(&self, _trailers: &dyn HeaderMap) -> FilterResult {
        Ok(StatusType::Continue)
    }

    fn encode_headers(&self, _headers: &dyn HeaderMap, _end_stream: bool) -> FilterResult {
        Ok(StatusType::Continue)
    }

    fn encode_data(&self, _data: &dyn BufferInstance, _end_stream: bool) -> FilterResult {
        Ok(StatusType::Continue)
    }

    fn encode_trailers(&self, _trailers: &dyn HeaderMap) -> FilterResult {
        Ok(StatusType::Continue)
    }

    /// Runs exactly once, before native resources are released.
    fn on_destroy(&self, _reason: DestroyReason) {}
}

/// Builds one filter instance per request from its parsed config and
/// callback handle.
pub trait FilterFactory: Send + Sync {
    fn create(
        &self,
        config: FilterConfig,
        callbacks: Arc<dyn FilterCallbacks>,
    ) -> Box<dyn HttpFilter>;
}
