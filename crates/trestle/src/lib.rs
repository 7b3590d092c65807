//! Host-side bridge between a streaming HTTP proxy engine and pluggable
//! filters written against [`trestle_filter_api`].
//!
//! The engine drives the bridge through the `extern "C"` exports in
//! [`abi`]; the bridge reconstructs per-request context, hands the filter
//! phase-scoped header and body views, and converts typed filter errors
//! and panics into at most one terminal reply per request. All native
//! access goes through the [`engine::EngineApi`] trait, which the proxy
//! implements with a registered vtable and tests implement in memory.

pub mod abi;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod headers;
pub mod mock;
mod recover;
pub mod request;
pub mod telemetry;

pub use abi::{install, installed, RawHttpRequest};
pub use buffer::BufferView;
pub use config::ConfigRegistry;
pub use dispatch::{Bridge, RequestDescriptor};
pub use engine::{
    BufferAction, ByteSlice, EngineApi, EngineResult, EngineVTable, FfiEngine, FinalizeReason,
    RequestHandle,
};
pub use headers::HeaderView;
pub use mock::MockEngine;
pub use request::RequestTable;
pub use telemetry::{init_logging, LogFormat, TelemetryError};
