//! The `extern "C"` surface the proxy engine drives.
//!
//! The engine loads this library, registers its vtable, and then calls
//! these exports for every config and request lifecycle event. The raw
//! request struct is owned by the engine; the bridge only reads the two
//! fields the ABI defines and uses the pointer itself as the correlation
//! key. Panics never cross the boundary: every export runs under
//! `catch_unwind` and degrades to an inert status.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;

use tracing::error;

use trestle_filter_api::StatusType;

use crate::dispatch::{Bridge, RequestDescriptor};
use crate::engine::RequestHandle;

/// Engine-owned per-request struct. Layout is part of the ABI.
#[repr(C)]
pub struct RawHttpRequest {
    /// Id of the merged config resolved for the matched route.
    pub config_id: u64,
    /// Phase discriminant for the current callback.
    pub phase: i32,
}

static BRIDGE: OnceLock<Bridge> = OnceLock::new();

/// Install the process-wide bridge the exports dispatch to. Returns the
/// bridge back if one was already installed.
pub fn install(bridge: Bridge) -> Result<(), Bridge> {
    BRIDGE.set(bridge)
}

/// The installed bridge, if any.
pub fn installed() -> Option<&'static Bridge> {
    BRIDGE.get()
}

fn descriptor(req: *mut RawHttpRequest) -> Option<RequestDescriptor> {
    if req.is_null() {
        return None;
    }
    // The engine guarantees the struct outlives the callback.
    let (config_id, phase) = unsafe { ((*req).config_id, (*req).phase) };
    Some(RequestDescriptor {
        handle: RequestHandle(req as usize),
        config_id,
        phase,
    })
}

/// Run an export body, never letting a panic unwind into the engine.
fn shielded<T>(fallback: T, body: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(payload) => {
            error!(
                panic = %crate::recover::panic_message(payload.as_ref()),
                "panic reached the ABI boundary"
            );
            fallback
        }
    }
}

#[no_mangle]
pub extern "C" fn trestle_new_http_plugin_config(data: *const u8, len: usize) -> u64 {
    shielded(0, || {
        let Some(bridge) = installed() else { return 0 };
        let raw = if data.is_null() || len == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(data, len) }
        };
        bridge.new_config(raw)
    })
}

#[no_mangle]
pub extern "C" fn trestle_destroy_http_plugin_config(id: u64) {
    shielded((), || {
        if let Some(bridge) = installed() {
            bridge.destroy_config(id);
        }
    })
}

#[no_mangle]
pub extern "C" fn trestle_merge_http_plugin_config(parent_id: u64, child_id: u64) -> u64 {
    shielded(0, || {
        let Some(bridge) = installed() else { return 0 };
        bridge.merge_config(parent_id, child_id)
    })
}

#[no_mangle]
pub extern "C" fn trestle_on_http_header(
    req: *mut RawHttpRequest,
    end_stream: u64,
    header_count: u64,
    header_bytes: u64,
) -> u64 {
    shielded(StatusType::LocalReply.code(), || {
        let (Some(bridge), Some(desc)) = (installed(), descriptor(req)) else {
            return StatusType::LocalReply.code();
        };
        bridge.on_header(desc, end_stream == 1, header_count, header_bytes)
    })
}

#[no_mangle]
pub extern "C" fn trestle_on_http_data(
    req: *mut RawHttpRequest,
    end_stream: u64,
    buffer: u64,
    length: u64,
) -> u64 {
    shielded(StatusType::LocalReply.code(), || {
        let (Some(bridge), Some(desc)) = (installed(), descriptor(req)) else {
            return StatusType::LocalReply.code();
        };
        bridge.on_data(desc, end_stream == 1, buffer, length)
    })
}

#[no_mangle]
pub extern "C" fn trestle_on_http_destroy(req: *mut RawHttpRequest, reason: u64) {
    shielded((), || {
        let (Some(bridge), Some(_)) = (installed(), descriptor(req)) else {
            return;
        };
        bridge.on_destroy(RequestHandle(req as usize), reason);
    })
}
