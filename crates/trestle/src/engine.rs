//! The engine seam: every native call the bridge makes goes through
//! [`EngineApi`].
//!
//! Production uses [`FfiEngine`], a thin wrapper over a `#[repr(C)]` table
//! of function pointers the engine hands us at load time. Tests swap in
//! [`crate::mock::MockEngine`]. Each call returns a status the engine uses
//! to report lifecycle races (request gone, filter destroyed, outside the
//! execution window), which map onto the shared error taxonomy.

use std::os::raw::c_void;

use trestle_filter_api::{FilterError, LocalReply, RawValue};

/// Opaque identifier for one in-flight request, valid only within the
/// window the engine defines. Never dereferenced by the bridge itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub usize);

impl RequestHandle {
    pub(crate) fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

/// Why native resources for a request are being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    /// The explicit destroy callback ran.
    Normal,
    /// Fallback release because the in-process state was dropped without a
    /// destroy callback.
    GcSweep,
}

impl FinalizeReason {
    pub(crate) fn code(self) -> i32 {
        match self {
            FinalizeReason::Normal => 0,
            FinalizeReason::GcSweep => 1,
        }
    }
}

/// How a buffer write applies to the native buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAction {
    Set,
    Append,
    Prepend,
}

impl BufferAction {
    fn code(self) -> i32 {
        match self {
            BufferAction::Set => 0,
            BufferAction::Append => 1,
            BufferAction::Prepend => 2,
        }
    }
}

/// Result of a native call.
pub type EngineResult<T> = Result<T, FilterError>;

/// Status codes the engine returns from every call.
const CALL_OK: i32 = 0;
const CALL_REQUEST_FINISHED: i32 = 1;
const CALL_FILTER_DESTROYED: i32 = 2;
const CALL_NOT_IN_WINDOW: i32 = 3;
const CALL_INVALID_PHASE: i32 = 4;

/// Translate an engine status code into the shared taxonomy.
pub(crate) fn check_call(status: i32) -> EngineResult<()> {
    match status {
        CALL_OK => Ok(()),
        CALL_REQUEST_FINISHED => Err(FilterError::RequestFinished),
        CALL_FILTER_DESTROYED => Err(FilterError::FilterDestroyed),
        CALL_NOT_IN_WINDOW => Err(FilterError::NotInWindow),
        CALL_INVALID_PHASE => Err(FilterError::InvalidPhase),
        other => Err(FilterError::fault(format!(
            "engine returned unknown call status {other}"
        ))),
    }
}

/// The native calls the bridge makes on behalf of filters.
///
/// Mirrors the engine's callback ABI one-to-one so the whole bridge can be
/// exercised against an in-memory implementation.
pub trait EngineApi: Send + Sync {
    /// Resume a phase that previously reported `Running`.
    fn continue_request(&self, handle: RequestHandle, status: u64) -> EngineResult<()>;

    /// Issue a terminal reply for the request.
    fn send_local_reply(&self, handle: RequestHandle, reply: &LocalReply) -> EngineResult<()>;

    /// Zero-copy read of one header value out of native memory.
    fn get_header(&self, handle: RequestHandle, key: &str) -> EngineResult<RawValue>;

    /// Copy all header entries in one round trip.
    fn copy_headers(
        &self,
        handle: RequestHandle,
        count: u64,
        byte_size: u64,
    ) -> EngineResult<Vec<(String, String)>>;

    /// Set or add one header value.
    fn set_header(
        &self,
        handle: RequestHandle,
        key: &str,
        value: &str,
        add: bool,
    ) -> EngineResult<()>;

    /// Remove all values for one header or trailer key.
    fn remove_header(&self, handle: RequestHandle, key: &str) -> EngineResult<()>;

    /// Copy all trailer entries in one round trip.
    fn copy_trailers(
        &self,
        handle: RequestHandle,
        count: u64,
        byte_size: u64,
    ) -> EngineResult<Vec<(String, String)>>;

    /// Set one trailer value.
    fn set_trailer(&self, handle: RequestHandle, key: &str, value: &str) -> EngineResult<()>;

    /// Copy the current contents of a native body buffer.
    fn get_buffer(
        &self,
        handle: RequestHandle,
        buffer: u64,
        length: u64,
    ) -> EngineResult<Vec<u8>>;

    /// Write to a native body buffer.
    fn set_buffer(
        &self,
        handle: RequestHandle,
        buffer: u64,
        data: &[u8],
        action: BufferAction,
    ) -> EngineResult<()>;

    /// Name of the matched route.
    fn route_name(&self, handle: RequestHandle) -> EngineResult<String>;

    /// Read a filter's dynamic metadata namespace.
    fn get_dynamic_metadata(
        &self,
        handle: RequestHandle,
        filter_name: &str,
    ) -> EngineResult<serde_json::Value>;

    /// Set one key in a filter's dynamic metadata namespace.
    fn set_dynamic_metadata(
        &self,
        handle: RequestHandle,
        filter_name: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> EngineResult<()>;

    /// Release native resources for the request. Must be called exactly
    /// once per request; the engine does not report races from this call.
    fn finalize(&self, handle: RequestHandle, reason: FinalizeReason);
}

/// A borrowed byte range crossing the ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ByteSlice {
    pub ptr: *const u8,
    pub len: usize,
}

impl ByteSlice {
    pub(crate) fn empty() -> ByteSlice {
        ByteSlice {
            ptr: std::ptr::null(),
            len: 0,
        }
    }

    fn from_bytes(data: &[u8]) -> ByteSlice {
        ByteSlice {
            ptr: data.as_ptr(),
            len: data.len(),
        }
    }

    fn from_str(data: &str) -> ByteSlice {
        ByteSlice::from_bytes(data.as_bytes())
    }

    /// Copy the range into an owned string.
    ///
    /// # Safety
    ///
    /// `ptr` must reference `len` readable bytes.
    unsafe fn to_string_copy(self) -> String {
        if self.len == 0 {
            return String::new();
        }
        String::from_utf8_lossy(std::slice::from_raw_parts(self.ptr, self.len)).into_owned()
    }
}

/// The function-pointer table the engine registers at load time.
///
/// Layout is part of the ABI. Entries returning `i32` report a call status
/// (see [`check_call`]). `copy_headers`/`copy_trailers` fill caller-owned
/// arrays: `entries` receives `2 * count` key/value slices pointing into
/// `buf`, which must hold at least the map's reported byte size.
#[repr(C)]
pub struct EngineVTable {
    pub continue_request: unsafe extern "C" fn(req: *mut c_void, status: u64) -> i32,
    pub send_local_reply: unsafe extern "C" fn(
        req: *mut c_void,
        status_code: i32,
        body: ByteSlice,
        headers: *const ByteSlice,
        headers_len: usize,
        grpc_status: i64,
        details: ByteSlice,
    ) -> i32,
    pub get_header:
        unsafe extern "C" fn(req: *mut c_void, key: ByteSlice, out: *mut ByteSlice) -> i32,
    pub copy_headers: unsafe extern "C" fn(
        req: *mut c_void,
        entries: *mut ByteSlice,
        entries_len: usize,
        buf: *mut u8,
        buf_len: usize,
    ) -> i32,
    pub set_header: unsafe extern "C" fn(
        req: *mut c_void,
        key: ByteSlice,
        value: ByteSlice,
        add: i32,
    ) -> i32,
    pub remove_header: unsafe extern "C" fn(req: *mut c_void, key: ByteSlice) -> i32,
    pub copy_trailers: unsafe extern "C" fn(
        req: *mut c_void,
        entries: *mut ByteSlice,
        entries_len: usize,
        buf: *mut u8,
        buf_len: usize,
    ) -> i32,
    pub set_trailer:
        unsafe extern "C" fn(req: *mut c_void, key: ByteSlice, value: ByteSlice) -> i32,
    pub get_buffer: unsafe extern "C" fn(req: *mut c_void, buffer: u64, out: *mut u8) -> i32,
    pub set_buffer: unsafe extern "C" fn(
        req: *mut c_void,
        buffer: u64,
        data: ByteSlice,
        action: i32,
    ) -> i32,
    pub get_string_value:
        unsafe extern "C" fn(req: *mut c_void, value_id: i32, out: *mut ByteSlice) -> i32,
    pub get_dynamic_metadata: unsafe extern "C" fn(
        req: *mut c_void,
        filter_name: ByteSlice,
        out: *mut ByteSlice,
    ) -> i32,
    pub set_dynamic_metadata: unsafe extern "C" fn(
        req: *mut c_void,
        filter_name: ByteSlice,
        key: ByteSlice,
        value: ByteSlice,
    ) -> i32,
    pub finalize: unsafe extern "C" fn(req: *mut c_void, reason: i32),
}

/// String-value ids for `get_string_value`.
const VALUE_ROUTE_NAME: i32 = 1;

/// [`EngineApi`] implementation over the registered vtable.
pub struct FfiEngine {
    vtable: &'static EngineVTable,
}

impl FfiEngine {
    pub fn new(vtable: &'static EngineVTable) -> FfiEngine {
        FfiEngine { vtable }
    }
}

impl EngineApi for FfiEngine {
    fn continue_request(&self, handle: RequestHandle, status: u64) -> EngineResult<()> {
        check_call(unsafe { (self.vtable.continue_request)(handle.as_ptr(), status) })
    }

    fn send_local_reply(&self, handle: RequestHandle, reply: &LocalReply) -> EngineResult<()> {
        let mut flat = Vec::with_capacity(reply.headers.len() * 2);
        for (key, value) in &reply.headers {
            flat.push(ByteSlice::from_str(key));
            flat.push(ByteSlice::from_str(value));
        }
        check_call(unsafe {
            (self.vtable.send_local_reply)(
                handle.as_ptr(),
                reply.status_code as i32,
                ByteSlice::from_str(&reply.body),
                flat.as_ptr(),
                flat.len(),
                reply.grpc_status,
                ByteSlice::from_str(&reply.details),
            )
        })
    }

    fn get_header(&self, handle: RequestHandle, key: &str) -> EngineResult<RawValue> {
        let mut out = ByteSlice::empty();
        check_call(unsafe {
            (self.vtable.get_header)(handle.as_ptr(), ByteSlice::from_str(key), &mut out)
        })?;
        Ok(RawValue::new(out.ptr, out.len))
    }

    fn copy_headers(
        &self,
        handle: RequestHandle,
        count: u64,
        byte_size: u64,
    ) -> EngineResult<Vec<(String, String)>> {
        copy_entries(handle, count, byte_size, self.vtable.copy_headers)
    }

    fn set_header(
        &self,
        handle: RequestHandle,
        key: &str,
        value: &str,
        add: bool,
    ) -> EngineResult<()> {
        check_call(unsafe {
            (self.vtable.set_header)(
                handle.as_ptr(),
                ByteSlice::from_str(key),
                ByteSlice::from_str(value),
                i32::from(add),
            )
        })
    }

    fn remove_header(&self, handle: RequestHandle, key: &str) -> EngineResult<()> {
        check_call(unsafe { (self.vtable.remove_header)(handle.as_ptr(), ByteSlice::from_str(key)) })
    }

    fn copy_trailers(
        &self,
        handle: RequestHandle,
        count: u64,
        byte_size: u64,
    ) -> EngineResult<Vec<(String, String)>> {
        copy_entries(handle, count, byte_size, self.vtable.copy_trailers)
    }

    fn set_trailer(&self, handle: RequestHandle, key: &str, value: &str) -> EngineResult<()> {
        check_call(unsafe {
            (self.vtable.set_trailer)(
                handle.as_ptr(),
                ByteSlice::from_str(key),
                ByteSlice::from_str(value),
            )
        })
    }

    fn get_buffer(
        &self,
        handle: RequestHandle,
        buffer: u64,
        length: u64,
    ) -> EngineResult<Vec<u8>> {
        let mut out = vec![0u8; length as usize];
        check_call(unsafe { (self.vtable.get_buffer)(handle.as_ptr(), buffer, out.as_mut_ptr()) })?;
        Ok(out)
    }

    fn set_buffer(
        &self,
        handle: RequestHandle,
        buffer: u64,
        data: &[u8],
        action: BufferAction,
    ) -> EngineResult<()> {
        check_call(unsafe {
            (self.vtable.set_buffer)(
                handle.as_ptr(),
                buffer,
                ByteSlice::from_bytes(data),
                action.code(),
            )
        })
    }

    fn route_name(&self, handle: RequestHandle) -> EngineResult<String> {
        let mut out = ByteSlice::empty();
        check_call(unsafe {
            (self.vtable.get_string_value)(handle.as_ptr(), VALUE_ROUTE_NAME, &mut out)
        })?;
        // Copy out of native memory before the engine reuses it.
        Ok(unsafe { out.to_string_copy() })
    }

    fn get_dynamic_metadata(
        &self,
        handle: RequestHandle,
        filter_name: &str,
    ) -> EngineResult<serde_json::Value> {
        let mut out = ByteSlice::empty();
        check_call(unsafe {
            (self.vtable.get_dynamic_metadata)(
                handle.as_ptr(),
                ByteSlice::from_str(filter_name),
                &mut out,
            )
        })?;
        if out.len == 0 {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        let raw = unsafe { out.to_string_copy() };
        serde_json::from_str(&raw)
            .map_err(|e| FilterError::fault(format!("engine returned malformed metadata: {e}")))
    }

    fn set_dynamic_metadata(
        &self,
        handle: RequestHandle,
        filter_name: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> EngineResult<()> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| FilterError::fault(format!("unencodable metadata value: {e}")))?;
        check_call(unsafe {
            (self.vtable.set_dynamic_metadata)(
                handle.as_ptr(),
                ByteSlice::from_str(filter_name),
                ByteSlice::from_str(key),
                ByteSlice::from_str(&encoded),
            )
        })
    }

    fn finalize(&self, handle: RequestHandle, reason: FinalizeReason) {
        unsafe { (self.vtable.finalize)(handle.as_ptr(), reason.code()) }
    }
}

type CopyFn = unsafe extern "C" fn(
    req: *mut c_void,
    entries: *mut ByteSlice,
    entries_len: usize,
    buf: *mut u8,
    buf_len: usize,
) -> i32;

/// Shared bulk-copy path for headers and trailers: one native round trip
/// fills the entry table, then everything is copied into owned strings.
fn copy_entries(
    handle: RequestHandle,
    count: u64,
    byte_size: u64,
    copy: CopyFn,
) -> EngineResult<Vec<(String, String)>> {
    let mut buf = vec![0u8; byte_size as usize];
    let mut slices = vec![ByteSlice::empty(); (count as usize).saturating_mul(2)];
    check_call(unsafe {
        copy(
            handle.as_ptr(),
            slices.as_mut_ptr(),
            slices.len(),
            buf.as_mut_ptr(),
            buf.len(),
        )
    })?;
    let mut entries = Vec::with_capacity(count as usize);
    for pair in slices.chunks_exact(2) {
        entries.push(unsafe { (pair[0].to_string_copy(), pair[1].to_string_copy()) });
    }
    Ok(entries)
}
