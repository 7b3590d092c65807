//! Shared vocabulary between the bridge and filter implementations.
//!
//! The numeric codes are part of the wire contract with the proxy engine
//! and must not be renumbered.

use std::fmt;

/// Outcome of a filter phase method, reported back to the engine.
///
/// The generic results apply to every phase; the phase-scoped refinements
/// carry buffering semantics the engine interprets per phase (for data, for
/// example, stop-and-buffer and stop-without-buffering behave differently).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    /// The filter is working asynchronously; the request resumes later via
    /// [`FilterCallbacks::continue_request`](crate::FilterCallbacks::continue_request).
    Running,
    /// A terminal reply was already issued; no further filter methods run.
    LocalReply,
    /// Advance to the next phase immediately.
    Continue,
    /// Stop iteration and buffer the pending data.
    StopAndBuffer,
    /// Stop iteration, buffer, and raise the watermark.
    StopAndBufferWatermark,
    /// Stop iteration without buffering.
    StopNoBuffer,

    // Header-scoped refinements.
    HeaderContinue,
    HeaderStopIteration,
    HeaderContinueAndDontEndStream,
    HeaderStopAllIterationAndBuffer,
    HeaderStopAllIterationAndWatermark,

    // Data-scoped refinements.
    DataContinue,
    DataStopIterationAndBuffer,
    DataStopIterationAndWatermark,
    DataStopIterationNoBuffer,

    // Trailer-scoped refinements.
    TrailerContinue,
    TrailerStopIteration,
}

impl StatusType {
    /// The numeric code the engine understands.
    pub fn code(self) -> u64 {
        match self {
            StatusType::Running => 0,
            StatusType::LocalReply => 1,
            StatusType::Continue => 2,
            StatusType::StopAndBuffer => 3,
            StatusType::StopAndBufferWatermark => 4,
            StatusType::StopNoBuffer => 5,
            StatusType::HeaderContinue => 100,
            StatusType::HeaderStopIteration => 101,
            StatusType::HeaderContinueAndDontEndStream => 102,
            StatusType::HeaderStopAllIterationAndBuffer => 103,
            StatusType::HeaderStopAllIterationAndWatermark => 104,
            StatusType::DataContinue => 200,
            StatusType::DataStopIterationAndBuffer => 201,
            StatusType::DataStopIterationAndWatermark => 202,
            StatusType::DataStopIterationNoBuffer => 203,
            StatusType::TrailerContinue => 300,
            StatusType::TrailerStopIteration => 301,
        }
    }
}

/// One of the six points in the decode/encode lifecycle where the engine
/// yields control to filter logic.
///
/// Decode and encode directions are independent and may interleave in time;
/// within a direction the order is Header, Data, Trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    DecodeHeader,
    DecodeData,
    DecodeTrailer,
    EncodeHeader,
    EncodeData,
    EncodeTrailer,
}

impl Phase {
    /// Decode a phase discriminant carried on the raw engine request.
    pub fn from_code(code: i32) -> Option<Phase> {
        match code {
            1 => Some(Phase::DecodeHeader),
            2 => Some(Phase::DecodeData),
            3 => Some(Phase::DecodeTrailer),
            4 => Some(Phase::EncodeHeader),
            5 => Some(Phase::EncodeData),
            6 => Some(Phase::EncodeTrailer),
            _ => None,
        }
    }

    /// The wire discriminant for this phase.
    pub fn code(self) -> i32 {
        match self {
            Phase::DecodeHeader => 1,
            Phase::DecodeData => 2,
            Phase::DecodeTrailer => 3,
            Phase::EncodeHeader => 4,
            Phase::EncodeData => 5,
            Phase::EncodeTrailer => 6,
        }
    }

    /// True for the request direction.
    pub fn is_decode(self) -> bool {
        matches!(
            self,
            Phase::DecodeHeader | Phase::DecodeData | Phase::DecodeTrailer
        )
    }

    /// True for trailer phases, which route mutations through the
    /// engine's trailer calls instead of the header calls.
    pub fn is_trailer(self) -> bool {
        matches!(self, Phase::DecodeTrailer | Phase::EncodeTrailer)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::DecodeHeader => "decode-header",
            Phase::DecodeData => "decode-data",
            Phase::DecodeTrailer => "decode-trailer",
            Phase::EncodeHeader => "encode-header",
            Phase::EncodeData => "encode-data",
            Phase::EncodeTrailer => "encode-trailer",
        };
        f.write_str(name)
    }
}

/// Why a request is being destroyed, passed unchanged to the filter's
/// destroy hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// The stream completed normally.
    Normal,
    /// The engine terminated the stream early.
    Terminate,
}

impl DestroyReason {
    /// Decode the engine's reason code.
    pub fn from_code(code: u64) -> Option<DestroyReason> {
        match code {
            0 => Some(DestroyReason::Normal),
            1 => Some(DestroyReason::Terminate),
            _ => None,
        }
    }
}

/// A borrowed view of bytes owned by the engine.
///
/// Returned by the zero-copy read path. The bytes live in native memory and
/// remain valid only until the next native mutation of the structure they
/// came from; copy them out before mutating or suspending.
#[derive(Debug, Clone, Copy)]
pub struct RawValue {
    ptr: *const u8,
    len: usize,
}

impl RawValue {
    /// Wrap a pointer and length handed back by the engine.
    pub fn new(ptr: *const u8, len: usize) -> RawValue {
        RawValue { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the underlying bytes.
    ///
    /// # Safety
    ///
    /// The caller must ensure the engine has not mutated the owning native
    /// structure since this value was obtained, and must not hold the slice
    /// across such a mutation.
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(self.ptr, self.len)
        }
    }
}
