//! Filter-facing contract for the Trestle HTTP filter bridge.
//!
//! A filter participates in the proxy engine's decode/encode pipeline by
//! implementing [`HttpFilter`]. The bridge calls one phase method per engine
//! callback and hands back the returned [`StatusType`]. A filter that needs
//! to work asynchronously returns [`StatusType::Running`] and later resumes
//! the request through its [`FilterCallbacks`] handle, from any task.
//!
//! # Example
//!
//! ```ignore
//! use trestle_filter_api::*;
//!
//! struct AddHeader;
//!
//! impl HttpFilter for AddHeader {
//!     fn decode_headers(&self, headers: &dyn HeaderMap, _end_stream: bool) -> FilterResult {
//!         headers.set("x-processed-by", "trestle")?;
//!         Ok(StatusType::Continue)
//!     }
//! }
//! ```

mod error;
mod filter;
mod passthrough;
mod types;

pub use error::{ErrorCategory, FilterError};
pub use filter::{
    BufferInstance, ConfigError, ConfigParser, FilterCallbacks, FilterConfig, FilterFactory,
    FilterResult, HeaderMap, HttpFilter, LocalReply,
};
pub use passthrough::{PassThroughFactory, PassThroughFilter};
pub use types::{DestroyReason, Phase, RawValue, StatusType};
