//! Trace reconstruction and the public read path.
//!
//! Flat span documents come back from the search backend; this module parses
//! them into typed spans, derives trace-level fields (token usage, status,
//! input/output, baggage), and serves the paginated overview/by-id/export
//! operations.

pub mod assemble;
pub mod cursor;
pub mod extract;
pub mod service;
pub mod span;

pub use cursor::PaginationCursor;
pub use service::TraceService;
pub use span::{Span, StatusCode};
