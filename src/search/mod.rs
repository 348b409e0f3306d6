//! Span search backend access: index resolution, query building, and the
//! typed store adapter over the document search engine.

pub mod indices;
pub mod query;
pub mod store;

pub use store::{HttpTransport, SearchResponse, SearchTransport, SpanStore};
