//! Ingestion core for `proxy-audit`: tails a proxy server's access and
//! error logs, parses, filters, batches, and writes to a local SQLite
//! store while publishing realtime aggregates to Redis.
//!
//! The read-side query API, auth, the AI summary worker and GeoIP
//! enrichment are external collaborators and out of scope for this
//! crate; this library exposes only the ingestion pipeline so the
//! binary crate and integration tests can drive it.

pub mod cache;
pub mod collector;
pub mod config;
pub mod error_parser;
pub mod events;
pub mod filter;
pub mod logging;
pub mod parser;
pub mod startup;
pub mod storage;
pub mod tailer;
