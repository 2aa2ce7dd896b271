//! dmarc-digest Library
//!
//! This library provides the core of the DMARC aggregate report pipeline:
//! container detection and decompression, XML decoding into a canonical report
//! model, DMARC compliance evaluation, idempotent SQLite persistence and the
//! statistics queried by dashboards and tools.

pub mod compliance;
pub mod config;
pub mod decoder;
pub mod decompress;
pub mod encode;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod queries;
pub mod store;

pub use compliance::evaluate;
pub use config::Config;
pub use decoder::decode;
pub use decompress::decompress;
pub use error::{DmarcError, Result};
pub use pipeline::{decode_and_evaluate, ingest, ingest_batch, Attachment, IngestSummary};
pub use store::Store;
