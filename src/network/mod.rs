// file: src/network/mod.rs
// version: 2.0.0
// guid: c6c8b23d-4815-4b6d-bbcc-d9b07224f598

//! Network operations module

pub mod fetcher;
pub mod manifest;
pub mod transport;

pub use fetcher::{CacheEntry, ImageFetcher};
pub use manifest::{image_filename, ChecksumManifest, MANIFEST_FILENAME};
pub use transport::{HttpTransport, MemoryTransport, RangeResponse, Transport};
