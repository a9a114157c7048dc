// file: src/logging/mod.rs
// version: 2.0.0
// guid: 19a1b0e5-e12a-43c2-a9eb-293317c7ff17

//! Logging system for the autoinstall ISO builder

pub mod logger;

pub use logger::{init_json_logger, init_logger, with_async_operation_span, with_operation_span};
