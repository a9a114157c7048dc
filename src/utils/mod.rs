// file: src/utils/mod.rs
// version: 2.0.0
// guid: 977bae45-984b-40e9-aceb-42e5a09afbff

//! Utility modules

pub mod crypto;

pub use crypto::CryptoUtils;
