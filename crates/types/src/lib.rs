//! Configuration and error classification for the strata store.
//!
//! This crate holds the types that cross the boundary between the store and
//! the process embedding it:
//! - [`config`]: open-time configuration (storage budgets, key comparison)
//! - [`ErrorCode`]: coarse error classification for callers

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;

pub use config::{
    ConfigError, KeyComparison, KeyDataType, StorageConfig, StoreConfig, StringCollation,
};
pub use error::ErrorCode;
