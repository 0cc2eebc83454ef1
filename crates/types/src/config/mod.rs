//! Configuration types for the strata store.
//!
//! Configuration is supplied by the embedding process, typically deserialized
//! from TOML or JSON. All config structs validate their values at construction
//! time via fallible builders. Post-deserialization validation is available
//! via the `validate()` method on each struct.

// The schemars `JsonSchema` derive macro internally uses `.unwrap()` in its
// expansions. Config types are declarative structs with minimal procedural code.
#![allow(clippy::unwrap_used)]

mod key;
mod storage;
mod store;

pub use key::*;
use snafu::Snafu;
pub use storage::*;
pub use store::*;

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range or
/// violates a cross-field constraint.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}
