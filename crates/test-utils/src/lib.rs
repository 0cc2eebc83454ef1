//! Shared test helpers for the strata workspace.
//!
//! - [`TestDir`]: scratch directory removed on drop
//! - [`assert_eventually`]: poll a condition with a deadline
//! - [`test_store_config`] and friends: ready-made store configurations
//! - [`CrashInjector`]: deterministic failures inside the checkpoint commit
//! - [`strategies`]: proptest generators for keys, values, and operations

#![deny(unsafe_code)]

mod test_dir;
pub use test_dir::TestDir;

mod assertions;
pub use assertions::assert_eventually;

mod config;
pub use config::{SMALL_COPY_CHUNK, test_durable_config, test_store_config, test_typed_config};

mod crash_injector;
pub use crash_injector::{CrashInjector, CrashPoint};

pub mod strategies;
