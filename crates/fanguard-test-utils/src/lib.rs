#![deny(unsafe_code)]

//! Shared test utilities for the fanguard workspace.
//!
//! Provides reusable fixtures, config builders, and tracing helpers so that
//! individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! fanguard-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod strategies;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use daemon::TestDaemon;
pub use tracing_setup::init_test_tracing;
