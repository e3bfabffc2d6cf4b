//! Tracing for tests.
//!
//! Events go to the test-harness writer, so they only show for failing
//! tests (or with `--nocapture`). The subscriber is installed at most once
//! per process; every later call is a no-op.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset: control loop and IPC chatter at
/// debug, everything else at warn.
pub const DEFAULT_TEST_FILTER: &str = "warn,fanguard_core=debug,fanguard_config=debug";

/// Install the test subscriber with `RUST_LOG` or [`DEFAULT_TEST_FILTER`].
///
/// ```ignore
/// #[tokio::test]
/// async fn my_test() {
///     fanguard_test_utils::init_test_tracing();
///     tracing::debug!("captured by the harness");
/// }
/// ```
pub fn init_test_tracing() {
    init_test_tracing_with(DEFAULT_TEST_FILTER);
}

/// Like [`init_test_tracing`] with an explicit fallback directive.
pub fn init_test_tracing_with(directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .compact()
        .try_init();
}
