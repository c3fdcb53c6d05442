//! Shared helpers for monodag's integration tests: graph builders, a fake
//! executor backend and test-friendly tracing.

pub mod builders;
pub mod fake_executor;

pub use builders::{ProjectBuilder, ProjectGraphBuilder, TargetBuilder};
pub use fake_executor::FakeExecutor;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

/// Upper bound for any single awaited step in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

static INIT: Once = Once::new();

/// Install a tracing subscriber whose output the test harness captures,
/// so logs only show up for failing tests (or with `--nocapture`).
///
/// The filter comes from `MONODAG_LOG`, then `RUST_LOG`, then `info`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = std::env::var(monodag::logging::LOG_ENV)
            .ok()
            .and_then(|s| EnvFilter::try_new(s).ok())
            .or_else(|| EnvFilter::try_from_default_env().ok())
            .unwrap_or_else(|| EnvFilter::new("info"));

        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Await `f`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(TEST_TIMEOUT, f).await {
        Ok(value) => value,
        Err(_) => panic!("test step timed out after {TEST_TIMEOUT:?}"),
    }
}
