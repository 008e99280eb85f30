mod gateway;
mod origin;
mod tab;

pub use gateway::ScriptedGateway;
pub use origin::{TestOrigin, START};
pub use tab::TestTab;

use std::sync::Once;
use std::time::Duration;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per process. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Let spawned tasks run until they are all idle. Under a paused clock this
/// also advances time by `STEP`.
pub async fn settle() {
    tokio::time::sleep(STEP).await;
}

const STEP: Duration = Duration::from_millis(10);

/// Poll `condition` until it holds or `limit` of (paused) time elapses.
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let mut waited = Duration::ZERO;
    while waited <= limit {
        if condition() {
            return true;
        }
        settle().await;
        waited += STEP;
    }
    condition()
}
