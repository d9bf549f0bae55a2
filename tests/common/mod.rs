pub mod backends;
pub mod nodes;

#[allow(unused_imports)]
pub use backends::*;
#[allow(unused_imports)]
pub use nodes::*;

use std::sync::Arc;
use std::time::Duration;

use ragweave::config::{FusionConfig, GovernorConfig, RunnerConfig};
use ragweave::governor::ConcurrencyGovernor;
use ragweave::recorder::EventRecorder;
use ragweave::runner::GraphRunner;

/// A governor with relaxed limits; tests that exercise the limits build
/// their own.
#[allow(dead_code)]
pub fn test_governor() -> Arc<ConcurrencyGovernor> {
    Arc::new(ConcurrencyGovernor::new(&GovernorConfig::default()))
}

/// Runner with short backoffs so retry paths stay fast under test.
#[allow(dead_code)]
pub fn test_runner(recorder: EventRecorder) -> GraphRunner {
    GraphRunner::new(recorder, test_governor(), test_runner_config())
}

#[allow(dead_code)]
pub fn test_runner_config() -> RunnerConfig {
    RunnerConfig {
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(40),
        backoff_jitter: 0.0,
        branch_timeout: Duration::from_secs(5),
        ..RunnerConfig::default()
    }
}

#[allow(dead_code)]
pub fn test_fusion_config() -> FusionConfig {
    FusionConfig {
        search_timeout: Duration::from_secs(2),
        ..FusionConfig::default()
    }
}
