//! Pipeline configuration.
//!
//! Every tunable threshold in the crate lives here with its default;
//! nothing is hard-coded at call sites. [`PipelineConfig::from_env`]
//! overlays `RAGWEAVE_*` environment variables (a `.env` file is loaded
//! first when present) on top of the defaults.

use std::str::FromStr;
use std::time::Duration;

use crate::consistency::Reduction;

/// Permit pools and breaker tuning for the [`ConcurrencyGovernor`].
///
/// [`ConcurrencyGovernor`]: crate::governor::ConcurrencyGovernor
#[derive(Clone, Debug)]
pub struct GovernorConfig {
    pub retrieval_permits: usize,
    pub generation_permits: usize,
    /// How long a call may wait for a permit before timing out.
    pub acquire_timeout: Duration,
    /// Consecutive failures that open the breaker.
    pub breaker_threshold: u32,
    /// How long an open breaker rejects calls.
    pub cooldown: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            retrieval_permits: 4,
            generation_permits: 4,
            acquire_timeout: Duration::from_secs(5),
            breaker_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Fusion, rerank, and widening tuning for the
/// [`RetrievalFusionEngine`].
///
/// [`RetrievalFusionEngine`]: crate::retrieval::RetrievalFusionEngine
#[derive(Clone, Debug)]
pub struct FusionConfig {
    /// Reciprocal-rank fusion constant.
    pub k_rrf: f32,
    /// Post-rerank top score below which retrieval widens.
    pub score_threshold: f32,
    /// Multiplier on `k_base` for the widened issue.
    pub widen_factor: f32,
    /// Multiplier on `k_final` for the widened issue, rounded up.
    pub widen_k_final_factor: f32,
    /// Per-search-call timeout handed to the governor.
    pub search_timeout: Duration,
    /// Always use hybrid retrieval when a lexical index is configured.
    pub hybrid: bool,
    /// Use hybrid for short queries even when `hybrid` is off.
    pub prefer_hybrid_for_short_queries: bool,
    pub short_query_max_words: usize,
    pub short_query_max_chars: usize,
    /// Character budget for assembled prompt context.
    pub max_context_chars: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            k_rrf: 60.0,
            score_threshold: 0.7,
            widen_factor: 2.0,
            widen_k_final_factor: 1.25,
            search_timeout: Duration::from_secs(10),
            hybrid: false,
            prefer_hybrid_for_short_queries: true,
            short_query_max_words: 5,
            short_query_max_chars: 30,
            max_context_chars: 12_000,
        }
    }
}

/// Thresholds for the [`ConsistencyChecker`].
///
/// [`ConsistencyChecker`]: crate::consistency::ConsistencyChecker
#[derive(Clone, Debug)]
pub struct ConsistencyConfig {
    pub similarity_threshold: f32,
    pub judgment_threshold: f32,
    pub reduction: Reduction,
    pub embed_timeout: Duration,
    pub judge_timeout: Duration,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            judgment_threshold: 7.0,
            reduction: Reduction::Min,
            embed_timeout: Duration::from_secs(10),
            judge_timeout: Duration::from_secs(30),
        }
    }
}

/// Superstep and retry tuning for the [`GraphRunner`].
///
/// [`GraphRunner`]: crate::runner::GraphRunner
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Default branch concurrency for map fan-outs that do not set
    /// their own.
    pub map_max_concurrency: usize,
    /// Default per-branch timeout for map fan-outs.
    pub branch_timeout: Duration,
    /// First backoff delay for the single backend-error retry.
    pub backoff_base: Duration,
    /// Backoff delay cap.
    pub backoff_cap: Duration,
    /// Jitter fraction applied to each delay (0.2 means +/- 20%).
    pub backoff_jitter: f64,
    /// Superstep ceiling guarding against conditional-edge loops.
    pub max_steps: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            map_max_concurrency: 4,
            branch_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(8),
            backoff_jitter: 0.2,
            max_steps: 64,
        }
    }
}

/// Aggregate configuration for one pipeline.
#[derive(Clone, Debug, Default)]
pub struct PipelineConfig {
    pub governor: GovernorConfig,
    pub fusion: FusionConfig,
    pub consistency: ConsistencyConfig,
    pub runner: RunnerConfig,
}

impl PipelineConfig {
    /// Defaults overlaid with `RAGWEAVE_*` environment variables.
    ///
    /// Unset or unparsable variables silently keep the default, so a
    /// partial environment never breaks startup.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        overlay(&mut config.governor.retrieval_permits, "RAGWEAVE_RETRIEVAL_PERMITS");
        overlay(&mut config.governor.generation_permits, "RAGWEAVE_GENERATION_PERMITS");
        overlay_secs(&mut config.governor.acquire_timeout, "RAGWEAVE_ACQUIRE_TIMEOUT_SECS");
        overlay(&mut config.governor.breaker_threshold, "RAGWEAVE_BREAKER_THRESHOLD");
        overlay_secs(&mut config.governor.cooldown, "RAGWEAVE_BREAKER_COOLDOWN_SECS");

        overlay(&mut config.fusion.k_rrf, "RAGWEAVE_K_RRF");
        overlay(&mut config.fusion.score_threshold, "RAGWEAVE_SCORE_THRESHOLD");
        overlay(&mut config.fusion.widen_factor, "RAGWEAVE_WIDEN_FACTOR");
        overlay(
            &mut config.fusion.widen_k_final_factor,
            "RAGWEAVE_WIDEN_K_FINAL_FACTOR",
        );
        overlay_secs(&mut config.fusion.search_timeout, "RAGWEAVE_SEARCH_TIMEOUT_SECS");
        overlay(&mut config.fusion.hybrid, "RAGWEAVE_HYBRID");
        overlay(
            &mut config.fusion.prefer_hybrid_for_short_queries,
            "RAGWEAVE_HYBRID_SHORT_QUERIES",
        );
        overlay(&mut config.fusion.max_context_chars, "RAGWEAVE_MAX_CONTEXT_CHARS");

        overlay(
            &mut config.consistency.similarity_threshold,
            "RAGWEAVE_SIMILARITY_THRESHOLD",
        );
        overlay(
            &mut config.consistency.judgment_threshold,
            "RAGWEAVE_JUDGMENT_THRESHOLD",
        );

        overlay(
            &mut config.runner.map_max_concurrency,
            "RAGWEAVE_MAP_MAX_CONCURRENCY",
        );
        overlay_secs(&mut config.runner.branch_timeout, "RAGWEAVE_BRANCH_TIMEOUT_SECS");
        overlay_secs(&mut config.runner.backoff_base, "RAGWEAVE_BACKOFF_BASE_SECS");
        overlay_secs(&mut config.runner.backoff_cap, "RAGWEAVE_BACKOFF_CAP_SECS");
        overlay(&mut config.runner.max_steps, "RAGWEAVE_MAX_STEPS");

        config
    }

    #[must_use]
    pub fn with_governor(mut self, governor: GovernorConfig) -> Self {
        self.governor = governor;
        self
    }

    #[must_use]
    pub fn with_fusion(mut self, fusion: FusionConfig) -> Self {
        self.fusion = fusion;
        self
    }

    #[must_use]
    pub fn with_consistency(mut self, consistency: ConsistencyConfig) -> Self {
        self.consistency = consistency;
        self
    }

    #[must_use]
    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }
}

fn overlay<T: FromStr>(slot: &mut T, key: &str) {
    if let Ok(raw) = std::env::var(key)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        *slot = value;
    }
}

fn overlay_secs(slot: &mut Duration, key: &str) {
    if let Ok(raw) = std::env::var(key)
        && let Ok(secs) = raw.trim().parse::<u64>()
    {
        *slot = Duration::from_secs(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = PipelineConfig::default();
        assert_eq!(config.governor.retrieval_permits, 4);
        assert_eq!(config.fusion.k_rrf, 60.0);
        assert_eq!(config.fusion.score_threshold, 0.7);
        assert_eq!(config.fusion.widen_factor, 2.0);
        assert_eq!(config.consistency.judgment_threshold, 7.0);
        assert_eq!(config.runner.map_max_concurrency, 4);
        assert_eq!(config.runner.backoff_cap, Duration::from_secs(8));
    }

    #[test]
    fn overlay_ignores_unparsable_values() {
        let mut value = 4usize;
        // No such variable set.
        overlay(&mut value, "RAGWEAVE_TEST_UNSET_KEY");
        assert_eq!(value, 4);
    }
}
