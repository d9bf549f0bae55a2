//! Shared concurrency control for backend calls.
//!
//! Every backend call in the pipeline goes through the
//! [`ConcurrencyGovernor`]: one semaphore per resource class bounds
//! in-flight calls, a per-call timeout bounds latency, and a circuit
//! breaker sheds load after a run of consecutive failures.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::warn;

use crate::config::GovernorConfig;

/// The resource classes the governor arbitrates between.
///
/// Retrieval and generation calls have very different latency and cost
/// profiles, so each class gets its own permit pool and breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Retrieval,
    Generation,
}

impl ResourceClass {
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Retrieval => "retrieval",
            Self::Generation => "generation",
        }
    }
}

/// Errors produced by [`ConcurrencyGovernor::run_under`].
///
/// Generic over the guarded future's error type, so no `Diagnostic`
/// derive here; callers wrap these in their own diagnostic errors.
#[derive(Debug, Error)]
pub enum GovernorError<E> {
    /// The guarded future did not finish within the per-call timeout, or
    /// no permit became available within the acquisition timeout.
    #[error("{class} call timed out after {waited_ms}ms")]
    Timeout { class: &'static str, waited_ms: u64 },

    /// The circuit breaker for this class is open.
    #[error("{class} calls rejected: circuit breaker open")]
    Rejected { class: &'static str },

    /// The guarded future itself failed.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

#[derive(Debug)]
struct ClassState {
    permits: Semaphore,
    limit: usize,
    active: AtomicUsize,
    breaker: Mutex<BreakerState>,
}

impl ClassState {
    fn new(limit: usize) -> Self {
        Self {
            permits: Semaphore::new(limit),
            limit,
            active: AtomicUsize::new(0),
            breaker: Mutex::new(BreakerState::default()),
        }
    }
}

/// Bounds concurrent backend calls per [`ResourceClass`].
///
/// Shared by every engine in a pipeline: clone the surrounding `Arc`
/// rather than constructing one governor per component, or the bounds
/// stop being global.
#[derive(Debug)]
pub struct ConcurrencyGovernor {
    retrieval: ClassState,
    generation: ClassState,
    acquire_timeout: Duration,
    breaker_threshold: u32,
    cooldown: Duration,
}

impl ConcurrencyGovernor {
    #[must_use]
    pub fn new(config: &GovernorConfig) -> Self {
        Self {
            retrieval: ClassState::new(config.retrieval_permits),
            generation: ClassState::new(config.generation_permits),
            acquire_timeout: config.acquire_timeout,
            breaker_threshold: config.breaker_threshold,
            cooldown: config.cooldown,
        }
    }

    fn class(&self, class: ResourceClass) -> &ClassState {
        match class {
            ResourceClass::Retrieval => &self.retrieval,
            ResourceClass::Generation => &self.generation,
        }
    }

    /// Number of calls currently holding a permit for `class`.
    #[must_use]
    pub fn active_count(&self, class: ResourceClass) -> usize {
        self.class(class).active.load(Ordering::SeqCst)
    }

    /// Configured permit limit for `class`.
    #[must_use]
    pub fn permit_limit(&self, class: ResourceClass) -> usize {
        self.class(class).limit
    }

    /// Runs `fut` under the permit pool and breaker of `class`, bounded
    /// by `timeout`.
    ///
    /// Order of checks: breaker first (open means immediate
    /// [`GovernorError::Rejected`]), then permit acquisition bounded by
    /// the acquisition timeout, then execution bounded by `timeout`.
    /// Timeouts and inner failures both count against the breaker; a
    /// success resets it.
    pub async fn run_under<T, E, F>(
        &self,
        class: ResourceClass,
        timeout: Duration,
        fut: F,
    ) -> Result<T, GovernorError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let state = self.class(class);
        let label = class.as_label();

        if self.breaker_is_open(state) {
            return Err(GovernorError::Rejected { class: label });
        }

        let started = Instant::now();
        let permit = match tokio::time::timeout(self.acquire_timeout, state.permits.acquire()).await
        {
            Ok(Ok(permit)) => permit,
            // Closed semaphore cannot happen: the governor never closes it.
            Ok(Err(_)) => return Err(GovernorError::Rejected { class: label }),
            Err(_) => {
                self.note_failure(state, label, "permit acquisition timed out");
                return Err(GovernorError::Timeout {
                    class: label,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        state.active.fetch_add(1, Ordering::SeqCst);
        let result = tokio::time::timeout(timeout, fut).await;
        state.active.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        match result {
            Ok(Ok(value)) => {
                self.note_success(state);
                Ok(value)
            }
            Ok(Err(inner)) => {
                self.note_failure(state, label, "call failed");
                Err(GovernorError::Inner(inner))
            }
            Err(_) => {
                self.note_failure(state, label, "call timed out");
                Err(GovernorError::Timeout {
                    class: label,
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    fn breaker_is_open(&self, state: &ClassState) -> bool {
        let mut breaker = state.breaker.lock().unwrap_or_else(|p| p.into_inner());
        match breaker.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                // Cooldown elapsed; half-open, let the next call probe.
                breaker.open_until = None;
                breaker.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    fn note_success(&self, state: &ClassState) {
        let mut breaker = state.breaker.lock().unwrap_or_else(|p| p.into_inner());
        breaker.consecutive_failures = 0;
        breaker.open_until = None;
    }

    fn note_failure(&self, state: &ClassState, label: &'static str, reason: &str) {
        let mut breaker = state.breaker.lock().unwrap_or_else(|p| p.into_inner());
        breaker.consecutive_failures += 1;
        if breaker.consecutive_failures >= self.breaker_threshold {
            breaker.open_until = Some(Instant::now() + self.cooldown);
            warn!(
                class = label,
                failures = breaker.consecutive_failures,
                cooldown_ms = self.cooldown.as_millis() as u64,
                reason,
                "circuit breaker opened"
            );
        }
    }
}
