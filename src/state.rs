//! State management for pipeline execution.
//!
//! This module provides versioned state management with multiple channels
//! for different kinds of pipeline data. Each channel carries its own
//! version number, bumped by the barrier only when the channel actually
//! changed, which makes change detection and no-lost-update checks cheap.
//!
//! # Core Types
//!
//! - [`PipelineState`]: The main state container with versioned channels
//! - [`StateSnapshot`]: Immutable snapshot of state at a point in time
//!
//! # Channels
//!
//! State is organized into three channels:
//! - **Extra**: shared metadata and intermediate results (query text,
//!   assembled context, flags for downstream predicates)
//! - **Branches**: per-branch outputs of map fan-outs, keyed by branch
//!   key; each key is written by exactly one branch
//! - **Warnings**: append-only diagnostics (retry exhaustion, isolated
//!   branch failures, best-effort substitutions)
//!
//! # Examples
//!
//! ```rust
//! use ragweave::state::PipelineState;
//! use serde_json::json;
//!
//! let mut state = PipelineState::new_with_query("what is ownership?");
//! state.add_extra("topic", json!("rust"));
//!
//! let snapshot = state.snapshot();
//! assert_eq!(snapshot.extra.get("query"), Some(&json!("what is ownership?")));
//! assert_eq!(snapshot.extra_version, 1);
//! ```

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Reserved key in the extra channel holding the run's query text.
pub const QUERY_KEY: &str = "query";

/// A value container paired with a version number.
///
/// Versions start at 1 and are bumped by the barrier merge only when the
/// channel's contents changed during a superstep.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct VersionedChannel<T> {
    value: T,
    version: u32,
}

impl<T: Clone> VersionedChannel<T> {
    #[must_use]
    pub fn new(value: T, version: u32) -> Self {
        Self { value, version }
    }

    #[must_use]
    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Clones the channel contents.
    #[must_use]
    pub fn snapshot(&self) -> T {
        self.value.clone()
    }

    /// Increments the version. Called by the barrier after a change.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}

/// The main state container for pipeline execution.
///
/// Three independent channels of versioned data: shared extras, per-branch
/// outputs, and append-only warnings. Nodes never touch this type directly;
/// they receive a [`StateSnapshot`] and return a patch, which the barrier
/// merges through the reducer registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineState {
    /// Shared metadata and intermediate results.
    pub extra: VersionedChannel<FxHashMap<String, Value>>,
    /// Per-branch outputs of map fan-outs, keyed by branch key.
    pub branches: VersionedChannel<FxHashMap<String, Value>>,
    /// Append-only diagnostics.
    pub warnings: VersionedChannel<Vec<String>>,
}

/// Immutable snapshot of pipeline state at a specific point in time.
///
/// Snapshots are created by [`PipelineState::snapshot()`] and handed to
/// nodes during execution; nodes treat them as read-only input. Cloned
/// data and version numbers are independent of later state mutations.
#[derive(Clone, Debug, Default)]
pub struct StateSnapshot {
    pub extra: FxHashMap<String, Value>,
    pub extra_version: u32,
    pub branches: FxHashMap<String, Value>,
    pub branches_version: u32,
    pub warnings: Vec<String>,
    pub warnings_version: u32,
}

impl StateSnapshot {
    /// The run's query text, if the state carries one.
    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.extra.get(QUERY_KEY).and_then(Value::as_str)
    }
}

impl PipelineState {
    /// Creates a new state seeded with a query under [`QUERY_KEY`].
    ///
    /// This is the primary constructor for starting a pipeline run.
    /// All channels start at version 1.
    #[must_use]
    pub fn new_with_query(query: &str) -> Self {
        let mut extra = FxHashMap::default();
        extra.insert(QUERY_KEY.to_string(), Value::String(query.to_string()));
        Self {
            extra: VersionedChannel::new(extra, 1),
            branches: VersionedChannel::default_v1(),
            warnings: VersionedChannel::default_v1(),
        }
    }

    /// Creates a builder for constructing state with a fluent API.
    #[must_use]
    pub fn builder() -> PipelineStateBuilder {
        PipelineStateBuilder::default()
    }

    /// Adds a key-value pair to the extra channel.
    ///
    /// Versions are not incremented here; that is the barrier's job.
    pub fn add_extra(&mut self, key: &str, value: Value) -> &mut Self {
        self.extra.get_mut().insert(key.to_string(), value);
        self
    }

    /// Creates an immutable snapshot of the current state.
    ///
    /// Clones all channel data, so cost is proportional to state size.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            extra: self.extra.snapshot(),
            extra_version: self.extra.version(),
            branches: self.branches.snapshot(),
            branches_version: self.branches.version(),
            warnings: self.warnings.snapshot(),
            warnings_version: self.warnings.version(),
        }
    }
}

impl<T: Clone + Default> VersionedChannel<T> {
    fn default_v1() -> Self {
        Self::new(T::default(), 1)
    }
}

/// Fluent builder for [`PipelineState`], useful for tests and for seeding
/// runs with pre-computed extras.
#[derive(Debug, Default)]
pub struct PipelineStateBuilder {
    extra: FxHashMap<String, Value>,
}

impl PipelineStateBuilder {
    #[must_use]
    pub fn with_query(mut self, query: &str) -> Self {
        self.extra
            .insert(QUERY_KEY.to_string(), Value::String(query.to_string()));
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn build(self) -> PipelineState {
        PipelineState {
            extra: VersionedChannel::new(self.extra, 1),
            branches: VersionedChannel::default_v1(),
            warnings: VersionedChannel::default_v1(),
        }
    }
}
