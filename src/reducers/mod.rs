//! Barrier-side state merging.
//!
//! After a superstep, the runner aggregates every node's partial into a
//! [`StateDelta`] and applies it through the [`ReducerRegistry`]. Each
//! reducer owns one channel; the registry skips channels with no data.

mod append_warnings;
mod merge_branches;
mod merge_extras;
mod reducer_registry;

pub use append_warnings::AppendWarnings;
pub use merge_branches::MergeBranches;
pub use merge_extras::MergeExtras;
pub use reducer_registry::*;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::state::PipelineState;
use crate::types::ChannelType;
use std::fmt;

/// One superstep's aggregated state update, built by the runner from the
/// frontier's partials.
///
/// The `branches` map is keyed by branch key; the runner fills it from
/// each branch's own output, so two branches can never address the same
/// slot.
#[derive(Clone, Debug, Default)]
pub struct StateDelta {
    pub extra: FxHashMap<String, Value>,
    pub branches: FxHashMap<String, Value>,
    pub warnings: Vec<String>,
}

impl StateDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extra.is_empty() && self.branches.is_empty() && self.warnings.is_empty()
    }
}

/// Unified reducer trait: every reducer mutates `PipelineState` using a
/// `StateDelta`. Version bumps stay with the barrier, not the reducers.
pub trait Reducer: Send + Sync {
    fn apply(&self, state: &mut PipelineState, update: &StateDelta);
}

#[derive(Debug)]
pub enum ReducerError {
    UnknownChannel(ChannelType),
}

impl fmt::Display for ReducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReducerError::UnknownChannel(channel) => {
                write!(f, "no reducers registered for channel: {channel:?}")
            }
        }
    }
}

impl std::error::Error for ReducerError {}
