use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::{
    reducers::{AppendWarnings, MergeBranches, MergeExtras, Reducer, ReducerError, StateDelta},
    state::PipelineState,
    types::ChannelType,
};
use tracing::instrument;

/// Maps each state channel to its reducers.
#[derive(Clone)]
pub struct ReducerRegistry {
    reducer_map: FxHashMap<ChannelType, Vec<Arc<dyn Reducer>>>,
}

/// Whether the delta carries data for the channel; lets the registry
/// skip reducers with nothing to do.
fn channel_guard(channel: ChannelType, delta: &StateDelta) -> bool {
    match channel {
        ChannelType::Extra => !delta.extra.is_empty(),
        ChannelType::Branches => !delta.branches.is_empty(),
        ChannelType::Warnings => !delta.warnings.is_empty(),
    }
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry
            .register(ChannelType::Extra, Arc::new(MergeExtras))
            .register(ChannelType::Branches, Arc::new(MergeBranches))
            .register(ChannelType::Warnings, Arc::new(AppendWarnings));
        registry
    }
}

impl ReducerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            reducer_map: FxHashMap::default(),
        }
    }

    /// Registers a reducer for a channel. Multiple reducers on the same
    /// channel apply in registration order.
    pub fn register(&mut self, channel: ChannelType, reducer: Arc<dyn Reducer>) -> &mut Self {
        self.reducer_map.entry(channel).or_default().push(reducer);
        self
    }

    /// Builder-style variant of [`register`](Self::register).
    #[must_use]
    pub fn with_reducer(mut self, channel: ChannelType, reducer: Arc<dyn Reducer>) -> Self {
        self.register(channel, reducer);
        self
    }

    #[instrument(skip(self, state, delta), err)]
    pub fn try_update(
        &self,
        channel: ChannelType,
        state: &mut PipelineState,
        delta: &StateDelta,
    ) -> Result<(), ReducerError> {
        if !channel_guard(channel, delta) {
            return Ok(());
        }
        if let Some(reducers) = self.reducer_map.get(&channel) {
            for reducer in reducers {
                reducer.apply(state, delta);
            }
            Ok(())
        } else {
            Err(ReducerError::UnknownChannel(channel))
        }
    }

    /// Applies `delta` across every registered channel.
    #[instrument(skip(self, state, delta), err)]
    pub fn apply_all(
        &self,
        state: &mut PipelineState,
        delta: &StateDelta,
    ) -> Result<(), ReducerError> {
        for channel in self.reducer_map.keys() {
            self.try_update(*channel, state, delta)?;
        }
        Ok(())
    }
}
