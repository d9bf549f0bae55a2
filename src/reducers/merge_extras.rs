use super::{Reducer, StateDelta};
use crate::state::PipelineState;

/// Shallow last-writer-wins merge into the extra channel.
#[derive(Debug, PartialEq, Clone, Hash, Eq)]
pub struct MergeExtras;

impl Reducer for MergeExtras {
    fn apply(&self, state: &mut PipelineState, update: &StateDelta) {
        if update.extra.is_empty() {
            return;
        }
        let state_map = state.extra.get_mut();
        for (k, v) in update.extra.iter() {
            state_map.insert(k.clone(), v.clone());
        }
    }
}
