use super::{Reducer, StateDelta};
use crate::state::PipelineState;

/// Per-key last-writer-wins merge into the branches channel.
///
/// Commutative across a fan-out because the runner keys the delta by
/// each branch's own key; application order between branches cannot
/// change the result.
#[derive(Debug, PartialEq, Clone, Hash, Eq)]
pub struct MergeBranches;

impl Reducer for MergeBranches {
    fn apply(&self, state: &mut PipelineState, update: &StateDelta) {
        if update.branches.is_empty() {
            return;
        }
        let state_map = state.branches.get_mut();
        for (k, v) in update.branches.iter() {
            state_map.insert(k.clone(), v.clone());
        }
    }
}
