use super::{Reducer, StateDelta};
use crate::state::PipelineState;

/// Appends diagnostics to the warnings channel. Never drops or reorders
/// existing entries.
#[derive(Debug, PartialEq, Clone, Hash, Eq)]
pub struct AppendWarnings;

impl Reducer for AppendWarnings {
    fn apply(&self, state: &mut PipelineState, update: &StateDelta) {
        if update.warnings.is_empty() {
            return;
        }
        state
            .warnings
            .get_mut()
            .extend(update.warnings.iter().cloned());
    }
}
