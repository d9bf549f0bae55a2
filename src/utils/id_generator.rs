//! Time-ordered unique identifiers for runs and events.
//!
//! Ids are a millisecond timestamp prefix followed by a random suffix:
//! sortable by creation time, unique without coordination, and readable
//! in log output.

use chrono::Utc;
use uuid::Uuid;

/// Generates time-ordered ids for graph invocations and node runs.
///
/// Stateless and cheap to clone; a fresh instance behaves identically.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// A new id for one graph invocation.
    #[must_use]
    pub fn graph_id(&self) -> String {
        self.mint("g")
    }

    /// A new id for one node execution (one attempt).
    #[must_use]
    pub fn run_id(&self) -> String {
        self.mint("r")
    }

    /// A new id for one recorded event.
    #[must_use]
    pub fn event_id(&self) -> String {
        self.mint("e")
    }

    fn mint(&self, prefix: &str) -> String {
        let millis = Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple();
        format!("{prefix}-{millis}-{suffix}")
    }
}
