//! Node lifecycle states.

/// Node operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Built but background work not started.
    Starting,
    /// Background loops and the swap consumer are running.
    Running,
    /// Shutdown signalled, waiting for background work to finish.
    ShuttingDown,
    /// Stopped. Final.
    Stopped,
}

impl NodeState {
    /// Check if the node is serving requests.
    pub fn is_running(&self) -> bool {
        matches!(self, NodeState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Stopped)
    }
}
