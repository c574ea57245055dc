use std::fmt;

use serde::Serialize;

/// Where a job's sandbox is in its lifetime, as seen by the controller
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unprovisioned,
    Created,
    Populated,
    Running,
    Stopped,
    Removed,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Removed | LifecycleState::Failed)
    }

    /// Cleanup may start from any provisioned state, so `Stopped` and `Removed`
    /// are reachable without passing through `Running`.
    pub fn can_advance_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            (Unprovisioned, Created) => true,
            (Created, Populated) => true,
            (Populated, Running) => true,
            (Created | Populated | Running, Stopped) => true,
            (Created | Populated | Running | Stopped, Removed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Unprovisioned => "unprovisioned",
            LifecycleState::Created => "created",
            LifecycleState::Populated => "populated",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Removed => "removed",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-job state tracker
#[derive(Debug)]
pub struct Lifecycle {
    job_id: String,
    state: LifecycleState,
}

impl Lifecycle {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: LifecycleState::Unprovisioned,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Moves to `next`, ignoring (and logging) transitions the machine does not allow
    pub fn advance(&mut self, next: LifecycleState) -> bool {
        if !self.state.can_advance_to(next) {
            log::error!(
                "Job {}: refusing lifecycle transition {} -> {}",
                self.job_id,
                self.state,
                next
            );
            return false;
        }
        log::debug!("Job {}: {} -> {}", self.job_id, self.state, next);
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut lifecycle = Lifecycle::new("job-1");
        for next in [Created, Populated, Running, Stopped, Removed] {
            assert!(lifecycle.advance(next), "transition to {next} rejected");
        }
        assert_eq!(lifecycle.state(), Removed);
    }

    #[test]
    fn test_cleanup_reachable_before_running() {
        assert!(Created.can_advance_to(Stopped));
        assert!(Populated.can_advance_to(Removed));
        assert!(!Unprovisioned.can_advance_to(Stopped));
        assert!(!Unprovisioned.can_advance_to(Removed));
    }

    #[test]
    fn test_terminal_states_absorb() {
        let mut lifecycle = Lifecycle::new("job-2");
        assert!(lifecycle.advance(Failed));
        assert!(!lifecycle.advance(Created));
        assert!(!lifecycle.advance(Removed));
        assert_eq!(lifecycle.state(), Failed);
        assert!(!Removed.can_advance_to(Failed));
    }

    #[test]
    fn test_no_skipping_forward() {
        assert!(!Created.can_advance_to(Running));
        assert!(!Running.can_advance_to(Populated));
        assert!(!Stopped.can_advance_to(Running));
    }
}
