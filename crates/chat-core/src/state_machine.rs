use crate::{error::TimelineError, types::LoadStatus};

/// Load lifecycle of one conversation timeline.
///
/// `Idle -> Loading -> Ready`, `Idle -> Loading -> Failed`, `Failed -> Loading`.
#[derive(Debug, Clone, Default)]
pub struct TimelineLifecycle {
    state: LoadStatus,
}

impl TimelineLifecycle {
    pub fn state(&self) -> LoadStatus {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LoadStatus::Ready
    }

    pub fn is_loading(&self) -> bool {
        self.state == LoadStatus::Loading
    }

    pub fn begin_load(&mut self) -> Result<LoadStatus, TimelineError> {
        self.transition_from_any_of(
            &[LoadStatus::Idle, LoadStatus::Failed],
            LoadStatus::Loading,
            "begin_load",
        )
    }

    pub fn on_load_result(&mut self, success: bool) -> Result<LoadStatus, TimelineError> {
        let next = if success {
            LoadStatus::Ready
        } else {
            LoadStatus::Failed
        };
        self.transition_from_any_of(&[LoadStatus::Loading], next, "on_load_result")
    }

    pub fn require_ready(&self, action: &'static str) -> Result<(), TimelineError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(TimelineError::invalid_state(self.state, action))
        }
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[LoadStatus],
        next: LoadStatus,
        action: &'static str,
    ) -> Result<LoadStatus, TimelineError> {
        if !expected.contains(&self.state) {
            return Err(TimelineError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(next)
    }
}
