//! Update state machine.

use std::fmt;

/// Progress of one update run.
///
/// ```text
/// Idle -> SessionOpen -> MetadataSet -> Streaming(0..n) -> Verified -> Closed
///   any non-terminal state -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateState {
    #[default]
    Idle,
    /// enterDFU acknowledged.
    SessionOpen,
    /// setApplicationMetadata acknowledged.
    MetadataSet,
    /// Streaming the row with this zero-based index.
    Streaming(usize),
    /// verifyApplication reported a valid image.
    Verified,
    /// exitDFU sent after a successful verify.
    Closed,
    Failed,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateState::Idle => write!(f, "IDLE"),
            UpdateState::SessionOpen => write!(f, "SESSION_OPEN"),
            UpdateState::MetadataSet => write!(f, "METADATA_SET"),
            UpdateState::Streaming(row) => write!(f, "STREAMING({row})"),
            UpdateState::Verified => write!(f, "VERIFIED"),
            UpdateState::Closed => write!(f, "CLOSED"),
            UpdateState::Failed => write!(f, "FAILED"),
        }
    }
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateState::Closed | UpdateState::Failed)
    }

    /// Whether the device has accepted enterDFU and not yet been told to exit.
    pub fn is_session_open(&self) -> bool {
        matches!(
            self,
            UpdateState::SessionOpen
                | UpdateState::MetadataSet
                | UpdateState::Streaming(_)
                | UpdateState::Verified
        )
    }

    pub fn can_transition_to(&self, next: UpdateState) -> bool {
        use UpdateState::*;
        match (*self, next) {
            (Idle, SessionOpen) => true,
            (SessionOpen, MetadataSet) => true,
            (MetadataSet, Streaming(0)) => true,
            (Streaming(cur), Streaming(n)) => n == cur + 1,
            (MetadataSet | Streaming(_), Verified) => true,
            (Verified, Closed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Runtime state of an update, mutated only by the orchestrator.
#[derive(Debug, Default)]
pub struct UpdateContext {
    pub state: UpdateState,
    /// Rows committed with programData.
    pub rows_programmed: usize,
    /// Row bytes committed.
    pub bytes_programmed: u64,
    /// Application flash span declared by the image.
    pub app_length: u64,
}

impl UpdateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: UpdateState) {
        debug_assert!(
            self.state.can_transition_to(new_state),
            "illegal transition {} -> {}",
            self.state,
            new_state
        );
        tracing::debug!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }

    /// Move to `Failed` unless already terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.goto_state(UpdateState::Failed);
        }
    }

    pub fn record_row(&mut self, len: usize) {
        self.rows_programmed += 1;
        self.bytes_programmed += len as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut ctx = UpdateContext::new();
        for next in [
            UpdateState::SessionOpen,
            UpdateState::MetadataSet,
            UpdateState::Streaming(0),
            UpdateState::Streaming(1),
            UpdateState::Verified,
            UpdateState::Closed,
        ] {
            ctx.goto_state(next);
        }
        assert_eq!(ctx.state, UpdateState::Closed);
        assert!(ctx.state.is_terminal());
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!UpdateState::Idle.can_transition_to(UpdateState::MetadataSet));
        assert!(!UpdateState::Streaming(2).can_transition_to(UpdateState::Streaming(4)));
        assert!(!UpdateState::SessionOpen.can_transition_to(UpdateState::Verified));
        assert!(!UpdateState::Closed.can_transition_to(UpdateState::Failed));
        assert!(!UpdateState::Failed.can_transition_to(UpdateState::Failed));
    }

    #[test]
    fn test_fail_from_any_open_state() {
        for state in [
            UpdateState::Idle,
            UpdateState::SessionOpen,
            UpdateState::Streaming(7),
            UpdateState::Verified,
        ] {
            let mut ctx = UpdateContext {
                state,
                ..Default::default()
            };
            ctx.fail();
            assert_eq!(ctx.state, UpdateState::Failed);
        }
    }

    #[test]
    fn test_session_open() {
        assert!(!UpdateState::Idle.is_session_open());
        assert!(UpdateState::Streaming(3).is_session_open());
        assert!(UpdateState::Verified.is_session_open());
        assert!(!UpdateState::Closed.is_session_open());
        assert!(!UpdateState::Failed.is_session_open());
    }

    #[test]
    fn test_record_row() {
        let mut ctx = UpdateContext::new();
        ctx.record_row(512);
        ctx.record_row(88);
        assert_eq!(ctx.rows_programmed, 2);
        assert_eq!(ctx.bytes_programmed, 600);
    }
}
