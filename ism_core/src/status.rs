use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessorStatus {
    #[default]
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid status transition from {from} to {to}")]
pub struct TransitionError {
    pub from: ProcessorStatus,
    pub to: ProcessorStatus,
}

impl ProcessorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorStatus::Created => "CREATED",
            ProcessorStatus::Queued => "QUEUED",
            ProcessorStatus::Running => "RUNNING",
            ProcessorStatus::Completed => "COMPLETED",
            ProcessorStatus::Failed => "FAILED",
            ProcessorStatus::Stopped => "STOPPED",
            ProcessorStatus::Terminate => "TERMINATE",
        }
    }

    pub fn can_transition_to(&self, next: ProcessorStatus) -> bool {
        use ProcessorStatus::*;
        if *self == next {
            return true;
        }
        match self {
            Created => matches!(next, Queued | Running | Failed | Stopped | Terminate),
            Queued => matches!(next, Running | Failed | Stopped | Terminate),
            Running => matches!(next, Completed | Failed | Stopped | Terminate),
            Completed => matches!(next, Failed),
            Stopped => matches!(next, Queued | Running | Failed | Terminate),
            Failed | Terminate => false,
        }
    }

    pub fn transition(self, next: ProcessorStatus) -> Result<ProcessorStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self,
                to: next,
            })
        }
    }

    /// No transition other than to itself leaves this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessorStatus::Failed | ProcessorStatus::Terminate)
    }
}

impl fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(ProcessorStatus::Created),
            "QUEUED" => Ok(ProcessorStatus::Queued),
            "RUNNING" => Ok(ProcessorStatus::Running),
            "COMPLETED" => Ok(ProcessorStatus::Completed),
            "FAILED" => Ok(ProcessorStatus::Failed),
            "STOPPED" => Ok(ProcessorStatus::Stopped),
            "TERMINATE" => Ok(ProcessorStatus::Terminate),
            other => Err(format!("unknown processor status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateDirection {
    Input,
    Output,
}

impl StateDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateDirection::Input => "INPUT",
            StateDirection::Output => "OUTPUT",
        }
    }
}

impl fmt::Display for StateDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INPUT" => Ok(StateDirection::Input),
            "OUTPUT" => Ok(StateDirection::Output),
            other => Err(format!("unknown state direction: {other}")),
        }
    }
}

/// Progress of one processor over one state in one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorState {
    pub processor_id: String,
    pub state_id: String,
    pub direction: StateDirection,
    #[serde(default)]
    pub status: ProcessorStatus,
    #[serde(default)]
    pub current_index: u64,
    #[serde(default)]
    pub maximum_index: u64,
    #[serde(default)]
    pub count: u64,
}

impl ProcessorState {
    pub fn new(
        processor_id: impl Into<String>,
        state_id: impl Into<String>,
        direction: StateDirection,
    ) -> Self {
        Self {
            processor_id: processor_id.into(),
            state_id: state_id.into(),
            direction,
            status: ProcessorStatus::Created,
            current_index: 0,
            maximum_index: 0,
            count: 0,
        }
    }

    pub fn route_id(&self) -> String {
        format!("{}:{}", self.state_id, self.processor_id)
    }

    pub fn transition(&mut self, next: ProcessorStatus) -> Result<(), TransitionError> {
        self.status = self.status.transition(next)?;
        Ok(())
    }

    /// Administrative override back to `CREATED`, bypassing the transition table.
    pub fn reset(&mut self) {
        self.status = ProcessorStatus::Created;
        self.current_index = 0;
    }

    pub fn record_progress(&mut self, current_index: u64, count: u64) {
        self.current_index = current_index;
        self.maximum_index = self.maximum_index.max(current_index);
        self.count = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessorStatus::*;

    const ALL: [ProcessorStatus; 7] = [Created, Queued, Running, Completed, Failed, Stopped, Terminate];

    #[test]
    fn test_happy_path() {
        let mut state = ProcessorState::new("p1", "s1", StateDirection::Input);
        for next in [Queued, Running, Completed] {
            state.transition(next).unwrap();
        }
        assert_eq!(state.status, Completed);
        assert_eq!(state.route_id(), "s1:p1");
    }

    #[test]
    fn test_illegal_transitions() {
        assert_eq!(
            Completed.transition(Running),
            Err(TransitionError { from: Completed, to: Running })
        );
        assert!(Failed.transition(Queued).is_err());
        assert!(Terminate.transition(Running).is_err());
        assert!(Queued.transition(Created).is_err());
        assert!(Running.transition(Queued).is_err());
    }

    #[test]
    fn test_self_transitions_always_allowed() {
        for status in ALL {
            assert!(status.can_transition_to(status), "{status}");
        }
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for status in ALL.into_iter().filter(ProcessorStatus::is_terminal) {
            for next in ALL.into_iter().filter(|next| *next != status) {
                assert!(!status.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_reset_returns_to_created() {
        let mut state = ProcessorState::new("p1", "s1", StateDirection::Output);
        state.transition(Failed).unwrap();
        state.record_progress(5, 5);
        assert!(state.transition(Running).is_err());
        state.reset();
        assert_eq!(state.status, Created);
        assert_eq!(state.maximum_index, 5);
        state.transition(Running).unwrap();
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&Terminate).unwrap(), "\"TERMINATE\"");
        assert_eq!("queued".parse::<ProcessorStatus>().unwrap(), Queued);
        assert_eq!(serde_json::to_string(&StateDirection::Input).unwrap(), "\"INPUT\"");
    }
}
