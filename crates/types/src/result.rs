//! Step results and status transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::VariableStore;

/// Exit codes reported in [`StepResult::code`].
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    /// Shell could not find the command.
    pub const UNKNOWN_COMMAND: i32 = 127;
    /// Synthetic code for a step that exceeded its deadline.
    pub const TIMEOUT: i32 = -100;
    /// Synthetic code for a step cancelled by the operator.
    pub const KILLED: i32 = -1;
    /// Synthetic code when the backend did not report one. Shares `-1` with
    /// [`KILLED`]; the status disambiguates.
    pub const UNKNOWN: i32 = -1;
}

/// Lifecycle status of a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Skipped,
    Exception,
    Killed,
    Timeout,
}

impl StepStatus {
    /// Whether no further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Skipped | StepStatus::Exception | StepStatus::Killed | StepStatus::Timeout
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Skipped)
    }

    pub fn display(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Success => "SUCCESS",
            StepStatus::Skipped => "SKIPPED",
            StepStatus::Exception => "EXCEPTION",
            StepStatus::Killed => "KILLED",
            StepStatus::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display())
    }
}

/// Structured outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub id: String,
    pub status: StepStatus,
    pub code: i32,
    pub start_at: Option<DateTime<Utc>>,
    pub finish_at: Option<DateTime<Utc>>,
    /// Host pid or in-container pid of the step shell.
    pub process_id: Option<u32>,
    /// Container ids in declaration order.
    pub containers: Vec<String>,
    /// Filtered environment exported by the step.
    pub output: VariableStore,
    /// Number of log lines written for the step.
    pub log_size: u64,
    pub error: Option<String>,
}

impl StepResult {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: StepStatus::Pending,
            code: exit_code::UNKNOWN,
            start_at: None,
            finish_at: None,
            process_id: None,
            containers: Vec::new(),
            output: VariableStore::new(),
            log_size: 0,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves a pending result to RUNNING and stamps `start_at` once.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = StepStatus::Running;
        self.start_at.get_or_insert(now);
        true
    }

    /// Records a terminal status. Returns `false` if the result was already terminal.
    pub fn finish(&mut self, status: StepStatus, code: i32, now: DateTime<Utc>) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        let start = *self.start_at.get_or_insert(now);
        self.status = status;
        self.code = code;
        self.finish_at = Some(now.max(start));
        true
    }

    /// Records an error message together with a terminal EXCEPTION.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.error = Some(error.into());
        self.finish(StepStatus::Exception, self.code, now)
    }

    /// Clears attempt-scoped fields before a retry.
    ///
    /// `id`, `containers` and the step-scoped `start_at` survive.
    pub fn reset_for_retry(&mut self) {
        self.status = StepStatus::Running;
        self.code = exit_code::UNKNOWN;
        self.finish_at = None;
        self.process_id = None;
        self.output = VariableStore::new();
        self.error = None;
    }

    /// Elapsed time between start and finish.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finish_at? - self.start_at?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn terminal_status_never_changes() {
        let now = Utc::now();
        let mut result = StepResult::new("s");
        assert!(result.mark_running(now));
        assert!(result.finish(StepStatus::Timeout, exit_code::TIMEOUT, now + Duration::seconds(1)));
        assert!(!result.finish(StepStatus::Success, 0, now + Duration::seconds(2)));
        assert!(!result.mark_running(now));
        assert_eq!(result.status, StepStatus::Timeout);
        assert_eq!(result.code, exit_code::TIMEOUT);
        assert_eq!(result.duration(), Some(Duration::seconds(1)));
    }

    #[test]
    fn finish_without_start_keeps_ordering() {
        let now = Utc::now();
        let mut result = StepResult::new("s");
        assert!(result.fail("bad volume string", now));
        assert_eq!(result.status, StepStatus::Exception);
        assert!(result.finish_at.unwrap() >= result.start_at.unwrap());
    }

    #[test]
    fn retry_reset_keeps_identity_and_containers() {
        let now = Utc::now();
        let mut result = StepResult::new("s");
        result.mark_running(now);
        result.containers.push("abc".into());
        result.code = 2;
        result.error = Some("boom".into());
        result.reset_for_retry();
        assert_eq!(result.id, "s");
        assert_eq!(result.containers, vec!["abc".to_string()]);
        assert_eq!(result.start_at, Some(now));
        assert_eq!(result.status, StepStatus::Running);
        assert!(result.error.is_none());
    }

    #[test]
    fn status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&StepStatus::Exception).unwrap(), "\"EXCEPTION\"");
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }
}
