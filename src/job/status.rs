/// Job lifecycle as reported to the dispatch service.
///
/// Transitions only move forward:
/// `Activating → Running → {Completed | Failed | Stopped}`, with `Failed`
/// also reachable from `Activating`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Activating,
    Running,
    Completed,
    Failed { exception: String },
    Stopped,
}

impl JobStatus {
    pub fn failed(exception: impl Into<String>) -> Self {
        Self::Failed {
            exception: exception.into(),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Activating => 1,
            Self::Running => 2,
            Self::Completed => 3,
            Self::Failed { .. } => 4,
            Self::Stopped => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. } | Self::Stopped)
    }

    pub fn exception(&self) -> Option<&str> {
        match self {
            Self::Failed { exception } => Some(exception),
            _ => None,
        }
    }

    /// Whether `next` may follow `current`; `None` means nothing was reported yet.
    pub fn can_follow(current: Option<&JobStatus>, next: &JobStatus) -> bool {
        match (current, next) {
            (None, JobStatus::Activating | JobStatus::Failed { .. }) => true,
            (Some(JobStatus::Activating), JobStatus::Running | JobStatus::Failed { .. }) => true,
            (Some(JobStatus::Running), next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activating => "Activating",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed { .. } => "Failed",
            Self::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_terminal_flags() {
        assert_eq!(JobStatus::Activating.code(), 1);
        assert_eq!(JobStatus::Running.code(), 2);
        assert_eq!(JobStatus::Completed.code(), 3);
        assert_eq!(JobStatus::failed("boom").code(), 4);
        assert_eq!(JobStatus::Stopped.code(), 5);

        assert!(!JobStatus::Activating.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
        assert_eq!(JobStatus::failed("boom").exception(), Some("boom"));
        assert_eq!(JobStatus::Completed.exception(), None);
    }

    #[test]
    fn test_forward_transitions() {
        assert!(JobStatus::can_follow(None, &JobStatus::Activating));
        assert!(JobStatus::can_follow(Some(&JobStatus::Activating), &JobStatus::Running));
        assert!(JobStatus::can_follow(Some(&JobStatus::Activating), &JobStatus::failed("x")));
        assert!(JobStatus::can_follow(Some(&JobStatus::Running), &JobStatus::Completed));
        assert!(JobStatus::can_follow(Some(&JobStatus::Running), &JobStatus::Stopped));
    }

    #[test]
    fn test_no_transition_out_of_terminal_or_backwards() {
        assert!(!JobStatus::can_follow(None, &JobStatus::Running));
        assert!(!JobStatus::can_follow(Some(&JobStatus::Running), &JobStatus::Activating));
        assert!(!JobStatus::can_follow(Some(&JobStatus::Activating), &JobStatus::Completed));
        for terminal in [JobStatus::Completed, JobStatus::Stopped, JobStatus::failed("x")] {
            assert!(!JobStatus::can_follow(Some(&terminal), &JobStatus::Running));
            assert!(!JobStatus::can_follow(Some(&terminal), &JobStatus::failed("again")));
        }
    }
}
