use std::fmt;

/// Result of one check-then-act bootstrap step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Created,
    AlreadyPresent,
}

impl StepStatus {
    #[must_use]
    pub fn from_created(created: bool) -> Self {
        if created {
            Self::Created
        } else {
            Self::AlreadyPresent
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Created => f.write_str("created"),
            StepStatus::AlreadyPresent => f.write_str("already exists, skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: String,
    pub status: StepStatus,
}

impl StepReport {
    pub fn new(step: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step: step.into(),
            status,
        }
    }
}

/// True when every step found its object already in place.
#[must_use]
pub fn all_skipped(reports: &[StepReport]) -> bool {
    reports
        .iter()
        .all(|report| report.status == StepStatus::AlreadyPresent)
}
