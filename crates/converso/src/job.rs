//! Remote job state tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{Args, ModuleResponse, ProgressEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job {id} is already {status}")]
    AlreadyTerminal { id: String, status: JobStatus },
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

impl JobError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyTerminal { .. } => "JOB_TERMINAL",
            Self::InvalidTransition { .. } => "JOB_INVALID_TRANSITION",
        }
    }
}

/// Unit of remote work: one module command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub module: String,
    pub command: String,
    #[serde(default)]
    pub args: Args,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "pending")]
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressEvent>,
    /// Final module response. Failures and cancellations carry a failed response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ModuleResponse>,
}

fn pending() -> JobStatus {
    JobStatus::Pending
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        module: impl Into<String>,
        command: impl Into<String>,
        args: Args,
    ) -> Self {
        Self {
            id: id.into(),
            kind: "module".to_string(),
            module: module.into(),
            command: command.into(),
            args,
            created_at: Utc::now(),
            expires_at: None,
            priority: 0,
            status: JobStatus::Pending,
            progress: None,
            result: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// pending → running
    pub fn start(&mut self) -> Result<(), JobError> {
        self.transition(&[JobStatus::Pending], JobStatus::Running)?;
        self.progress = Some(ProgressEvent::new("starting", 0, 100).with_message("Job started"));
        Ok(())
    }

    pub fn record_progress(&mut self, event: ProgressEvent) -> Result<(), JobError> {
        self.transition(&[JobStatus::Running], JobStatus::Running)?;
        self.progress = Some(event);
        Ok(())
    }

    /// running → completed, or failed when the module reported failure.
    pub fn finish(&mut self, response: ModuleResponse) -> Result<(), JobError> {
        let to = if response.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.transition(&[JobStatus::Running], to)?;
        self.result = Some(response);
        Ok(())
    }

    /// running → failed
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), JobError> {
        self.transition(&[JobStatus::Running], JobStatus::Failed)?;
        self.result = Some(ModuleResponse::failure(error));
        Ok(())
    }

    /// pending | running → cancelled
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), JobError> {
        self.transition(&[JobStatus::Pending, JobStatus::Running], JobStatus::Cancelled)?;
        self.result = Some(ModuleResponse::failure(reason));
        Ok(())
    }

    /// Error message of a failed or cancelled job.
    pub fn error(&self) -> Option<&str> {
        self.result
            .as_ref()
            .filter(|r| !r.success)
            .map(|r| r.error.as_str())
    }

    fn transition(&mut self, allowed: &[JobStatus], to: JobStatus) -> Result<(), JobError> {
        if self.status.is_terminal() {
            return Err(JobError::AlreadyTerminal {
                id: self.id.clone(),
                status: self.status,
            });
        }
        if !allowed.contains(&self.status) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
