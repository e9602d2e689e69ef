use serde::Serialize;
use strum_macros::Display;
use thiserror::Error;
use time::OffsetDateTime;

use crate::mesh::DeviceAddress;

/// Stages an update task moves through.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStage {
    #[strum(to_string = "idle")]
    Idle,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "uploading")]
    Uploading,
    #[strum(to_string = "verifying")]
    Verifying,
    #[strum(to_string = "rebooting")]
    Rebooting,
    #[strum(to_string = "complete")]
    Complete,
    #[strum(to_string = "failed")]
    Failed,
}

/// Per-task errors surfaced by the update pipeline.
///
/// Everything except [`UpdateError::Cancelled`] is retryable at the
/// whole-task level.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum UpdateError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("verification failed: {0}")]
    VerificationFailed(String),
    #[error("update cancelled")]
    Cancelled,
}

impl UpdateError {
    /// Returns whether the queue may schedule a re-attempt for this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// One device's update, mutated only by the queue manager.
#[derive(Debug, Clone)]
pub struct UpdateTask {
    pub(crate) device: DeviceAddress,
    pub(crate) stage: UpdateStage,
    pub(crate) bytes_transferred: u64,
    pub(crate) total_bytes: u64,
    pub(crate) retry_count: u32,
    pub(crate) max_retries: u32,
    pub(crate) started_at: OffsetDateTime,
    pub(crate) completed_at: Option<OffsetDateTime>,
    pub(crate) error_message: Option<String>,
    pub(crate) terminal: bool,
}

impl UpdateTask {
    pub(crate) fn new(device: DeviceAddress, total_bytes: u64, max_retries: u32) -> Self {
        Self {
            device,
            stage: UpdateStage::Idle,
            bytes_transferred: 0,
            total_bytes,
            retry_count: 0,
            max_retries,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            error_message: None,
            terminal: false,
        }
    }

    /// Returns the device under update.
    #[must_use]
    pub fn device(&self) -> &DeviceAddress {
        &self.device
    }

    /// Returns the current stage.
    #[must_use]
    pub fn stage(&self) -> UpdateStage {
        self.stage
    }

    /// Returns bytes transferred within the current attempt.
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Returns the image size in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Returns how many failed attempts have been retried.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Returns the retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns when the task was enqueued.
    #[must_use]
    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    /// Returns when the task reached a terminal stage, if it has.
    #[must_use]
    pub fn completed_at(&self) -> Option<OffsetDateTime> {
        self.completed_at
    }

    /// Returns the human-readable failure message, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Returns whether the task has finished for good.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }
}

/// Aggregate view over the current task set; recomputed, never stored.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct UpdateSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
}

impl UpdateSummary {
    /// Computes the summary over a task set.
    #[must_use]
    pub fn from_tasks<'task>(tasks: impl IntoIterator<Item = &'task UpdateTask>) -> Self {
        let mut summary = Self::default();
        for task in tasks {
            summary.total += 1;
            match task.stage {
                UpdateStage::Complete => summary.completed += 1,
                UpdateStage::Failed if task.terminal => summary.failed += 1,
                UpdateStage::Idle => {}
                _active => summary.in_progress += 1,
            }
        }
        summary
    }

    /// Returns overall progress as `completed / total`.
    ///
    /// ```
    /// use meshfleet::UpdateSummary;
    ///
    /// let summary = UpdateSummary { total: 4, completed: 1, failed: 0, in_progress: 3 };
    /// assert_eq!(0.25, summary.overall_progress());
    /// ```
    #[must_use]
    pub fn overall_progress(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn task(stage: UpdateStage, terminal: bool) -> UpdateTask {
        let mut task = UpdateTask::new(
            "aa:bb:cc:dd:ee:01".parse().expect("address should parse"),
            128,
            3,
        );
        task.stage = stage;
        task.terminal = terminal;
        task
    }

    #[test]
    fn summary_counts_each_stage_bucket() {
        let tasks = vec![
            task(UpdateStage::Complete, true),
            task(UpdateStage::Uploading, false),
            task(UpdateStage::Failed, true),
            task(UpdateStage::Failed, false),
            task(UpdateStage::Idle, false),
        ];

        let summary = UpdateSummary::from_tasks(&tasks);
        assert_eq!(5, summary.total);
        assert_eq!(1, summary.completed);
        assert_eq!(1, summary.failed);
        // A failed task awaiting its retry is still in flight.
        assert_eq!(2, summary.in_progress);
    }

    #[test]
    fn overall_progress_reaches_one_only_when_everything_completed() {
        let done = UpdateSummary {
            total: 3,
            completed: 3,
            failed: 0,
            in_progress: 0,
        };
        assert_eq!(1.0, done.overall_progress());

        let partial = UpdateSummary {
            total: 3,
            completed: 2,
            failed: 1,
            in_progress: 0,
        };
        assert!(partial.overall_progress() < 1.0);
    }

    #[test]
    fn cancelled_is_the_only_non_retryable_error() {
        assert_eq!(true, UpdateError::ConnectionFailed("x".into()).is_retryable());
        assert_eq!(true, UpdateError::UploadFailed("x".into()).is_retryable());
        assert_eq!(true, UpdateError::VerificationFailed("x".into()).is_retryable());
        assert_eq!(false, UpdateError::Cancelled.is_retryable());
    }
}
