//! Notification fan-out.
//!
//! One release never produces one job per recipient, nor one unbounded job:
//! recipients are split into fixed-size [`MessageBatch`]es, each its own job
//! on the email queue with its own retry policy.

use crate::config::FanoutConfig;
use crate::error::FanoutError;
use editions_core::notify::{MessageContent, Recipient, TemplateType};
use editions_core::queue::{JobHandle, JobOptions, JobQueue, QueueName};
use editions_runtime::metrics::NotificationMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Job name of a release email batch.
pub const RELEASE_EMAILS_JOB: &str = "edition.release-emails";

/// Job name of a single outbound message.
pub const SEND_MESSAGE_JOB: &str = "notification.send";

/// Payload of every email-queue job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBatch {
    /// Template to render.
    pub template: TemplateType,
    /// Variables shared by every recipient.
    pub content: MessageContent,
    /// Recipients of this batch.
    pub recipients: Vec<Recipient>,
}

/// Outcome of [`NotificationFanout::send_edition_release_emails`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Batch jobs enqueued (or collapsed onto an identical pending job).
    pub batches_enqueued: usize,
    /// Recipients covered by the enqueued batches.
    pub recipients: usize,
    /// Batches that could not be enqueued.
    pub failed_batches: usize,
}

impl FanoutReport {
    /// Sum two reports.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            batches_enqueued: self.batches_enqueued + other.batches_enqueued,
            recipients: self.recipients + other.recipients,
            failed_batches: self.failed_batches + other.failed_batches,
        }
    }
}

/// Splits recipients into bounded outbound jobs.
pub struct NotificationFanout {
    queue: Arc<dyn JobQueue>,
    config: FanoutConfig,
}

impl NotificationFanout {
    /// Create a fan-out with default tuning.
    #[must_use]
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            config: FanoutConfig::default(),
        }
    }

    /// Replace the tuning.
    #[must_use]
    pub fn with_config(mut self, config: FanoutConfig) -> Self {
        self.config = config;
        self
    }

    /// The tuning in use.
    #[must_use]
    pub const fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Enqueue release emails for `recipients`, `batch_size` per job.
    ///
    /// Zero recipients enqueue nothing. Each batch carries the dedup key
    /// `release:{edition_number}:{template}:{index}`, so a repeated fan-out for
    /// the same release collapses onto batches that have not run yet. A batch
    /// that fails to enqueue is logged and counted; later batches still go out.
    pub async fn send_edition_release_emails(
        &self,
        edition_number: i32,
        recipients: Vec<Recipient>,
        template: TemplateType,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        if recipients.is_empty() {
            return report;
        }

        let total_batches = recipients.len().div_ceil(self.config.batch_size);
        let content = MessageContent::default().with_var("edition_number", edition_number);

        for (index, chunk) in recipients.chunks(self.config.batch_size).enumerate() {
            let batch = MessageBatch {
                template,
                content: content.clone(),
                recipients: chunk.to_vec(),
            };
            let options = self
                .config
                .job_options()
                .with_dedup_key(format!("release:{edition_number}:{template}:{index}"));

            match self.enqueue(RELEASE_EMAILS_JOB, &batch, options).await {
                Ok(handle) => {
                    report.batches_enqueued += 1;
                    report.recipients += chunk.len();
                    NotificationMetrics::record_batch_enqueued();
                    info!(
                        edition_number,
                        template = %template,
                        batch = index + 1,
                        of = total_batches,
                        recipients = chunk.len(),
                        job_id = %handle.id,
                        deduplicated = handle.deduplicated,
                        "Release email batch enqueued"
                    );
                }
                Err(e) => {
                    report.failed_batches += 1;
                    error!(
                        edition_number,
                        template = %template,
                        batch = index + 1,
                        of = total_batches,
                        error = %e,
                        "Failed to enqueue release email batch"
                    );
                }
            }
        }

        report
    }

    /// Enqueue one templated message.
    ///
    /// # Errors
    ///
    /// Returns [`FanoutError`] if the job cannot be enqueued.
    pub async fn send_message(
        &self,
        recipient: Recipient,
        template: TemplateType,
        content: MessageContent,
    ) -> Result<JobHandle, FanoutError> {
        let batch = MessageBatch {
            template,
            content,
            recipients: vec![recipient],
        };
        self.enqueue(SEND_MESSAGE_JOB, &batch, self.config.job_options())
            .await
    }

    /// Enqueue a follow-up of `name` for the recipients a delivery attempt
    /// could not serve.
    pub(crate) async fn enqueue_followup(
        &self,
        name: &str,
        batch: &MessageBatch,
        dedup_key: String,
    ) -> Result<JobHandle, FanoutError> {
        let options = self
            .config
            .job_options()
            .with_delay(self.config.followup_delay)
            .with_dedup_key(dedup_key);
        self.enqueue(name, batch, options).await
    }

    async fn enqueue(
        &self,
        name: &str,
        batch: &MessageBatch,
        options: JobOptions,
    ) -> Result<JobHandle, FanoutError> {
        let payload = serde_json::to_value(batch)?;
        Ok(self
            .queue
            .enqueue(QueueName::Email, name, payload, options)
            .await?)
    }
}
