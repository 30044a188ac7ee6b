//! Email-queue job handler.

use crate::error::FanoutError;
use crate::fanout::{MessageBatch, NotificationFanout, RELEASE_EMAILS_JOB, SEND_MESSAGE_JOB};
use editions_core::BoxFuture;
use editions_core::notify::{Mailer, MailerError, Recipient};
use editions_core::queue::Job;
use editions_runtime::metrics::NotificationMetrics;
use editions_runtime::{JobError, JobHandler};
use std::sync::Arc;
use tracing::{info, warn};

/// Delivers [`MessageBatch`] jobs through a [`Mailer`].
///
/// A retry of a batch must not re-send to recipients already served, so
/// partial failures are split off: the recipients that failed with a
/// retryable error go into a follow-up job and the current job succeeds.
/// Permanently rejected recipients are dropped with a warning. Only when
/// nobody in the batch was served does the job itself fail.
pub struct MessageDispatcher {
    mailer: Arc<dyn Mailer>,
    fanout: Arc<NotificationFanout>,
}

impl MessageDispatcher {
    /// Create a dispatcher. Follow-up jobs go through `fanout`.
    #[must_use]
    pub fn new(mailer: Arc<dyn Mailer>, fanout: Arc<NotificationFanout>) -> Self {
        Self { mailer, fanout }
    }

    async fn deliver(&self, job: &Job) -> Result<(), FanoutError> {
        let batch: MessageBatch = job.payload_as()?;
        let total = batch.recipients.len();

        let mut retry_later: Vec<Recipient> = Vec::new();
        let mut rejected = 0;
        let mut last_error: Option<MailerError> = None;

        for recipient in &batch.recipients {
            match self
                .mailer
                .send(recipient, batch.template, &batch.content)
                .await
            {
                Ok(()) => {}
                Err(e) => {
                    if e.is_retryable() {
                        retry_later.push(recipient.clone());
                    } else {
                        rejected += 1;
                        warn!(
                            job_id = %job.id,
                            email = %recipient.email,
                            template = %batch.template,
                            error = %e,
                            "Recipient rejected, not retrying"
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        let failed = retry_later.len() + rejected;
        let sent = total - failed;
        NotificationMetrics::record_sent(sent);
        NotificationMetrics::record_failed(failed);

        if failed == 0 {
            return Ok(());
        }

        if sent == 0 {
            return Err(FanoutError::Delivery {
                failed,
                retryable: !retry_later.is_empty(),
                last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
            });
        }

        if !retry_later.is_empty() {
            let followup = MessageBatch {
                template: batch.template,
                content: batch.content.clone(),
                recipients: retry_later,
            };
            let handle = self
                .fanout
                .enqueue_followup(&job.name, &followup, format!("followup:{}", job.id))
                .await?;
            info!(
                job_id = %job.id,
                followup_job_id = %handle.id,
                sent,
                retrying = followup.recipients.len(),
                rejected,
                "Partial delivery, failed recipients moved to follow-up job"
            );
        }

        Ok(())
    }
}

impl JobHandler for MessageDispatcher {
    fn handle<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, Result<(), JobError>> {
        Box::pin(async move {
            match job.name.as_str() {
                RELEASE_EMAILS_JOB | SEND_MESSAGE_JOB => {
                    self.deliver(job).await.map_err(JobError::from)
                }
                other => Err(JobError::fatal(format!("unknown email job: {other}"))),
            }
        })
    }
}
