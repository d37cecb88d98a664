//! Per-job, line-numbered log publishing.

use std::sync::Arc;

use async_trait::async_trait;
use conveyor_broker::{PublishProperties, RecoveringChannel};
use conveyor_core::{
    message::{JobAnnounce, LogLine},
    pipeline::JobLogger,
    routing, ServiceName,
};
use tracing::warn;

/// Logger handed to `make_target`, publishing one `LogLine` per call with a
/// monotonically increasing line number keyed to this job.
pub struct PublishingJobLogger {
    channel: Arc<RecoveringChannel>,
    ttl_ms: Option<u64>,
    template: LogLine,
}

impl PublishingJobLogger {
    /// Create a logger bound to one job's identifiers.
    #[must_use]
    pub fn new(
        channel: Arc<RecoveringChannel>,
        service_name: ServiceName,
        job: &JobAnnounce,
        ttl_ms: Option<u64>,
    ) -> Self {
        Self {
            channel,
            ttl_ms,
            template: LogLine {
                service_name,
                pipeline_name: job.pipeline.clone(),
                run_id: job.run_id.clone(),
                target: job.target.clone(),
                job_id: job.job_id.clone(),
                line_number: 0,
                message: String::new(),
            },
        }
    }

    /// Line number of the most recently published line.
    #[must_use]
    pub const fn lines_written(&self) -> u64 {
        self.template.line_number
    }
}

#[async_trait]
impl JobLogger for PublishingJobLogger {
    async fn log(&mut self, message: &str) -> conveyor_core::Result<()> {
        self.template.line_number += 1;
        let line = LogLine {
            message: message.to_string(),
            ..self.template.clone()
        };
        let body = serde_json::to_vec(&line)?;
        let properties = PublishProperties {
            expiration_ms: self.ttl_ms,
            ..PublishProperties::default()
        };
        // Log lines are best effort: a job must not fail because its log
        // stream does.
        if let Err(err) = self
            .channel
            .publish(None, routing::JOB_LOG_QUEUE, body, properties)
            .await
        {
            warn!(
                job_id = %line.job_id,
                line_number = line.line_number,
                error = %err,
                "failed to publish job log line"
            );
        }
        Ok(())
    }
}
