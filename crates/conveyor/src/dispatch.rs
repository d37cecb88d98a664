//! The dispatch loop: consume the service's work queue, decode each
//! delivery into an [`Envelope`], and drive run evaluation or job
//! execution.
//!
//! Failure handling follows three tiers: the transport wrapper retries each
//! call once; a pipeline's refusal becomes a nack message; anything that
//! still escapes (double transport failure, malformed message) aborts the
//! consume cycle, which restarts from scratch after a fixed delay.

use std::sync::Arc;

use chrono::Utc;
use conveyor_broker::{Delivery, PublishProperties, RecoveringChannel};
use conveyor_core::{
    message::{Envelope, JobAnnounce, JobEnd, RunAck, RunAnnounce, RunNack},
    routing, WorkerConfig,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    claim::ClaimTransaction, error::Result, job_log::PublishingJobLogger, service::Service,
};

/// Long-running control loop for one worker process.
pub struct DispatchLoop {
    service: Arc<Service>,
    channel: Arc<RecoveringChannel>,
    config: WorkerConfig,
}

impl DispatchLoop {
    /// Create a dispatch loop over an established service and channel.
    #[must_use]
    pub fn new(service: Arc<Service>, channel: Arc<RecoveringChannel>, config: WorkerConfig) -> Self {
        Self {
            service,
            channel,
            config,
        }
    }

    /// Run until shutdown is signalled.
    ///
    /// Every consume cycle that dies (transport exhaustion, malformed
    /// message) is logged and restarted after the configured delay;
    /// in-flight claims are abandoned, which is safe because claiming is
    /// idempotent per attempt.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            match self.cycle(&mut shutdown).await {
                Ok(()) => {
                    info!(service = %self.service.name(), "dispatch loop shut down");
                    return Ok(());
                }
                Err(err) => {
                    error!(
                        error = %err,
                        delay_secs = self.config.reconnect_delay_secs,
                        "dispatch cycle failed, restarting"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(self.config.reconnect_delay()) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// One connect-and-consume cycle. Returns `Ok(())` only on shutdown.
    async fn cycle(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        self.channel.ensure_ready().await?;
        let mut consumer = self
            .channel
            .consume(&self.service.work_queue(), self.config.prefetch)
            .await?;
        info!(
            service = %self.service.name(),
            worker = %self.service.identity(),
            "consuming work queue"
        );
        loop {
            tokio::select! {
                delivery = consumer.recv() => {
                    match delivery {
                        Some(delivery) => self.handle_delivery(delivery).await?,
                        None => return Err(conveyor_broker::ChannelError::Closed.into()),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Decode and route one delivery. Decode failures propagate to the
    /// cycle boundary; losing the cycle over a malformed message is coarse
    /// but keeps the loop free of per-message poison handling.
    async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        match Envelope::decode(delivery.exchange.as_deref(), &delivery.body)? {
            Envelope::Run(run) => self.handle_run(run, delivery.delivery_tag).await,
            Envelope::Job(job) => self.handle_job(&job, delivery.delivery_tag).await,
        }
    }

    async fn handle_run(&self, run: RunAnnounce, delivery_tag: u64) -> Result<()> {
        let Some(runtime) = self.service.registry().instantiate(&run.pipeline) else {
            // Fanout delivers every service's announcements to every bound
            // queue; announcements for pipelines we never registered are
            // someone else's.
            debug!(pipeline = %run.pipeline, "ignoring run announcement for unregistered pipeline");
            self.channel.ack(delivery_tag).await?;
            return Ok(());
        };

        info!(pipeline = %run.pipeline, run_id = %run.run_id, "run announced");
        match runtime.targets(run.target_time).await {
            Ok(targets) => {
                let target_parameters = runtime.target_parameters(run.target_time).await;
                let ack = RunAck {
                    service_name: self.service.name().clone(),
                    pipeline_name: run.pipeline.clone(),
                    target_time: run.target_time,
                    run_id: run.run_id.clone(),
                    targets,
                    target_parameters,
                };
                self.publish_json(routing::RUN_ACK_QUEUE, &ack).await?;
                info!(
                    run_id = %run.run_id,
                    targets = ack.targets.len(),
                    "run acknowledged"
                );
            }
            Err(refused) => {
                let nack = RunNack {
                    service_name: self.service.name().clone(),
                    pipeline_name: run.pipeline.clone(),
                    run_id: run.run_id.clone(),
                    reannounce_time: refused.reannounce_after,
                    message: refused.reason,
                };
                self.publish_json(routing::RUN_NACK_QUEUE, &nack).await?;
                info!(run_id = %run.run_id, reason = %nack.message, "run refused");
            }
        }

        // Ack only after the ack/nack went out. If even the retried publish
        // failed we never get here, the announcement stays unacked, and the
        // broker redelivers it: a run announcement is never silently lost.
        self.channel.ack(delivery_tag).await?;
        Ok(())
    }

    async fn handle_job(&self, job: &JobAnnounce, delivery_tag: u64) -> Result<()> {
        self.process_job(job).await?;
        // Claim refusal and execution failure are normal outcomes, not
        // reasons to redeliver: the announcement is acked unconditionally
        // once handling completed.
        self.channel.ack(delivery_tag).await?;
        Ok(())
    }

    async fn process_job(&self, job: &JobAnnounce) -> Result<()> {
        let Some(runtime) = self.service.registry().instantiate(&job.pipeline) else {
            warn!(
                pipeline = %job.pipeline,
                job_id = %job.job_id,
                "job announcement for unregistered pipeline, dropping"
            );
            return Ok(());
        };

        let transaction = ClaimTransaction::new(
            &self.channel,
            self.service.identity(),
            self.config.claim_timeout(),
        );
        let claimed = transaction.claim(job, runtime.as_ref()).await?;
        if !claimed {
            info!(
                job_id = %job.job_id,
                target = %job.target,
                "job not claimed, another worker owns it"
            );
            return Ok(());
        }

        info!(job_id = %job.job_id, target = %job.target, "job claimed, executing");
        let mut logger = PublishingJobLogger::new(
            Arc::clone(&self.channel),
            self.service.name().clone(),
            job,
            self.config.message_ttl_ms(),
        );
        let succeeded = match runtime
            .make_target(job.target_time, &job.target, &job.target_parameters, &mut logger)
            .await
        {
            Ok(flag) => flag,
            Err(err) => {
                // Not swallowed: logged here and reported as a failed job so
                // the announcing side can decide on redelivery or alerting.
                error!(job_id = %job.job_id, error = %err, "target execution failed");
                false
            }
        };

        let end = JobEnd {
            service_name: self.service.name().clone(),
            pipeline_name: job.pipeline.clone(),
            target_time: job.target_time,
            target: job.target.clone(),
            job_id: job.job_id.clone(),
            end_time: Utc::now(),
            succeeded,
        };
        self.publish_json(routing::JOB_END_QUEUE, &end).await?;
        info!(job_id = %job.job_id, succeeded, "job finished");
        Ok(())
    }

    async fn publish_json<T: Serialize>(&self, queue: &str, message: &T) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        let properties = PublishProperties {
            expiration_ms: self.config.message_ttl_ms(),
            ..PublishProperties::default()
        };
        self.channel.publish(None, queue, body, properties).await?;
        Ok(())
    }
}
