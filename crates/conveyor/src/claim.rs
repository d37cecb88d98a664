//! The claim RPC: prove that this worker, and only this worker, will
//! execute a given job.
//!
//! The RPC is layered on the one-way transport with a correlation ID: the
//! worker declares an exclusive reply queue, publishes a claim request
//! carrying `reply_to` + `correlation_id`, and waits (with a hard budget)
//! for the correlated single-token response.

use std::time::Duration;

use chrono::Utc;
use conveyor_broker::{PublishProperties, QueueSpec, RecoveringChannel};
use conveyor_core::{
    identity::WorkerIdentity,
    message::{ClaimRequest, ClaimResponse, JobAnnounce},
    pipeline::PipelineRuntime,
    routing,
};
use tracing::{info, warn};

use crate::error::Result;

/// One claim attempt for one job. Builds the transient claim request,
/// runs the RPC round trip, and reports whether this worker owns the job.
pub struct ClaimTransaction<'a> {
    channel: &'a RecoveringChannel,
    identity: &'a WorkerIdentity,
    timeout: Duration,
}

impl<'a> ClaimTransaction<'a> {
    /// Create a claim transaction with the given wait budget.
    #[must_use]
    pub const fn new(
        channel: &'a RecoveringChannel,
        identity: &'a WorkerIdentity,
        timeout: Duration,
    ) -> Self {
        Self {
            channel,
            identity,
            timeout,
        }
    }

    /// Attempt to claim `job`, with the claim expiry computed by the
    /// pipeline runtime.
    ///
    /// Returns `true` only when the remote authority granted the claim.
    /// Refusal and timeout both return `false`: a worker that cannot prove
    /// ownership must not execute the job.
    pub async fn claim(&self, job: &JobAnnounce, runtime: &dyn PipelineRuntime) -> Result<bool> {
        let claim_start = Utc::now();
        let expire_time = runtime.expire_time(job.target_time, &job.target, claim_start);
        if expire_time <= claim_start {
            return Err(conveyor_core::Error::Execution(format!(
                "pipeline computed a claim expiry ({expire_time}) not after the claim start \
                 ({claim_start}) for target '{}'",
                job.target
            ))
            .into());
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let reply_queue = self.identity.reply_queue();
        self.channel
            .declare_queue(&QueueSpec::exclusive(&reply_queue))
            .await?;
        let mut consumer = self.channel.consume(&reply_queue, 1).await?;

        let request = ClaimRequest {
            job_id: job.job_id.clone(),
            worker_queue: reply_queue.clone(),
            start_time: claim_start,
            expire_time,
        };
        let body = serde_json::to_vec(&request)?;
        let properties = PublishProperties {
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(reply_queue),
            expiration_ms: None,
        };
        self.channel
            .publish(None, routing::CLAIM_QUEUE, body, properties)
            .await?;

        let granted = self
            .await_response(&mut consumer, &correlation_id, job)
            .await;

        // Always cancel the reply consumer so repeated claim attempts do not
        // leak consumers, whatever the outcome was.
        if let Err(err) = self.channel.cancel(consumer.tag()).await {
            warn!(error = %err, "failed to cancel claim reply consumer");
        }
        Ok(granted)
    }

    async fn await_response(
        &self,
        consumer: &mut conveyor_broker::Consumer,
        correlation_id: &str,
        job: &JobAnnounce,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                // A timed-out claim and an explicit refusal are deliberately
                // indistinguishable to callers: both mean "not ours". If a
                // future revision wants to retry timeouts but not refusals,
                // split the return value here.
                info!(job_id = %job.job_id, "claim timed out");
                return false;
            }
            match tokio::time::timeout(remaining, consumer.recv()).await {
                Ok(Some(delivery)) => {
                    if delivery.properties.correlation_id.as_deref() != Some(correlation_id) {
                        // Belongs to a stale or concurrent transaction; it
                        // must not be mistaken for this one's answer.
                        warn!(
                            job_id = %job.job_id,
                            got = ?delivery.properties.correlation_id,
                            "ignoring claim reply with mismatched correlation id"
                        );
                        let _ = self.channel.ack(delivery.delivery_tag).await;
                        continue;
                    }
                    let _ = self.channel.ack(delivery.delivery_tag).await;
                    match ClaimResponse::decode(&delivery.body) {
                        Ok(response) => return response.granted,
                        Err(err) => {
                            warn!(job_id = %job.job_id, error = %err, "unreadable claim response");
                            return false;
                        }
                    }
                }
                // Reply channel gone or budget spent: cannot prove ownership.
                Ok(None) => return false,
                Err(_) => {
                    info!(job_id = %job.job_id, "claim timed out");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use conveyor_broker::{Channel, MemoryBroker, Topology};
    use conveyor_core::{
        message::TargetParameters,
        pipeline::{JobLogger, RunRefused},
        JobId, PipelineName, RunId, TargetName,
    };
    use uuid::Uuid;

    use super::*;

    struct HourExpiry;

    #[async_trait]
    impl PipelineRuntime for HourExpiry {
        async fn targets(
            &self,
            _target_time: DateTime<Utc>,
        ) -> std::result::Result<BTreeSet<TargetName>, RunRefused> {
            Ok(BTreeSet::new())
        }

        fn expire_time(
            &self,
            _target_time: DateTime<Utc>,
            _target: &TargetName,
            claim_start: DateTime<Utc>,
        ) -> DateTime<Utc> {
            claim_start + chrono::Duration::hours(1)
        }

        async fn make_target(
            &self,
            _target_time: DateTime<Utc>,
            _target: &TargetName,
            _parameters: &TargetParameters,
            _log: &mut dyn JobLogger,
        ) -> conveyor_core::Result<bool> {
            Ok(true)
        }
    }

    struct InstantExpiry;

    #[async_trait]
    impl PipelineRuntime for InstantExpiry {
        async fn targets(
            &self,
            _target_time: DateTime<Utc>,
        ) -> std::result::Result<BTreeSet<TargetName>, RunRefused> {
            Ok(BTreeSet::new())
        }

        fn expire_time(
            &self,
            _target_time: DateTime<Utc>,
            _target: &TargetName,
            claim_start: DateTime<Utc>,
        ) -> DateTime<Utc> {
            claim_start
        }

        async fn make_target(
            &self,
            _target_time: DateTime<Utc>,
            _target: &TargetName,
            _parameters: &TargetParameters,
            _log: &mut dyn JobLogger,
        ) -> conveyor_core::Result<bool> {
            Ok(true)
        }
    }

    fn job(job_id: &str) -> JobAnnounce {
        JobAnnounce {
            job_id: JobId::new(job_id),
            pipeline: PipelineName::parse("daily_report").unwrap(),
            run_id: RunId::new("r-1"),
            target: TargetName::new("north"),
            target_parameters: TargetParameters::new(),
            target_time: "2024-01-01T00:00:00Z".parse().unwrap(),
        }
    }

    fn identity() -> WorkerIdentity {
        WorkerIdentity::new("testhost", 1, Uuid::new_v4())
    }

    /// Arbiter stub: grants the first claim per job id, refuses the rest.
    /// Optionally prefixes each reply with a bogus-correlation-id message.
    async fn spawn_arbiter(broker: &MemoryBroker, send_stale_reply_first: bool) {
        let channel = broker.open_channel();
        channel
            .declare_queue(&QueueSpec::durable(routing::CLAIM_QUEUE))
            .await
            .unwrap();
        let mut consumer = channel.consume(routing::CLAIM_QUEUE, 10).await.unwrap();
        tokio::spawn(async move {
            let mut granted = std::collections::HashSet::new();
            while let Some(delivery) = consumer.recv().await {
                let request: ClaimRequest = serde_json::from_slice(&delivery.body).unwrap();
                let reply_to = delivery.properties.reply_to.clone().unwrap();
                if send_stale_reply_first {
                    let stale = PublishProperties {
                        correlation_id: Some("stale-transaction".to_string()),
                        ..PublishProperties::default()
                    };
                    channel
                        .publish(None, &reply_to, ClaimResponse::refused().encode(), stale)
                        .await
                        .unwrap();
                }
                let response = if granted.insert(request.job_id.as_str().to_string()) {
                    ClaimResponse::granted()
                } else {
                    ClaimResponse::refused()
                };
                let properties = PublishProperties {
                    correlation_id: delivery.properties.correlation_id.clone(),
                    ..PublishProperties::default()
                };
                channel
                    .publish(None, &reply_to, response.encode(), properties)
                    .await
                    .unwrap();
                channel.ack(delivery.delivery_tag).await.unwrap();
            }
        });
    }

    fn worker_channel(broker: &MemoryBroker) -> RecoveringChannel {
        RecoveringChannel::new(Box::new(broker.connector()), Topology::new())
    }

    #[tokio::test]
    async fn test_first_claim_is_granted() {
        let broker = MemoryBroker::new();
        spawn_arbiter(&broker, false).await;
        let channel = worker_channel(&broker);
        let identity = identity();
        let txn = ClaimTransaction::new(&channel, &identity, Duration::from_secs(5));
        assert!(txn.claim(&job("abc"), &HourExpiry).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_claim_for_same_job_is_refused() {
        let broker = MemoryBroker::new();
        spawn_arbiter(&broker, false).await;
        let channel = worker_channel(&broker);
        let identity = identity();
        let txn = ClaimTransaction::new(&channel, &identity, Duration::from_secs(5));
        assert!(txn.claim(&job("abc"), &HourExpiry).await.unwrap());
        assert!(!txn.claim(&job("abc"), &HourExpiry).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_exactly_one_grant() {
        let broker = MemoryBroker::new();
        spawn_arbiter(&broker, false).await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                let channel = worker_channel(&broker);
                let identity = identity();
                let txn = ClaimTransaction::new(&channel, &identity, Duration::from_secs(5));
                txn.claim(&job("contested"), &HourExpiry).await.unwrap()
            }));
        }
        let mut grants = 0;
        for handle in handles {
            if handle.await.unwrap() {
                grants += 1;
            }
        }
        assert_eq!(grants, 1, "exactly one of N concurrent claims may win");
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_refusal() {
        let broker = MemoryBroker::new();
        // No arbiter: the claim request is dropped as unroutable.
        let channel = worker_channel(&broker);
        let identity = identity();
        let txn = ClaimTransaction::new(&channel, &identity, Duration::from_millis(50));
        let claimed = txn.claim(&job("abc"), &HourExpiry).await.unwrap();
        assert!(!claimed, "timeout must look exactly like a refusal");
    }

    #[tokio::test]
    async fn test_mismatched_correlation_id_is_ignored() {
        let broker = MemoryBroker::new();
        spawn_arbiter(&broker, true).await;
        let channel = worker_channel(&broker);
        let identity = identity();
        let txn = ClaimTransaction::new(&channel, &identity, Duration::from_secs(5));
        // The stale reply arrives first and must not be taken as the answer.
        assert!(txn.claim(&job("abc"), &HourExpiry).await.unwrap());
    }

    #[tokio::test]
    async fn test_repeated_claims_do_not_leak_consumers() {
        let broker = MemoryBroker::new();
        spawn_arbiter(&broker, false).await;
        let channel = worker_channel(&broker);
        let identity = identity();
        let txn = ClaimTransaction::new(&channel, &identity, Duration::from_secs(5));
        for index in 0..3 {
            let claimed = txn
                .claim(&job(&format!("job-{index}")), &HourExpiry)
                .await
                .unwrap();
            assert!(claimed);
        }
    }

    #[tokio::test]
    async fn test_expiry_not_after_start_is_rejected() {
        let broker = MemoryBroker::new();
        let channel = worker_channel(&broker);
        let identity = identity();
        let txn = ClaimTransaction::new(&channel, &identity, Duration::from_secs(5));
        let result = txn.claim(&job("abc"), &InstantExpiry).await;
        assert!(result.is_err());
    }
}
