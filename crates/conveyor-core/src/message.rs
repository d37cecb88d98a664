//! Wire message schema and ingress envelope decoding.
//!
//! All bodies are JSON with snake_case fields and RFC3339 timestamps. The
//! one exception is `ClaimResponse`, a single-token body matched by
//! correlation ID.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    identity::{JobId, PipelineName, RunId, ServiceName, TargetName},
    routing, Error, Result,
};

/// Arbitrary key/value parameters attached to one target.
///
/// Computed at announce-ack time and echoed back verbatim in the job
/// announcement; this is how run-level computation reaches job-level
/// execution without a shared store.
pub type TargetParameters = BTreeMap<String, serde_json::Value>;

/// Startup declaration of which pipelines this process can run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAnnounce {
    /// Service name
    pub service_name: ServiceName,
    /// Pipelines this service registers
    pub pipeline_names: Vec<PipelineName>,
}

/// Broadcast announcement of one scheduled pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAnnounce {
    /// Pipeline to run
    pub pipeline: PipelineName,
    /// Run token assigned by the announcer
    pub run_id: RunId,
    /// Logical timestamp the run is for
    pub target_time: DateTime<Utc>,
}

/// Acceptance of a run, listing the targets that exist for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAck {
    /// Accepting service
    pub service_name: ServiceName,
    /// Accepted pipeline
    pub pipeline_name: PipelineName,
    /// Logical timestamp of the run
    pub target_time: DateTime<Utc>,
    /// Run token
    pub run_id: RunId,
    /// Targets that exist for this run
    pub targets: BTreeSet<TargetName>,
    /// Per-target parameters, echoed back at job-announcement time
    #[serde(default)]
    pub target_parameters: BTreeMap<TargetName, TargetParameters>,
}

/// Refusal of a run with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunNack {
    /// Refusing service
    pub service_name: ServiceName,
    /// Refused pipeline
    pub pipeline_name: PipelineName,
    /// Run token
    pub run_id: RunId,
    /// When the announcer may try again, if the pipeline suggested a time
    pub reannounce_time: Option<DateTime<Utc>>,
    /// Why the run was refused
    pub message: String,
}

/// Direct-to-queue announcement of one claimable job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAnnounce {
    /// Job token assigned by the remote dispatcher
    pub job_id: JobId,
    /// Pipeline the job belongs to
    pub pipeline: PipelineName,
    /// Run token
    pub run_id: RunId,
    /// Target to execute
    pub target: TargetName,
    /// Parameters computed at announce-ack time
    #[serde(default)]
    pub target_parameters: TargetParameters,
    /// Logical timestamp of the run
    pub target_time: DateTime<Utc>,
}

/// Claim RPC request sent to the run's originating authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// Job being claimed
    pub job_id: JobId,
    /// Reply queue of the claiming worker
    pub worker_queue: String,
    /// When the claim attempt started
    pub start_time: DateTime<Utc>,
    /// When the claim lapses if the worker never finishes
    pub expire_time: DateTime<Utc>,
}

/// Claim RPC response: a single grant/refuse token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimResponse {
    /// Whether the claim was granted
    pub granted: bool,
}

/// Token body meaning "granted".
const CLAIM_GRANTED: &[u8] = b"1";

/// Token body meaning "refused".
const CLAIM_REFUSED: &[u8] = b"0";

impl ClaimResponse {
    /// Response granting the claim
    #[must_use]
    pub const fn granted() -> Self {
        Self { granted: true }
    }

    /// Response refusing the claim
    #[must_use]
    pub const fn refused() -> Self {
        Self { granted: false }
    }

    /// Encode to the single-token wire body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        if self.granted {
            CLAIM_GRANTED.to_vec()
        } else {
            CLAIM_REFUSED.to_vec()
        }
    }

    /// Decode from the single-token wire body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        match body {
            CLAIM_GRANTED => Ok(Self::granted()),
            CLAIM_REFUSED => Ok(Self::refused()),
            other => Err(Error::MalformedMessage(format!(
                "claim response token must be \"0\" or \"1\", got {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// End-of-job event published after an execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnd {
    /// Executing service
    pub service_name: ServiceName,
    /// Pipeline of the job
    pub pipeline_name: PipelineName,
    /// Logical timestamp of the run
    pub target_time: DateTime<Utc>,
    /// Target that was executed
    pub target: TargetName,
    /// Job token
    pub job_id: JobId,
    /// When execution finished
    pub end_time: DateTime<Utc>,
    /// Whether the target reported success
    pub succeeded: bool,
}

/// One line of a job's append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Executing service
    pub service_name: ServiceName,
    /// Pipeline of the job
    pub pipeline_name: PipelineName,
    /// Run token
    pub run_id: RunId,
    /// Target being executed
    pub target: TargetName,
    /// Job token
    pub job_id: JobId,
    /// 1-based line number within this job's log
    pub line_number: u64,
    /// Log text
    pub message: String,
}

/// Everything the work queue can deliver, decoded once at ingress.
///
/// Run announcements arrive via the fan-out exchange binding; job
/// announcements are published directly to the queue with no exchange.
/// Handlers match on this sum type instead of inspecting transport metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// A broadcast run announcement
    Run(RunAnnounce),
    /// A direct job announcement
    Job(JobAnnounce),
}

impl Envelope {
    /// Decode a delivery into an envelope.
    ///
    /// `exchange` is the exchange the delivery arrived through, `None` for a
    /// direct publish to the queue.
    pub fn decode(exchange: Option<&str>, body: &[u8]) -> Result<Self> {
        match exchange {
            Some(routing::RUN_ANNOUNCE_EXCHANGE) => {
                Ok(Self::Run(serde_json::from_slice(body)?))
            }
            None | Some("") => Ok(Self::Job(serde_json::from_slice(body)?)),
            Some(other) => Err(Error::MalformedMessage(format!(
                "delivery from unexpected exchange '{other}'"
            ))),
        }
    }
}
