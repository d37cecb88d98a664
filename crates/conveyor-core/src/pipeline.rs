//! The pluggable pipeline contract.
//!
//! A pipeline author implements [`PipelineRuntime`] once per pipeline; the
//! dispatch loop drives it. Refusing a run is a first-class outcome
//! ([`RunRefused`]), not a process error.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    identity::{PipelineName, TargetName},
    message::TargetParameters,
    Result,
};

/// Signal that a run should be refused rather than materialized.
///
/// Translated by the dispatch loop into a `RunNack` carrying the reason and
/// the optional re-announce time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct RunRefused {
    /// Human-readable refusal reason
    pub reason: String,
    /// When the announcer may usefully try again
    pub reannounce_after: Option<DateTime<Utc>>,
}

impl RunRefused {
    /// Refuse with a reason
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            reannounce_after: None,
        }
    }

    /// Suggest a time after which the run may be re-announced
    #[must_use]
    pub fn with_reannounce_after(mut self, after: DateTime<Utc>) -> Self {
        self.reannounce_after = Some(after);
        self
    }
}

/// Append-only, line-numbered log sink for one job.
///
/// Only usable once `(run_id, target, job_id)` are known, so it is handed to
/// `make_target` and never to `targets`.
#[async_trait]
pub trait JobLogger: Send {
    /// Append one line to this job's log.
    async fn log(&mut self, message: &str) -> Result<()>;
}

/// A logger that discards everything; useful in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJobLogger;

#[async_trait]
impl JobLogger for NullJobLogger {
    async fn log(&mut self, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Contract implemented once per pipeline by the application.
#[async_trait]
pub trait PipelineRuntime: Send + Sync {
    /// Decide which targets exist for the given logical time.
    ///
    /// Returning `RunRefused` nacks the run instead of acking it.
    async fn targets(
        &self,
        target_time: DateTime<Utc>,
    ) -> std::result::Result<BTreeSet<TargetName>, RunRefused>;

    /// Per-target parameters to attach to the run ack.
    ///
    /// Defaults to no parameters for any target.
    async fn target_parameters(
        &self,
        target_time: DateTime<Utc>,
    ) -> BTreeMap<TargetName, TargetParameters> {
        let _ = target_time;
        BTreeMap::new()
    }

    /// When a claim on the given target lapses.
    ///
    /// Required with no default: an expiry silently picked by the transport
    /// layer would either starve slow jobs or stall failover.
    fn expire_time(
        &self,
        target_time: DateTime<Utc>,
        target: &TargetName,
        claim_start: DateTime<Utc>,
    ) -> DateTime<Utc>;

    /// Execute one target. The return value is the success flag reported in
    /// the end-of-job event; errors are reported the same way, never
    /// swallowed.
    async fn make_target(
        &self,
        target_time: DateTime<Utc>,
        target: &TargetName,
        parameters: &TargetParameters,
        log: &mut dyn JobLogger,
    ) -> Result<bool>;
}

/// Factory producing a fresh runtime instance per announcement.
pub type RuntimeFactory = Arc<dyn Fn() -> Arc<dyn PipelineRuntime> + Send + Sync>;

/// Registry of the pipelines one service can run.
#[derive(Clone, Default)]
pub struct PipelineRegistry {
    factories: BTreeMap<PipelineName, RuntimeFactory>,
}

impl PipelineRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline under its name.
    ///
    /// A later registration under the same name replaces the earlier one.
    pub fn register<F>(&mut self, name: PipelineName, factory: F)
    where
        F: Fn() -> Arc<dyn PipelineRuntime> + Send + Sync + 'static,
    {
        self.factories.insert(name, Arc::new(factory));
    }

    /// Instantiate the runtime for a pipeline, if registered.
    #[must_use]
    pub fn instantiate(&self, name: &PipelineName) -> Option<Arc<dyn PipelineRuntime>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// Names of all registered pipelines, in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<PipelineName> {
        self.factories.keys().cloned().collect()
    }

    /// Whether any pipeline is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("pipelines", &self.names())
            .finish()
    }
}
