//! A service: pipeline registrations plus the worker's identity and the
//! broker topology they imply.

use conveyor_broker::{ExchangeKind, QueueSpec, Topology};
use conveyor_core::{
    identity::WorkerIdentity,
    pipeline::{PipelineRegistry, PipelineRuntime},
    routing, PipelineName, ServiceName,
};
use std::sync::Arc;
use uuid::Uuid;

/// Generate this process's worker identity from hostname, pid and a fresh
/// process-lifetime token.
#[must_use]
pub fn generate_identity() -> WorkerIdentity {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .map_or_else(
            |_| "unknown".to_string(),
            |h| {
                h.split('.')
                    .next()
                    .map_or_else(|| "unknown".to_string(), String::from)
            },
        );
    WorkerIdentity::new(host, std::process::id(), Uuid::new_v4())
}

/// One service instance: a name, this worker's identity, and the pipelines
/// it can run. Created at process start; driven only by the dispatch loop.
#[derive(Debug)]
pub struct Service {
    name: ServiceName,
    identity: WorkerIdentity,
    registry: PipelineRegistry,
}

impl Service {
    /// Create a service with no pipelines registered yet.
    #[must_use]
    pub fn new(name: ServiceName, identity: WorkerIdentity) -> Self {
        Self {
            name,
            identity,
            registry: PipelineRegistry::new(),
        }
    }

    /// Register a pipeline this service can run.
    pub fn register_pipeline<F>(&mut self, pipeline: PipelineName, factory: F)
    where
        F: Fn() -> Arc<dyn PipelineRuntime> + Send + Sync + 'static,
    {
        self.registry.register(pipeline, factory);
    }

    /// Service name
    #[must_use]
    pub const fn name(&self) -> &ServiceName {
        &self.name
    }

    /// This worker's identity
    #[must_use]
    pub const fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Registered pipelines
    #[must_use]
    pub const fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// Name of this service's durable work queue.
    #[must_use]
    pub fn work_queue(&self) -> String {
        routing::work_queue_name(&self.name)
    }

    /// The topology this service needs declared before consuming: the run
    /// fan-out exchange, the discovery exchange, and the durable work queue
    /// bound once per registered pipeline.
    #[must_use]
    pub fn topology(&self) -> Topology {
        let work_queue = self.work_queue();
        let mut topology = Topology::new()
            .with_exchange(routing::RUN_ANNOUNCE_EXCHANGE, ExchangeKind::Fanout)
            .with_exchange(routing::DISCOVERY_EXCHANGE, ExchangeKind::Fanout)
            .with_queue(QueueSpec::durable(&work_queue));
        for pipeline in self.registry.names() {
            topology = topology.with_binding(
                &work_queue,
                routing::RUN_ANNOUNCE_EXCHANGE,
                routing::pipeline_routing_key(&self.name, &pipeline),
            );
        }
        topology
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use conveyor_core::{
        message::TargetParameters,
        pipeline::{JobLogger, RunRefused},
        TargetName,
    };
    use std::collections::BTreeSet;

    use super::*;

    struct NoopPipeline;

    #[async_trait]
    impl PipelineRuntime for NoopPipeline {
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

    fn service_with_pipelines(names: &[&str]) -> Service {
        let mut service = Service::new(
            ServiceName::parse("reports").unwrap(),
            generate_identity(),
        );
        for name in names {
            service.register_pipeline(PipelineName::parse(*name).unwrap(), || {
                Arc::new(NoopPipeline)
            });
        }
        service
    }

    #[test]
    fn test_generate_identity_has_hostname_and_pid() {
        let identity = generate_identity();
        // hostname-pid format
        assert!(identity.label().contains('-'), "{}", identity.label());
        assert!(!identity.reply_queue().is_empty());
    }

    #[test]
    fn test_generated_identities_are_distinct() {
        // Same host and pid, but the process-lifetime token differs.
        assert_ne!(
            generate_identity().reply_queue(),
            generate_identity().reply_queue()
        );
    }

    #[test]
    fn test_work_queue_derived_from_service_name() {
        let service = service_with_pipelines(&[]);
        assert_eq!(service.work_queue(), "conveyor.work.reports");
    }

    #[tokio::test]
    async fn test_topology_binds_once_per_pipeline() {
        let service = service_with_pipelines(&["daily_report", "hourly_rollup"]);
        let broker = conveyor_broker::MemoryBroker::new();
        let channel = broker.open_channel();
        service
            .topology()
            .declare(&channel)
            .await
            .unwrap();
        assert_eq!(broker.binding_count("conveyor.work.reports"), 2);
    }
}
