//! Service announcement for discovery bookkeeping.
//!
//! Fire-and-forget: the announcement is not on the coordination-critical
//! path, it only tells a registry which pipelines this process can run.

use std::{sync::Arc, time::Duration};

use conveyor_broker::{PublishProperties, RecoveringChannel};
use conveyor_core::{message::ServiceAnnounce, routing};
use tokio::sync::watch;
use tracing::info;

use crate::{error::Result, service::Service};

/// Publishes this service's pipeline registrations to the discovery
/// exchange, once at startup and optionally on an interval.
pub struct ServiceAnnouncer {
    channel: Arc<RecoveringChannel>,
    announce: ServiceAnnounce,
    ttl_ms: Option<u64>,
}

impl ServiceAnnouncer {
    /// Create an announcer for the given service.
    #[must_use]
    pub fn new(channel: Arc<RecoveringChannel>, service: &Service, ttl_ms: Option<u64>) -> Self {
        Self {
            channel,
            announce: ServiceAnnounce {
                service_name: service.name().clone(),
                pipeline_names: service.registry().names(),
            },
            ttl_ms,
        }
    }

    /// Publish one announcement.
    pub async fn announce_once(&self) -> Result<()> {
        let body = serde_json::to_vec(&self.announce)?;
        let properties = PublishProperties {
            expiration_ms: self.ttl_ms,
            ..PublishProperties::default()
        };
        self.channel
            .publish(
                Some(routing::DISCOVERY_EXCHANGE),
                self.announce.service_name.as_str(),
                body,
                properties,
            )
            .await?;
        info!(
            service = %self.announce.service_name,
            pipelines = self.announce.pipeline_names.len(),
            "service announced"
        );
        Ok(())
    }

    /// Re-announce on an interval until shutdown.
    pub async fn run_periodic(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            self.announce_once().await?;
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use conveyor_broker::{Channel, MemoryBroker, QueueSpec};
    use conveyor_core::{PipelineName, ServiceName};

    use super::*;
    use crate::service::generate_identity;

    #[tokio::test]
    async fn test_announce_reaches_discovery_subscribers() {
        let broker = MemoryBroker::new();
        let mut service = Service::new(
            ServiceName::parse("reports").unwrap(),
            generate_identity(),
        );
        service.register_pipeline(PipelineName::parse("daily_report").unwrap(), || {
            unreachable!("announcement never instantiates pipelines")
        });

        let channel = Arc::new(RecoveringChannel::new(
            Box::new(broker.connector()),
            service.topology(),
        ));
        channel.ensure_ready().await.unwrap();

        // A registry subscribes to the discovery exchange.
        let registry_channel = broker.open_channel();
        registry_channel
            .declare_queue(&QueueSpec::durable("registry"))
            .await
            .unwrap();
        registry_channel
            .bind_queue("registry", routing::DISCOVERY_EXCHANGE, "")
            .await
            .unwrap();
        let mut consumer = registry_channel.consume("registry", 10).await.unwrap();

        let announcer = ServiceAnnouncer::new(Arc::clone(&channel), &service, None);
        announcer.announce_once().await.unwrap();

        let delivery = consumer.recv().await.unwrap();
        let announce: ServiceAnnounce = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(announce.service_name.as_str(), "reports");
        assert_eq!(announce.pipeline_names.len(), 1);
    }

    #[tokio::test]
    async fn test_announce_without_subscribers_is_fire_and_forget() {
        let broker = MemoryBroker::new();
        let service = Service::new(
            ServiceName::parse("reports").unwrap(),
            generate_identity(),
        );
        let channel = Arc::new(RecoveringChannel::new(
            Box::new(broker.connector()),
            service.topology(),
        ));
        let announcer = ServiceAnnouncer::new(channel, &service, None);
        assert!(announcer.announce_once().await.is_ok());
    }
}
