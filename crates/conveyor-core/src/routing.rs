//! Exchange, queue and routing-key naming conventions.
//!
//! Every name is derived deterministically so that topology declarations are
//! idempotent across reconnects and across worker processes of one service.

use crate::identity::{PipelineName, ServiceName};

/// Fan-out exchange carrying run announcements to every bound work queue.
pub const RUN_ANNOUNCE_EXCHANGE: &str = "conveyor.runs";

/// Fan-out exchange carrying service announcements for discovery.
pub const DISCOVERY_EXCHANGE: &str = "conveyor.services";

/// Queue on which the announcing authority receives claim requests.
pub const CLAIM_QUEUE: &str = "conveyor.claims";

/// Queue on which the announcing authority receives run acks.
pub const RUN_ACK_QUEUE: &str = "conveyor.run_ack";

/// Queue on which the announcing authority receives run nacks.
pub const RUN_NACK_QUEUE: &str = "conveyor.run_nack";

/// Queue on which the announcing authority receives end-of-job events.
pub const JOB_END_QUEUE: &str = "conveyor.job_end";

/// Queue on which the announcing authority receives per-job log lines.
pub const JOB_LOG_QUEUE: &str = "conveyor.job_log";

/// Durable work queue for one service (shared by all its worker processes).
#[must_use]
pub fn work_queue_name(service: &ServiceName) -> String {
    format!("conveyor.work.{service}")
}

/// Routing key under which runs of one pipeline are announced.
#[must_use]
pub fn pipeline_routing_key(service: &ServiceName, pipeline: &PipelineName) -> String {
    format!("{service}.{pipeline}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceName {
        ServiceName::parse("reports").unwrap()
    }

    #[test]
    fn test_work_queue_name_is_deterministic() {
        assert_eq!(work_queue_name(&service()), "conveyor.work.reports");
        assert_eq!(work_queue_name(&service()), work_queue_name(&service()));
    }

    #[test]
    fn test_pipeline_routing_key_joins_with_dot() {
        let pipeline = PipelineName::parse("daily_report").unwrap();
        assert_eq!(
            pipeline_routing_key(&service(), &pipeline),
            "reports.daily_report"
        );
    }
}
