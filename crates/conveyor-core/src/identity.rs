//! Semantic identifier newtypes and the worker identity.
//!
//! Names that participate in queue/exchange naming (`ServiceName`,
//! `PipelineName`) are validated at construction; tokens assigned by remote
//! parties (`RunId`, `JobId`, `TargetName`) are opaque and accepted as-is.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Check a name used in broker routing: non-empty, no whitespace, no dots.
fn validate_routing_name(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidIdentifier(format!("{field} is empty")));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(Error::InvalidIdentifier(format!(
            "{field} '{value}' contains whitespace"
        )));
    }
    if value.contains('.') {
        return Err(Error::InvalidIdentifier(format!(
            "{field} '{value}' contains '.' which is reserved for routing keys"
        )));
    }
    Ok(())
}

/// Name of a service (one logical worker pool).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceName(String);

impl ServiceName {
    /// Parse and validate a service name.
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_routing_name("service name", &name)?;
        Ok(Self(name))
    }

    /// Get the name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a pipeline a service can run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineName(String);

impl PipelineName {
    /// Parse and validate a pipeline name.
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_routing_name("pipeline name", &name)?;
        Ok(Self(name))
    }

    /// Get the name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PipelineName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque run token assigned by the announcing authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Create a run ID from a remote-assigned token
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque job token assigned by the remote dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a job ID from a remote-assigned token
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of work within a run (a region, a table, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetName(String);

impl TargetName {
    /// Create a target name
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one worker process.
///
/// Built once at startup from hostname + pid + a process-lifetime random
/// token, then threaded through as an explicit value. The token makes the
/// reply queue name distinct across processes sharing a host while staying
/// stable across reconnects within one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    host: String,
    pid: u32,
    token: Uuid,
}

impl WorkerIdentity {
    /// Create a worker identity from its components.
    #[must_use]
    pub fn new(host: impl Into<String>, pid: u32, token: Uuid) -> Self {
        Self {
            host: host.into(),
            pid,
            token,
        }
    }

    /// Short worker label (hostname-pid) used in logs.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}-{}", self.host, self.pid)
    }

    /// Name of this worker's exclusive claim-reply queue.
    #[must_use]
    pub fn reply_queue(&self) -> String {
        format!(
            "conveyor.reply.{}-{}-{}",
            self.host,
            self.pid,
            self.token.simple()
        )
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_service_name_valid() {
        let name = ServiceName::parse("weather-ingest");
        assert!(name.is_ok());
    }

    #[test]
    fn test_service_name_empty_is_invalid() {
        assert!(ServiceName::parse("").is_err());
    }

    #[test]
    fn test_service_name_rejects_dots() {
        assert!(ServiceName::parse("a.b").is_err());
    }

    #[test]
    fn test_pipeline_name_rejects_whitespace() {
        assert!(PipelineName::parse("daily report").is_err());
    }

    #[test]
    fn test_opaque_ids_accept_anything() {
        let job = JobId::new("abc.def ghi");
        assert_eq!(job.as_str(), "abc.def ghi");
    }

    #[test]
    fn test_reply_queue_stable_within_process() {
        let token = Uuid::new_v4();
        let a = WorkerIdentity::new("host1", 42, token);
        let b = WorkerIdentity::new("host1", 42, token);
        assert_eq!(a.reply_queue(), b.reply_queue());
    }

    #[test]
    fn test_reply_queue_distinct_across_processes() {
        let a = WorkerIdentity::new("host1", 42, Uuid::new_v4());
        let b = WorkerIdentity::new("host1", 43, Uuid::new_v4());
        let c = WorkerIdentity::new("host2", 42, Uuid::new_v4());
        assert_ne!(a.reply_queue(), b.reply_queue());
        assert_ne!(a.reply_queue(), c.reply_queue());
    }

    #[test]
    fn test_worker_label_format() {
        let identity = WorkerIdentity::new("node-a", 7, Uuid::new_v4());
        assert_eq!(identity.label(), "node-a-7");
    }

    proptest! {
        #[test]
        fn prop_routing_names_never_contain_separators(name in "[a-z][a-z0-9_-]{0,30}") {
            let parsed = ServiceName::parse(name.clone());
            prop_assert!(parsed.is_ok());
            prop_assert_eq!(parsed.ok().map(|n| n.as_str().to_string()), Some(name));
        }

        #[test]
        fn prop_names_with_dots_rejected(prefix in "[a-z]{1,8}", suffix in "[a-z]{1,8}") {
            let name = format!("{prefix}.{suffix}");
            prop_assert!(PipelineName::parse(name).is_err());
        }
    }
}
