//! Config-driven pipeline running a shell command per target.
//!
//! This is the pipeline the `conveyor` binary hosts: targets come from
//! configuration, execution shells out with the target and target time in
//! the environment. Applications embedding the library implement
//! `PipelineRuntime` directly instead.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conveyor_core::{
    message::TargetParameters,
    pipeline::{JobLogger, PipelineRuntime, RunRefused},
    Error, TargetName,
};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

fn default_expire_secs() -> i64 {
    3600
}

/// One `[pipelines.<name>]` entry in the worker config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPipelineSpec {
    /// Targets that exist for every run of this pipeline
    pub targets: Vec<String>,
    /// Shell command executed per target; sees `CONVEYOR_TARGET` and
    /// `CONVEYOR_TARGET_TIME` in its environment
    pub command: String,
    /// Claim expiry, seconds after the claim starts
    #[serde(default = "default_expire_secs")]
    pub expire_secs: i64,
}

/// Pipeline executing a configured command once per configured target.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    spec: CommandPipelineSpec,
}

impl CommandPipeline {
    /// Create a pipeline from its config entry.
    #[must_use]
    pub const fn new(spec: CommandPipelineSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl PipelineRuntime for CommandPipeline {
    async fn targets(
        &self,
        _target_time: DateTime<Utc>,
    ) -> std::result::Result<BTreeSet<TargetName>, RunRefused> {
        if self.spec.targets.is_empty() {
            return Err(RunRefused::new("no targets configured"));
        }
        Ok(self
            .spec
            .targets
            .iter()
            .map(TargetName::new)
            .collect())
    }

    fn expire_time(
        &self,
        _target_time: DateTime<Utc>,
        _target: &TargetName,
        claim_start: DateTime<Utc>,
    ) -> DateTime<Utc> {
        claim_start + Duration::seconds(self.spec.expire_secs.max(1))
    }

    async fn make_target(
        &self,
        target_time: DateTime<Utc>,
        target: &TargetName,
        _parameters: &TargetParameters,
        log: &mut dyn JobLogger,
    ) -> conveyor_core::Result<bool> {
        log.log(&format!("running '{}' for target {target}", self.spec.command))
            .await?;

        let output = Command::new("sh")
            .args(["-c", &self.spec.command])
            .env("CONVEYOR_TARGET", target.as_str())
            .env("CONVEYOR_TARGET_TIME", target_time.to_rfc3339())
            .output()
            .await
            .map_err(|err| Error::Execution(format!("failed to spawn command: {err}")))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            log.log(line).await?;
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            log.log(line).await?;
        }

        let exit_code = output.status.code().map_or(-1, |code| code);
        log.log(&format!("command exited with code {exit_code}")).await?;
        Ok(output.status.success())
    }
}

#[cfg(test)]
mod tests {
    use conveyor_core::pipeline::NullJobLogger;

    use super::*;

    fn spec(targets: &[&str], command: &str) -> CommandPipelineSpec {
        CommandPipelineSpec {
            targets: targets.iter().map(|t| (*t).to_string()).collect(),
            command: command.to_string(),
            expire_secs: 60,
        }
    }

    fn target_time() -> DateTime<Utc> {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn test_targets_come_from_config() {
        let pipeline = CommandPipeline::new(spec(&["north", "south"], "true"));
        let targets = pipeline.targets(target_time()).await.unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&TargetName::new("north")));
    }

    #[tokio::test]
    async fn test_no_targets_refuses_the_run() {
        let pipeline = CommandPipeline::new(spec(&[], "true"));
        let refused = pipeline.targets(target_time()).await.unwrap_err();
        assert_eq!(refused.reason, "no targets configured");
    }

    #[tokio::test]
    async fn test_successful_command_reports_success() {
        let pipeline = CommandPipeline::new(spec(&["north"], "true"));
        let mut log = NullJobLogger;
        let succeeded = pipeline
            .make_target(
                target_time(),
                &TargetName::new("north"),
                &TargetParameters::new(),
                &mut log,
            )
            .await
            .unwrap();
        assert!(succeeded);
    }

    #[tokio::test]
    async fn test_failing_command_reports_failure() {
        let pipeline = CommandPipeline::new(spec(&["north"], "false"));
        let mut log = NullJobLogger;
        let succeeded = pipeline
            .make_target(
                target_time(),
                &TargetName::new("north"),
                &TargetParameters::new(),
                &mut log,
            )
            .await
            .unwrap();
        assert!(!succeeded);
    }

    #[tokio::test]
    async fn test_command_sees_target_in_environment() {
        let pipeline = CommandPipeline::new(spec(
            &["north"],
            r#"test "$CONVEYOR_TARGET" = "north""#,
        ));
        let mut log = NullJobLogger;
        let succeeded = pipeline
            .make_target(
                target_time(),
                &TargetName::new("north"),
                &TargetParameters::new(),
                &mut log,
            )
            .await
            .unwrap();
        assert!(succeeded);
    }

    #[test]
    fn test_expire_time_strictly_after_claim_start() {
        let pipeline = CommandPipeline::new(CommandPipelineSpec {
            targets: vec!["north".to_string()],
            command: "true".to_string(),
            expire_secs: 0,
        });
        let start = Utc::now();
        assert!(pipeline.expire_time(start, &TargetName::new("north"), start) > start);
    }

    #[test]
    fn test_spec_defaults_expiry() {
        let spec: CommandPipelineSpec =
            toml::from_str("targets = [\"north\"]\ncommand = \"true\"").unwrap();
        assert_eq!(spec.expire_secs, 3600);
    }
}
