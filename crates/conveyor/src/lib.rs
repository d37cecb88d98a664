//! Conveyor worker - the coordination side of a pipeline service
//!
//! This crate provides:
//! - `Service`: a named pipeline registry plus worker identity and topology
//! - `DispatchLoop`: the consume/decode/handle control loop
//! - `ClaimTransaction`: the correlation-ID claim RPC
//! - `ServiceAnnouncer`: startup (and optional periodic) discovery announce
//! - `CommandPipeline`: the config-driven pipeline hosted by the binary

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod announce;
pub mod claim;
pub mod cli;
pub mod dispatch;
pub mod error;
pub mod job_log;
pub mod service;
pub mod shell_pipeline;

pub use announce::ServiceAnnouncer;
pub use claim::ClaimTransaction;
pub use dispatch::DispatchLoop;
pub use error::{Result, WorkerError};
pub use service::{generate_identity, Service};
pub use shell_pipeline::{CommandPipeline, CommandPipelineSpec};
