//! Conveyor-broker - The transport boundary
//!
//! This crate provides:
//! - The `Channel` and `Connector` trait seams over a message broker
//! - `Topology`: idempotent exchange/queue/binding declarations
//! - `RecoveringChannel`: transparent reconnect with a one-retry budget
//! - `MemoryBroker`: an in-process broker for tests and single-host use
//!
//! The coordination core never holds a raw channel across a reconnect; the
//! replaceable inner handle lives behind `RecoveringChannel`.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod channel;
pub mod memory;
pub mod recovery;
pub mod topology;

pub use channel::{
    Channel, ChannelError, ChannelResult, Connector, Consumer, Delivery, ExchangeKind,
    PublishProperties, QueueSpec,
};
pub use memory::{MemoryBroker, MemoryChannel, MemoryConnector};
pub use recovery::RecoveringChannel;
pub use topology::{Binding, Topology};
