//! Task event relay infrastructure.
//!
//! This crate provides the server-side building blocks that bridge the
//! per-task upstream broker channels to connected client sessions:
//!
//! - [`Broker`]: boundary to the external publish/subscribe broker, with
//!   an in-process [`InMemoryBroker`] backed by `tokio::sync::broadcast`.
//! - [`adapter`]: the event source adapter: one upstream subscription
//!   feeding a bounded queue and a dedicated dispatch task.
//! - [`ChannelRegistry`]: reference-counted table of live channels,
//!   serialized per channel.
//! - [`RelayError`]: error taxonomy shared with the session layer.

pub mod adapter;
pub mod broker;
pub mod error;
pub mod registry;

pub use broker::{Broker, BrokerError, InMemoryBroker, UpstreamSubscription};
pub use error::RelayError;
pub use registry::{
    Attachment, ChannelRegistry, DetachOutcome, Outbound, RegistryConfig, Subscriber,
};
