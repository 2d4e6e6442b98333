//! Client side of the task event relay.
//!
//! - [`ConnectionController`]: reconnect state machine, free of I/O.
//! - [`RelayClient`]: async driver running the controller over a
//!   [`Connector`] such as [`WsConnector`].
//! - [`StatusPoller`]: periodic status checks against a [`StatusSource`]
//!   such as [`ApiClient`].
//! - [`TaskFeed`]: display state folding events and poll results.

pub mod api;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod feed;
pub mod poller;
pub mod reconnect;
pub mod transport;

pub use api::ApiClient;
pub use client::{ClientEvent, RelayClient};
pub use controller::{CloseKind, Command, ConnectionController, ConnectionState};
pub use error::ClientError;
pub use feed::TaskFeed;
pub use poller::{StatusPoller, StatusSource};
pub use reconnect::ReconnectConfig;
pub use transport::{Connector, Transport, TransportEvent, WsConnector};
