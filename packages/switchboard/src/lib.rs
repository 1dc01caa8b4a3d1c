//! Switchboard - one reconnecting event connection shared by many views
//!
//! A [`Client`] owns a single WebSocket to the dashboard server. Views
//! subscribe to event types and send envelopes through it; the client keeps
//! reconnecting with exponential backoff and holds outbound envelopes until
//! the connection is open again.
//!
//! # Example
//!
//! ```no_run
//! use switchboard::{Client, ClientConfig, WsConnector};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig::with_url("ws://127.0.0.1:8080/ws");
//!     let client = Client::spawn(config, WsConnector::new());
//!
//!     let agents = client.subscribe("agent_update", |envelope| {
//!         println!("agent changed: {}", envelope.data());
//!         Ok(())
//!     });
//!
//!     // Queued until the connection opens
//!     client.emit("ping", json!({}));
//!     client.connect();
//!
//!     tokio::signal::ctrl_c().await.unwrap();
//!     agents.unsubscribe();
//!     client.shutdown().await;
//! }
//! ```

pub mod backoff;
mod client;
pub mod config;
mod dispatch;
mod engine;
mod envelope;
pub mod error;
mod queue;
mod state;
pub mod transport;

pub use backoff::Backoff;
pub use client::{Client, Subscription};
pub use config::{ClientConfig, QueueConfig};
pub use dispatch::{Dispatcher, Handler, HandlerFailure, HandlerId};
pub use engine::Stats;
pub use envelope::Envelope;
pub use error::{ConfigError, DecodeError, TransportError};
pub use queue::{OutboundQueue, OverflowPolicy, QueuedMessage};
pub use state::{ConnectionState, Effect, Lifecycle, TransitionError, Trigger};
pub use transport::{Connector, Peer, Transport, TransportEvent, WsConnector};
