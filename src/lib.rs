//! Signaling and attendance-verification core for one-to-one consultation video rooms.
//!
//! Clients talk to the coordinator over a WebSocket. It pairs a student and a consultant
//! in a room, relays their WebRTC negotiation, tracks recording, and credits verified
//! consultation hours from the observed length of the session.

pub mod attendance;
pub mod clock;
pub mod config;
pub mod connections;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod messages;
pub mod recording;
pub mod registry;
pub mod relay;
pub mod room;
pub mod server;
pub mod types;

pub use coordinator::Coordinator;
pub use error::{CoordinatorError, CreditError, GatewayError};
