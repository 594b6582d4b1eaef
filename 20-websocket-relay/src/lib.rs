//! WebSocket chat relay.
//!
//! Clients connect to `/websocket`, send JSON chat messages and receive every
//! message sent by the other connected clients. Each module focuses on one
//! responsibility:
//!
//! - [`transport`] adapts axum, tokio-tungstenite and in-memory sockets to a
//!   common frame sink/stream pair.
//! - [`session`] runs the reader, writer and router tasks of one connection
//!   and owns its close protocol.
//! - [`hub`] merges every session's messages into one ordered queue and fans
//!   them out to all other sessions.
//! - [`server`] exposes the HTTP routes and upgrades connections.
//! - [`client`] is the terminal front end.
//! - [`cli`] parses the command line for `serve` and `client` modes.
//! - [`message`] defines the JSON envelope.
//! - [`console`] serializes line output to stdout.

pub mod cli;
pub mod client;
pub mod console;
pub mod hub;
pub mod message;
pub mod server;
pub mod session;
pub mod transport;
