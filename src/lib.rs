//! Async WebSockets for the tokio stack, for clients and multi-session
//! servers.
//!
//! The crate implements the [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455)
//! end to end: the frame codec with masking and fragmentation, the HTTP/1.1
//! upgrade handshake on both sides (including TLS, proxy tunneling and a
//! basic-auth retry), and permessage-deflate negotiation.
//!
//! On top of the single-connection API (`handshake::connect_async`,
//! `handshake::accept_async`), the `server` module adds an embedded HTTP/1.1
//! front door that routes upgrade requests by URL path to per-path behavior
//! factories, and tracks every accepted session in a registry supporting
//! broadcast, fleet-wide pings, periodic liveness sweeps and graceful
//! shutdown.

pub mod config;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod frame;
pub mod handshake;
pub mod manager;
pub mod message;
pub mod server;
pub mod service;
pub mod session;
pub mod split;
pub mod stream;

mod compression;
mod http;
mod read;
mod request;
mod write;

mod tests;
