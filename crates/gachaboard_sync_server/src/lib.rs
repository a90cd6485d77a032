//! Gachaboard sync server.
//!
//! - [`sync`]: room registry and per-room session accounting
//! - [`handlers`]: the WebSocket gateway and the administrative HTTP routes
//! - [`config`]: environment-driven configuration

pub mod config;
pub mod handlers;
pub mod sync;
