//! # Gachaboard Room Sync Engine
//!
//! Shared sync layer for collaborative boards.
//!
//! This crate provides:
//! - **Protocol types**: the JSON messages exchanged over a room socket
//! - **Schema**: the document schema descriptor and the compatibility check
//!   run during the handshake
//! - **Room ids**: a validated [`RoomId`] built once at the system boundary
//! - **Storage**: one SQLite file per room via [`storage::RoomStore`]
//! - **Engine**: the [`engine::ReplicationEngine`] seam and the bundled
//!   [`engine::RecordEngine`]
//!
//! Used by `gachaboard_sync_server`, which owns the room registry and the
//! HTTP/WebSocket surface.

pub mod engine;
pub mod protocol;
pub mod room_id;
pub mod schema;
pub mod storage;
pub mod transport;

pub use room_id::{RoomId, RoomIdError};
