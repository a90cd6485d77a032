//! Per-room session counting.
//!
//! The count only moves on two edges: a handshake completing (`+1`) and the
//! engine reporting a removed session (`-1`). In-flight handshakes are tracked
//! separately so a room is never torn down under a socket that is still
//! negotiating.

use gachaboard_sync::RoomId;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct SessionAccountant {
    sessions: AtomicUsize,
    handshakes: AtomicUsize,
}

impl SessionAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session that completed its handshake. Returns the new count.
    pub fn on_session_joined(&self, room_id: &RoomId, session_id: &str) -> usize {
        let total = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "[sync] session_joined roomId={} sessionId={} total={}",
            room_id, session_id, total
        );
        total
    }

    /// Record a session the engine removed. Never drops below zero.
    pub fn on_session_left(&self, room_id: &RoomId, session_id: &str) -> usize {
        let previous = self
            .sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 0 {
            warn!(
                "[sync] session_left for untracked session roomId={} sessionId={}",
                room_id, session_id
            );
            return 0;
        }

        let remaining = previous - 1;
        info!(
            "[sync] session_left roomId={} sessionId={} remaining={}",
            room_id, session_id, remaining
        );
        remaining
    }

    pub fn begin_handshake(&self) {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_handshake(&self) {
        let _ = self
            .handshakes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn pending_handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// No connected sessions and nobody mid-handshake.
    pub fn is_idle(&self) -> bool {
        self.active_sessions() == 0 && self.pending_handshakes() == 0
    }
}
