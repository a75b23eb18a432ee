//! Resume frame cache and position bookkeeping.
//!
//! Both ends of a resumable session track an absolute position per
//! direction: the byte count of position-counted frames sent, and the byte
//! count received. Outbound frames are retained until the peer acknowledges
//! a position past them (via KEEPALIVE or RESUME_OK), bounded by a byte
//! capacity; resumption replays the retained suffix.

use std::collections::VecDeque;

use bytes::Bytes;
use rand::RngCore;

/// Append-only ring of outbound resumable frames plus the inbound high-water
/// mark. Storage is in-memory; callers wanting durability hold the manager
/// behind the shared handle the connection exposes and snapshot `entries()`.
#[derive(Debug)]
pub struct ResumeManager {
    /// Retained frames, each tagged with the absolute position of its first
    /// byte. Ordered and contiguous.
    entries: VecDeque<(u64, Bytes)>,
    /// Position of the oldest retained byte (low-water mark).
    first_available_position: u64,
    /// Position one past the newest sent byte (high-water mark).
    next_position: u64,
    /// Absolute byte count of resumable frames received from the peer.
    last_received_position: u64,
    capacity: usize,
    retained: usize,
}

impl ResumeManager {
    pub fn new(capacity: usize) -> Self {
        ResumeManager {
            entries: VecDeque::new(),
            first_available_position: 0,
            next_position: 0,
            last_received_position: 0,
            capacity,
            retained: 0,
        }
    }

    /// A fresh opaque session token.
    pub fn generate_token() -> Bytes {
        let mut token = [0u8; 16];
        rand::rng().fill_bytes(&mut token);
        Bytes::copy_from_slice(&token)
    }

    /// Record an outbound resumable frame, evicting from the tail of history
    /// when the retention budget is exceeded.
    pub fn track_sent(&mut self, frame: Bytes) {
        let len = frame.len();
        self.entries.push_back((self.next_position, frame));
        self.next_position += len as u64;
        self.retained += len;
        while self.retained > self.capacity {
            let Some((_, evicted)) = self.entries.pop_front() else {
                break;
            };
            self.retained -= evicted.len();
            self.first_available_position = self
                .entries
                .front()
                .map_or(self.next_position, |(pos, _)| *pos);
        }
    }

    /// Advance the inbound position by one received resumable frame.
    pub fn track_received(&mut self, frame_len: usize) {
        self.last_received_position += frame_len as u64;
    }

    /// Drop retained frames the peer has acknowledged receiving.
    pub fn release_up_to(&mut self, position: u64) {
        while let Some((pos, frame)) = self.entries.front() {
            if pos + frame.len() as u64 > position {
                break;
            }
            let len = frame.len();
            self.entries.pop_front();
            self.retained -= len;
        }
        self.first_available_position = self
            .entries
            .front()
            .map_or(self.next_position, |(pos, _)| *pos);
    }

    /// Whether a replay can start exactly at `position`: within the retained
    /// window and on a frame boundary (or equal to the high-water mark,
    /// meaning nothing needs replaying).
    pub fn is_position_available(&self, position: u64) -> bool {
        if position < self.first_available_position || position > self.next_position {
            return false;
        }
        position == self.next_position
            || self
                .entries
                .binary_search_by(|(pos, _)| pos.cmp(&position))
                .is_ok()
    }

    /// Retained frames from `position` to the high-water mark, in send order.
    /// `None` when the position is no longer (or never was) available.
    pub fn replay_from(&self, position: u64) -> Option<Vec<Bytes>> {
        if !self.is_position_available(position) {
            return None;
        }
        let start = self
            .entries
            .partition_point(|(pos, _)| *pos < position);
        Some(
            self.entries
                .iter()
                .skip(start)
                .map(|(_, frame)| frame.clone())
                .collect(),
        )
    }

    pub fn first_available_position(&self) -> u64 {
        self.first_available_position
    }

    /// The implied position: one past the last byte sent.
    pub fn next_position(&self) -> u64 {
        self.next_position
    }

    pub fn last_received_position(&self) -> u64 {
        self.last_received_position
    }

    /// Retained `(position, frame)` pairs, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = (u64, &Bytes)> {
        self.entries.iter().map(|(pos, frame)| (*pos, frame))
    }

    pub fn retained_bytes(&self) -> usize {
        self.retained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn positions_advance_by_frame_bytes() {
        let mut mgr = ResumeManager::new(1024);
        mgr.track_sent(frame(100, 1));
        mgr.track_sent(frame(50, 2));
        assert_eq!(mgr.next_position(), 150);
        assert_eq!(mgr.first_available_position(), 0);

        mgr.track_received(64);
        mgr.track_received(36);
        assert_eq!(mgr.last_received_position(), 100);
    }

    #[test]
    fn eviction_advances_low_water_mark() {
        let mut mgr = ResumeManager::new(120);
        mgr.track_sent(frame(100, 1));
        mgr.track_sent(frame(100, 2));
        // First frame evicted: retention budget is 120 bytes.
        assert_eq!(mgr.first_available_position(), 100);
        assert_eq!(mgr.retained_bytes(), 100);
        assert!(!mgr.is_position_available(0));
        assert!(mgr.is_position_available(100));
    }

    #[test]
    fn release_trims_acknowledged_frames() {
        let mut mgr = ResumeManager::new(1024);
        mgr.track_sent(frame(100, 1));
        mgr.track_sent(frame(100, 2));
        mgr.release_up_to(100);
        assert_eq!(mgr.first_available_position(), 100);
        assert_eq!(mgr.retained_bytes(), 100);

        // A mid-frame acknowledgment keeps the straddling frame.
        mgr.release_up_to(150);
        assert_eq!(mgr.first_available_position(), 100);
        assert_eq!(mgr.retained_bytes(), 100);
    }

    #[test]
    fn replay_returns_suffix_in_order() {
        let mut mgr = ResumeManager::new(1024);
        mgr.track_sent(frame(10, 1));
        mgr.track_sent(frame(10, 2));
        mgr.track_sent(frame(10, 3));

        let replayed = mgr.replay_from(10).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0][0], 2);
        assert_eq!(replayed[1][0], 3);

        // Replay from the high-water mark is valid and empty.
        assert_eq!(mgr.replay_from(30).unwrap().len(), 0);
    }

    #[test]
    fn replay_rejects_unaligned_or_evicted_positions() {
        let mut mgr = ResumeManager::new(20);
        mgr.track_sent(frame(10, 1));
        mgr.track_sent(frame(10, 2));
        mgr.track_sent(frame(10, 3));
        // Position 0 evicted by capacity.
        assert!(mgr.replay_from(0).is_none());
        // Position 15 is inside a frame.
        assert!(mgr.replay_from(15).is_none());
        assert!(mgr.replay_from(20).is_some());
    }

    #[test]
    fn generated_tokens_are_distinct() {
        assert_ne!(ResumeManager::generate_token(), ResumeManager::generate_token());
    }
}
