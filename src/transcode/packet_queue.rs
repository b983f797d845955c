//! Measured FIFO of compressed packets
//!
//! Tracks queued byte size and the last pushed/popped timestamps so a
//! producer can decide when to stop reading ahead.

use std::collections::VecDeque;

use ffmpeg_next as ffmpeg;

/// FIFO of compressed packets with byte and timestamp accounting.
#[derive(Default)]
pub struct PacketQueue {
    packets: VecDeque<ffmpeg::Packet>,
    size: usize,
    last_push_pts: Option<i64>,
    last_pop_pts: Option<i64>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet. Ownership moves into the queue.
    pub fn push(&mut self, packet: ffmpeg::Packet) {
        self.size += packet.size();
        if packet.pts().is_some() {
            self.last_push_pts = packet.pts();
        }
        self.packets.push_back(packet);
    }

    /// Remove the oldest packet, handing ownership to the caller.
    pub fn pop(&mut self) -> Option<ffmpeg::Packet> {
        let packet = self.packets.pop_front()?;
        self.size = self.size.saturating_sub(packet.size());
        if packet.pts().is_some() {
            self.last_pop_pts = packet.pts();
        }
        Some(packet)
    }

    /// Drop every queued packet and forget the tracked timestamps.
    pub fn clear(&mut self) {
        self.packets.clear();
        self.size = 0;
        self.last_push_pts = None;
        self.last_pop_pts = None;
    }

    pub fn front_pts(&self) -> Option<i64> {
        self.packets.front().and_then(|p| p.pts())
    }

    pub fn last_push_pts(&self) -> Option<i64> {
        self.last_push_pts
    }

    pub fn last_pop_pts(&self) -> Option<i64> {
        self.last_pop_pts
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Total payload bytes currently queued.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Span between the oldest queued pts and the newest pushed pts, in the
    /// stream time base.
    pub fn buffered_duration(&self) -> i64 {
        match (self.front_pts(), self.last_push_pts) {
            (Some(front), Some(last)) if last > front => last - front,
            _ => 0,
        }
    }

    /// Whether a producer should pause: `limit` bytes or more are queued.
    pub fn is_full(&self, limit: usize) -> bool {
        self.size >= limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(len: usize, pts: Option<i64>) -> ffmpeg::Packet {
        let mut p = ffmpeg::Packet::copy(&vec![0u8; len]);
        p.set_pts(pts);
        p
    }

    #[test]
    fn test_push_pop_accounting() {
        let mut q = PacketQueue::new();
        q.push(packet(100, Some(0)));
        q.push(packet(50, Some(1024)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.size(), 150);
        assert_eq!(q.front_pts(), Some(0));
        assert_eq!(q.last_push_pts(), Some(1024));
        assert_eq!(q.buffered_duration(), 1024);

        let first = q.pop().unwrap();
        assert_eq!(first.pts(), Some(0));
        assert_eq!(q.size(), 50);
        assert_eq!(q.last_pop_pts(), Some(0));
        assert_eq!(q.front_pts(), Some(1024));
    }

    #[test]
    fn test_missing_pts_keeps_last_seen() {
        let mut q = PacketQueue::new();
        q.push(packet(10, Some(5)));
        q.push(packet(10, None));
        assert_eq!(q.last_push_pts(), Some(5));
    }

    #[test]
    fn test_clear_resets_timestamps() {
        let mut q = PacketQueue::new();
        q.push(packet(10, Some(7)));
        q.pop();
        q.push(packet(10, Some(8)));
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.size(), 0);
        assert_eq!(q.last_push_pts(), None);
        assert_eq!(q.last_pop_pts(), None);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_is_full() {
        let mut q = PacketQueue::new();
        assert!(!q.is_full(64));
        q.push(packet(64, Some(0)));
        assert!(q.is_full(64));
        q.pop();
        assert!(!q.is_full(64));
    }
}
