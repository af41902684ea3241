// src/rtmp/write_queue.rs - Outbound message queue
//
// Core features:
// - Tiered backpressure strategy (Normal/Warning/High/Critical)
// - Control messages and sequence headers never dropped by policy
// - Pending video count per stream, read by the live frame dropper
// - Time-based eviction, shorter for audio-only sessions

use crate::rtmp::event::{Packet, RtmpEvent};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

// Backpressure thresholds, measured in queued payload bytes
const QUEUE_WARN_BYTES: usize = 1024 * 1024;
const QUEUE_HIGH_BYTES: usize = 2 * 1024 * 1024;
const QUEUE_MAX_BYTES: usize = 4 * 1024 * 1024;
const QUEUE_MAX_AGE_SECS: u64 = 10;
const AUDIO_ONLY_MAX_AGE_SECS: u64 = 5;

struct WriteEntry {
    packet: Packet,
    size: usize,
    timestamp: Instant,
    is_video: bool,
    // control messages, metadata and decoder configuration
    is_priority: bool,
}

impl WriteEntry {
    fn age_secs(&self) -> u64 {
        self.timestamp.elapsed().as_secs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureLevel {
    Normal,   // < 1MB: enqueue all
    Warning,  // 1-2MB: drop non-keyframe video, keep audio + keyframes
    High,     // 2-4MB: only keep keyframes and priority messages
    Critical, // >= 4MB: should disconnect
}

/// Outcome of [`WriteQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued,
    /// Dropped by the backpressure policy, the session stays usable.
    Dropped,
    /// Queue full, the session should be disconnected.
    Rejected,
}

/// Per-connection queue of packets waiting for the wire.
pub struct WriteQueue {
    queue: VecDeque<WriteEntry>,
    total_bytes: usize,
    has_video: bool,
    dropped_frames: u64,
    pending_video: HashMap<u32, usize>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::with_capacity(64),
            total_bytes: 0,
            has_video: false,
            dropped_frames: 0,
            pending_video: HashMap::new(),
        }
    }

    pub fn backpressure_level(&self) -> BackpressureLevel {
        if self.total_bytes >= QUEUE_MAX_BYTES {
            BackpressureLevel::Critical
        } else if self.total_bytes >= QUEUE_HIGH_BYTES {
            BackpressureLevel::High
        } else if self.total_bytes >= QUEUE_WARN_BYTES {
            BackpressureLevel::Warning
        } else {
            BackpressureLevel::Normal
        }
    }

    /// Enqueue a packet
    ///
    /// # Arguments
    /// * `packet` - Message to queue; media flags are derived from its event
    ///
    /// # Returns
    /// * `Queued` - Accepted
    /// * `Dropped` - Discarded per policy
    /// * `Rejected` - Would reach the critical threshold
    pub fn enqueue(&mut self, packet: Packet) -> EnqueueResult {
        let (is_video, is_keyframe, is_priority) = match &packet.event {
            RtmpEvent::Video(video) => (true, packet.event.is_keyframe(), video.is_config()),
            RtmpEvent::Audio(audio) => (false, false, audio.is_config()),
            RtmpEvent::Aggregate(_) => (true, false, false),
            _ => (false, false, true),
        };
        let size = packet.event.payload_len();
        if is_video {
            self.has_video = true;
        }

        // checked before adding to prevent overshoot
        if self.total_bytes.saturating_add(size) >= QUEUE_MAX_BYTES {
            return EnqueueResult::Rejected;
        }

        if is_priority {
            self.push_entry(packet, size, is_video, true);
            return EnqueueResult::Queued;
        }

        let accepted = match self.backpressure_level() {
            BackpressureLevel::Normal => true,
            BackpressureLevel::Warning => is_keyframe || !is_video,
            BackpressureLevel::High => is_keyframe,
            BackpressureLevel::Critical => false,
        };
        if accepted {
            self.push_entry(packet, size, is_video, false);
        } else {
            self.dropped_frames += 1;
        }
        if self.backpressure_level() != BackpressureLevel::Normal {
            self.evict_old_entries();
        }
        if accepted {
            EnqueueResult::Queued
        } else {
            EnqueueResult::Dropped
        }
    }

    fn push_entry(&mut self, packet: Packet, size: usize, is_video: bool, is_priority: bool) {
        if is_video {
            *self.pending_video.entry(packet.header.stream_id).or_insert(0) += 1;
        }
        self.queue.push_back(WriteEntry {
            packet,
            size,
            timestamp: Instant::now(),
            is_video,
            is_priority,
        });
        self.total_bytes += size;
    }

    fn evict_old_entries(&mut self) {
        let max_age = if self.has_video {
            QUEUE_MAX_AGE_SECS
        } else {
            AUDIO_ONLY_MAX_AGE_SECS
        };

        while let Some(entry) = self.queue.front() {
            if entry.is_priority || entry.age_secs() <= max_age {
                break;
            }
            if self.pop_entry().is_some() {
                self.dropped_frames += 1;
            }
        }
    }

    fn pop_entry(&mut self) -> Option<Packet> {
        let entry = self.queue.pop_front()?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        if entry.is_video {
            let stream_id = entry.packet.header.stream_id;
            if let Some(count) = self.pending_video.get_mut(&stream_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.pending_video.remove(&stream_id);
                }
            }
        }
        Some(entry.packet)
    }

    /// Takes up to `max` packets off the front, in queue order.
    pub fn drain(&mut self, max: usize) -> Vec<Packet> {
        let mut packets = Vec::with_capacity(max.min(self.queue.len()));
        while packets.len() < max {
            match self.pop_entry() {
                Some(packet) => packets.push(packet),
                None => break,
            }
        }
        packets
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending_video.clear();
        self.total_bytes = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending_entries(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_video(&self, stream_id: u32) -> usize {
        self.pending_video.get(&stream_id).copied().unwrap_or(0)
    }

    pub fn pending_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    #[cfg(test)]
    fn has_video(&self) -> bool {
        self.has_video
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtmp::event::{AudioData, Ping, PingType, VideoData};
    use bytes::Bytes;

    fn video(stream_id: u32, first: u8, size: usize) -> Packet {
        let mut data = vec![0u8; size.max(2)];
        data[0] = first;
        data[1] = 1;
        Packet::new(6, stream_id, 0, RtmpEvent::Video(VideoData::new(Bytes::from(data))))
    }

    fn audio(size: usize) -> Packet {
        let mut data = vec![0u8; size.max(2)];
        data[0] = 0xaf;
        data[1] = 1;
        Packet::new(5, 1, 0, RtmpEvent::Audio(AudioData::new(Bytes::from(data))))
    }

    #[test]
    fn test_basic_enqueue_drain() {
        let mut queue = WriteQueue::new();
        assert_eq!(queue.enqueue(video(1, 0x27, 100)), EnqueueResult::Queued);
        assert_eq!(queue.pending_bytes(), 100);
        assert_eq!(queue.pending_entries(), 1);
        assert_eq!(queue.pending_video(1), 1);
        assert_eq!(queue.pending_video(2), 0);

        let packets = queue.drain(10);
        assert_eq!(packets.len(), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.pending_video(1), 0);
        assert_eq!(queue.pending_bytes(), 0);
    }

    #[test]
    fn test_backpressure_levels() {
        let mut queue = WriteQueue::new();
        queue.enqueue(video(1, 0x17, 512 * 1024));
        assert_eq!(queue.backpressure_level(), BackpressureLevel::Normal);
        queue.enqueue(video(1, 0x17, 1000 * 1024));
        assert_eq!(queue.backpressure_level(), BackpressureLevel::Warning);
        queue.enqueue(video(1, 0x17, 1000 * 1024));
        assert_eq!(queue.backpressure_level(), BackpressureLevel::High);

        // would reach critical, rejected even for a keyframe
        assert_eq!(queue.enqueue(video(1, 0x17, 1600 * 1024)), EnqueueResult::Rejected);
        assert_eq!(queue.backpressure_level(), BackpressureLevel::High);
    }

    #[test]
    fn test_warning_level_drops_interframes_keeps_audio() {
        let mut queue = WriteQueue::new();
        queue.enqueue(video(1, 0x17, 1500 * 1024));
        assert_eq!(queue.backpressure_level(), BackpressureLevel::Warning);

        assert_eq!(queue.enqueue(audio(100)), EnqueueResult::Queued);
        assert_eq!(queue.enqueue(video(1, 0x27, 100)), EnqueueResult::Dropped);
        assert_eq!(queue.dropped_frames(), 1);
    }

    #[test]
    fn test_high_level_keeps_keyframes_and_control() {
        let mut queue = WriteQueue::new();
        queue.enqueue(video(1, 0x27, 3 * 1024 * 1024));
        assert_eq!(queue.backpressure_level(), BackpressureLevel::High);

        let before = queue.pending_entries();
        assert_eq!(queue.enqueue(video(1, 0x17, 100)), EnqueueResult::Queued);
        assert_eq!(queue.enqueue(audio(100)), EnqueueResult::Dropped);
        let ping = Packet::new(2, 0, 0, RtmpEvent::Ping(Ping::new(PingType::PingClient, 1)));
        assert_eq!(queue.enqueue(ping), EnqueueResult::Queued);
        assert_eq!(queue.pending_entries(), before + 2);
    }

    #[test]
    fn test_pending_video_per_stream() {
        let mut queue = WriteQueue::new();
        queue.enqueue(video(1, 0x27, 10));
        queue.enqueue(video(1, 0x27, 10));
        queue.enqueue(video(2, 0x27, 10));
        queue.enqueue(audio(10));
        assert!(queue.has_video());
        assert_eq!(queue.pending_video(1), 2);
        assert_eq!(queue.pending_video(2), 1);

        queue.drain(2);
        assert_eq!(queue.pending_video(1), 0);
        assert_eq!(queue.pending_video(2), 1);

        queue.clear();
        assert_eq!(queue.pending_video(2), 0);
        assert!(queue.is_empty());
    }
}
