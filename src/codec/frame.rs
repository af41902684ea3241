// src/codec/frame.rs - Buffered frames for late joiners
//
// Core features:
// - FrozenFrames uses Arc<[FrameData]> for O(1) clone across subscribers
// - The frozen snapshot is cached until the next keyframe write
// - Interframe buffering is optional and capped

use bytes::Bytes;
use rml_rtmp::time::RtmpTimestamp;
use std::sync::Arc;

/// Interframes kept at most after a keyframe.
pub const MAX_BUFFERED_INTERFRAMES: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub struct FrameData {
    pub timestamp: RtmpTimestamp,
    pub data: Bytes,
}

impl FrameData {
    pub fn new(timestamp: u32, data: Bytes) -> Self {
        Self {
            timestamp: RtmpTimestamp { value: timestamp },
            data,
        }
    }
}

/// Immutable keyframe set, O(1) clone.
#[derive(Debug, Clone)]
pub struct FrozenFrames {
    frames: Arc<[FrameData]>,
}

impl FrozenFrames {
    fn new(frames: Vec<FrameData>) -> Self {
        Self {
            frames: Arc::from(frames.into_boxed_slice()),
        }
    }

    pub fn frames(&self) -> &[FrameData] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[cfg(test)]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.frames)
    }
}

impl Default for FrozenFrames {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Current keyframe group plus the interframes that followed it.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    keyframes: Vec<FrameData>,
    frozen: Option<FrozenFrames>,
    interframes: Vec<FrameData>,
    buffer_interframes: bool,
}

impl FrameBuffer {
    pub fn new(buffer_interframes: bool) -> Self {
        Self {
            buffer_interframes,
            ..Self::default()
        }
    }

    pub fn set_buffer_interframes(&mut self, buffer_interframes: bool) {
        self.buffer_interframes = buffer_interframes;
        if !buffer_interframes {
            self.interframes.clear();
        }
    }

    /// Adds a keyframe slice. Several slices may share one timestamp.
    pub fn push_keyframe(&mut self, frame: FrameData) {
        self.frozen = None;
        self.keyframes.push(frame);
    }

    /// Buffers an interframe when enabled and below the cap.
    pub fn push_interframe(&mut self, frame: FrameData) -> bool {
        if !self.buffer_interframes
            || self.keyframes.is_empty()
            || self.interframes.len() >= MAX_BUFFERED_INTERFRAMES
        {
            return false;
        }
        self.interframes.push(frame);
        true
    }

    /// Drops buffered frames, keeps settings.
    pub fn soft_reset(&mut self) {
        self.keyframes.clear();
        self.frozen = None;
        self.interframes.clear();
    }

    pub fn keyframe(&self) -> Option<FrameData> {
        self.keyframes.first().cloned()
    }

    /// Snapshot of the keyframe group.
    pub fn keyframes(&mut self) -> FrozenFrames {
        if let Some(frozen) = &self.frozen {
            return frozen.clone();
        }
        let frozen = FrozenFrames::new(self.keyframes.clone());
        self.frozen = Some(frozen.clone());
        frozen
    }

    pub fn has_keyframe(&self) -> bool {
        !self.keyframes.is_empty()
    }

    pub fn num_interframes(&self) -> usize {
        self.interframes.len()
    }

    pub fn interframe(&self, index: usize) -> Option<FrameData> {
        self.interframes.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: u32, data: &'static [u8]) -> FrameData {
        FrameData::new(ts, Bytes::from_static(data))
    }

    #[test]
    fn test_frozen_keyframes_zero_copy() {
        let mut buffer = FrameBuffer::new(false);
        buffer.push_keyframe(frame(0, b"k1-slice1"));
        buffer.push_keyframe(frame(0, b"k1-slice2"));

        let first = buffer.keyframes();
        let second = buffer.keyframes();
        assert_eq!(first.len(), 2);
        // cached snapshot is shared, not rebuilt
        assert!(first.strong_count() >= 3);
        assert_eq!(first.strong_count(), second.strong_count());

        buffer.push_keyframe(frame(0, b"k1-slice3"));
        assert_eq!(buffer.keyframes().len(), 3);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_interframes_need_a_keyframe() {
        let mut buffer = FrameBuffer::new(true);
        assert!(!buffer.push_interframe(frame(10, b"p0")));
        buffer.push_keyframe(frame(20, b"k"));
        assert!(buffer.push_interframe(frame(30, b"p1")));
        assert!(buffer.push_interframe(frame(40, b"p2")));
        assert_eq!(buffer.num_interframes(), 2);
        assert_eq!(buffer.interframe(1).unwrap().timestamp.value, 40);
        assert!(buffer.interframe(2).is_none());
    }

    #[test]
    fn test_interframe_buffering_disabled() {
        let mut buffer = FrameBuffer::new(false);
        buffer.push_keyframe(frame(0, b"k"));
        assert!(!buffer.push_interframe(frame(10, b"p")));
        assert_eq!(buffer.num_interframes(), 0);
    }

    #[test]
    fn test_interframe_cap() {
        let mut buffer = FrameBuffer::new(true);
        buffer.push_keyframe(frame(0, b"k"));
        for ts in 0..(MAX_BUFFERED_INTERFRAMES as u32 + 5) {
            buffer.push_interframe(frame(ts + 1, b"p"));
        }
        assert_eq!(buffer.num_interframes(), MAX_BUFFERED_INTERFRAMES);
    }

    #[test]
    fn test_soft_reset() {
        let mut buffer = FrameBuffer::new(true);
        buffer.push_keyframe(frame(0, b"k"));
        buffer.push_interframe(frame(10, b"p"));
        buffer.soft_reset();
        assert!(!buffer.has_keyframe());
        assert!(buffer.keyframes().is_empty());
        assert_eq!(buffer.num_interframes(), 0);
    }
}
