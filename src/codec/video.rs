// src/codec/video.rs - Video codec capabilities

use crate::codec::frame::{FrameBuffer, FrameData, FrozenFrames};
use bytes::Bytes;

/// FLV video codec ids.
pub const CODEC_SORENSON: u8 = 2;
pub const CODEC_SCREEN_VIDEO: u8 = 3;
pub const CODEC_VP6: u8 = 4;
pub const CODEC_VP6_ALPHA: u8 = 5;
pub const CODEC_SCREEN_VIDEO2: u8 = 6;
pub const CODEC_AVC: u8 = 7;

const FLV_FRAME_KEY: u8 = 1;
const AVC_SEQUENCE_HEADER: u8 = 0;
const AVC_NALU: u8 = 1;

/// Tracks what a late joining subscriber needs to start decoding.
pub trait VideoCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn codec_id(&self) -> u8;

    /// Whether frames may be skipped without corrupting the stream.
    fn can_drop_frames(&self) -> bool {
        true
    }

    fn can_handle_data(&self, data: &Bytes) -> bool {
        data.first().map(|b| b & 0x0f) == Some(self.codec_id())
    }

    /// Inspects a frame, buffering what is needed. `false` when foreign.
    fn add_data(&mut self, data: &Bytes, timestamp: u32) -> bool;

    fn decoder_configuration(&self) -> Option<Bytes> {
        None
    }

    fn keyframe(&self) -> Option<FrameData>;

    fn keyframes(&mut self) -> FrozenFrames;

    fn num_interframes(&self) -> usize;

    fn interframe(&self, index: usize) -> Option<FrameData>;

    fn reset(&mut self);
}

// ============================================================================
// AVC
// ============================================================================

/// H.264 in FLV: sequence header plus the current keyframe group.
pub struct AvcVideo {
    decoder_configuration: Option<Bytes>,
    keyframe_timestamp: Option<u32>,
    frames: FrameBuffer,
}

impl AvcVideo {
    pub fn new(buffer_interframes: bool) -> Self {
        Self {
            decoder_configuration: None,
            keyframe_timestamp: None,
            frames: FrameBuffer::new(buffer_interframes),
        }
    }
}

impl VideoCodec for AvcVideo {
    fn name(&self) -> &'static str {
        "AVC"
    }

    fn codec_id(&self) -> u8 {
        CODEC_AVC
    }

    fn add_data(&mut self, data: &Bytes, timestamp: u32) -> bool {
        if data.len() < 2 || !self.can_handle_data(data) {
            return false;
        }
        let frame_type = data[0] >> 4;
        let avc_type = data[1];
        if frame_type == FLV_FRAME_KEY {
            match avc_type {
                AVC_NALU => {
                    // a new timestamp starts a new keyframe, slices of one
                    // picture share it
                    if self.keyframe_timestamp != Some(timestamp) {
                        self.keyframe_timestamp = Some(timestamp);
                        self.frames.soft_reset();
                    }
                    self.frames.push_keyframe(FrameData::new(timestamp, data.clone()));
                }
                AVC_SEQUENCE_HEADER => {
                    self.frames.soft_reset();
                    self.keyframe_timestamp = None;
                    self.decoder_configuration = Some(data.clone());
                }
                _ => {}
            }
        } else if avc_type == AVC_NALU {
            self.frames.push_interframe(FrameData::new(timestamp, data.clone()));
        }
        true
    }

    fn decoder_configuration(&self) -> Option<Bytes> {
        self.decoder_configuration.clone()
    }

    fn keyframe(&self) -> Option<FrameData> {
        self.frames.keyframe()
    }

    fn keyframes(&mut self) -> FrozenFrames {
        self.frames.keyframes()
    }

    fn num_interframes(&self) -> usize {
        self.frames.num_interframes()
    }

    fn interframe(&self, index: usize) -> Option<FrameData> {
        self.frames.interframe(index)
    }

    fn reset(&mut self) {
        self.decoder_configuration = None;
        self.keyframe_timestamp = None;
        self.frames.soft_reset();
    }
}

// ============================================================================
// Keyframe tracking codecs
// ============================================================================

/// Sorenson, screen video and VP6: no decoder configuration, the last
/// keyframe is enough to start.
pub struct KeyframeVideo {
    codec_id: u8,
    frames: FrameBuffer,
}

impl KeyframeVideo {
    pub fn new(codec_id: u8, buffer_interframes: bool) -> Self {
        Self {
            codec_id,
            frames: FrameBuffer::new(buffer_interframes),
        }
    }
}

impl VideoCodec for KeyframeVideo {
    fn name(&self) -> &'static str {
        match self.codec_id {
            CODEC_SORENSON => "SorensonVideo",
            CODEC_SCREEN_VIDEO => "ScreenVideo",
            CODEC_VP6 => "VP6",
            CODEC_VP6_ALPHA => "VP6Alpha",
            CODEC_SCREEN_VIDEO2 => "ScreenVideo2",
            _ => "Video",
        }
    }

    fn codec_id(&self) -> u8 {
        self.codec_id
    }

    fn add_data(&mut self, data: &Bytes, timestamp: u32) -> bool {
        if data.is_empty() || !self.can_handle_data(data) {
            return false;
        }
        let frame = FrameData::new(timestamp, data.clone());
        if data[0] >> 4 == FLV_FRAME_KEY {
            self.frames.soft_reset();
            self.frames.push_keyframe(frame);
        } else {
            self.frames.push_interframe(frame);
        }
        true
    }

    fn keyframe(&self) -> Option<FrameData> {
        self.frames.keyframe()
    }

    fn keyframes(&mut self) -> FrozenFrames {
        self.frames.keyframes()
    }

    fn num_interframes(&self) -> usize {
        self.frames.num_interframes()
    }

    fn interframe(&self, index: usize) -> Option<FrameData> {
        self.frames.interframe(index)
    }

    fn reset(&mut self) {
        self.frames.soft_reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(data: &'static [u8]) -> Bytes {
        Bytes::from_static(data)
    }

    #[test]
    fn test_avc_sequence_header_is_configuration() {
        let mut avc = AvcVideo::new(false);
        assert!(avc.add_data(&bytes(&[0x17, 0x00, 0, 0, 0, 0x01]), 0));
        assert_eq!(avc.decoder_configuration().unwrap().as_ref(), &[0x17, 0x00, 0, 0, 0, 0x01]);
        assert!(avc.keyframe().is_none());
    }

    #[test]
    fn test_avc_keyframe_group() {
        let mut avc = AvcVideo::new(true);
        avc.add_data(&bytes(&[0x17, 0x01, 0, 0, 0, 0xa1]), 100);
        avc.add_data(&bytes(&[0x17, 0x01, 0, 0, 0, 0xa2]), 100);
        avc.add_data(&bytes(&[0x27, 0x01, 0, 0, 0, 0xb1]), 110);
        assert_eq!(avc.keyframes().len(), 2);
        assert_eq!(avc.num_interframes(), 1);

        // next keyframe replaces the group and its interframes
        avc.add_data(&bytes(&[0x17, 0x01, 0, 0, 0, 0xa3]), 200);
        assert_eq!(avc.keyframes().len(), 1);
        assert_eq!(avc.keyframe().unwrap().timestamp.value, 200);
        assert_eq!(avc.num_interframes(), 0);
    }

    #[test]
    fn test_avc_rejects_other_codecs() {
        let mut avc = AvcVideo::new(false);
        assert!(!avc.add_data(&bytes(&[0x12, 0x00]), 0));
        assert!(!avc.add_data(&Bytes::new(), 0));
    }

    #[test]
    fn test_keyframe_video_tracks_last_keyframe() {
        let mut video = KeyframeVideo::new(CODEC_SORENSON, false);
        assert_eq!(video.name(), "SorensonVideo");
        assert!(video.add_data(&bytes(&[0x12, 0xaa]), 0));
        assert!(video.add_data(&bytes(&[0x22, 0xbb]), 40));
        assert!(video.add_data(&bytes(&[0x12, 0xcc]), 80));
        let keyframes = video.keyframes();
        assert_eq!(keyframes.len(), 1);
        assert_eq!(keyframes.frames()[0].data.as_ref(), &[0x12, 0xcc]);
        assert!(video.decoder_configuration().is_none());
    }
}
