//! Codec capabilities.
//!
//! Codecs are opaque to the core: they identify payloads by their first
//! byte and keep what a late joining subscriber needs to start decoding
//! (decoder configuration, the current keyframe group, optionally the
//! interframes after it). Bitstream parsing stays out of here.

pub mod audio;
pub mod frame;
pub mod video;

pub use audio::{AacAudio, AudioCodec, PassthroughAudio};
pub use frame::{FrameBuffer, FrameData, FrozenFrames};
pub use video::{AvcVideo, KeyframeVideo, VideoCodec};

use bytes::Bytes;
use log::debug;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Picks a codec implementation from the first payload byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecFactory {
    buffer_interframes: bool,
}

impl CodecFactory {
    pub fn new(buffer_interframes: bool) -> Self {
        Self { buffer_interframes }
    }

    pub fn video_codec(&self, data: &Bytes) -> Option<Box<dyn VideoCodec>> {
        let codec_id = data.first()? & 0x0f;
        match codec_id {
            video::CODEC_AVC => Some(Box::new(AvcVideo::new(self.buffer_interframes))),
            video::CODEC_SORENSON..=video::CODEC_SCREEN_VIDEO2 => Some(Box::new(
                KeyframeVideo::new(codec_id, self.buffer_interframes),
            )),
            _ => None,
        }
    }

    pub fn audio_codec(&self, data: &Bytes) -> Option<Box<dyn AudioCodec>> {
        let codec_id = data.first()? >> 4;
        match codec_id {
            audio::CODEC_AAC => Some(Box::new(AacAudio::new())),
            0..=9 | 11 => Some(Box::new(PassthroughAudio::new(codec_id))),
            _ => None,
        }
    }
}

/// Codec state of one published stream, shared with its subscribers.
#[derive(Default)]
pub struct StreamCodecInfo {
    has_audio: AtomicBool,
    has_video: AtomicBool,
    video: RwLock<Option<Box<dyn VideoCodec>>>,
    audio: RwLock<Option<Box<dyn AudioCodec>>>,
    factory: CodecFactory,
}

impl StreamCodecInfo {
    pub fn new(factory: CodecFactory) -> Self {
        Self {
            factory,
            ..Self::default()
        }
    }

    pub fn has_audio(&self) -> bool {
        self.has_audio.load(Ordering::Acquire)
    }

    pub fn has_video(&self) -> bool {
        self.has_video.load(Ordering::Acquire)
    }

    /// Feeds a video frame, detecting the codec on first use.
    pub fn add_video(&self, data: &Bytes, timestamp: u32) {
        self.has_video.store(true, Ordering::Release);
        let mut video = self.video.write();
        let handles = video.as_ref().is_some_and(|codec| codec.can_handle_data(data));
        if !handles {
            *video = self.factory.video_codec(data);
            if let Some(codec) = video.as_ref() {
                debug!("Video codec detected: {}", codec.name());
            }
        }
        if let Some(codec) = video.as_mut() {
            codec.add_data(data, timestamp);
        }
    }

    /// Feeds an audio frame, detecting the codec on first use.
    pub fn add_audio(&self, data: &Bytes) {
        self.has_audio.store(true, Ordering::Release);
        let mut audio = self.audio.write();
        let handles = audio.as_ref().is_some_and(|codec| codec.can_handle_data(data));
        if !handles {
            *audio = self.factory.audio_codec(data);
            if let Some(codec) = audio.as_ref() {
                debug!("Audio codec detected: {}", codec.name());
            }
        }
        if let Some(codec) = audio.as_mut() {
            codec.add_data(data);
        }
    }

    pub fn video_codec_name(&self) -> Option<&'static str> {
        self.video.read().as_ref().map(|codec| codec.name())
    }

    pub fn audio_codec_name(&self) -> Option<&'static str> {
        self.audio.read().as_ref().map(|codec| codec.name())
    }

    pub fn video_can_drop_frames(&self) -> bool {
        self.video
            .read()
            .as_ref()
            .is_some_and(|codec| codec.can_drop_frames())
    }

    pub fn video_configuration(&self) -> Option<Bytes> {
        self.video.read().as_ref()?.decoder_configuration()
    }

    pub fn audio_configuration(&self) -> Option<Bytes> {
        self.audio.read().as_ref()?.decoder_configuration()
    }

    pub fn video_keyframes(&self) -> FrozenFrames {
        match self.video.write().as_mut() {
            Some(codec) => codec.keyframes(),
            None => FrozenFrames::default(),
        }
    }

    pub fn has_keyframe(&self) -> bool {
        self.video
            .read()
            .as_ref()
            .is_some_and(|codec| codec.keyframe().is_some())
    }

    pub fn num_interframes(&self) -> usize {
        self.video
            .read()
            .as_ref()
            .map_or(0, |codec| codec.num_interframes())
    }

    pub fn interframe(&self, index: usize) -> Option<FrameData> {
        self.video.read().as_ref()?.interframe(index)
    }

    pub fn reset(&self) {
        if let Some(codec) = self.video.write().as_mut() {
            codec.reset();
        }
        if let Some(codec) = self.audio.write().as_mut() {
            codec.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selects_by_first_byte() {
        let factory = CodecFactory::new(false);
        let avc = factory.video_codec(&Bytes::from_static(&[0x17, 0x00])).unwrap();
        assert_eq!(avc.name(), "AVC");
        let vp6 = factory.video_codec(&Bytes::from_static(&[0x14])).unwrap();
        assert_eq!(vp6.name(), "VP6");
        assert!(factory.video_codec(&Bytes::from_static(&[0x1c])).is_none());
        assert!(factory.video_codec(&Bytes::new()).is_none());

        assert_eq!(factory.audio_codec(&Bytes::from_static(&[0xaf])).unwrap().name(), "AAC");
        assert_eq!(factory.audio_codec(&Bytes::from_static(&[0x2f])).unwrap().name(), "MP3");
        assert!(factory.audio_codec(&Bytes::from_static(&[0xff])).is_none());
    }

    #[test]
    fn test_stream_codec_info_tracks_configuration() {
        let info = StreamCodecInfo::new(CodecFactory::new(true));
        assert!(!info.has_video());
        info.add_video(&Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 1]), 0);
        info.add_video(&Bytes::from_static(&[0x17, 0x01, 0, 0, 0, 2]), 100);
        info.add_video(&Bytes::from_static(&[0x27, 0x01, 0, 0, 0, 3]), 110);
        info.add_audio(&Bytes::from_static(&[0xaf, 0x00, 0x12, 0x10]));

        assert!(info.has_video() && info.has_audio());
        assert_eq!(info.video_codec_name(), Some("AVC"));
        assert!(info.video_configuration().is_some());
        assert!(info.audio_configuration().is_some());
        assert!(info.has_keyframe());
        assert_eq!(info.video_keyframes().len(), 1);
        assert_eq!(info.num_interframes(), 1);
        assert!(info.video_can_drop_frames());

        info.reset();
        assert!(info.video_configuration().is_none());
        assert!(!info.has_keyframe());
    }
}
