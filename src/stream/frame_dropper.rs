// src/stream/frame_dropper.rs - Dependency aware live video dropping
//
// An interframe is only decodable when its reference frames arrived. Once a
// frame was dropped the dropper refuses interframes until a keyframe makes
// the stream decodable again.

use crate::rtmp::event::{FrameType, RtmpEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropperState {
    /// Everything passes.
    SendAll,
    /// Keyframes and interframes pass, disposable frames are dropped.
    SendInterframes,
    /// Only keyframes pass.
    SendKeyframes,
    /// Only keyframes pass; the next one re-enables interframes.
    SendKeyframesCheck,
}

#[derive(Debug, Clone)]
pub struct VideoFrameDropper {
    state: DropperState,
}

impl VideoFrameDropper {
    pub fn new() -> Self {
        Self {
            state: DropperState::SendAll,
        }
    }

    pub fn state(&self) -> DropperState {
        self.state
    }

    pub fn reset(&mut self, state: DropperState) {
        self.state = state;
    }

    /// Whether `event` may go out given `pending` undelivered video messages.
    /// Only video is ever refused.
    pub fn can_send_packet(&mut self, event: &RtmpEvent, pending: usize) -> bool {
        let frame_type = match event {
            RtmpEvent::Video(video) => video.frame_type(),
            _ => return true,
        };
        match self.state {
            DropperState::SendAll => true,
            DropperState::SendInterframes => match frame_type {
                FrameType::Keyframe => {
                    if pending == 0 {
                        self.state = DropperState::SendAll;
                    }
                    true
                }
                FrameType::Interframe => true,
                _ => false,
            },
            DropperState::SendKeyframes => {
                let keyframe = frame_type == FrameType::Keyframe;
                if keyframe && pending == 0 {
                    self.state = DropperState::SendKeyframesCheck;
                }
                keyframe
            }
            DropperState::SendKeyframesCheck => {
                let keyframe = frame_type == FrameType::Keyframe;
                if keyframe && pending == 0 {
                    self.state = DropperState::SendInterframes;
                }
                keyframe
            }
        }
    }

    /// Records that `event` was dropped so dependent frames follow it.
    pub fn drop_packet(&mut self, event: &RtmpEvent) {
        let frame_type = match event {
            RtmpEvent::Video(video) => video.frame_type(),
            _ => return,
        };
        self.state = match (self.state, frame_type) {
            // disposable frames are safe to lose
            (DropperState::SendAll, FrameType::DisposableInterframe) => DropperState::SendAll,
            (DropperState::SendAll, FrameType::Interframe | FrameType::Keyframe) => {
                DropperState::SendKeyframes
            }
            (DropperState::SendInterframes, FrameType::Interframe) => {
                DropperState::SendKeyframesCheck
            }
            (DropperState::SendInterframes, FrameType::Keyframe) => DropperState::SendKeyframes,
            (DropperState::SendKeyframesCheck, FrameType::Keyframe) => DropperState::SendKeyframes,
            (state, _) => state,
        };
    }
}

impl Default for VideoFrameDropper {
    fn default() -> Self {
        Self::new()
    }
}
