// src/stream/message.rs - Stream messages and the subscriber output seam

use crate::rtmp::event::{Ping, RtmpEvent};
use crate::rtmp::status::Status;

/// One timestamped event flowing from a source to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub timestamp: u32,
    pub event: RtmpEvent,
}

impl StreamMessage {
    pub fn new(timestamp: u32, event: RtmpEvent) -> Self {
        Self { timestamp, event }
    }

    pub fn is_video(&self) -> bool {
        matches!(self.event, RtmpEvent::Video(_))
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.event, RtmpEvent::Audio(_))
    }

    /// Audio, video and data notifies; the buffer gate only applies to these.
    pub fn is_stream_data(&self) -> bool {
        self.event.is_stream_data()
    }
}

/// Where a play engine writes to, normally the client's connection.
pub trait MessageSink: Send + Sync {
    /// Writes a media or data message. `false` when it was not accepted.
    fn push_message(&self, message: StreamMessage) -> bool;

    fn push_status(&self, status: Status);

    fn push_ping(&self, ping: Ping);

    /// Messages written but not yet on the wire.
    fn pending_messages(&self) -> usize;

    /// Video messages of this stream written but not yet on the wire.
    fn pending_video_messages(&self) -> usize;

    /// Detaches the sink; later writes are discarded.
    fn close(&self);
}
