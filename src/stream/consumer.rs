// src/stream/consumer.rs - Subscriber output onto a client connection

use crate::rtmp::channel::{OutputStream, CONTROL_CHANNEL};
use crate::rtmp::connection::RtmpConnection;
use crate::rtmp::event::{Ping, RtmpEvent};
use crate::rtmp::status::Status;
use crate::stream::message::{MessageSink, StreamMessage};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Writes a stream's messages on its data, video and audio channels.
///
/// Holds the connection weakly; once the connection is gone every write
/// is dropped.
pub struct ConnectionConsumer {
    connection: Weak<RtmpConnection>,
    stream_id: u32,
    output: OutputStream,
    closed: AtomicBool,
}

impl ConnectionConsumer {
    pub fn new(connection: &Arc<RtmpConnection>, stream_id: u32, output: OutputStream) -> Self {
        Self {
            connection: Arc::downgrade(connection),
            stream_id,
            output,
            closed: AtomicBool::new(false),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    fn connection(&self) -> Option<Arc<RtmpConnection>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.connection.upgrade()
    }
}

impl MessageSink for ConnectionConsumer {
    fn push_message(&self, message: StreamMessage) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let StreamMessage { timestamp, event } = message;
        self.output
            .channel_for(&event)
            .write(self.stream_id, timestamp, event)
    }

    fn push_status(&self, status: Status) {
        if self.closed.load(Ordering::Acquire) {
            debug!("Stream {} dropped status {}", self.stream_id, status.code);
            return;
        }
        self.output.data.send_status(self.stream_id, &status);
    }

    fn push_ping(&self, ping: Ping) {
        if let Some(connection) = self.connection() {
            connection.write_event(CONTROL_CHANNEL, 0, 0, RtmpEvent::Ping(ping));
        }
    }

    fn pending_messages(&self) -> usize {
        self.connection
            .upgrade()
            .map_or(0, |connection| connection.pending_messages())
    }

    fn pending_video_messages(&self) -> usize {
        self.connection.upgrade().map_or(0, |connection| {
            connection.pending_video_messages(self.stream_id)
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.output.close();
        }
    }
}
