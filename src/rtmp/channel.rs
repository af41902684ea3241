// src/rtmp/channel.rs - Logical channels of one connection
//
// Core features:
// - Affine mapping between stream ids and their channel ids
// - Channel handles that write through the owning connection
// - Status objects rendered as `onStatus` invokes or `onPlayStatus` notifies
// - Output stream bundles of data, video and audio channels

use crate::rtmp::connection::RtmpConnection;
use crate::rtmp::event::{Call, Invoke, Notify, RtmpEvent};
use crate::rtmp::status::Status;
use log::debug;
use std::sync::Weak;

/// Control channel for protocol messages such as pings and chunk sizes.
pub const CONTROL_CHANNEL: u32 = 2;
/// Channel carrying connection level invokes and notifies.
pub const INVOKE_CHANNEL: u32 = 3;
/// First channel id available to streams, lower ids are reserved.
pub const FIRST_STREAM_CHANNEL: u32 = 4;

/// First of the three channels (data, video, audio) a stream writes to.
///
/// Stream 0 is the connection itself and talks on the invoke channel.
pub fn channel_for_stream(stream_id: u32) -> u32 {
    if stream_id == 0 {
        INVOKE_CHANNEL
    } else {
        stream_id * 5 - 1
    }
}

/// Stream a channel id belongs to; `0` for the reserved channels.
pub fn stream_for_channel(channel_id: u32) -> u32 {
    if channel_id < FIRST_STREAM_CHANNEL {
        0
    } else {
        (channel_id - FIRST_STREAM_CHANNEL) / 5 + 1
    }
}

/// Handle to one channel. Holds the connection weakly; writes after the
/// connection went away are discarded.
#[derive(Clone)]
pub struct Channel {
    id: u32,
    connection: Weak<RtmpConnection>,
}

impl Channel {
    pub(crate) fn new(id: u32, connection: Weak<RtmpConnection>) -> Self {
        Self { id, connection }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Writes one event on this channel.
    ///
    /// # Returns
    /// `false` when the connection is gone or refused the write.
    pub fn write(&self, stream_id: u32, timestamp: u32, event: RtmpEvent) -> bool {
        match self.connection.upgrade() {
            Some(connection) => connection.write_event(self.id, stream_id, timestamp, event),
            None => {
                debug!("Channel {} dropped a write, connection is gone", self.id);
                false
            }
        }
    }

    /// Sends a status object to the client.
    ///
    /// Play completion statuses go out as an `onPlayStatus` notify, everything
    /// else as an `onStatus` invoke with transaction id 0.
    pub fn send_status(&self, stream_id: u32, status: &Status) -> bool {
        let event = if status.is_play_status() {
            RtmpEvent::Notify(Notify::new("onPlayStatus", vec![status.to_amf0()]))
        } else {
            RtmpEvent::Invoke(Invoke::new(0, Call::new("onStatus", vec![status.to_amf0()])))
        };
        self.write(stream_id, 0, event)
    }

    /// Releases the channel id on the connection.
    pub fn close(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.close_channel(self.id);
        }
    }
}

/// The three channels a stream's output is spread over.
#[derive(Clone)]
pub struct OutputStream {
    pub data: Channel,
    pub video: Channel,
    pub audio: Channel,
}

impl OutputStream {
    /// Picks the channel for an event kind.
    pub fn channel_for(&self, event: &RtmpEvent) -> &Channel {
        match event {
            RtmpEvent::Audio(_) => &self.audio,
            RtmpEvent::Video(_) => &self.video,
            _ => &self.data,
        }
    }

    pub fn close(&self) {
        self.data.close();
        self.video.close();
        self.audio.close();
    }
}
