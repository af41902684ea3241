// src/rtmp/event.rs - RTMP message model
//
// One tagged union over every message kind the core understands. The chunk
// layer below decodes bytes into these; everything above matches on them.

use crate::so::event::SharedObjectMessage;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use rml_rtmp::rml_amf0::Amf0Value;
use std::collections::HashMap;

// ============================================================================
// Data Types
// ============================================================================

/// RTMP message type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    ChunkSize,
    Abort,
    BytesRead,
    Ping,
    ServerBandwidth,
    ClientBandwidth,
    Audio,
    Video,
    FlexStreamSend,
    FlexSharedObject,
    FlexMessage,
    Notify,
    SharedObject,
    Invoke,
    Aggregate,
    Unknown(u8),
}

impl DataType {
    pub fn from_u8(value: u8) -> DataType {
        match value {
            1 => DataType::ChunkSize,
            2 => DataType::Abort,
            3 => DataType::BytesRead,
            4 => DataType::Ping,
            5 => DataType::ServerBandwidth,
            6 => DataType::ClientBandwidth,
            8 => DataType::Audio,
            9 => DataType::Video,
            15 => DataType::FlexStreamSend,
            16 => DataType::FlexSharedObject,
            17 => DataType::FlexMessage,
            18 => DataType::Notify,
            19 => DataType::SharedObject,
            20 => DataType::Invoke,
            22 => DataType::Aggregate,
            other => DataType::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            DataType::ChunkSize => 1,
            DataType::Abort => 2,
            DataType::BytesRead => 3,
            DataType::Ping => 4,
            DataType::ServerBandwidth => 5,
            DataType::ClientBandwidth => 6,
            DataType::Audio => 8,
            DataType::Video => 9,
            DataType::FlexStreamSend => 15,
            DataType::FlexSharedObject => 16,
            DataType::FlexMessage => 17,
            DataType::Notify => 18,
            DataType::SharedObject => 19,
            DataType::Invoke => 20,
            DataType::Aggregate => 22,
            DataType::Unknown(value) => *value,
        }
    }
}

/// Where a media message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceType {
    #[default]
    Unknown,
    Live,
    Vod,
}

// ============================================================================
// Media
// ============================================================================

/// FLV video frame type, high nibble of the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Keyframe,
    Interframe,
    DisposableInterframe,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    pub data: Bytes,
    pub source_type: SourceType,
}

impl AudioData {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            source_type: SourceType::Unknown,
        }
    }

    /// Zero length packet used to reset a client's audio pipeline.
    pub fn blank() -> Self {
        Self::new(Bytes::new())
    }

    /// Sound format id, high nibble of the first byte.
    pub fn codec_id(&self) -> Option<u8> {
        self.data.first().map(|b| b >> 4)
    }

    /// AAC sequence header (AudioSpecificConfig).
    pub fn is_config(&self) -> bool {
        self.codec_id() == Some(10) && self.data.get(1) == Some(&0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoData {
    pub data: Bytes,
    pub source_type: SourceType,
}

impl VideoData {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            source_type: SourceType::Unknown,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self.data.first().map(|b| b >> 4) {
            Some(1) => FrameType::Keyframe,
            Some(2) => FrameType::Interframe,
            Some(3) => FrameType::DisposableInterframe,
            _ => FrameType::Unknown,
        }
    }

    /// Codec id, low nibble of the first byte.
    pub fn codec_id(&self) -> Option<u8> {
        self.data.first().map(|b| b & 0x0f)
    }

    /// AVC sequence header (decoder configuration record).
    pub fn is_config(&self) -> bool {
        self.codec_id() == Some(7) && self.data.get(1) == Some(&0)
    }
}

/// Several FLV tags packed into one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub data: Bytes,
}

/// One FLV tag taken out of an [`Aggregate`].
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatePart {
    pub data_type: DataType,
    pub timestamp: u32,
    pub data: Bytes,
}

const FLV_TAG_HEADER_SIZE: usize = 11;
const FLV_BACK_POINTER_SIZE: usize = 4;

impl Aggregate {
    /// Splits the payload into its FLV tags.
    ///
    /// Stops at the first truncated tag. Timestamps are rebased so the first
    /// tag lands on `base_timestamp`.
    pub fn parts(&self, base_timestamp: u32) -> Vec<AggregatePart> {
        let mut parts = Vec::new();
        let mut offset = 0usize;
        let mut first_timestamp: Option<u32> = None;
        while offset + FLV_TAG_HEADER_SIZE <= self.data.len() {
            let header = &self.data[offset..offset + FLV_TAG_HEADER_SIZE];
            let data_type = DataType::from_u8(header[0]);
            let size = BigEndian::read_u24(&header[1..4]) as usize;
            // 24 bit timestamp plus an extension byte holding bits 24-31
            let timestamp = BigEndian::read_u24(&header[4..7]) | ((header[7] as u32) << 24);
            let start = offset + FLV_TAG_HEADER_SIZE;
            let end = start + size;
            if end > self.data.len() {
                break;
            }
            let first = *first_timestamp.get_or_insert(timestamp);
            parts.push(AggregatePart {
                data_type,
                timestamp: base_timestamp.wrapping_add(timestamp.wrapping_sub(first)),
                data: self.data.slice(start..end),
            });
            offset = end + FLV_BACK_POINTER_SIZE;
        }
        parts
    }
}

// ============================================================================
// Calls
// ============================================================================

/// Outcome of a service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Pending,
    SuccessResult,
    SuccessNull,
    SuccessVoid,
    ServiceNotFound,
    MethodNotFound,
    AccessDenied,
    InvocationException,
    GeneralException,
    AppShuttingDown,
    NotConnected,
}

impl CallStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            CallStatus::SuccessResult | CallStatus::SuccessNull | CallStatus::SuccessVoid
        )
    }
}

/// A remote method call, as carried by invoke and notify messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub service_name: Option<String>,
    pub method: String,
    pub args: Vec<Amf0Value>,
    pub status: CallStatus,
    pub result: Option<Amf0Value>,
}

impl Call {
    pub fn new(method: impl Into<String>, args: Vec<Amf0Value>) -> Self {
        Self {
            service_name: None,
            method: method.into(),
            args,
            status: CallStatus::Pending,
            result: None,
        }
    }

    /// Splits `service.method` at the last dot.
    pub fn from_action(action: &str, args: Vec<Amf0Value>) -> Self {
        match action.rfind('.') {
            Some(dot) => Self {
                service_name: Some(action[..dot].to_string()),
                ..Self::new(&action[dot + 1..], args)
            },
            None => Self::new(action, args),
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Amf0Value> {
        self.args.get(index)
    }

    pub fn arg_str(&self, index: usize) -> Option<&str> {
        match self.args.get(index) {
            Some(Amf0Value::Utf8String(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn arg_f64(&self, index: usize) -> Option<f64> {
        match self.args.get(index) {
            Some(Amf0Value::Number(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn arg_bool(&self, index: usize) -> Option<bool> {
        match self.args.get(index) {
            Some(Amf0Value::Boolean(value)) => Some(*value),
            Some(Amf0Value::Number(value)) => Some(*value != 0.0),
            _ => None,
        }
    }
}

/// Request expecting a reply, matched by transaction id.
#[derive(Debug, Clone, PartialEq)]
pub struct Invoke {
    pub transaction_id: u32,
    pub command_object: Amf0Value,
    pub call: Call,
}

impl Invoke {
    pub fn new(transaction_id: u32, call: Call) -> Self {
        Self {
            transaction_id,
            command_object: Amf0Value::Null,
            call,
        }
    }
}

/// Fire and forget call, transaction id 0. Also carries stream data such as
/// `onMetaData`.
#[derive(Debug, Clone, PartialEq)]
pub struct Notify {
    pub call: Call,
}

const STREAM_DATA_HANDLERS: &[&str] = &[
    "onMetaData",
    "@setDataFrame",
    "@clearDataFrame",
    "onCuePoint",
    "onTextData",
    "onCaption",
    "onFI",
    "|RtmpSampleAccess",
];

impl Notify {
    pub fn new(method: impl Into<String>, args: Vec<Amf0Value>) -> Self {
        Self {
            call: Call::new(method, args),
        }
    }

    /// Whether this notify is stream payload rather than a command.
    pub fn is_stream_data(&self) -> bool {
        STREAM_DATA_HANDLERS.contains(&self.call.method.as_str())
    }

    /// The metadata object of an `onMetaData` or `@setDataFrame` notify.
    pub fn metadata(&self) -> Option<&HashMap<String, Amf0Value>> {
        match self.call.method.as_str() {
            "onMetaData" | "@setDataFrame" => self.call.args.iter().find_map(|arg| match arg {
                Amf0Value::Object(properties) => Some(properties),
                _ => None,
            }),
            _ => None,
        }
    }

    /// `@setDataFrame` wraps `onMetaData`; subscribers only ever see the latter.
    pub fn as_metadata_notify(&self) -> Option<Notify> {
        self.metadata()
            .map(|properties| Notify::new("onMetaData", vec![Amf0Value::Object(properties.clone())]))
    }
}

// ============================================================================
// Control
// ============================================================================

/// User control event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingType {
    StreamBegin,
    StreamPlayBufferClear,
    StreamDry,
    ClientBuffer,
    RecordedStream,
    PingClient,
    PongServer,
    BufferEmpty,
    BufferFull,
    Other(u16),
}

impl PingType {
    pub fn from_u16(value: u16) -> PingType {
        match value {
            0 => PingType::StreamBegin,
            1 => PingType::StreamPlayBufferClear,
            2 => PingType::StreamDry,
            3 => PingType::ClientBuffer,
            4 => PingType::RecordedStream,
            6 => PingType::PingClient,
            7 => PingType::PongServer,
            31 => PingType::BufferEmpty,
            32 => PingType::BufferFull,
            other => PingType::Other(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            PingType::StreamBegin => 0,
            PingType::StreamPlayBufferClear => 1,
            PingType::StreamDry => 2,
            PingType::ClientBuffer => 3,
            PingType::RecordedStream => 4,
            PingType::PingClient => 6,
            PingType::PongServer => 7,
            PingType::BufferEmpty => 31,
            PingType::BufferFull => 32,
            PingType::Other(value) => *value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub ping_type: PingType,
    pub value2: u32,
    pub value3: Option<u32>,
}

impl Ping {
    pub fn new(ping_type: PingType, value2: u32) -> Self {
        Self {
            ping_type,
            value2,
            value3: None,
        }
    }

    pub fn with_value3(ping_type: PingType, value2: u32, value3: u32) -> Self {
        Self {
            ping_type,
            value2,
            value3: Some(value3),
        }
    }
}

// ============================================================================
// Event Union
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RtmpEvent {
    Audio(AudioData),
    Video(VideoData),
    Aggregate(Aggregate),
    Notify(Notify),
    Invoke(Invoke),
    FlexMessage(Invoke),
    FlexStreamSend(Notify),
    Ping(Ping),
    SharedObject(SharedObjectMessage),
    FlexSharedObject(SharedObjectMessage),
    ChunkSize(u32),
    ClientBandwidth { window: u32, limit_type: u8 },
    ServerBandwidth(u32),
    BytesRead(u32),
    Unknown { data_type: u8, data: Bytes },
}

impl RtmpEvent {
    pub fn data_type(&self) -> DataType {
        match self {
            RtmpEvent::Audio(_) => DataType::Audio,
            RtmpEvent::Video(_) => DataType::Video,
            RtmpEvent::Aggregate(_) => DataType::Aggregate,
            RtmpEvent::Notify(_) => DataType::Notify,
            RtmpEvent::Invoke(_) => DataType::Invoke,
            RtmpEvent::FlexMessage(_) => DataType::FlexMessage,
            RtmpEvent::FlexStreamSend(_) => DataType::FlexStreamSend,
            RtmpEvent::Ping(_) => DataType::Ping,
            RtmpEvent::SharedObject(_) => DataType::SharedObject,
            RtmpEvent::FlexSharedObject(_) => DataType::FlexSharedObject,
            RtmpEvent::ChunkSize(_) => DataType::ChunkSize,
            RtmpEvent::ClientBandwidth { .. } => DataType::ClientBandwidth,
            RtmpEvent::ServerBandwidth(_) => DataType::ServerBandwidth,
            RtmpEvent::BytesRead(_) => DataType::BytesRead,
            RtmpEvent::Unknown { data_type, .. } => DataType::from_u8(*data_type),
        }
    }

    /// Payload size for media, zero for messages the codec layer sizes itself.
    pub fn payload_len(&self) -> usize {
        match self {
            RtmpEvent::Audio(audio) => audio.data.len(),
            RtmpEvent::Video(video) => video.data.len(),
            RtmpEvent::Aggregate(aggregate) => aggregate.data.len(),
            RtmpEvent::Unknown { data, .. } => data.len(),
            _ => 0,
        }
    }

    /// Audio, video, aggregate and stream data notifies.
    pub fn is_stream_data(&self) -> bool {
        match self {
            RtmpEvent::Audio(_) | RtmpEvent::Video(_) | RtmpEvent::Aggregate(_) => true,
            RtmpEvent::Notify(notify) | RtmpEvent::FlexStreamSend(notify) => notify.is_stream_data(),
            _ => false,
        }
    }

    pub fn set_source_type(&mut self, source_type: SourceType) {
        match self {
            RtmpEvent::Audio(audio) => audio.source_type = source_type,
            RtmpEvent::Video(video) => video.source_type = source_type,
            _ => {}
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(self, RtmpEvent::Video(video) if video.frame_type() == FrameType::Keyframe)
    }
}

/// Chunk header fields the core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub channel_id: u32,
    pub stream_id: u32,
    pub timestamp: u32,
    pub data_type: DataType,
    pub size: u32,
}

/// A decoded message together with its header.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub event: RtmpEvent,
}

impl Packet {
    pub fn new(channel_id: u32, stream_id: u32, timestamp: u32, event: RtmpEvent) -> Self {
        let header = Header {
            channel_id,
            stream_id,
            timestamp,
            data_type: event.data_type(),
            size: event.payload_len() as u32,
        };
        Self { header, event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_ids() {
        for id in [1u8, 2, 3, 4, 5, 6, 8, 9, 15, 16, 17, 18, 19, 20, 22] {
            assert!(!matches!(DataType::from_u8(id), DataType::Unknown(_)));
            assert_eq!(DataType::from_u8(id).as_u8(), id);
        }
        assert_eq!(DataType::from_u8(7), DataType::Unknown(7));
    }

    #[test]
    fn test_video_frame_type() {
        let key = VideoData::new(Bytes::from_static(&[0x17, 0x01, 0, 0, 0]));
        let inter = VideoData::new(Bytes::from_static(&[0x27, 0x01, 0, 0, 0]));
        let disposable = VideoData::new(Bytes::from_static(&[0x32, 0x00]));
        let config = VideoData::new(Bytes::from_static(&[0x17, 0x00, 0, 0, 0]));
        assert_eq!(key.frame_type(), FrameType::Keyframe);
        assert_eq!(inter.frame_type(), FrameType::Interframe);
        assert_eq!(disposable.frame_type(), FrameType::DisposableInterframe);
        assert_eq!(VideoData::new(Bytes::new()).frame_type(), FrameType::Unknown);
        assert!(config.is_config());
        assert!(!key.is_config());
        assert_eq!(disposable.codec_id(), Some(2));
    }

    #[test]
    fn test_audio_config_detection() {
        let config = AudioData::new(Bytes::from_static(&[0xaf, 0x00, 0x12, 0x10]));
        let raw = AudioData::new(Bytes::from_static(&[0xaf, 0x01, 0x21]));
        let mp3 = AudioData::new(Bytes::from_static(&[0x2f, 0x00]));
        assert!(config.is_config());
        assert!(!raw.is_config());
        assert!(!mp3.is_config());
        assert_eq!(mp3.codec_id(), Some(2));
    }

    #[test]
    fn test_call_from_action() {
        let call = Call::from_action("chat.sendMessage", vec![]);
        assert_eq!(call.service_name.as_deref(), Some("chat"));
        assert_eq!(call.method, "sendMessage");
        let call = Call::from_action("publish", vec![Amf0Value::Utf8String("cam1".into())]);
        assert!(call.service_name.is_none());
        assert_eq!(call.arg_str(0), Some("cam1"));
    }

    #[test]
    fn test_set_data_frame_unwraps_metadata() {
        let mut properties = HashMap::new();
        properties.insert("width".to_string(), Amf0Value::Number(640.0));
        let notify = Notify::new(
            "@setDataFrame",
            vec![Amf0Value::Utf8String("onMetaData".into()), Amf0Value::Object(properties)],
        );
        assert!(notify.is_stream_data());
        let unwrapped = notify.as_metadata_notify().unwrap();
        assert_eq!(unwrapped.call.method, "onMetaData");
        assert_eq!(
            unwrapped.metadata().and_then(|m| m.get("width")),
            Some(&Amf0Value::Number(640.0))
        );
        assert!(!Notify::new("chat", vec![]).is_stream_data());
    }

    #[test]
    fn test_aggregate_parts() {
        fn tag(data_type: u8, ts: u32, payload: &[u8]) -> Vec<u8> {
            let mut out = vec![data_type];
            let size = payload.len() as u32;
            out.extend_from_slice(&size.to_be_bytes()[1..]);
            out.extend_from_slice(&(ts & 0xffffff).to_be_bytes()[1..]);
            out.push((ts >> 24) as u8);
            out.extend_from_slice(&[0, 0, 0]);
            out.extend_from_slice(payload);
            out.extend_from_slice(&(11 + size).to_be_bytes());
            out
        }
        let mut data = tag(9, 1000, &[0x17, 0x01]);
        data.extend(tag(8, 1020, &[0xaf, 0x01, 0x00]));
        // truncated trailing tag is ignored
        data.extend_from_slice(&[9, 0, 0, 50]);
        let aggregate = Aggregate { data: Bytes::from(data) };

        let parts = aggregate.parts(500);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].data_type, DataType::Video);
        assert_eq!(parts[0].timestamp, 500);
        assert_eq!(parts[0].data.as_ref(), &[0x17, 0x01]);
        assert_eq!(parts[1].data_type, DataType::Audio);
        assert_eq!(parts[1].timestamp, 520);
    }

    #[test]
    fn test_ping_types() {
        for id in [0u16, 1, 2, 3, 4, 6, 7, 31, 32] {
            assert_eq!(PingType::from_u16(id).as_u16(), id);
        }
        assert_eq!(PingType::from_u16(99), PingType::Other(99));
    }
}
