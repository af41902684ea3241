// src/tests/mod.rs - End to end scenarios over connections, streams and shared objects
//
// Every scenario drives real connections through the command dispatcher with
// a deterministic context: inline executor, manual clock and scheduler.

use crate::config::ServerConfig;
use crate::context::tests::context_parts;
use crate::context::ServerContext;
use crate::rtmp::connection::tests::connection_with;
use crate::rtmp::connection::{ConnectionState, RtmpConnection};
use crate::rtmp::event::{AudioData, Call, Invoke, Notify, Packet, RtmpEvent, VideoData};
use crate::rtmp::status::{self, Status};
use crate::rtmp::transport::QueuedTransport;
use crate::so::event::{EventData, SharedObjectEvent, SharedObjectEventKind, SharedObjectMessage};
use crate::stream::message::StreamMessage;
use crate::stream::provider::DefaultProviderService;
use crate::util::ManualScheduler;
use bytes::Bytes;
use rml_rtmp::rml_amf0::Amf0Value;
use std::collections::HashMap;
use std::sync::Arc;

struct Harness {
    context: Arc<ServerContext>,
    scheduler: Arc<ManualScheduler>,
    providers: Arc<DefaultProviderService>,
}

impl Harness {
    fn new(config: ServerConfig) -> Self {
        let (context, scheduler) = context_parts(config);
        let providers = Arc::new(DefaultProviderService::default());
        Self {
            context: Arc::new(context.set_providers(providers.clone())),
            scheduler,
            providers,
        }
    }

    /// A client that completed the handshake and connected to `live`.
    fn client(&self) -> Client {
        let (connection, transport) = connection_with(&self.context);
        let mut properties = HashMap::new();
        properties.insert("app".to_string(), Amf0Value::Utf8String("live".into()));
        let mut invoke = Invoke::new(1, Call::new("connect", vec![]));
        invoke.command_object = Amf0Value::Object(properties);
        connection.message_received(Packet::new(3, 0, 0, RtmpEvent::Invoke(invoke)));
        assert!(connection.is_connected());
        transport.drain();
        Client {
            connection,
            transport,
            transaction_id: 1,
        }
    }
}

struct Client {
    connection: Arc<RtmpConnection>,
    transport: Arc<QueuedTransport>,
    transaction_id: u32,
}

impl Client {
    fn command(&mut self, stream_id: u32, method: &str, args: Vec<Amf0Value>) {
        self.transaction_id += 1;
        let channel = if stream_id == 0 { 3 } else { stream_id * 5 - 1 };
        self.connection.message_received(Packet::new(
            channel,
            stream_id,
            0,
            RtmpEvent::Invoke(Invoke::new(self.transaction_id, Call::new(method, args))),
        ));
    }

    fn create_stream(&mut self) -> u32 {
        self.command(0, "createStream", vec![]);
        let reply = self
            .transport
            .drain()
            .into_iter()
            .find_map(|packet| match packet.event {
                RtmpEvent::Invoke(invoke) if invoke.call.method == "_result" => {
                    invoke.call.args.first().cloned()
                }
                _ => None,
            });
        match reply {
            Some(Amf0Value::Number(id)) => id as u32,
            other => panic!("createStream answered {other:?}"),
        }
    }

    fn send(&self, stream_id: u32, timestamp: u32, event: RtmpEvent) {
        self.connection
            .message_received(Packet::new(stream_id * 5, stream_id, timestamp, event));
    }

    fn statuses(&self) -> Vec<String> {
        status_codes(&self.transport.drain())
    }
}

fn status_codes(packets: &[Packet]) -> Vec<String> {
    packets
        .iter()
        .filter_map(|packet| match &packet.event {
            RtmpEvent::Invoke(Invoke { call, .. }) | RtmpEvent::Notify(Notify { call })
                if call.method == "onStatus" || call.method == "onPlayStatus" =>
            {
                call.args.first().and_then(Status::code_of).map(str::to_string)
            }
            _ => None,
        })
        .collect()
}

fn video(first: u8, second: u8) -> RtmpEvent {
    RtmpEvent::Video(VideoData::new(Bytes::from(vec![first, second, 0, 0, 0, 0xaa])))
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_live_only_play_without_publisher_fails_at_once() {
    let harness = Harness::new(ServerConfig::default().set_ping_interval(0));
    let mut viewer = harness.client();
    let stream_id = viewer.create_stream();
    viewer.command(
        stream_id,
        "play",
        vec![
            Amf0Value::Utf8String("cam1".into()),
            Amf0Value::Number(-1.0),
        ],
    );

    assert_eq!(viewer.statuses(), vec![status::NS_PLAY_STREAMNOTFOUND]);
    // nothing left waiting for a publisher
    assert_eq!(harness.scheduler.pending_jobs(), 0);
    harness.scheduler.advance(60_000);
    assert!(viewer.statuses().is_empty());
    viewer.connection.close();
}

#[test]
fn test_late_joiner_gets_keyframe_before_interframes() {
    let _ = env_logger::builder().is_test(true).try_init();
    let harness = Harness::new(ServerConfig::default().set_ping_interval(0));
    let mut publisher = harness.client();
    let mut viewer = harness.client();

    let publish_id = publisher.create_stream();
    publisher.command(
        publish_id,
        "publish",
        vec![
            Amf0Value::Utf8String("cam1".into()),
            Amf0Value::Utf8String("live".into()),
        ],
    );
    assert_eq!(publisher.statuses(), vec![status::NS_PUBLISH_START]);
    publisher.send(publish_id, 100, video(0x17, 0x00));
    publisher.send(publish_id, 100, video(0x17, 0x01));

    let play_id = viewer.create_stream();
    viewer.command(
        play_id,
        "play",
        vec![
            Amf0Value::Utf8String("cam1".into()),
            Amf0Value::Number(-1.0),
        ],
    );
    publisher.send(publish_id, 110, video(0x27, 0x01));
    publisher.send(publish_id, 120, video(0x27, 0x01));

    let frames: Vec<(u8, u8)> = viewer
        .transport
        .drain()
        .into_iter()
        .filter_map(|packet| match packet.event {
            RtmpEvent::Video(video) => Some((video.data[0], video.data[1])),
            _ => None,
        })
        .collect();
    assert_eq!(
        frames,
        vec![(0x17, 0x00), (0x17, 0x01), (0x27, 0x01), (0x27, 0x01)]
    );
    publisher.connection.close();
    viewer.connection.close();
}

#[test]
fn test_single_frame_play_starts_with_first_video() {
    let harness = Harness::new(ServerConfig::default().set_ping_interval(0));
    let mut recording = vec![
        StreamMessage::new(0, RtmpEvent::Audio(AudioData::new(Bytes::from_static(&[0xaf, 0, 0x12])))),
        StreamMessage::new(0, RtmpEvent::Notify(Notify::new("onCuePoint", vec![]))),
        StreamMessage::new(5, RtmpEvent::Audio(AudioData::new(Bytes::from_static(&[0xaf, 1, 1])))),
    ];
    for index in 0..7u32 {
        let first = if index == 0 { 0x17 } else { 0x27 };
        recording.push(StreamMessage::new(
            10 + index * 40,
            RtmpEvent::Video(VideoData::new(Bytes::from(vec![first, 1, 0, 0, 0]))),
        ));
    }
    assert_eq!(recording.len(), 10);
    harness.providers.register_vod("live", "clip", recording);

    let mut viewer = harness.client();
    let stream_id = viewer.create_stream();
    viewer.command(
        stream_id,
        "play",
        vec![
            Amf0Value::Utf8String("clip".into()),
            Amf0Value::Number(0.0),
            Amf0Value::Number(0.0),
        ],
    );
    let codes = viewer.statuses();
    assert!(codes.contains(&status::NS_PLAY_START.to_string()));

    harness.scheduler.advance(harness.context.config.playback.pull_interval);
    let media: Vec<Packet> = viewer
        .transport
        .drain()
        .into_iter()
        .filter(|packet| packet.event.is_stream_data())
        .collect();
    match media.first().map(|packet| &packet.event) {
        Some(RtmpEvent::Video(video)) => assert_eq!(video.data[0], 0x17),
        other => panic!("first message was {other:?}"),
    }
    assert_eq!(media[0].header.timestamp, 10);
    viewer.connection.close();
}

fn shared_object_packet(name: &str, events: Vec<SharedObjectEvent>) -> RtmpEvent {
    RtmpEvent::SharedObject(SharedObjectMessage {
        name: name.to_string(),
        version: 0,
        persistent: false,
        events,
    })
}

fn shared_object_messages(transport: &QueuedTransport) -> Vec<SharedObjectMessage> {
    transport
        .drain()
        .into_iter()
        .filter_map(|packet| match packet.event {
            RtmpEvent::SharedObject(message) => Some(message),
            _ => None,
        })
        .collect()
}

#[test]
fn test_shared_object_batch_reaches_other_listener_once() {
    let harness = Harness::new(ServerConfig::default().set_ping_interval(0));
    let first = harness.client();
    let second = harness.client();
    let join = || {
        shared_object_packet(
            "state",
            vec![SharedObjectEvent::new(
                SharedObjectEventKind::ServerConnect,
                None,
                EventData::Empty,
            )],
        )
    };
    first.send(0, 0, join());
    second.send(0, 0, join());
    shared_object_messages(&first.transport);
    shared_object_messages(&second.transport);
    let object = harness.context.shared_objects.get("live", "state").unwrap();
    let version = object.version();

    let updates = ["a", "b", "c"]
        .iter()
        .enumerate()
        .map(|(index, key)| {
            SharedObjectEvent::new(
                SharedObjectEventKind::ServerSetAttribute,
                Some(key.to_string()),
                EventData::Value(Amf0Value::Number(index as f64)),
            )
        })
        .collect();
    first.send(0, 0, shared_object_packet("state", updates));

    assert_eq!(object.version(), version + 1);
    let to_second = shared_object_messages(&second.transport);
    assert_eq!(to_second.len(), 1);
    assert!(to_second[0]
        .kinds()
        .iter()
        .all(|kind| *kind == SharedObjectEventKind::ClientUpdateData));
    let keys: Vec<&str> = to_second[0]
        .events
        .iter()
        .filter_map(|event| event.key.as_deref())
        .collect();
    assert_eq!(keys, vec!["a", "b", "c"]);

    let to_first = shared_object_messages(&first.transport);
    assert_eq!(to_first.len(), 1);
    assert!(to_first[0]
        .kinds()
        .iter()
        .all(|kind| *kind == SharedObjectEventKind::ClientUpdateAttribute));

    first.connection.close();
    second.connection.close();
}

#[test]
fn test_silent_client_is_closed_by_keep_alive() {
    let harness = Harness::new(ServerConfig::default());
    let client = harness.client();
    assert_eq!(harness.context.clock.now_millis(), 1000);

    harness.scheduler.advance(66_000);
    assert_eq!(client.connection.state(), ConnectionState::Connected);
    let pings = client
        .transport
        .drain()
        .into_iter()
        .filter(|packet| matches!(packet.event, RtmpEvent::Ping(_)))
        .count();
    assert!(pings > 0);

    harness.scheduler.advance(1_000);
    assert_eq!(client.connection.state(), ConnectionState::Disconnected);
    assert!(harness.context.manager.is_empty());
    assert_eq!(harness.scheduler.pending_jobs(), 0);
}
