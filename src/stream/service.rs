// src/stream/service.rs - NetStream commands on a connection's streams
//
// Core features:
// - Stream id reservation through createStream/deleteStream
// - Subscriber streams built lazily on the first play
// - Publish with live, record and append modes
// - Failure statuses for requests that cannot be served

use crate::error::{Error, Result};
use crate::rtmp::connection::RtmpConnection;
use crate::rtmp::status::{self, Status};
use crate::stream::broadcast::{ClientBroadcastStream, PublishMode};
use crate::stream::consumer::ConnectionConsumer;
use crate::stream::engine::{PlayEngine, PlayEngineConfig, PlayEngineContext};
use crate::stream::message::MessageSink;
use crate::stream::play_item::PlayItem;
use crate::stream::playlist::PlaylistSubscriberStream;
use crate::stream::state::{StreamState, StreamStateHolder};
use log::{debug, info};
use std::sync::Arc;

/// A stream a client created on its connection.
#[derive(Clone)]
pub enum ClientStream {
    Subscriber(Arc<PlaylistSubscriberStream>),
    Broadcast(Arc<ClientBroadcastStream>),
}

impl ClientStream {
    pub fn stream_id(&self) -> u32 {
        match self {
            ClientStream::Subscriber(stream) => stream.stream_id(),
            ClientStream::Broadcast(stream) => stream.stream_id(),
        }
    }

    pub fn state(&self) -> StreamState {
        match self {
            ClientStream::Subscriber(stream) => stream.state(),
            ClientStream::Broadcast(stream) => stream.state(),
        }
    }

    pub fn close(&self) {
        match self {
            ClientStream::Subscriber(stream) => stream.close(),
            ClientStream::Broadcast(stream) => stream.close(),
        }
    }

    /// Client buffer length; publishers have no use for it.
    pub fn set_buffer_duration(&self, duration: u32) {
        if let ClientStream::Subscriber(stream) = self {
            stream.set_buffer_duration(duration);
        }
    }
}

/// Stateless command layer; all state lives on the connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamService;

impl StreamService {
    pub fn new() -> Self {
        Self
    }

    pub fn create_stream(&self, connection: &RtmpConnection) -> Result<u32> {
        let stream_id = connection.reserve_stream_id()?;
        debug!("Connection {} created stream {}", connection.session_id(), stream_id);
        Ok(stream_id)
    }

    /// Closes the stream and frees its id.
    pub fn delete_stream(&self, connection: &RtmpConnection, stream_id: u32) {
        if !connection.unreserve_stream_id(stream_id) {
            debug!(
                "Connection {} deleted unknown stream {}",
                connection.session_id(),
                stream_id
            );
        }
    }

    /// Closes the stream but keeps its id reserved for a later play or publish.
    pub fn close_stream(&self, connection: &RtmpConnection, stream_id: u32) {
        if let Some(stream) = connection.remove_stream(stream_id) {
            stream.close();
            debug!("Connection {} closed stream {}", connection.session_id(), stream_id);
        }
    }

    /// Stops publishing `name` on any stream of this connection.
    pub fn release_stream(&self, connection: &RtmpConnection, name: &str) {
        for stream in connection.streams() {
            if let ClientStream::Broadcast(broadcast) = stream {
                if broadcast.published_name().as_deref() == Some(name) {
                    broadcast.unpublish();
                }
            }
        }
    }

    /// Closes every stream of the connection.
    pub fn close_all(&self, connection: &RtmpConnection) {
        for stream in connection.streams() {
            connection.remove_stream(stream.stream_id());
            stream.close();
        }
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    fn create_subscriber(
        &self,
        connection: &Arc<RtmpConnection>,
        stream_id: u32,
    ) -> Result<Arc<PlaylistSubscriberStream>> {
        let output = connection
            .create_output_stream(stream_id)
            .ok_or(Error::NotConnected)?;
        let sink: Arc<dyn MessageSink> =
            Arc::new(ConnectionConsumer::new(connection, stream_id, output));
        let context = connection.context();
        let engine = PlayEngine::new(
            PlayEngineConfig {
                stream_id,
                scope: connection.scope_name(),
                playback: context.config.playback.clone(),
            },
            sink,
            PlayEngineContext {
                providers: context.providers.clone(),
                scheduler: context.scheduler.clone(),
                clock: context.clock.clone(),
            },
            Arc::new(StreamStateHolder::new()),
        );
        let subscriber = PlaylistSubscriberStream::new(engine);
        if let Some(duration) = connection.take_stream_buffer(stream_id) {
            subscriber.set_buffer_duration(duration);
        }
        subscriber.start()?;
        if !connection.register_stream(ClientStream::Subscriber(subscriber.clone())) {
            subscriber.close();
            return Err(Error::InvalidStreamId(stream_id));
        }
        Ok(subscriber)
    }

    fn subscriber(
        &self,
        connection: &RtmpConnection,
        stream_id: u32,
    ) -> Result<Arc<PlaylistSubscriberStream>> {
        match connection.stream(stream_id) {
            Some(ClientStream::Subscriber(stream)) => Ok(stream),
            _ => Err(Error::InvalidStreamId(stream_id)),
        }
    }

    /// Plays `name` on `stream_id`.
    ///
    /// # Arguments
    /// * `start` - seconds; `-2` live then recorded, `-1` live only
    /// * `length` - seconds, negative for everything
    /// * `reset` - replace the playlist instead of appending to it
    pub fn play(
        &self,
        connection: &Arc<RtmpConnection>,
        stream_id: u32,
        name: &str,
        start: f64,
        length: f64,
        reset: bool,
    ) -> Result<()> {
        let fail = |description: String| {
            connection.send_status(
                stream_id,
                &Status::new(status::NS_PLAY_FAILED)
                    .set_description(description)
                    .set_details(name)
                    .set_client_id(stream_id),
            );
        };
        if !connection.is_valid_stream_id(stream_id) {
            fail(format!("Stream {stream_id} was not created."));
            return Err(Error::InvalidStreamId(stream_id));
        }
        let subscriber = match connection.stream(stream_id) {
            Some(ClientStream::Subscriber(stream)) => stream,
            Some(ClientStream::Broadcast(stream)) => {
                fail(format!("Stream {stream_id} is publishing."));
                return Err(Error::IllegalState {
                    operation: "play",
                    state: stream.state(),
                });
            }
            None => self.create_subscriber(connection, stream_id)?,
        };

        let item = PlayItem::from_client(name, start, length);
        info!(
            "Connection {} plays {} on stream {} (start {}, reset {})",
            connection.session_id(),
            name,
            stream_id,
            item.start,
            reset
        );
        if reset {
            subscriber.remove_all_items();
            if matches!(subscriber.state(), StreamState::Playing | StreamState::Paused) {
                subscriber.stop()?;
            }
            subscriber.add_item(item);
            subscriber.play()
        } else {
            let index = subscriber.item_count();
            subscriber.add_item(item);
            match subscriber.state() {
                StreamState::Playing | StreamState::Paused => Ok(()),
                _ => subscriber.set_item(index),
            }
        }
    }

    pub fn stop(&self, connection: &RtmpConnection, stream_id: u32) -> Result<()> {
        self.subscriber(connection, stream_id)?.stop()
    }

    /// Pauses or resumes; without an explicit flag the current state is toggled.
    pub fn pause(
        &self,
        connection: &RtmpConnection,
        stream_id: u32,
        pause: Option<bool>,
        position: u32,
    ) -> Result<()> {
        let subscriber = self.subscriber(connection, stream_id)?;
        let pause = pause.unwrap_or(subscriber.state() != StreamState::Paused);
        if pause {
            subscriber.pause(position)
        } else {
            subscriber.resume(position)
        }
    }

    /// Seeks, telling the client with `NetStream.Seek.Failed` when it cannot.
    pub fn seek(&self, connection: &RtmpConnection, stream_id: u32, position: u32) -> Result<()> {
        let result = self
            .subscriber(connection, stream_id)
            .and_then(|subscriber| subscriber.seek(position));
        if let Err(e) = &result {
            connection.send_status(
                stream_id,
                &Status::new(status::NS_SEEK_FAILED)
                    .set_description(e.to_string())
                    .set_client_id(stream_id),
            );
        }
        result
    }

    pub fn receive_audio(&self, connection: &RtmpConnection, stream_id: u32, receive: bool) {
        match self.subscriber(connection, stream_id) {
            Ok(subscriber) => {
                subscriber.receive_audio(receive);
            }
            Err(e) => debug!("receiveAudio: {e}"),
        }
    }

    pub fn receive_video(&self, connection: &RtmpConnection, stream_id: u32, receive: bool) {
        match self.subscriber(connection, stream_id) {
            Ok(subscriber) => {
                subscriber.receive_video(receive);
            }
            Err(e) => debug!("receiveVideo: {e}"),
        }
    }

    // ========================================================================
    // Publishers
    // ========================================================================

    /// Publishes `name` on `stream_id`, creating the broadcast stream on first use.
    pub fn publish(
        &self,
        connection: &Arc<RtmpConnection>,
        stream_id: u32,
        name: &str,
        mode: PublishMode,
    ) -> Result<()> {
        let bad_name = |description: String| {
            connection.send_status(
                stream_id,
                &Status::new(status::NS_PUBLISH_BADNAME)
                    .set_description(description)
                    .set_details(name)
                    .set_client_id(stream_id),
            );
        };
        if !connection.is_valid_stream_id(stream_id) {
            bad_name(format!("Stream {stream_id} was not created."));
            return Err(Error::InvalidStreamId(stream_id));
        }
        let broadcast = match connection.stream(stream_id) {
            Some(ClientStream::Broadcast(stream)) => stream,
            Some(ClientStream::Subscriber(stream)) => {
                bad_name(format!("Stream {stream_id} is playing."));
                return Err(Error::IllegalState {
                    operation: "publish",
                    state: stream.state(),
                });
            }
            None => {
                let output = connection
                    .create_output_stream(stream_id)
                    .ok_or(Error::NotConnected)?;
                let sink: Arc<dyn MessageSink> =
                    Arc::new(ConnectionConsumer::new(connection, stream_id, output));
                let stream = Arc::new(ClientBroadcastStream::new(
                    stream_id,
                    connection.scope_name(),
                    sink,
                    connection.context().providers.clone(),
                ));
                if !connection.register_stream(ClientStream::Broadcast(stream.clone())) {
                    return Err(Error::InvalidStreamId(stream_id));
                }
                stream
            }
        };
        broadcast.publish(name, mode)
    }

    pub fn unpublish(&self, connection: &RtmpConnection, stream_id: u32) -> Result<()> {
        match connection.stream(stream_id) {
            Some(ClientStream::Broadcast(stream)) => {
                stream.unpublish();
                Ok(())
            }
            _ => Err(Error::InvalidStreamId(stream_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::context::tests::context_parts;
    use crate::rtmp::connection::tests::connected;
    use crate::rtmp::event::{Invoke, Notify, Packet, RtmpEvent};
    use crate::stream::engine::tests::{audio, video};
    use crate::stream::provider::DefaultProviderService;
    use crate::codec::CodecFactory;
    use crate::context::ServerContext;
    use crate::rtmp::transport::QueuedTransport;

    struct Setup {
        context: Arc<ServerContext>,
        providers: Arc<DefaultProviderService>,
    }

    fn setup() -> Setup {
        let (context, _scheduler) = context_parts(ServerConfig::default().set_ping_interval(0));
        let providers = Arc::new(DefaultProviderService::new(CodecFactory::default()));
        let context = Arc::new(context.set_providers(providers.clone()));
        Setup { context, providers }
    }

    /// Status codes written to the client, in order.
    fn statuses(transport: &QueuedTransport) -> Vec<String> {
        transport
            .drain()
            .into_iter()
            .filter_map(|packet: Packet| match packet.event {
                RtmpEvent::Invoke(Invoke { call, .. }) | RtmpEvent::Notify(Notify { call })
                    if call.method == "onStatus" || call.method == "onPlayStatus" =>
                {
                    Status::code_of(&call.args[0]).map(str::to_string)
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_play_requires_created_stream() {
        let setup = setup();
        let (connection, transport) = connected(&setup.context);
        let service = StreamService::new();
        let result = service.play(&connection, 1, "movie", 0.0, -1.0, true);
        assert!(matches!(result, Err(Error::InvalidStreamId(1))));
        assert_eq!(statuses(&transport), vec![status::NS_PLAY_FAILED]);
        connection.close();
    }

    #[test]
    fn test_play_recorded_then_close_stream() {
        let setup = setup();
        setup
            .providers
            .register_vod("live", "movie", vec![video(0, 0x17), audio(20), video(40, 0x27)]);
        let (connection, transport) = connected(&setup.context);
        let service = StreamService::new();
        let stream_id = service.create_stream(&connection).unwrap();
        connection.set_stream_buffer(stream_id, 2000);

        service.play(&connection, stream_id, "movie", 0.0, -1.0, true).unwrap();
        let subscriber = service.subscriber(&connection, stream_id).unwrap();
        assert_eq!(subscriber.state(), StreamState::Playing);
        assert_eq!(subscriber.engine().buffer_duration(), 2000);
        let codes = statuses(&transport);
        assert!(codes.contains(&status::NS_PLAY_RESET.to_string()));
        assert!(codes.contains(&status::NS_PLAY_START.to_string()));

        service.pause(&connection, stream_id, None, 10).unwrap();
        assert_eq!(subscriber.state(), StreamState::Paused);
        service.pause(&connection, stream_id, None, 10).unwrap();
        assert_eq!(subscriber.state(), StreamState::Playing);

        service.close_stream(&connection, stream_id);
        assert_eq!(subscriber.state(), StreamState::Closed);
        assert!(connection.stream(stream_id).is_none());
        assert!(connection.is_valid_stream_id(stream_id));
        connection.close();
    }

    #[test]
    fn test_seek_on_live_fails_with_status() {
        let setup = setup();
        let (publisher, _publisher_transport) = connected(&setup.context);
        let (viewer, viewer_transport) = connected(&setup.context);
        let service = StreamService::new();

        let publish_id = service.create_stream(&publisher).unwrap();
        service
            .publish(&publisher, publish_id, "cam", PublishMode::Live)
            .unwrap();
        let play_id = service.create_stream(&viewer).unwrap();
        service.play(&viewer, play_id, "cam", -1.0, -1.0, true).unwrap();
        statuses(&viewer_transport);

        assert!(matches!(
            service.seek(&viewer, play_id, 1000),
            Err(Error::SeekUnsupported)
        ));
        assert_eq!(statuses(&viewer_transport), vec![status::NS_SEEK_FAILED]);
        publisher.close();
        viewer.close();
    }

    #[test]
    fn test_publish_modes_and_name_conflicts() {
        let setup = setup();
        let (first, first_transport) = connected(&setup.context);
        let (second, second_transport) = connected(&setup.context);
        let service = StreamService::new();

        let id = service.create_stream(&first).unwrap();
        service.publish(&first, id, "show", PublishMode::Record).unwrap();
        assert_eq!(
            statuses(&first_transport),
            vec![status::NS_RECORD_FAILED, status::NS_PUBLISH_START]
        );

        let other = service.create_stream(&second).unwrap();
        assert!(matches!(
            service.publish(&second, other, "show", PublishMode::Live),
            Err(Error::StreamAlreadyPublished(_))
        ));
        assert_eq!(statuses(&second_transport), vec![status::NS_PUBLISH_BADNAME]);

        service.release_stream(&first, "show");
        assert_eq!(statuses(&first_transport), vec![status::NS_UNPUBLISHED_SUCCESS]);
        service
            .publish(&second, other, "show", PublishMode::Live)
            .unwrap();
        first.close();
        second.close();
    }

    #[test]
    fn test_close_all_closes_every_stream() {
        let setup = setup();
        setup
            .providers
            .register_vod("live", "movie", vec![video(0, 0x17)]);
        let (connection, _transport) = connected(&setup.context);
        let service = StreamService::new();
        let play_id = service.create_stream(&connection).unwrap();
        let publish_id = service.create_stream(&connection).unwrap();
        service.play(&connection, play_id, "movie", -2.0, -1.0, true).unwrap();
        service
            .publish(&connection, publish_id, "cam", PublishMode::Live)
            .unwrap();
        let streams = connection.streams();
        assert_eq!(streams.len(), 2);

        service.close_all(&connection);
        assert_eq!(connection.stream_count(), 0);
        assert!(streams
            .iter()
            .all(|stream| stream.state() == StreamState::Closed));
        assert!(setup.providers.live_names().is_empty());
        connection.close();
    }
}
