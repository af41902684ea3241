// src/rtmp/handler.rs - Inbound message routing and the default command set
//
// Core features:
// - One exhaustive dispatch over the event union
// - Media and stream data go through the per-stream ordered dispatcher
// - A `publish` invoke is handled as a command and then also queued on the
//   stream's dispatcher, so the stream sees it in media order
// - Default NetConnection/NetStream commands, replies matched by transaction id

use crate::application::ConnectParams;
use crate::rtmp::channel::CONTROL_CHANNEL;
use crate::rtmp::connection::RtmpConnection;
use crate::rtmp::event::{
    Call, CallStatus, Header, Invoke, Notify, Packet, Ping, PingType, RtmpEvent, SourceType,
};
use crate::rtmp::status::{self, Status};
use crate::so::event::SharedObjectMessage;
use crate::so::shared_object::SharedObjectListener;
use crate::stream::broadcast::PublishMode;
use log::{debug, info, warn};
use rml_rtmp::rml_amf0::Amf0Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Hooks the dispatcher calls for messages that are not stream media.
///
/// Every hook receives the connection explicitly.
pub trait RtmpHandler: Send + Sync {
    fn on_command(&self, connection: &Arc<RtmpConnection>, header: &Header, invoke: Invoke);

    /// Notifies that are not stream data for an existing stream.
    fn on_notify(&self, connection: &Arc<RtmpConnection>, header: &Header, notify: Notify) {
        debug!(
            "Connection {} ignored notify {} on stream {}",
            connection.session_id(),
            notify.call.method,
            header.stream_id
        );
    }

    fn on_shared_object(&self, connection: &Arc<RtmpConnection>, message: SharedObjectMessage) {
        if !connection.is_connected() {
            warn!(
                "Connection {} sent shared object {} before connecting",
                connection.session_id(),
                message.name
            );
            return;
        }
        let scope = connection.scope_name();
        let listener: Arc<dyn SharedObjectListener> = connection.clone();
        connection
            .context()
            .shared_objects
            .handle_message(&scope, listener, message);
    }

    fn on_ping(&self, connection: &Arc<RtmpConnection>, ping: Ping) {
        match ping.ping_type {
            PingType::ClientBuffer => {
                let buffer = ping.value3.unwrap_or(0);
                debug!(
                    "Connection {} stream {} client buffer {}ms",
                    connection.session_id(),
                    ping.value2,
                    buffer
                );
                connection.set_stream_buffer(ping.value2, buffer);
            }
            PingType::PingClient => {
                connection.write_event(
                    CONTROL_CHANNEL,
                    0,
                    0,
                    RtmpEvent::Ping(Ping::new(PingType::PongServer, ping.value2)),
                );
            }
            PingType::PongServer => connection.ping_received(&ping),
            other => debug!(
                "Connection {} ignored ping {:?}",
                connection.session_id(),
                other
            ),
        }
    }

    fn on_chunk_size(&self, connection: &Arc<RtmpConnection>, chunk_size: u32) {
        debug!(
            "Connection {} peer chunk size {}",
            connection.session_id(),
            chunk_size
        );
    }

    fn on_client_bandwidth(&self, connection: &Arc<RtmpConnection>, window: u32, limit_type: u8) {
        debug!(
            "Connection {} client bandwidth {} ({})",
            connection.session_id(),
            window,
            limit_type
        );
    }

    fn on_server_bandwidth(&self, connection: &Arc<RtmpConnection>, window: u32) {
        debug!(
            "Connection {} server bandwidth {}",
            connection.session_id(),
            window
        );
    }
}

fn is_publish(header: &Header, invoke: &Invoke) -> bool {
    header.stream_id != 0 && invoke.call.service_name.is_none() && invoke.call.method == "publish"
}

/// Routes one received packet by its data type.
pub fn dispatch(connection: &Arc<RtmpConnection>, packet: Packet) {
    let handler = connection.context().handler.clone();
    let Packet { header, event } = packet;
    match event {
        RtmpEvent::Audio(_) | RtmpEvent::Video(_) | RtmpEvent::Aggregate(_) => {
            let mut event = event;
            event.set_source_type(SourceType::Live);
            connection
                .dispatcher(header.stream_id)
                .dispatch(Packet { header, event });
        }
        RtmpEvent::SharedObject(message) | RtmpEvent::FlexSharedObject(message) => {
            handler.on_shared_object(connection, message)
        }
        event @ (RtmpEvent::Invoke(_) | RtmpEvent::FlexMessage(_)) => {
            let copy = match &event {
                RtmpEvent::Invoke(invoke) | RtmpEvent::FlexMessage(invoke)
                    if is_publish(&header, invoke) =>
                {
                    Some(event.clone())
                }
                _ => None,
            };
            if let RtmpEvent::Invoke(invoke) | RtmpEvent::FlexMessage(invoke) = event {
                handler.on_command(connection, &header, invoke);
            }
            if let Some(event) = copy {
                // second delivery of the same publish, in media order
                connection
                    .dispatcher(header.stream_id)
                    .dispatch(Packet { header, event });
            }
        }
        event @ (RtmpEvent::Notify(_) | RtmpEvent::FlexStreamSend(_)) => {
            if event.is_stream_data() && connection.stream(header.stream_id).is_some() {
                connection
                    .dispatcher(header.stream_id)
                    .dispatch(Packet { header, event });
            } else if let RtmpEvent::Notify(notify) | RtmpEvent::FlexStreamSend(notify) = event {
                handler.on_notify(connection, &header, notify);
            }
        }
        RtmpEvent::Ping(ping) => handler.on_ping(connection, ping),
        RtmpEvent::BytesRead(bytes) => connection.set_client_bytes_read(bytes),
        RtmpEvent::ChunkSize(chunk_size) => handler.on_chunk_size(connection, chunk_size),
        RtmpEvent::ClientBandwidth { window, limit_type } => {
            handler.on_client_bandwidth(connection, window, limit_type)
        }
        RtmpEvent::ServerBandwidth(window) => handler.on_server_bandwidth(connection, window),
        RtmpEvent::Unknown { data_type, data } => debug!(
            "Connection {} dropped message type {} ({} bytes)",
            connection.session_id(),
            data_type,
            data.len()
        ),
    }
}

// ============================================================================
// Replies
// ============================================================================

/// Answers an invoke on the channel and stream it arrived on.
///
/// Invokes with transaction id 0 expect no answer and get none.
fn reply(
    connection: &RtmpConnection,
    header: &Header,
    transaction_id: u32,
    method: &str,
    command_object: Amf0Value,
    args: Vec<Amf0Value>,
) -> bool {
    if transaction_id == 0 {
        return false;
    }
    let invoke = Invoke {
        transaction_id,
        command_object,
        call: Call::new(method, args),
    };
    connection.write_event(header.channel_id, header.stream_id, 0, RtmpEvent::Invoke(invoke))
}

fn reply_result(connection: &RtmpConnection, header: &Header, transaction_id: u32, args: Vec<Amf0Value>) {
    reply(connection, header, transaction_id, "_result", Amf0Value::Null, args);
}

fn reply_error(connection: &RtmpConnection, header: &Header, transaction_id: u32, status: Status) {
    reply(
        connection,
        header,
        transaction_id,
        "_error",
        Amf0Value::Null,
        vec![status.to_amf0()],
    );
}

fn server_properties() -> Amf0Value {
    let mut properties = HashMap::new();
    properties.insert("fmsVer".to_string(), Amf0Value::Utf8String("FMS/3,5,1,525".into()));
    properties.insert("capabilities".to_string(), Amf0Value::Number(31.0));
    properties.insert("mode".to_string(), Amf0Value::Number(1.0));
    Amf0Value::Object(properties)
}

/// `app` of the connect object without query string and slashes.
fn scope_from_params(params: &ConnectParams) -> String {
    match params.get("app") {
        Some(Amf0Value::Utf8String(app)) => app
            .split('?')
            .next()
            .unwrap_or_default()
            .trim_matches('/')
            .to_string(),
        _ => String::new(),
    }
}

// ============================================================================
// Server Handler
// ============================================================================

/// The default command set of the server.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerHandler;

impl ServerHandler {
    fn connect(
        &self,
        connection: &Arc<RtmpConnection>,
        header: &Header,
        transaction_id: u32,
        command_object: Amf0Value,
    ) {
        let params = match command_object {
            Amf0Value::Object(properties) => properties,
            _ => ConnectParams::new(),
        };
        let scope = scope_from_params(&params);
        match connection.connect(&scope, params) {
            Ok(()) => {
                let window = connection.context().config.rtmp.bandwidth_window;
                connection.write_event(CONTROL_CHANNEL, 0, 0, RtmpEvent::ServerBandwidth(window));
                connection.write_event(
                    CONTROL_CHANNEL,
                    0,
                    0,
                    RtmpEvent::ClientBandwidth {
                        window,
                        limit_type: 2,
                    },
                );
                connection.write_event(
                    CONTROL_CHANNEL,
                    0,
                    0,
                    RtmpEvent::Ping(Ping::new(PingType::StreamBegin, 0)),
                );
                let mut info = Status::new(status::NC_CONNECT_SUCCESS)
                    .set_description("Connection succeeded.")
                    .to_amf0();
                if let Amf0Value::Object(properties) = &mut info {
                    properties.insert("objectEncoding".to_string(), Amf0Value::Number(0.0));
                }
                reply(
                    connection,
                    header,
                    transaction_id,
                    "_result",
                    server_properties(),
                    vec![info],
                );
            }
            Err(e) => {
                reply_error(
                    connection,
                    header,
                    transaction_id,
                    Status::new(status::NC_CONNECT_REJECTED).set_description(e.to_string()),
                );
                connection.close();
            }
        }
    }

    fn call_returned(&self, connection: &RtmpConnection, transaction_id: u32, call: Call) {
        let Some(pending) = connection.take_pending_call(transaction_id) else {
            debug!(
                "Connection {} got {} for unknown transaction {}",
                connection.session_id(),
                call.method,
                transaction_id
            );
            return;
        };
        let result = call.args.last().cloned();
        let status = if call.method == "_error" {
            CallStatus::InvocationException
        } else if matches!(result, None | Some(Amf0Value::Null) | Some(Amf0Value::Undefined)) {
            CallStatus::SuccessNull
        } else {
            CallStatus::SuccessResult
        };
        pending.complete(status, result);
    }

    fn play(&self, connection: &Arc<RtmpConnection>, header: &Header, call: &Call) {
        let streams = &connection.context().streams;
        let stream_id = header.stream_id;
        if let Some(Amf0Value::Boolean(false)) = call.arg(0) {
            if let Err(e) = streams.stop(connection, stream_id) {
                debug!("Connection {} play(false): {e}", connection.session_id());
            }
            return;
        }
        let Some(name) = call.arg_str(0) else {
            warn!(
                "Connection {} play without a name on stream {}",
                connection.session_id(),
                stream_id
            );
            connection.send_status(
                stream_id,
                &Status::new(status::NS_PLAY_FAILED)
                    .set_description("Play requires a stream name.")
                    .set_client_id(stream_id),
            );
            return;
        };
        let start = call.arg_f64(1).unwrap_or(-2.0);
        let length = call.arg_f64(2).unwrap_or(-1.0);
        let reset = call.arg_bool(3).unwrap_or(true);
        connection.negotiate_chunk_size();
        if let Err(e) = streams.play(connection, stream_id, name, start, length, reset) {
            debug!("Connection {} play {name}: {e}", connection.session_id());
        }
    }

    fn publish(&self, connection: &Arc<RtmpConnection>, header: &Header, call: &Call) {
        let streams = &connection.context().streams;
        let stream_id = header.stream_id;
        match call.arg_str(0).filter(|name| !name.is_empty()) {
            Some(name) => {
                let mode = PublishMode::from_name(call.arg_str(1));
                connection.negotiate_chunk_size();
                if let Err(e) = streams.publish(connection, stream_id, name, mode) {
                    debug!("Connection {} publish {name}: {e}", connection.session_id());
                }
            }
            None => {
                if let Err(e) = streams.unpublish(connection, stream_id) {
                    debug!("Connection {} unpublish: {e}", connection.session_id());
                }
            }
        }
    }
}

impl RtmpHandler for ServerHandler {
    fn on_command(&self, connection: &Arc<RtmpConnection>, header: &Header, invoke: Invoke) {
        let Invoke {
            transaction_id,
            command_object,
            call,
        } = invoke;
        if let Some(service) = call.service_name.as_deref() {
            warn!(
                "Connection {} called unknown service {}.{}",
                connection.session_id(),
                service,
                call.method
            );
            reply_error(
                connection,
                header,
                transaction_id,
                Status::new(status::NC_CALL_FAILED)
                    .set_description(format!("Service not found: {service}")),
            );
            return;
        }
        match call.method.as_str() {
            "connect" => {
                return self.connect(connection, header, transaction_id, command_object);
            }
            "_result" | "_error" => return self.call_returned(connection, transaction_id, call),
            _ => {}
        }
        if !connection.is_connected() {
            warn!(
                "Connection {} sent {} before connecting",
                connection.session_id(),
                call.method
            );
            reply_error(
                connection,
                header,
                transaction_id,
                Status::new(status::NC_CALL_FAILED).set_description("Not connected."),
            );
            return;
        }

        let streams = &connection.context().streams;
        let stream_id = header.stream_id;
        match call.method.as_str() {
            "createStream" => match streams.create_stream(connection) {
                Ok(id) => reply_result(connection, header, transaction_id, vec![Amf0Value::Number(id as f64)]),
                Err(e) => reply_error(
                    connection,
                    header,
                    transaction_id,
                    Status::new(status::NC_CALL_FAILED).set_description(e.to_string()),
                ),
            },
            "deleteStream" => {
                let target = call.arg_f64(0).map_or(stream_id, |id| id as u32);
                streams.delete_stream(connection, target);
            }
            "closeStream" => streams.close_stream(connection, stream_id),
            "releaseStream" | "FCUnpublish" => {
                if let Some(name) = call.arg_str(0) {
                    streams.release_stream(connection, name);
                }
                reply_result(connection, header, transaction_id, vec![Amf0Value::Null]);
            }
            "FCPublish" => {
                debug!(
                    "Connection {} announced {:?}",
                    connection.session_id(),
                    call.arg_str(0)
                );
                reply_result(connection, header, transaction_id, vec![Amf0Value::Null]);
            }
            "play" => self.play(connection, header, &call),
            "pause" => {
                let position = call.arg_f64(1).unwrap_or(0.0).max(0.0) as u32;
                if let Err(e) = streams.pause(connection, stream_id, call.arg_bool(0), position) {
                    debug!("Connection {} pause: {e}", connection.session_id());
                }
            }
            "seek" => {
                let position = call.arg_f64(0).unwrap_or(0.0).max(0.0) as u32;
                if let Err(e) = streams.seek(connection, stream_id, position) {
                    debug!("Connection {} seek: {e}", connection.session_id());
                }
            }
            "receiveAudio" => {
                streams.receive_audio(connection, stream_id, call.arg_bool(0).unwrap_or(true));
            }
            "receiveVideo" => {
                streams.receive_video(connection, stream_id, call.arg_bool(0).unwrap_or(true));
            }
            "publish" => self.publish(connection, header, &call),
            method => {
                info!(
                    "Connection {} called unknown method {}",
                    connection.session_id(),
                    method
                );
                reply_error(
                    connection,
                    header,
                    transaction_id,
                    Status::new(status::NC_CALL_FAILED)
                        .set_description(format!("Method not found: {method}")),
                );
            }
        }
    }
}
