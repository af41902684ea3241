// src/rtmp/connection.rs - RTMP session state machine
//
// Core features:
// - Forward-only protocol state: connect, handshake, connected, error, closing
// - Handshake timeout and keep-alive pings on the injected scheduler
// - Receive queue drained by one named consumer thread per connection,
//   each packet handled on the worker pool before the next one is taken
// - Fair write permit taken in short slices while the session is healthy
// - Stream id reservation, lazily created channels and stream dispatchers
// - Pending calls failed with NotConnected on close, close runs once

use crate::application::ConnectParams;
use crate::config::{RtmpConfig, DEFAULT_CHUNK_SIZE};
use crate::context::ServerContext;
use crate::error::{Error, Result};
use crate::rtmp::channel::{
    channel_for_stream, Channel, OutputStream, CONTROL_CHANNEL, FIRST_STREAM_CHANNEL,
    INVOKE_CHANNEL,
};
use crate::rtmp::dispatcher::{StreamDispatcher, StreamEventTarget};
use crate::rtmp::event::{Call, CallStatus, Invoke, Notify, Packet, Ping, PingType, RtmpEvent};
use crate::rtmp::handler;
use crate::rtmp::manager::ConnectionToken;
use crate::rtmp::pending_call::{PendingCall, PendingCallback, PendingCalls};
use crate::rtmp::status::Status;
use crate::rtmp::transport::Transport;
use crate::so::event::SharedObjectMessage;
use crate::so::shared_object::SharedObjectListener;
use crate::stream::service::ClientStream;
use crate::util::JobHandle;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::{FairMutex, Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rml_rtmp::rml_amf0::Amf0Value;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const SESSION_ID_LEN: usize = 13;

/// Protocol state of a session. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connect = 0,
    Handshake = 1,
    Connected = 2,
    Error = 3,
    Disconnecting = 4,
    Disconnected = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connect,
            1 => ConnectionState::Handshake,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Error,
            4 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// A packet waiting in the receive queue.
struct ReceivedPacket {
    packet: Packet,
    /// Advisory; late packets are logged, not dropped.
    expires_at: u64,
}

pub struct RtmpConnection {
    session_id: String,
    context: Arc<ServerContext>,
    transport: Arc<dyn Transport>,
    state: AtomicU8,
    token: Mutex<Option<ConnectionToken>>,
    scope: RwLock<Option<String>>,
    params: RwLock<ConnectParams>,

    channels: DashMap<u32, Channel>,
    streams: DashMap<u32, ClientStream>,
    /// Client buffer lengths announced before the stream existed.
    stream_buffers: DashMap<u32, u32>,
    reserved_streams: Mutex<BTreeSet<u32>>,
    dispatchers: DashMap<u32, Arc<StreamDispatcher>>,
    pending_calls: PendingCalls,
    transaction_id: AtomicU32,

    closed: AtomicBool,
    chunk_size_sent: AtomicBool,
    handshake_job: Mutex<Option<JobHandle>>,
    keep_alive_job: Mutex<Option<JobHandle>>,
    keep_alive_running: AtomicBool,

    connected_at: AtomicU64,
    last_ping_value: AtomicU32,
    last_ping_sent_at: AtomicU64,
    last_pong_at: AtomicU64,
    round_trip_time: AtomicU32,
    last_bytes_read: AtomicU64,
    last_bytes_read_at: AtomicU64,
    client_bytes_read: AtomicU32,

    receive_sender: Mutex<Option<Sender<ReceivedPacket>>>,
    receive_receiver: Mutex<Option<Receiver<ReceivedPacket>>>,
    last_error: Mutex<Option<String>>,
    write_permit: FairMutex<()>,
    self_ref: Weak<RtmpConnection>,
}

impl RtmpConnection {
    /// Creates a session on top of an accepted transport.
    ///
    /// The session does nothing until [`open`](RtmpConnection::open) is called.
    pub fn new(context: Arc<ServerContext>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let session_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(SESSION_ID_LEN)
            .map(char::from)
            .collect();
        let now = context.clock.now_millis();
        let (sender, receiver) = crossbeam_channel::unbounded();
        Arc::new_cyclic(|self_ref| Self {
            session_id,
            context,
            transport,
            state: AtomicU8::new(ConnectionState::Connect as u8),
            token: Mutex::new(None),
            scope: RwLock::new(None),
            params: RwLock::new(ConnectParams::new()),
            channels: DashMap::new(),
            streams: DashMap::new(),
            stream_buffers: DashMap::new(),
            reserved_streams: Mutex::new(BTreeSet::new()),
            dispatchers: DashMap::new(),
            pending_calls: PendingCalls::new(),
            transaction_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            chunk_size_sent: AtomicBool::new(false),
            handshake_job: Mutex::new(None),
            keep_alive_job: Mutex::new(None),
            keep_alive_running: AtomicBool::new(false),
            connected_at: AtomicU64::new(0),
            last_ping_value: AtomicU32::new(0),
            last_ping_sent_at: AtomicU64::new(0),
            last_pong_at: AtomicU64::new(0),
            round_trip_time: AtomicU32::new(0),
            last_bytes_read: AtomicU64::new(0),
            last_bytes_read_at: AtomicU64::new(now),
            client_bytes_read: AtomicU32::new(0),
            receive_sender: Mutex::new(Some(sender)),
            receive_receiver: Mutex::new(Some(receiver)),
            last_error: Mutex::new(None),
            write_permit: FairMutex::new(()),
            self_ref: self_ref.clone(),
        })
    }

    fn config(&self) -> &RtmpConfig {
        &self.context.config.rtmp
    }

    fn now(&self) -> u64 {
        self.context.clock.now_millis()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn token(&self) -> Option<ConnectionToken> {
        *self.token.lock()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn remote_address(&self) -> String {
        self.transport.remote_address()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves the state forward; never backwards.
    fn advance_state(&self, to: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        while current < to as u8 {
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Handshake done and joined to a scope.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.scope.read().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn scope(&self) -> Option<String> {
        self.scope.read().clone()
    }

    /// Scope name streams resolve in, empty before connect.
    pub fn scope_name(&self) -> String {
        self.scope().unwrap_or_default()
    }

    pub fn params(&self) -> ConnectParams {
        self.params.read().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Registers the session, starts its receive consumer and the handshake
    /// timer.
    ///
    /// # Returns
    /// `Err(Error::ThreadExited)` when the consumer thread cannot be spawned.
    pub fn open(&self) -> Result<()> {
        let Some(this) = self.self_ref.upgrade() else {
            return Err(Error::NotConnected);
        };
        let receiver = match self.receive_receiver.lock().take() {
            Some(receiver) => receiver,
            None => {
                debug!("Connection {} already open", self.session_id);
                return Ok(());
            }
        };
        let token = self.context.manager.register(this);
        *self.token.lock() = Some(token);
        self.advance_state(ConnectionState::Handshake);

        let weak = self.self_ref.clone();
        let poll = Duration::from_millis(self.config().receive_poll_timeout);
        let thread_name = format!("rtmp-receive-{}", self.session_id);
        let result = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || consume_received(weak, receiver, poll));
        if let Err(e) = result {
            error!("Thread[{thread_name}] exited with error: {e}");
            self.close();
            return Err(Error::ThreadExited);
        }

        self.start_wait_for_handshake();
        debug!(
            "Connection {} opened from {}",
            self.session_id,
            self.transport.remote_address()
        );
        Ok(())
    }

    fn start_wait_for_handshake(&self) {
        let weak = self.self_ref.clone();
        let handle = self.context.scheduler.schedule_once(
            self.config().handshake_timeout,
            Box::new(move || {
                if let Some(connection) = weak.upgrade() {
                    if !connection.is_connected() && !connection.is_closed() {
                        warn!(
                            "Connection {} did not connect in time",
                            connection.session_id
                        );
                        connection.on_inactive();
                    }
                }
            }),
        );
        *self.handshake_job.lock() = Some(handle);
    }

    fn stop_wait_for_handshake(&self) {
        if let Some(handle) = self.handshake_job.lock().take() {
            self.context.scheduler.cancel(handle);
        }
    }

    /// Called by the transport side once the RTMP handshake completed.
    pub fn handshake_complete(&self) -> bool {
        self.advance_state(ConnectionState::Connected)
    }

    /// Marks the session broken; the receive consumer stops at its next poll.
    pub fn mark_error(&self, reason: &str) {
        warn!("Connection {} failed: {reason}", self.session_id);
        *self.last_error.lock() = Some(reason.to_string());
        self.advance_state(ConnectionState::Error);
    }

    /// Joins the client to `scope`.
    ///
    /// # Arguments
    /// * `scope` - application name from the connect command
    /// * `params` - the connect command object
    ///
    /// # Returns
    /// `Err(Error::ClientRejected)` when the application refused the client;
    /// the handshake timer is cancelled either way.
    pub fn connect(&self, scope: &str, params: ConnectParams) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Connected {
            warn!(
                "Connection {} cannot connect while {:?}",
                self.session_id, state
            );
            return Err(Error::NotConnected);
        }
        match self.context.application.app_connect(self, scope, &params) {
            Ok(()) => {
                *self.scope.write() = Some(scope.to_string());
                *self.params.write() = params;
                let now = self.now();
                self.connected_at.store(now, Ordering::Release);
                self.last_bytes_read_at.store(now, Ordering::Release);
                self.stop_wait_for_handshake();
                self.start_round_trip_measurement();
                info!(
                    "Connection {} connected to {} from {}",
                    self.session_id,
                    scope,
                    self.transport.remote_address()
                );
                Ok(())
            }
            Err(e) => {
                self.stop_wait_for_handshake();
                warn!("Connection {} rejected: {e}", self.session_id);
                Err(match e {
                    Error::ClientRejected(reason) => Error::ClientRejected(reason),
                    other => Error::ClientRejected(other.to_string()),
                })
            }
        }
    }

    /// Tears the session down. Only the first caller does the work.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Connection {} already closing", self.session_id);
            return;
        }
        let was_scoped = self.scope.read().is_some();
        self.advance_state(ConnectionState::Disconnecting);
        self.stop_wait_for_handshake();
        if let Some(handle) = self.keep_alive_job.lock().take() {
            self.context.scheduler.cancel(handle);
        }

        for (transaction_id, pending) in self.pending_calls.drain() {
            let call = pending.complete(CallStatus::NotConnected, None);
            debug!(
                "Connection {} failed call {} ({})",
                self.session_id, transaction_id, call.method
            );
        }

        self.context.streams.close_all(self);
        self.context.shared_objects.disconnect(&self.session_id);

        self.dispatchers.clear();
        self.streams.clear();
        self.stream_buffers.clear();
        self.channels.clear();
        self.reserved_streams.lock().clear();
        self.receive_sender.lock().take();
        self.transport.close();
        self.advance_state(ConnectionState::Disconnected);

        if let Some(token) = self.token.lock().take() {
            self.context.manager.unregister(token);
        }
        if was_scoped {
            self.context.application.app_disconnect(self);
        }
        info!("Connection {} closed", self.session_id);
    }

    fn on_inactive(&self) {
        warn!(
            "Closing connection {} from {} due to inactivity",
            self.session_id,
            self.transport.remote_address()
        );
        self.close();
    }

    // ========================================================================
    // Keep-alive
    // ========================================================================

    fn start_round_trip_measurement(&self) {
        let interval = self.config().ping_interval;
        if interval == 0 {
            return;
        }
        let weak = self.self_ref.clone();
        let handle = self.context.scheduler.schedule_repeating(
            self.config().keep_alive_grace,
            interval,
            Arc::new(move || {
                if let Some(connection) = weak.upgrade() {
                    connection.keep_alive_tick();
                }
            }),
        );
        if let Some(previous) = self.keep_alive_job.lock().replace(handle) {
            self.context.scheduler.cancel(previous);
        }
    }

    fn keep_alive_tick(&self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        if self
            .keep_alive_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let now = self.now();
        let read = self.transport.read_bytes();
        if read > self.last_bytes_read.load(Ordering::Acquire) {
            self.last_bytes_read.store(read, Ordering::Release);
            self.last_bytes_read_at.store(now, Ordering::Release);
            self.keep_alive_running.store(false, Ordering::Release);
            return;
        }

        let max_inactivity = self.config().max_inactivity;
        let ping_sent_at = self.last_ping_sent_at.load(Ordering::Acquire);
        let pong_baseline = self
            .last_pong_at
            .load(Ordering::Acquire)
            .max(self.connected_at.load(Ordering::Acquire));
        let silent_for = now.saturating_sub(self.last_bytes_read_at.load(Ordering::Acquire));
        let inactive =
            ping_sent_at.saturating_sub(pong_baseline) > max_inactivity && silent_for > max_inactivity;
        self.keep_alive_running.store(false, Ordering::Release);

        if inactive {
            self.on_inactive();
        } else {
            self.ping();
        }
    }

    /// Sends a ping carrying the low 32 bits of the current time.
    pub fn ping(&self) {
        let now = self.now();
        let value = now as u32;
        self.last_ping_value.store(value, Ordering::Release);
        self.last_ping_sent_at.store(now, Ordering::Release);
        self.write_event(
            CONTROL_CHANNEL,
            0,
            0,
            RtmpEvent::Ping(Ping::new(PingType::PingClient, value)),
        );
    }

    /// Accounts a pong from the client.
    pub fn ping_received(&self, pong: &Ping) {
        let now = self.now();
        self.last_pong_at.store(now, Ordering::Release);
        let sent = self.last_ping_value.load(Ordering::Acquire);
        if pong.value2 == sent {
            let round_trip = (now as u32).wrapping_sub(sent);
            self.round_trip_time.store(round_trip, Ordering::Release);
            debug!("Connection {} round trip {}ms", self.session_id, round_trip);
        } else {
            let pending = self.pending_messages();
            if pending > 4 {
                debug!(
                    "Connection {} pong {} does not match ping {}, {} messages pending, possible congestion",
                    self.session_id, pong.value2, sent, pending
                );
            }
        }
    }

    pub fn round_trip_time(&self) -> u32 {
        self.round_trip_time.load(Ordering::Acquire)
    }

    pub fn last_ping_sent_at(&self) -> u64 {
        self.last_ping_sent_at.load(Ordering::Acquire)
    }

    /// Pings unanswered for longer than the inactivity limit and the
    /// transport saw no I/O either.
    pub fn is_idle(&self) -> bool {
        let ping_sent_at = self.last_ping_sent_at.load(Ordering::Acquire);
        let pong_at = self.last_pong_at.load(Ordering::Acquire);
        let unanswered =
            pong_at > 0 && ping_sent_at.saturating_sub(pong_at) > self.config().max_inactivity;
        unanswered && self.transport.is_idle()
    }

    pub fn set_client_bytes_read(&self, bytes: u32) {
        self.client_bytes_read.store(bytes, Ordering::Release);
    }

    /// Bytes the client acknowledged having read.
    pub fn client_bytes_read(&self) -> u32 {
        self.client_bytes_read.load(Ordering::Acquire)
    }

    pub fn read_bytes(&self) -> u64 {
        self.transport.read_bytes()
    }

    pub fn written_bytes(&self) -> u64 {
        self.transport.written_bytes()
    }

    pub fn pending_messages(&self) -> usize {
        self.transport.pending_messages()
    }

    pub fn pending_video_messages(&self, stream_id: u32) -> usize {
        self.transport.pending_video_messages(stream_id)
    }

    // ========================================================================
    // Receive Pipeline
    // ========================================================================

    /// Queues a decoded packet for in-order handling.
    ///
    /// # Returns
    /// `false` once the session is closing.
    pub fn handle_message_received(&self, packet: Packet) -> bool {
        let expires_at = self.now() + self.config().max_handling_timeout;
        match self.receive_sender.lock().as_ref() {
            Some(sender) => sender.send(ReceivedPacket { packet, expires_at }).is_ok(),
            None => {
                debug!("Connection {} dropped a packet while closing", self.session_id);
                false
            }
        }
    }

    fn process_received(&self, received: ReceivedPacket) {
        let now = self.now();
        if now > received.expires_at {
            debug!(
                "Connection {} handling {:?} {}ms late",
                self.session_id,
                received.packet.header.data_type,
                now - received.expires_at
            );
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let result = self
            .context
            .executor
            .submit(move || this.message_received(received.packet))
            .and_then(|completion| completion.wait());
        if let Err(e) = result {
            warn!("Connection {} message handling failed: {e}", self.session_id);
            *self.last_error.lock() = Some(e.to_string());
        }
    }

    /// Dispatches one packet. A panicking handler is logged and contained.
    pub fn message_received(self: &Arc<Self>, packet: Packet) {
        let data_type = packet.header.data_type;
        if catch_unwind(AssertUnwindSafe(|| handler::dispatch(self, packet))).is_err() {
            error!(
                "Connection {} handler panicked on {:?}",
                self.session_id, data_type
            );
            *self.last_error.lock() = Some(format!("handler panicked on {data_type:?}"));
        }
    }

    // ========================================================================
    // Write Path
    // ========================================================================

    /// Writes a packet under the connection's write permit.
    ///
    /// The permit is retried in short slices until the session fails.
    pub fn write_packet(&self, packet: Packet) -> bool {
        let slice = Duration::from_millis(self.config().write_lock_slice.max(1));
        let _permit = loop {
            if let Some(permit) = self.write_permit.try_lock_for(slice) {
                break permit;
            }
            if self.state() >= ConnectionState::Error {
                warn!(
                    "Connection {} dropped {:?}, write permit unavailable",
                    self.session_id, packet.header.data_type
                );
                return false;
            }
        };
        self.transport.write(packet)
    }

    pub fn write_event(&self, channel_id: u32, stream_id: u32, timestamp: u32, event: RtmpEvent) -> bool {
        self.write_packet(Packet::new(channel_id, stream_id, timestamp, event))
    }

    /// Sends the configured chunk size once, when it is above the default.
    pub(crate) fn negotiate_chunk_size(&self) {
        let chunk_size = self.config().chunk_size;
        if chunk_size <= DEFAULT_CHUNK_SIZE {
            return;
        }
        if self
            .chunk_size_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!("Connection {} chunk size {}", self.session_id, chunk_size);
            self.write_event(CONTROL_CHANNEL, 0, 0, RtmpEvent::ChunkSize(chunk_size));
        }
    }

    /// Calls `method` on the client over the invoke channel.
    pub fn invoke(
        &self,
        method: &str,
        args: Vec<Amf0Value>,
        callback: Option<Arc<dyn PendingCallback>>,
    ) -> bool {
        self.invoke_on(INVOKE_CHANNEL, Call::from_action(method, args), callback)
    }

    /// Sends `call` as an invoke on `channel_id` and keeps it until the reply.
    ///
    /// # Returns
    /// `false` when the write failed; the call is then completed with
    /// `NotConnected` right away.
    pub fn invoke_on(
        &self,
        channel_id: u32,
        call: Call,
        callback: Option<Arc<dyn PendingCallback>>,
    ) -> bool {
        if call.service_name.is_none() && matches!(call.method.as_str(), "play" | "publish") {
            self.negotiate_chunk_size();
        }
        let transaction_id = self.transaction_id.fetch_add(1, Ordering::AcqRel);
        let mut pending = PendingCall::new(call.clone());
        if let Some(callback) = callback {
            pending = pending.with_callback(callback);
        }
        self.pending_calls.register(transaction_id, pending);
        let written = self.write_event(
            channel_id,
            0,
            0,
            RtmpEvent::Invoke(Invoke::new(transaction_id, call)),
        );
        if !written {
            if let Some(pending) = self.pending_calls.take(transaction_id) {
                pending.complete(CallStatus::NotConnected, None);
            }
        }
        written
    }

    /// Fire and forget call on the invoke channel.
    pub fn notify(&self, method: &str, args: Vec<Amf0Value>) -> bool {
        self.write_event(INVOKE_CHANNEL, 0, 0, RtmpEvent::Notify(Notify::new(method, args)))
    }

    /// Writes a status to the client on the stream's data channel.
    pub fn send_status(&self, stream_id: u32, status: &Status) -> bool {
        match self.get_channel(channel_for_stream(stream_id)) {
            Some(channel) => channel.send_status(stream_id, status),
            None => false,
        }
    }

    /// Takes the pending call a `_result` or `_error` answers.
    pub fn take_pending_call(&self, transaction_id: u32) -> Option<PendingCall> {
        self.pending_calls.take(transaction_id)
    }

    pub fn pending_call_count(&self) -> usize {
        self.pending_calls.len()
    }

    // ========================================================================
    // Stream Ids
    // ========================================================================

    /// Reserves the smallest free stream id.
    pub fn reserve_stream_id(&self) -> Result<u32> {
        let max_streams = self.config().max_streams;
        let mut reserved = self.reserved_streams.lock();
        match (1..max_streams).find(|id| !reserved.contains(id)) {
            Some(stream_id) => {
                reserved.insert(stream_id);
                Ok(stream_id)
            }
            None => {
                error!(
                    "Connection {} has no stream id left below {}",
                    self.session_id, max_streams
                );
                Err(Error::StreamIdExhausted)
            }
        }
    }

    /// Reserves `stream_id` if it is free, otherwise the smallest free id.
    pub fn reserve_stream_id_at(&self, stream_id: u32) -> Result<u32> {
        if stream_id > 0 && stream_id < self.config().max_streams {
            if self.reserved_streams.lock().insert(stream_id) {
                return Ok(stream_id);
            }
        }
        self.reserve_stream_id()
    }

    /// Releases a stream id together with its stream and dispatcher.
    pub fn unreserve_stream_id(&self, stream_id: u32) -> bool {
        if let Some(stream) = self.remove_stream(stream_id) {
            stream.close();
        }
        self.stream_buffers.remove(&stream_id);
        self.reserved_streams.lock().remove(&stream_id)
    }

    pub fn is_valid_stream_id(&self, stream_id: u32) -> bool {
        self.reserved_streams.lock().contains(&stream_id)
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Channel handle for `channel_id`, created on first use.
    ///
    /// # Returns
    /// `None` while the handshake is not done yet; callers treat that as
    /// "not ready".
    pub fn get_channel(&self, channel_id: u32) -> Option<Channel> {
        if self.state() < ConnectionState::Connected {
            warn!(
                "Connection {} asked for channel {} before the handshake completed",
                self.session_id, channel_id
            );
            return None;
        }
        let channel = self
            .channels
            .entry(channel_id)
            .or_insert_with(|| Channel::new(channel_id, self.self_ref.clone()))
            .value()
            .clone();
        Some(channel)
    }

    pub fn next_available_channel_id(&self) -> u32 {
        let mut channel_id = FIRST_STREAM_CHANNEL;
        while self.channels.contains_key(&channel_id) {
            channel_id += 1;
        }
        channel_id
    }

    pub fn close_channel(&self, channel_id: u32) -> bool {
        self.channels.remove(&channel_id).is_some()
    }

    /// Data, video and audio channels of `stream_id`, in that order.
    pub fn create_output_stream(&self, stream_id: u32) -> Option<OutputStream> {
        let first = channel_for_stream(stream_id);
        Some(OutputStream {
            data: self.get_channel(first)?,
            video: self.get_channel(first + 1)?,
            audio: self.get_channel(first + 2)?,
        })
    }

    // ========================================================================
    // Streams
    // ========================================================================

    /// Adds a stream under its reserved id.
    pub fn register_stream(&self, stream: ClientStream) -> bool {
        let stream_id = stream.stream_id();
        if !self.is_valid_stream_id(stream_id) {
            warn!(
                "Connection {} refused stream {}, id not reserved",
                self.session_id, stream_id
            );
            return false;
        }
        self.streams.insert(stream_id, stream);
        true
    }

    pub fn stream(&self, stream_id: u32) -> Option<ClientStream> {
        self.streams.get(&stream_id).map(|entry| entry.value().clone())
    }

    pub fn remove_stream(&self, stream_id: u32) -> Option<ClientStream> {
        self.dispatchers.remove(&stream_id);
        self.streams.remove(&stream_id).map(|(_, stream)| stream)
    }

    pub fn streams(&self) -> Vec<ClientStream> {
        self.streams.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Applies a client buffer length, or keeps it until the stream exists.
    pub fn set_stream_buffer(&self, stream_id: u32, duration: u32) {
        match self.stream(stream_id) {
            Some(stream) => stream.set_buffer_duration(duration),
            None => {
                self.stream_buffers.insert(stream_id, duration);
            }
        }
    }

    pub(crate) fn take_stream_buffer(&self, stream_id: u32) -> Option<u32> {
        self.stream_buffers.remove(&stream_id).map(|(_, duration)| duration)
    }

    /// Ordered dispatcher of `stream_id`, created on first use.
    pub fn dispatcher(&self, stream_id: u32) -> Arc<StreamDispatcher> {
        self.dispatchers
            .entry(stream_id)
            .or_insert_with(|| {
                let target: Weak<dyn StreamEventTarget> = self.self_ref.clone();
                StreamDispatcher::new(stream_id, target, self.context.executor.clone())
            })
            .value()
            .clone()
    }
}

impl StreamEventTarget for RtmpConnection {
    fn dispatch_stream_event(&self, stream_id: u32, packet: Packet) {
        match self.stream(stream_id) {
            Some(ClientStream::Broadcast(stream)) => {
                stream.dispatch_event(packet.header.timestamp, packet.event)
            }
            Some(ClientStream::Subscriber(_)) => debug!(
                "Connection {} ignored {:?} sent to subscriber stream {}",
                self.session_id, packet.header.data_type, stream_id
            ),
            None => debug!(
                "Connection {} has no stream {} for {:?}",
                self.session_id, stream_id, packet.header.data_type
            ),
        }
    }
}

impl SharedObjectListener for RtmpConnection {
    fn listener_id(&self) -> String {
        self.session_id.clone()
    }

    fn is_connected(&self) -> bool {
        RtmpConnection::is_connected(self) && !self.is_closed()
    }

    fn send_shared_object(&self, message: SharedObjectMessage) {
        self.write_event(INVOKE_CHANNEL, 0, 0, RtmpEvent::SharedObject(message));
    }
}

/// Receive consumer: one packet at a time, each handled to completion.
fn consume_received(
    connection: Weak<RtmpConnection>,
    receiver: Receiver<ReceivedPacket>,
    poll: Duration,
) {
    loop {
        match receiver.recv_timeout(poll) {
            Ok(received) => {
                let Some(connection) = connection.upgrade() else {
                    break;
                };
                if connection.state() >= ConnectionState::Error {
                    break;
                }
                connection.process_received(received);
            }
            Err(RecvTimeoutError::Timeout) => match connection.upgrade() {
                Some(connection) if connection.state() < ConnectionState::Error => continue,
                _ => break,
            },
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(
        "{} exited",
        std::thread::current().name().unwrap_or("rtmp-receive")
    );
}
