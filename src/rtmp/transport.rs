// src/rtmp/transport.rs - Transport seam
//
// The connection never touches sockets. It writes decoded packets to a
// `Transport` and reads liveness counters from it; the chunk codec and the
// socket loop live on the other side of this trait.

use crate::rtmp::event::Packet;
use crate::rtmp::write_queue::{EnqueueResult, WriteQueue};
use crate::util::Clock;
use log::warn;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// What the connection needs from the underlying session.
pub trait Transport: Send + Sync {
    /// Queues a packet for the wire. `false` when the packet was not accepted.
    fn write(&self, packet: Packet) -> bool;

    fn is_connected(&self) -> bool;

    fn is_closing(&self) -> bool;

    /// Total bytes received from the peer.
    fn read_bytes(&self) -> u64;

    /// Total bytes handed to the wire.
    fn written_bytes(&self) -> u64;

    /// Messages accepted but not yet on the wire.
    fn pending_messages(&self) -> usize;

    /// Video messages of one stream accepted but not yet on the wire.
    fn pending_video_messages(&self, stream_id: u32) -> usize;

    /// Transport level idleness: neither side saw I/O for a while.
    fn is_idle(&self) -> bool;

    fn remote_address(&self) -> String;

    fn close(&self);
}

/// In-memory transport backed by a [`WriteQueue`].
///
/// The socket side calls [`QueuedTransport::record_read`] for incoming bytes
/// and [`QueuedTransport::drain`] to pick up outgoing packets.
pub struct QueuedTransport {
    remote_address: String,
    queue: Mutex<WriteQueue>,
    connected: AtomicBool,
    closing: AtomicBool,
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    last_io: AtomicU64,
    idle_timeout: u64,
    clock: Arc<dyn Clock>,
}

impl QueuedTransport {
    pub fn new(remote_address: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            remote_address: remote_address.into(),
            queue: Mutex::new(WriteQueue::new()),
            connected: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            read_bytes: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            last_io: AtomicU64::new(now),
            idle_timeout: 60000,
            clock,
        }
    }

    /// Sets how long without I/O counts as idle.
    pub fn set_idle_timeout(mut self, idle_timeout: u64) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Accounts bytes received from the peer.
    pub fn record_read(&self, bytes: u64) {
        self.read_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.last_io.store(self.clock.now_millis(), Ordering::Release);
    }

    /// Takes every queued packet, counting it as written.
    pub fn drain(&self) -> Vec<Packet> {
        let packets = self.queue.lock().drain(usize::MAX);
        if !packets.is_empty() {
            let bytes: usize = packets.iter().map(|p| p.event.payload_len()).sum();
            self.written_bytes.fetch_add(bytes as u64, Ordering::AcqRel);
            self.last_io.store(self.clock.now_millis(), Ordering::Release);
        }
        packets
    }

    pub fn dropped_frames(&self) -> u64 {
        self.queue.lock().dropped_frames()
    }
}

impl Transport for QueuedTransport {
    fn write(&self, packet: Packet) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.queue.lock().enqueue(packet) {
            EnqueueResult::Queued => true,
            EnqueueResult::Dropped => false,
            EnqueueResult::Rejected => {
                warn!("Write queue full for {}, closing", self.remote_address);
                self.closing.store(true, Ordering::Release);
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Acquire)
    }

    fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Acquire)
    }

    fn pending_messages(&self) -> usize {
        self.queue.lock().pending_entries()
    }

    fn pending_video_messages(&self, stream_id: u32) -> usize {
        self.queue.lock().pending_video(stream_id)
    }

    fn is_idle(&self) -> bool {
        let last_io = self.last_io.load(Ordering::Acquire);
        self.clock.now_millis().saturating_sub(last_io) > self.idle_timeout
    }

    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    fn close(&self) {
        self.closing.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.queue.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtmp::event::{Ping, PingType, RtmpEvent};
    use crate::util::ManualClock;

    fn ping(value: u32) -> Packet {
        Packet::new(2, 0, 0, RtmpEvent::Ping(Ping::new(PingType::PingClient, value)))
    }

    #[test]
    fn test_write_and_drain() {
        let clock = Arc::new(ManualClock::new(0));
        let transport = QueuedTransport::new("127.0.0.1:1935", clock);
        assert!(transport.write(ping(1)));
        assert!(transport.write(ping(2)));
        assert_eq!(transport.pending_messages(), 2);

        let packets = transport.drain();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], ping(1));
        assert_eq!(transport.pending_messages(), 0);
    }

    #[test]
    fn test_closed_transport_rejects_writes() {
        let clock = Arc::new(ManualClock::new(0));
        let transport = QueuedTransport::new("peer", clock);
        transport.close();
        assert!(!transport.is_connected());
        assert!(transport.is_closing());
        assert!(!transport.write(ping(1)));
    }

    #[test]
    fn test_idle_tracking() {
        let clock = Arc::new(ManualClock::new(1000));
        let transport = QueuedTransport::new("peer", clock.clone()).set_idle_timeout(500);
        assert!(!transport.is_idle());
        clock.advance(600);
        assert!(transport.is_idle());
        transport.record_read(64);
        assert!(!transport.is_idle());
        assert_eq!(transport.read_bytes(), 64);
    }
}
