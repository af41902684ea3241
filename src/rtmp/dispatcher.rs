// src/rtmp/dispatcher.rs - Per-stream ordered dispatch on a shared pool
//
// Core features:
// - Lock-free packet queue per (connection, stream)
// - At most one drain task in flight, guarded by an atomic flag
// - Packets reach the stream one at a time in arrival order
// - Re-submits itself when packets arrived while the flag was being cleared

use crate::rtmp::event::Packet;
use crate::util::Executor;
use crossbeam::queue::SegQueue;
use log::{debug, error, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Receiver of ordered stream events, normally the connection.
pub trait StreamEventTarget: Send + Sync {
    fn dispatch_stream_event(&self, stream_id: u32, packet: Packet);
}

pub struct StreamDispatcher {
    stream_id: u32,
    queue: SegQueue<Packet>,
    scheduled: AtomicBool,
    target: Weak<dyn StreamEventTarget>,
    executor: Arc<dyn Executor>,
    self_ref: Weak<StreamDispatcher>,
}

impl StreamDispatcher {
    pub fn new(
        stream_id: u32,
        target: Weak<dyn StreamEventTarget>,
        executor: Arc<dyn Executor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            stream_id,
            queue: SegQueue::new(),
            scheduled: AtomicBool::new(false),
            target,
            executor,
            self_ref: self_ref.clone(),
        })
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Packets queued and not yet handed to the stream.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Queues a packet and makes sure a drain task is on its way.
    pub fn dispatch(&self, packet: Packet) {
        self.queue.push(packet);
        self.schedule();
    }

    fn schedule(&self) {
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            self.scheduled.store(false, Ordering::Release);
            return;
        };
        if let Err(e) = self.executor.execute(Box::new(move || this.drain())) {
            warn!("Stream {} dispatch not scheduled: {e}", self.stream_id);
            self.scheduled.store(false, Ordering::Release);
        }
    }

    fn drain(&self) {
        let target = self.target.upgrade();
        while let Some(packet) = self.queue.pop() {
            match &target {
                Some(target) => {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        target.dispatch_stream_event(self.stream_id, packet)
                    }));
                    if result.is_err() {
                        error!("Stream {} event handler panicked", self.stream_id);
                    }
                }
                None => debug!("Stream {} dropped a packet, target is gone", self.stream_id),
            }
        }
        self.scheduled.store(false, Ordering::Release);
        // a producer may have pushed after the last pop but lost the flag race
        if !self.queue.is_empty() {
            self.schedule();
        }
    }
}
