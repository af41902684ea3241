// src/rtmp/pending_call.rs - Server initiated calls waiting for a reply

use crate::rtmp::event::{Call, CallStatus};
use dashmap::DashMap;
use rml_rtmp::rml_amf0::Amf0Value;
use std::sync::Arc;

/// Notified once the reply to a pending call arrived or the call failed.
pub trait PendingCallback: Send + Sync {
    fn result_received(&self, call: &Call);
}

impl<F> PendingCallback for F
where
    F: Fn(&Call) + Send + Sync,
{
    fn result_received(&self, call: &Call) {
        self(call)
    }
}

/// An invoke the server sent, keyed by its transaction id.
pub struct PendingCall {
    call: Call,
    callbacks: Vec<Arc<dyn PendingCallback>>,
}

impl PendingCall {
    pub fn new(call: Call) -> Self {
        Self {
            call,
            callbacks: Vec::new(),
        }
    }

    pub fn with_callback(mut self, callback: Arc<dyn PendingCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Records the outcome and runs every callback on the calling thread.
    pub fn complete(mut self, status: CallStatus, result: Option<Amf0Value>) -> Call {
        self.call.status = status;
        self.call.result = result;
        for callback in &self.callbacks {
            callback.result_received(&self.call);
        }
        self.call
    }
}

/// Transaction id to pending call map of one connection.
#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<u32, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transaction_id: u32, call: PendingCall) {
        self.calls.insert(transaction_id, call);
    }

    /// Removes and returns the call; a second lookup finds nothing.
    pub fn take(&self, transaction_id: u32) -> Option<PendingCall> {
        self.calls.remove(&transaction_id).map(|(_, call)| call)
    }

    pub fn contains(&self, transaction_id: u32) -> bool {
        self.calls.contains_key(&transaction_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Removes every call, in transaction id order.
    pub fn drain(&self) -> Vec<(u32, PendingCall)> {
        let mut ids: Vec<u32> = self.calls.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.take(id).map(|call| (id, call)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_take_is_at_most_once() {
        let calls = PendingCalls::new();
        calls.register(7, PendingCall::new(Call::new("checkBandwidth", vec![])));
        assert!(calls.contains(7));

        let call = calls.take(7).unwrap();
        assert_eq!(call.call().method, "checkBandwidth");
        assert!(calls.take(7).is_none());
        assert!(calls.is_empty());
    }

    #[test]
    fn test_complete_runs_callbacks_with_result() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let callback = Arc::new(move |call: &Call| {
            assert_eq!(call.status, CallStatus::SuccessResult);
            assert_eq!(call.result, Some(Amf0Value::Number(1.0)));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let pending = PendingCall::new(Call::new("ping", vec![]))
            .with_callback(callback.clone())
            .with_callback(callback);
        assert_eq!(pending.callback_count(), 2);

        let call = pending.complete(CallStatus::SuccessResult, Some(Amf0Value::Number(1.0)));
        assert_eq!(call.status, CallStatus::SuccessResult);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drain_empties_in_order() {
        let calls = PendingCalls::new();
        for id in [5, 2, 9] {
            calls.register(id, PendingCall::new(Call::new(format!("m{id}"), vec![])));
        }
        let drained: Vec<u32> = calls.drain().into_iter().map(|(id, _)| id).collect();
        assert_eq!(drained, vec![2, 5, 9]);
        assert!(calls.is_empty());
    }
}
