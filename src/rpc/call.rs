//! An outbound request tracked until a matching response, timeout, or send
//! failure.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use crate::messages::{Message, RequestMethod, RequestSpecific, RequestTypeSpecific};
use crate::rpc::call_table::Mtid;

/// Observer of a call's lifecycle events. Callbacks run synchronously on
/// whichever thread produced the event and must not block.
pub trait CallListener: Send + Sync {
    fn on_sent(&self, _call: &RpcCall) {}
    fn on_response(&self, _call: &RpcCall, _response: &Message) {}
    fn on_timeout(&self, _call: &RpcCall) {}
    fn on_stall(&self, _call: &RpcCall) {}
    fn on_send_failed(&self, _call: &RpcCall) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Unsent,
    Sent,
    /// A matching-mtid response arrived from the wrong source; the timeout is
    /// now expected rather than suspicious.
    Stalled,
    Responded,
    TimedOut,
    SendFailed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Responded | CallState::TimedOut | CallState::SendFailed
        )
    }
}

struct CallInner {
    state: CallState,
    listeners: Vec<Arc<dyn CallListener>>,
    response: Option<Message>,
}

/// The millis value standing for "no explicit expected RTT configured".
const RTT_UNSET: u64 = u64::MAX;

pub struct RpcCall {
    request: RequestSpecific,
    destination: SocketAddr,
    known_reachable: bool,
    expected_rtt_millis: AtomicU64,
    mtid: OnceLock<Mtid>,
    sent_at: OnceLock<Instant>,
    inner: Mutex<CallInner>,
}

impl RpcCall {
    pub fn new(request: RequestSpecific, destination: SocketAddr) -> Self {
        Self {
            request,
            destination,
            known_reachable: false,
            expected_rtt_millis: AtomicU64::new(RTT_UNSET),
            mtid: OnceLock::new(),
            sent_at: OnceLock::new(),
            inner: Mutex::new(CallInner {
                state: CallState::Unsent,
                listeners: Vec::new(),
                response: None,
            }),
        }
    }

    /// Marks the destination as an already-verified routing table entry, which
    /// keeps this call out of the general-population RTT estimator.
    pub fn with_known_reachable(mut self, known_reachable: bool) -> Self {
        self.known_reachable = known_reachable;
        self
    }

    // === Getters ===

    pub fn request(&self) -> &RequestSpecific {
        &self.request
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn known_reachable_at_creation_time(&self) -> bool {
        self.known_reachable
    }

    /// The transaction id, once assigned at dispatch.
    pub fn mtid(&self) -> Option<Mtid> {
        self.mtid.get().copied()
    }

    pub fn request_method(&self) -> RequestMethod {
        match self.request.request_type {
            RequestTypeSpecific::Ping => RequestMethod::Ping,
            RequestTypeSpecific::FindNode(_) => RequestMethod::FindNode,
        }
    }

    pub fn state(&self) -> CallState {
        self.lock().state
    }

    pub fn response(&self) -> Option<Message> {
        self.lock().response.clone()
    }

    /// When the request actually left the socket.
    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at.get().copied()
    }

    pub fn expected_rtt(&self) -> Option<Duration> {
        match self.expected_rtt_millis.load(Ordering::Relaxed) {
            RTT_UNSET => None,
            millis => Some(Duration::from_millis(millis)),
        }
    }

    /// Override the adaptive stall timeout for this call. Kept public so
    /// loss-adaptive experiments stay cheap.
    pub fn set_expected_rtt(&self, rtt: Duration) {
        self.expected_rtt_millis
            .store(rtt.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn add_listener(&self, listener: Arc<dyn CallListener>) {
        self.lock().listeners.push(listener);
    }

    // === Lifecycle events ===

    pub(crate) fn assign_mtid(&self, mtid: Mtid) {
        let _ = self.mtid.set(mtid);
    }

    pub(crate) fn sent(&self) {
        let _ = self.sent_at.set(Instant::now());
        let listeners = {
            let mut inner = self.lock();
            if inner.state != CallState::Unsent {
                return;
            }
            inner.state = CallState::Sent;
            inner.listeners.clone()
        };
        for listener in listeners {
            listener.on_sent(self);
        }
    }

    pub(crate) fn responded(&self, response: Message) {
        let listeners = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = CallState::Responded;
            inner.response = Some(response.clone());
            inner.listeners.clone()
        };
        for listener in listeners {
            listener.on_response(self, &response);
        }
    }

    /// A matching response arrived from an unexpected source; don't complete
    /// the call, but make its eventual timeout expected.
    pub fn inject_stall(&self) {
        let listeners = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = CallState::Stalled;
            inner.listeners.clone()
        };
        for listener in listeners {
            listener.on_stall(self);
        }
    }

    /// Driven by the external call timer once the expected RTT has elapsed
    /// without a response.
    pub fn timeout(&self) {
        let listeners = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = CallState::TimedOut;
            inner.listeners.clone()
        };
        for listener in listeners {
            listener.on_timeout(self);
        }
    }

    pub(crate) fn send_failed(&self) {
        let listeners = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = CallState::SendFailed;
            inner.listeners.clone()
        };
        for listener in listeners {
            listener.on_send_failed(self);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CallInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCall")
            .field("destination", &self.destination)
            .field("mtid", &self.mtid.get())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::Id;
    use std::sync::atomic::AtomicUsize;

    fn ping_call() -> RpcCall {
        RpcCall::new(
            RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Ping,
            },
            "127.0.0.1:6881".parse().unwrap(),
        )
    }

    struct Counter {
        timeouts: AtomicUsize,
        stalls: AtomicUsize,
    }

    impl CallListener for Counter {
        fn on_timeout(&self, _call: &RpcCall) {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        fn on_stall(&self, _call: &RpcCall) {
            self.stalls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn terminal_states_are_sticky() {
        let call = ping_call();
        let counter = Arc::new(Counter {
            timeouts: AtomicUsize::new(0),
            stalls: AtomicUsize::new(0),
        });
        call.add_listener(counter.clone());

        call.timeout();
        call.timeout();
        call.inject_stall();

        assert_eq!(call.state(), CallState::TimedOut);
        assert_eq!(counter.timeouts.load(Ordering::Relaxed), 1);
        assert_eq!(counter.stalls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn stall_does_not_terminate() {
        let call = ping_call();
        call.sent();
        call.inject_stall();
        assert_eq!(call.state(), CallState::Stalled);

        call.timeout();
        assert_eq!(call.state(), CallState::TimedOut);
    }

    #[test]
    fn expected_rtt_override() {
        let call = ping_call();
        assert_eq!(call.expected_rtt(), None);

        call.set_expected_rtt(Duration::from_millis(750));
        assert_eq!(call.expected_rtt(), Some(Duration::from_millis(750)));
    }
}
