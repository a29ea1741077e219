//! Per-socket RPC server: multiplexes outgoing calls onto one UDP endpoint,
//! correlates inbound datagrams with pending calls, and infers the node's
//! externally visible address from peer reports.

pub mod call;
pub mod call_table;
mod consensus;
pub mod socket;
pub mod spam_throttle;
pub mod stats;
pub mod timeout_filter;

use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Instant;

use tracing::{debug, error, info, trace};

use crate::common::{is_global_unicast, Id};
use crate::config::{Config, MTID_LENGTH, REACHABILITY_TIMEOUT};
use crate::messages::{ErrorCode, ErrorSpecific, Message, MessageType, RequestSpecific, RequestTypeSpecific};
use crate::reactor::{ConnectionManager, Selectable};
use crate::scheduler::Scheduler;
use crate::{Error, Result};

use call::{CallListener, RpcCall};
use call_table::{CallTable, Mtid};
use consensus::AddressConsensus;
use socket::SocketHandler;
use spam_throttle::SpamThrottle;
use stats::RpcStats;
use timeout_filter::ResponseTimeoutFilter;

pub use call::CallState;
pub use stats::MessageKind;

/// Version token carried in the `v` field of outgoing messages.
pub const VERSION: [u8; 4] = [75, 82, 0, 1]; // "KR" version 01

/// The routing table and message-semantics collaborator.
///
/// Implementations must be callable from arbitrary threads and must not block
/// beyond short critical sections.
pub trait DhtHandler: Send + Sync + 'static {
    /// Reserve a node id tied to the server being constructed.
    fn register_id(&self) -> Id;

    /// Release the id reserved by [DhtHandler::register_id].
    fn remove_id(&self, id: &Id);

    /// An outbound call has timed out; penalize the destination.
    fn timeout(&self, call: &RpcCall);

    /// Bookkeeping hook invoked for every correctly classified message.
    fn incoming_message(&self, message: &Message, from: SocketAddr);

    /// Apply the message's semantics: answer requests, feed lookups. Responses
    /// to requests go back out through [RpcServer::send_message].
    fn apply(&self, server: &RpcServer, message: &Message, from: SocketAddr);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Running,
    Stopped,
}

/// A pending transmission; pairs an encoded-or-to-be-encoded message with the
/// call awaiting its response, if any.
pub(crate) struct EnqueuedSend {
    pub(crate) message: Message,
    pub(crate) destination: SocketAddr,
    pub(crate) associated_call: Option<Arc<RpcCall>>,
}

impl EnqueuedSend {
    fn new(
        server: &ServerState,
        mut message: Message,
        destination: SocketAddr,
        associated_call: Option<Arc<RpcCall>>,
    ) -> Self {
        if message.version.is_none() {
            message.version = Some(VERSION.to_vec());
        }

        // BEP 42: tell ping/find-node respondees how we see them. Heavier
        // response types would carry this too if the server grew them.
        if let MessageType::Response(_) = &message.message_type {
            if message.requester_ip.is_none() {
                message.requester_ip = Some(destination);
            }
        }

        if let Some(call) = &associated_call {
            if call.expected_rtt().is_none() {
                call.set_expected_rtt(server.timeout_filter.stall_timeout());
            }
        }

        Self {
            message,
            destination,
            associated_call,
        }
    }

    pub(crate) fn encode(&self, max_packet_size: usize) -> Result<Vec<u8>> {
        let bytes = self.message.to_bytes()?;
        if bytes.len() > max_packet_size {
            return Err(Error::PacketTooLarge(bytes.len()));
        }
        Ok(bytes)
    }
}

struct ReachabilityWatchdog {
    num_receives_at_last_check: u64,
    last_change: Option<Instant>,
}

type EnqueueListener = Arc<dyn Fn(&Arc<RpcCall>) + Send + Sync>;
type DeclogTask = Box<dyn FnOnce() + Send>;

pub(crate) struct ServerState {
    pub(crate) config: Config,
    dht: Arc<dyn DhtHandler>,
    pub(crate) reactor: Arc<ConnectionManager>,
    pub(crate) scheduler: Scheduler,
    derived_id: Id,

    lifecycle: Mutex<State>,
    start_time: OnceLock<Instant>,
    handler: Mutex<Option<Arc<SocketHandler>>>,
    pipeline_tx: flume::Sender<EnqueuedSend>,
    pipeline_rx_seed: Mutex<Option<flume::Receiver<EnqueuedSend>>>,

    calls: CallTable,
    call_queue: Mutex<VecDeque<Arc<RpcCall>>>,
    awaiting_declog: Mutex<VecDeque<DeclogTask>>,
    enqueue_listeners: Mutex<Arc<Vec<EnqueueListener>>>,

    num_received: AtomicU64,
    num_sent: AtomicU64,
    stats: RpcStats,
    timeout_filter: Arc<ResponseTimeoutFilter>,
    pub(crate) throttle: SpamThrottle,
    consensus: AddressConsensus,
    unverified_lossrate: crate::common::MovingAverage,
    verified_lossrate: crate::common::MovingAverage,

    is_reachable: AtomicBool,
    watchdog: Mutex<ReachabilityWatchdog>,
}

/// One instance per bound local address. Cheap to clone; all clones share the
/// same underlying server.
#[derive(Clone)]
pub struct RpcServer {
    state: Arc<ServerState>,
}

impl RpcServer {
    /// Reserves a derived id from `dht` and prepares an unstarted server.
    /// No socket is opened until [RpcServer::start].
    pub fn new(
        config: Config,
        dht: Arc<dyn DhtHandler>,
        reactor: Arc<ConnectionManager>,
        scheduler: Scheduler,
    ) -> Self {
        let derived_id = dht.register_id();
        let max_active_calls = config.max_active_calls;
        let (pipeline_tx, pipeline_rx) = flume::unbounded();

        let state = Arc::new(ServerState {
            config,
            dht,
            reactor,
            scheduler,
            derived_id,

            lifecycle: Mutex::new(State::Initial),
            start_time: OnceLock::new(),
            handler: Mutex::new(None),
            pipeline_tx,
            pipeline_rx_seed: Mutex::new(Some(pipeline_rx)),

            calls: CallTable::new(max_active_calls),
            call_queue: Mutex::new(VecDeque::new()),
            awaiting_declog: Mutex::new(VecDeque::new()),
            enqueue_listeners: Mutex::new(Arc::new(Vec::new())),

            num_received: AtomicU64::new(0),
            num_sent: AtomicU64::new(0),
            stats: RpcStats::new(),
            timeout_filter: Arc::new(ResponseTimeoutFilter::new()),
            throttle: SpamThrottle::new(),
            consensus: AddressConsensus::new(),
            unverified_lossrate: crate::common::MovingAverage::new(0.01, 0.5),
            verified_lossrate: crate::common::MovingAverage::new(0.01, 0.5),

            is_reachable: AtomicBool::new(false),
            watchdog: Mutex::new(ReachabilityWatchdog {
                num_receives_at_last_check: 0,
                last_change: None,
            }),
        });

        Self { state }
    }

    /// Opens the socket, registers with the reactor and begins serving.
    ///
    /// Errors with [Error::IllegalState] unless the server has never been
    /// started.
    pub fn start(&self) -> Result<()> {
        {
            let mut lifecycle = self.state.lock_lifecycle();
            if *lifecycle != State::Initial {
                return Err(Error::IllegalState("already initialized"));
            }
            *lifecycle = State::Running;
        }

        info!("Starting RPC server");
        self.state.timeout_filter.reset();

        let pipeline_rx = self
            .state
            .pipeline_rx_seed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::IllegalState("pipeline already taken"))?;

        let handler = SocketHandler::open(
            &self.state,
            pipeline_rx,
            self.state.pipeline_tx.clone(),
        )?;

        let token = self
            .state
            .reactor
            .register(handler.clone() as Arc<dyn Selectable>);
        handler.activate(token);

        *self.state.lock_handler() = Some(handler.clone());

        let now = Instant::now();
        let _ = self.state.start_time.set(now);
        self.state
            .lock_watchdog()
            .last_change = Some(now);

        // flush anything enqueued before start
        handler.write_event();

        Ok(())
    }

    /// Releases the derived id, deregisters from the reactor, discards the
    /// pipeline and closes the socket. Idempotent.
    pub fn stop(&self) {
        {
            let mut lifecycle = self.state.lock_lifecycle();
            if *lifecycle == State::Stopped {
                return;
            }
            *lifecycle = State::Stopped;
        }

        if let Some(handler) = self.state.lock_handler().take() {
            handler.close();
        }
        self.state.dht.remove_id(&self.state.derived_id);
        info!("Stopped RPC server");
    }

    /// Sends a ping carrying the derived id and tracks the call.
    pub fn ping(&self, address: SocketAddr) -> Arc<RpcCall> {
        self.do_call(RpcCall::new(
            RequestSpecific {
                requester_id: self.state.derived_id,
                request_type: RequestTypeSpecific::Ping,
            },
            address,
        ))
    }

    /// Admits a call: assigns a transaction id and dispatches it, or queues it
    /// when the active-call ceiling is reached.
    pub fn do_call(&self, call: RpcCall) -> Arc<RpcCall> {
        let call = Arc::new(call);
        self.state.admit(&call);
        call
    }

    /// Enqueues a fire-and-forget send with no call correlation.
    pub fn send_message(&self, message: Message, destination: SocketAddr) {
        let send = EnqueuedSend::new(&self.state, message, destination, None);
        self.state.fill_pipe(send);
    }

    /// O(1) lookup of an in-flight call.
    pub fn find_call(&self, mtid: &Mtid) -> Option<Arc<RpcCall>> {
        self.state.calls.get(mtid)
    }

    /// Observe every admitted call. Listeners run on the admitting thread and
    /// must not block.
    pub fn on_enqueue(&self, listener: impl Fn(&Arc<RpcCall>) + Send + Sync + 'static) {
        let mut guard = self
            .state
            .enqueue_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // copy-on-write: additions are rare, iteration is hot
        let mut listeners: Vec<EnqueueListener> = guard.iter().cloned().collect();
        listeners.push(Arc::new(listener));
        *guard = Arc::new(listeners);
    }

    /// One-shot task run as soon as call-table occupancy permits.
    pub fn on_declog(&self, task: impl FnOnce() + Send + 'static) {
        self.state
            .lock_declog()
            .push_back(Box::new(task));
        self.state.do_queued_calls();
    }

    /// Reachability watchdog tick, driven by an external clock.
    pub fn check_reachability(&self, now: Instant) {
        let mut watchdog = self.state.lock_watchdog();
        let received = self.state.num_received.load(Ordering::Relaxed);

        if received != watchdog.num_receives_at_last_check {
            self.state.is_reachable.store(true, Ordering::Relaxed);
            watchdog.last_change = Some(now);
            watchdog.num_receives_at_last_check = received;
        } else if let Some(last_change) = watchdog.last_change {
            if now.duration_since(last_change) > REACHABILITY_TIMEOUT {
                self.state.is_reachable.store(false, Ordering::Relaxed);
                self.state.timeout_filter.reset();
            }
        } else {
            watchdog.last_change = Some(now);
        }
    }

    // === Getters ===

    pub fn derived_id(&self) -> &Id {
        &self.state.derived_id
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock_handler().as_ref().map(|h| h.local_addr())
    }

    /// The locally bound address if it is globally unicast in this server's family.
    pub fn public_address(&self) -> Option<IpAddr> {
        self.local_addr()
            .map(|addr| addr.ip())
            .filter(|ip| self.state.config.family.matches(ip) && is_global_unicast(ip))
    }

    /// The majority-elected (ip, port) peers report for us, if any.
    pub fn consensus_external_address(&self) -> Option<SocketAddr> {
        self.state.consensus.external_address()
    }

    /// Socket-derived public address if present, else the consensus address.
    pub fn combined_public_address(&self) -> Option<IpAddr> {
        self.public_address()
            .or_else(|| self.consensus_external_address().map(|addr| addr.ip()))
    }

    pub fn num_active_rpc_calls(&self) -> usize {
        self.state.calls.len()
    }

    pub fn num_received(&self) -> u64 {
        self.state.num_received.load(Ordering::Relaxed)
    }

    pub fn num_sent(&self) -> u64 {
        self.state.num_sent.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &RpcStats {
        &self.state.stats
    }

    pub fn timeout_filter(&self) -> Arc<ResponseTimeoutFilter> {
        self.state.timeout_filter.clone()
    }

    pub fn is_reachable(&self) -> bool {
        self.state.is_reachable.load(Ordering::Relaxed)
    }

    /// Observed timeout rate for calls to unverified nodes.
    pub fn unverified_lossrate(&self) -> f64 {
        self.state.unverified_lossrate.get()
    }

    /// Observed timeout rate for calls to verified routing-table entries.
    pub fn verified_lossrate(&self) -> f64 {
        self.state.verified_lossrate.get()
    }

    pub(crate) fn from_state(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

impl Display for RpcServer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let uptime = self
            .state
            .start_time
            .get()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        writeln!(
            f,
            "{}\tbind: {:?} consensus: {:?}",
            self.state.derived_id,
            self.local_addr(),
            self.consensus_external_address()
        )?;
        write!(
            f,
            "rx: {} tx: {} active: {} stallTimeout: {:?} loss: {:.3} loss (verified): {:.3} uptime: {:?}",
            self.num_received(),
            self.num_sent(),
            self.num_active_rpc_calls(),
            self.state.timeout_filter.stall_timeout(),
            self.unverified_lossrate(),
            self.verified_lossrate(),
            uptime
        )
    }
}

impl ServerState {
    /// Fires enqueue observers, then either dispatches under a fresh
    /// transaction id or queues the call until a slot frees up.
    fn admit(self: &Arc<Self>, call: &Arc<RpcCall>) {
        let listeners = self
            .enqueue_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners.iter() {
            listener(call);
        }

        match self.calls.try_insert(call) {
            Some(mtid) => self.dispatch_call(call, mtid),
            None => {
                debug!("Queueing RPC call, no slots available at the moment");
                self.lock_call_queue().push_back(call.clone());
            }
        }
    }

    fn dispatch_call(self: &Arc<Self>, call: &Arc<RpcCall>, mtid: Mtid) {
        call.add_listener(Arc::new(ServerCallListener {
            server: Arc::downgrade(self),
        }));

        // Routing-table entries keep track of their own RTTs, and they are
        // biased towards lower RTTs than the general population encountered
        // during lookups; keep them out of the estimator.
        if !call.known_reachable_at_creation_time() {
            self.timeout_filter.register_call(call);
        }

        let message = Message {
            transaction_id: mtid.to_vec(),
            version: Some(VERSION.to_vec()),
            requester_ip: None,
            read_only: None,
            message_type: MessageType::Request(call.request().clone()),
        };

        let send = EnqueuedSend::new(self, message, call.destination(), Some(call.clone()));
        self.fill_pipe(send);
    }

    fn fill_pipe(&self, send: EnqueuedSend) {
        let _ = self.pipeline_tx.send(send);
        let handler = self.lock_handler().clone();
        if let Some(handler) = handler {
            handler.write_event();
        }
    }

    /// Drains queued calls into freed slots, then runs declog tasks while
    /// capacity remains.
    pub(crate) fn do_queued_calls(self: &Arc<Self>) {
        loop {
            if !self.calls.has_capacity() {
                return;
            }
            let Some(call) = self.lock_call_queue().pop_front() else {
                break;
            };
            self.admit(&call);
        }

        loop {
            if !self.calls.has_capacity() {
                return;
            }
            let Some(task) = self.lock_declog().pop_front() else {
                break;
            };
            task();
        }
    }

    pub(crate) fn count_received(&self, wire_bytes: usize) {
        self.num_received.fetch_add(1, Ordering::Relaxed);
        self.stats.add_received_bytes(wire_bytes);
    }

    pub(crate) fn count_sent(&self, message_type: &MessageType, wire_bytes: usize) {
        self.num_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.add_sent_message(message_type);
        self.stats.add_sent_bytes(wire_bytes);
    }

    /// Worker-side classification of one prefiltered datagram: decode, parse,
    /// then correlate with a pending call or hand off to the DHT layer.
    pub(crate) fn handle_packet(self: &Arc<Self>, packet: bytes::Bytes, source: SocketAddr) {
        // Bencode syntax gate. Schema problems are reported further down with
        // the sender's transaction id; raw garbage gets a zeroed one.
        let value: serde_bencode::value::Value = match serde_bencode::from_bytes(&packet) {
            Ok(value) => value,
            Err(error) => {
                debug!(?error, ?source, length = packet.len(), "Failed to decode inbound datagram");
                self.send_error(
                    source,
                    vec![0; 4],
                    ErrorCode::ProtocolError,
                    format!("invalid bencoding: {error}"),
                );
                return;
            }
        };

        let message = match Message::from_bytes(&packet, |t| self.calls.method_of(t)) {
            Ok(message) => message,
            Err(error) => {
                let (mtid, code) = parse_failure_details(&value);
                debug!(?error, ?source, "Failed to parse inbound message");
                self.send_error(source, mtid, code, error.to_string());
                return;
            }
        };

        trace!(?message, ?source, length = packet.len(), "Received message");
        self.stats.add_received_message(&message.message_type);

        // just respond to incoming requests, no need to match them to pending ones
        if let MessageType::Request(_) = message.message_type {
            self.handle_message(&message, source);
            return;
        }

        if matches!(message.message_type, MessageType::Response(_))
            && message.transaction_id.len() != MTID_LENGTH
        {
            debug!(mtid = ?message.transaction_id, "Response with invalid transaction id length");
            let description = format!(
                "received a response with a transaction id length of {} bytes, expected: {} bytes",
                message.transaction_id.len(),
                MTID_LENGTH
            );
            self.send_error(
                source,
                message.transaction_id.clone(),
                ErrorCode::ServerError,
                description,
            );
            return;
        }

        // check if this is a response to an outstanding request
        if let Ok(mtid) = Mtid::try_from(message.transaction_id.as_slice()) {
            if let Some(call) = self.calls.get(&mtid) {
                if call.destination() == source {
                    // remove first; only the remover completes the call
                    if self.calls.remove_if_same(&mtid, &call) {
                        call.responded(message.clone());
                        self.do_queued_calls();
                        // apply after checking for a proper response
                        self.handle_message(&message, source);
                    }
                    return;
                }

                // Transaction id matched but the source is not the request's
                // destination. With random 48 bit ids chance is exceedingly
                // unlikely; indicates a port-mangling NAT, a multihomed host
                // on a wildcard bind, or spoofing. Ignore the response but
                // expect the upcoming timeout.
                error!(
                    request_destination = ?call.destination(),
                    response_source = ?source,
                    "mtid matched, socket address did not, ignoring message"
                );
                call.inject_stall();
                return;
            }
        }

        if let MessageType::Response(_) = message.message_type {
            // no call found; outside the restart grace window that deserves
            // telling the sender
            let uptime = self
                .start_time
                .get()
                .map(|t| t.elapsed())
                .unwrap_or_default();
            if uptime > self.config.stray_reply_grace {
                debug!(mtid = ?message.transaction_id, "Cannot find RPC call for response");
                self.send_error(
                    source,
                    message.transaction_id.clone(),
                    ErrorCode::ServerError,
                    "received a response message whose transaction ID did not match a pending request or transaction expired".into(),
                );
            }
            return;
        }

        if let MessageType::Error(_) = message.message_type {
            self.handle_message(&message, source);
            return;
        }

        debug!(?message, "not sure how to handle message");
    }

    fn handle_message(self: &Arc<Self>, message: &Message, from: SocketAddr) {
        if let MessageType::Response(_) = message.message_type {
            if let Some(reported) = message.requester_ip {
                self.consensus.observe(from.ip(), reported);
            }
        }
        self.dht.incoming_message(message, from);
        self.dht
            .apply(&RpcServer::from_state(self.clone()), message, from);
    }

    fn send_error(
        &self,
        destination: SocketAddr,
        transaction_id: Vec<u8>,
        code: ErrorCode,
        description: String,
    ) {
        let message = Message {
            transaction_id,
            version: Some(VERSION.to_vec()),
            requester_ip: None,
            read_only: None,
            message_type: MessageType::Error(ErrorSpecific {
                code: code.code(),
                description,
            }),
        };
        let send = EnqueuedSend::new(self, message, destination, None);
        self.fill_pipe(send);
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, State> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handler(&self) -> MutexGuard<'_, Option<Arc<SocketHandler>>> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_call_queue(&self) -> MutexGuard<'_, VecDeque<Arc<RpcCall>>> {
        self.call_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_declog(&self) -> MutexGuard<'_, VecDeque<DeclogTask>> {
        self.awaiting_declog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_watchdog(&self) -> MutexGuard<'_, ReachabilityWatchdog> {
        self.watchdog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Terminal-event bookkeeping the server installs on every dispatched call.
struct ServerCallListener {
    server: Weak<ServerState>,
}

impl CallListener for ServerCallListener {
    fn on_timeout(&self, call: &RpcCall) {
        let Some(server) = self.server.upgrade() else {
            return;
        };

        server.stats.add_timeout();
        if call.known_reachable_at_creation_time() {
            server.verified_lossrate.update(1.0);
        } else {
            server.unverified_lossrate.update(1.0);
        }

        if let Some(mtid) = call.mtid() {
            server.calls.remove_if_same(&mtid, call);
        }
        server.dht.timeout(call);
        server.do_queued_calls();
    }

    fn on_response(&self, call: &RpcCall, _response: &Message) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        if call.known_reachable_at_creation_time() {
            server.verified_lossrate.update(0.0);
        } else {
            server.unverified_lossrate.update(0.0);
        }
    }

    fn on_send_failed(&self, call: &RpcCall) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        if let Some(mtid) = call.mtid() {
            server.calls.remove_if_same(&mtid, call);
        }
        server.do_queued_calls();
    }
}

/// Best-effort extraction of the offending transaction id and error code for
/// replies to messages that decoded as bencode but failed to parse.
fn parse_failure_details(value: &serde_bencode::value::Value) -> (Vec<u8>, ErrorCode) {
    use serde_bencode::value::Value;

    let Value::Dict(dict) = value else {
        return (vec![0; MTID_LENGTH], ErrorCode::ProtocolError);
    };

    let mtid = match dict.get("t".as_bytes()) {
        Some(Value::Bytes(bytes)) => bytes.clone(),
        _ => vec![0; MTID_LENGTH],
    };

    let code = match (dict.get("y".as_bytes()), dict.get("q".as_bytes())) {
        (Some(Value::Bytes(y)), Some(Value::Bytes(q)))
            if y.as_slice() == b"q"
                && q.as_slice() != b"ping"
                && q.as_slice() != b"find_node" =>
        {
            ErrorCode::MethodUnknown
        }
        _ => ErrorCode::ProtocolError,
    };

    (mtid, code)
}
