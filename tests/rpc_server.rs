//! End-to-end RPC server scenarios against real localhost UDP stub peers.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use krpc::messages::{
    ErrorCode, Message, MessageType, PingResponseArguments, RequestSpecific, RequestTypeSpecific,
    ResponseSpecific,
};
use krpc::rpc::call::{CallListener, CallState, RpcCall};
use krpc::rpc::timeout_filter::RPC_CALL_TIMEOUT_MAX;
use krpc::{AddressFamily, Config, ConnectionManager, DhtHandler, Error, Id, RpcServer, Scheduler};

#[derive(Default)]
struct StubDht {
    removed_ids: AtomicUsize,
    timeouts: AtomicUsize,
    incoming: Mutex<Vec<(Message, SocketAddr)>>,
}

impl DhtHandler for StubDht {
    fn register_id(&self) -> Id {
        Id::random()
    }

    fn remove_id(&self, _id: &Id) {
        self.removed_ids.fetch_add(1, Ordering::Relaxed);
    }

    fn timeout(&self, _call: &RpcCall) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn incoming_message(&self, message: &Message, from: SocketAddr) {
        self.incoming.lock().unwrap().push((message.clone(), from));
    }

    fn apply(&self, server: &RpcServer, message: &Message, from: SocketAddr) {
        // answer ping requests the way a routing layer would
        if let MessageType::Request(RequestSpecific {
            request_type: RequestTypeSpecific::Ping,
            ..
        }) = &message.message_type
        {
            server.send_message(
                Message {
                    transaction_id: message.transaction_id.clone(),
                    version: None,
                    requester_ip: None,
                    read_only: None,
                    message_type: MessageType::Response(ResponseSpecific::Ping(
                        PingResponseArguments {
                            responder_id: *server.derived_id(),
                        },
                    )),
                },
                from,
            );
        }
    }
}

#[derive(Default)]
struct EventRecorder {
    sent: AtomicUsize,
    responses: AtomicUsize,
    timeouts: AtomicUsize,
    stalls: AtomicUsize,
}

impl CallListener for EventRecorder {
    fn on_sent(&self, _call: &RpcCall) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }
    fn on_response(&self, _call: &RpcCall, _response: &Message) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }
    fn on_timeout(&self, _call: &RpcCall) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }
    fn on_stall(&self, _call: &RpcCall) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }
}

struct TestNode {
    server: RpcServer,
    dht: Arc<StubDht>,
    // kept alive for the duration of the test
    _reactor: Arc<ConnectionManager>,
    _scheduler: Scheduler,
}

fn localhost_config() -> Config {
    Config {
        family: AddressFamily::Ipv4,
        bind_address: Some("127.0.0.1".parse().unwrap()),
        port: Some(0),
        ..Default::default()
    }
}

fn start_node(config: Config) -> TestNode {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dht = Arc::new(StubDht::default());
    let reactor = ConnectionManager::new().unwrap();
    let scheduler = Scheduler::new(2);

    let server = RpcServer::new(config, dht.clone(), reactor.clone(), scheduler.clone());
    server.start().unwrap();

    TestNode {
        server,
        dht,
        _reactor: reactor,
        _scheduler: scheduler,
    }
}

fn stub_peer() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

fn recv_message(socket: &UdpSocket) -> (Message, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (amount, from) = socket.recv_from(&mut buf).unwrap();
    (
        Message::from_bytes(&buf[..amount], |_| None).unwrap(),
        from,
    )
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn ping_call(node: &TestNode, destination: SocketAddr) -> (RpcCall, Arc<EventRecorder>) {
    let call = RpcCall::new(
        RequestSpecific {
            requester_id: *node.server.derived_id(),
            request_type: RequestTypeSpecific::Ping,
        },
        destination,
    );
    let recorder = Arc::new(EventRecorder::default());
    call.add_listener(recorder.clone());
    (call, recorder)
}

#[test]
fn happy_ping() {
    let node = start_node(localhost_config());
    let (peer, peer_addr) = stub_peer();

    let (call, recorder) = ping_call(&node, peer_addr);
    let call = node.server.do_call(call);

    let (request, server_addr) = recv_message(&peer);
    assert_eq!(request.transaction_id.len(), 6);
    assert_eq!(
        request.message_type,
        MessageType::Request(RequestSpecific {
            requester_id: *node.server.derived_id(),
            request_type: RequestTypeSpecific::Ping,
        })
    );

    let responder_id = Id::random();
    let reply = Message {
        transaction_id: request.transaction_id.clone(),
        version: None,
        requester_ip: Some("203.0.113.9:50000".parse().unwrap()),
        read_only: None,
        message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
            responder_id,
        })),
    };
    peer.send_to(&reply.to_bytes().unwrap(), server_addr).unwrap();

    wait_for("ping response", || {
        recorder.responses.load(Ordering::Relaxed) == 1
    });

    assert_eq!(call.state(), CallState::Responded);
    assert_eq!(recorder.sent.load(Ordering::Relaxed), 1);
    assert_eq!(node.server.num_active_rpc_calls(), 0);
    assert_eq!(node.server.num_sent(), 1);
    assert_eq!(node.server.num_received(), 1);
    assert_eq!(node.server.stats().sent_count(krpc::rpc::MessageKind::Request), 1);
    assert_eq!(
        node.server.stats().received_count(krpc::rpc::MessageKind::Response),
        1
    );

    // one observation is far below the election threshold
    assert_eq!(node.server.consensus_external_address(), None);

    // the DHT layer saw the response too
    wait_for("incoming_message", || {
        !node.dht.incoming.lock().unwrap().is_empty()
    });
}

#[test]
fn answers_requests_with_echoed_transaction_id() {
    let node = start_node(localhost_config());
    let (peer, peer_addr) = stub_peer();
    let server_addr = node.server.local_addr().unwrap();

    // arbitrary-length transaction ids from peers are echoed verbatim
    let request = Message {
        transaction_id: b"ab".to_vec(),
        version: None,
        requester_ip: None,
        read_only: None,
        message_type: MessageType::Request(RequestSpecific {
            requester_id: Id::random(),
            request_type: RequestTypeSpecific::Ping,
        }),
    };
    peer.send_to(&request.to_bytes().unwrap(), server_addr)
        .unwrap();

    let (response, _) = recv_message(&peer);
    assert_eq!(response.transaction_id, b"ab".to_vec());
    assert_eq!(
        response.message_type,
        MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
            responder_id: *node.server.derived_id(),
        }))
    );
    // BEP 42: the response reports how we see the requester
    assert_eq!(response.requester_ip, Some(peer_addr));
}

#[test]
fn malformed_input_gets_protocol_error() {
    let node = start_node(localhost_config());
    let (peer, _) = stub_peer();
    let server_addr = node.server.local_addr().unwrap();

    // passes the read-loop prefilter ('d', >= 10 bytes) but is not bencode
    peer.send_to(b"dthis is not bencoded!!", server_addr)
        .unwrap();

    let (reply, _) = recv_message(&peer);
    assert_eq!(reply.transaction_id, vec![0, 0, 0, 0]);
    match reply.message_type {
        MessageType::Error(error) => {
            assert_eq!(error.code, ErrorCode::ProtocolError.code());
        }
        other => panic!("expected error message, got {other:?}"),
    }

    assert_eq!(node.server.num_received(), 1);
    assert_eq!(node.server.num_active_rpc_calls(), 0);
}

#[test]
fn stray_response_outside_grace_window() {
    let mut config = localhost_config();
    config.stray_reply_grace = Duration::ZERO;
    let node = start_node(config);

    let (peer, _) = stub_peer();
    let server_addr = node.server.local_addr().unwrap();

    let stray = Message {
        transaction_id: vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF],
        version: None,
        requester_ip: None,
        read_only: None,
        message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
            responder_id: Id::random(),
        })),
    };
    peer.send_to(&stray.to_bytes().unwrap(), server_addr)
        .unwrap();

    let (reply, _) = recv_message(&peer);
    assert_eq!(
        reply.transaction_id,
        vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
    );
    match reply.message_type {
        MessageType::Error(error) => {
            assert_eq!(error.code, ErrorCode::ServerError.code());
        }
        other => panic!("expected error message, got {other:?}"),
    }
}

#[test]
fn stray_response_within_grace_window_is_dropped() {
    let node = start_node(localhost_config());
    let (peer, _) = stub_peer();
    let server_addr = node.server.local_addr().unwrap();

    let stray = Message {
        transaction_id: vec![1, 2, 3, 4, 5, 6],
        version: None,
        requester_ip: None,
        read_only: None,
        message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
            responder_id: Id::random(),
        })),
    };
    peer.send_to(&stray.to_bytes().unwrap(), server_addr)
        .unwrap();

    wait_for("datagram counted", || node.server.num_received() == 1);

    let mut buf = [0u8; 2048];
    peer.set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    assert!(
        peer.recv_from(&mut buf).is_err(),
        "fresh servers must drop strays silently"
    );
}

#[test]
fn wrong_length_transaction_id_is_rejected() {
    let mut config = localhost_config();
    config.stray_reply_grace = Duration::ZERO;
    let node = start_node(config);
    let (peer, _) = stub_peer();
    let server_addr = node.server.local_addr().unwrap();

    let response = Message {
        transaction_id: vec![1, 2, 3],
        version: None,
        requester_ip: None,
        read_only: None,
        message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
            responder_id: Id::random(),
        })),
    };
    peer.send_to(&response.to_bytes().unwrap(), server_addr)
        .unwrap();

    let (reply, _) = recv_message(&peer);
    assert_eq!(reply.transaction_id, vec![1, 2, 3]);
    match reply.message_type {
        MessageType::Error(error) => {
            assert_eq!(error.code, ErrorCode::ServerError.code());
            assert!(error.description.contains("transaction id length"));
        }
        other => panic!("expected error message, got {other:?}"),
    }
}

#[test]
fn response_from_wrong_source_stalls_the_call() {
    let node = start_node(localhost_config());
    let (destination_peer, destination_addr) = stub_peer();
    let (imposter, _) = stub_peer();

    let (call, recorder) = ping_call(&node, destination_addr);
    let call = node.server.do_call(call);

    let (request, server_addr) = recv_message(&destination_peer);

    // correct transaction id, wrong source socket
    let reply = Message {
        transaction_id: request.transaction_id,
        version: None,
        requester_ip: None,
        read_only: None,
        message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
            responder_id: Id::random(),
        })),
    };
    imposter
        .send_to(&reply.to_bytes().unwrap(), server_addr)
        .unwrap();

    wait_for("stall injection", || {
        recorder.stalls.load(Ordering::Relaxed) == 1
    });

    assert_eq!(call.state(), CallState::Stalled);
    assert_eq!(recorder.responses.load(Ordering::Relaxed), 0);
    assert_eq!(node.server.num_active_rpc_calls(), 1);
    let mtid = call.mtid().unwrap();
    assert!(node.server.find_call(&mtid).is_some());
}

#[test]
fn backpressure_queues_and_drains_excess_calls() {
    let mut config = localhost_config();
    config.max_active_calls = 2;
    let node = start_node(config);

    let (_hole_a, hole_a_addr) = stub_peer();
    let (_hole_b, hole_b_addr) = stub_peer();

    let first = node.server.ping(hole_a_addr);
    let second = node.server.ping(hole_b_addr);
    wait_for("both calls admitted", || {
        first.mtid().is_some() && second.mtid().is_some()
    });

    let (queued, _recorder) = ping_call(&node, hole_b_addr);
    let queued = node.server.do_call(queued);

    assert_eq!(queued.mtid(), None, "queued calls hold no transaction id");
    assert_eq!(node.server.num_active_rpc_calls(), 2);

    // the external timer declares the first call dead; its slot drains the queue
    first.timeout();

    wait_for("queued call dispatched", || queued.mtid().is_some());
    assert_eq!(node.server.num_active_rpc_calls(), 2);
    assert_eq!(node.dht.timeouts.load(Ordering::Relaxed), 1);
    assert_ne!(queued.mtid(), second.mtid());
}

#[test]
fn declog_tasks_run_when_capacity_frees_up() {
    let mut config = localhost_config();
    config.max_active_calls = 1;
    let node = start_node(config);

    let (_hole, hole_addr) = stub_peer();
    let call = node.server.ping(hole_addr);
    wait_for("call admitted", || call.mtid().is_some());

    let ran = Arc::new(AtomicUsize::new(0));
    let observed = ran.clone();
    node.server.on_declog(move || {
        observed.fetch_add(1, Ordering::Relaxed);
    });
    assert_eq!(ran.load(Ordering::Relaxed), 0, "table is still clogged");

    call.timeout();
    wait_for("declog task", || ran.load(Ordering::Relaxed) == 1);
}

#[test]
fn enqueue_listeners_observe_admissions() {
    let node = start_node(localhost_config());
    let (_hole, hole_addr) = stub_peer();

    let seen = Arc::new(AtomicUsize::new(0));
    let observed = seen.clone();
    node.server.on_enqueue(move |_call| {
        observed.fetch_add(1, Ordering::Relaxed);
    });

    node.server.ping(hole_addr);
    node.server.ping(hole_addr);

    assert_eq!(seen.load(Ordering::Relaxed), 2);
}

#[test]
fn consensus_elects_from_live_traffic() {
    let node = start_node(localhost_config());

    let majority: SocketAddr = "203.0.113.1:6881".parse().unwrap();
    let minority: SocketAddr = "198.51.100.2:6881".parse().unwrap();

    // Elections need more than 20 distinct voters, and the origin map is
    // keyed by voter IP; loopback routes the whole 127.0.0.0/8, so each stub
    // peer gets its own source address.
    for n in 0..21u8 {
        let ip: IpAddr = format!("127.0.0.{}", n + 2).parse().unwrap();
        let peer = UdpSocket::bind((ip, 0)).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let reported = if n < 15 { majority } else { minority };

        let (call, recorder) = ping_call(&node, peer_addr);
        node.server.do_call(call);

        let (request, server_addr) = recv_message(&peer);
        let reply = Message {
            transaction_id: request.transaction_id,
            version: None,
            requester_ip: Some(reported),
            read_only: None,
            message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
                responder_id: Id::random(),
            })),
        };
        peer.send_to(&reply.to_bytes().unwrap(), server_addr).unwrap();

        wait_for("vote processed", || {
            recorder.responses.load(Ordering::Relaxed) == 1
        });
    }

    wait_for("consensus election", || {
        node.server.consensus_external_address().is_some()
    });
    assert_eq!(node.server.consensus_external_address(), Some(majority));
    assert_eq!(node.server.combined_public_address(), Some(majority.ip()));
}

#[test]
fn reachability_watchdog() {
    let node = start_node(localhost_config());
    let (peer, peer_addr) = stub_peer();

    // a full round trip seeds both the counters and the timeout filter
    let (call, recorder) = ping_call(&node, peer_addr);
    node.server.do_call(call);
    let (request, server_addr) = recv_message(&peer);
    let reply = Message {
        transaction_id: request.transaction_id,
        version: None,
        requester_ip: None,
        read_only: None,
        message_type: MessageType::Response(ResponseSpecific::Ping(PingResponseArguments {
            responder_id: Id::random(),
        })),
    };
    peer.send_to(&reply.to_bytes().unwrap(), server_addr).unwrap();
    wait_for("response", || recorder.responses.load(Ordering::Relaxed) == 1);

    let now = Instant::now();
    node.server.check_reachability(now);
    assert!(node.server.is_reachable());
    assert_ne!(
        node.server.timeout_filter().stall_timeout(),
        RPC_CALL_TIMEOUT_MAX,
        "round trip should have produced an RTT sample"
    );

    // silence past the reachability timeout flips the flag and resets the filter
    node.server
        .check_reachability(now + Duration::from_secs(61));
    assert!(!node.server.is_reachable());
    assert_eq!(
        node.server.timeout_filter().stall_timeout(),
        RPC_CALL_TIMEOUT_MAX
    );
}

#[test]
fn lifecycle() {
    let dht = Arc::new(StubDht::default());
    let reactor = ConnectionManager::new().unwrap();
    let scheduler = Scheduler::new(1);
    let server = RpcServer::new(localhost_config(), dht.clone(), reactor, scheduler);

    assert_eq!(server.local_addr(), None);
    server.start().unwrap();
    assert!(server.local_addr().is_some());

    // starting a running server is a programmer error
    assert!(matches!(server.start(), Err(Error::IllegalState(_))));

    server.stop();
    assert_eq!(dht.removed_ids.load(Ordering::Relaxed), 1);

    // idempotent
    server.stop();
    assert_eq!(dht.removed_ids.load(Ordering::Relaxed), 1);

    // a stopped server does not come back
    assert!(matches!(server.start(), Err(Error::IllegalState(_))));
}

#[test]
fn ping_helper_uses_derived_id() {
    let node = start_node(localhost_config());
    let (peer, peer_addr) = stub_peer();

    node.server.ping(peer_addr);
    let (request, _) = recv_message(&peer);

    match request.message_type {
        MessageType::Request(request) => {
            assert_eq!(request.requester_id, *node.server.derived_id());
            assert_eq!(request.request_type, RequestTypeSpecific::Ping);
        }
        other => panic!("expected request, got {other:?}"),
    }
}
