//! Non-blocking datagram endpoint: readiness-driven read loop and the
//! single-writer send state machine.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use bytes::Bytes;
use mio::net::UdpSocket;
use mio::{Interest, Token};
use tracing::{debug, error, trace, warn};

use crate::config::{RECEIVE_BUFFER_SIZE, UDP_SOCKET_BUFFER_SIZE};
use crate::reactor::Selectable;
use crate::rpc::{EnqueuedSend, ServerState};

pub const DEFAULT_PORT: u16 = 6881;

const NOT_INITIALIZED: u8 = 0;
const IDLE: u8 = 1;
const WRITING: u8 = 2;
const AWAITING_READINESS: u8 = 3;
const CLOSED: u8 = 4;

/// Owns the UDP socket. Reads happen on the reactor thread; writes are
/// performed by whichever thread wins the IDLE -> WRITING exchange, so at most
/// one thread sends at any instant.
pub(crate) struct SocketHandler {
    socket: UdpSocket,
    local_addr: SocketAddr,
    write_state: AtomicU8,
    pipeline_rx: flume::Receiver<EnqueuedSend>,
    pipeline_tx: flume::Sender<EnqueuedSend>,
    token: OnceLock<Token>,
    self_ref: OnceLock<Weak<SocketHandler>>,
    server: Weak<ServerState>,
}

impl SocketHandler {
    pub(crate) fn open(
        server: &Arc<ServerState>,
        pipeline_rx: flume::Receiver<EnqueuedSend>,
        pipeline_tx: flume::Sender<EnqueuedSend>,
    ) -> crate::Result<Arc<Self>> {
        let config = &server.config;
        let bind_ip = config
            .bind_address
            .unwrap_or_else(|| config.family.unspecified());

        let std_socket = if let Some(port) = config.port {
            std::net::UdpSocket::bind(SocketAddr::new(bind_ip, port))?
        } else {
            match std::net::UdpSocket::bind(SocketAddr::new(bind_ip, DEFAULT_PORT)) {
                Ok(socket) => Ok(socket),
                Err(_) => std::net::UdpSocket::bind(SocketAddr::new(bind_ip, 0)),
            }?
        };

        // Raise OS-level buffers; the defaults drop packets under DHT load.
        set_socket_buffers(&std_socket, UDP_SOCKET_BUFFER_SIZE)?;

        let local_addr = std_socket.local_addr()?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket);

        let handler = Arc::new(Self {
            socket,
            local_addr,
            write_state: AtomicU8::new(NOT_INITIALIZED),
            pipeline_rx,
            pipeline_tx,
            token: OnceLock::new(),
            self_ref: OnceLock::new(),
            server: Arc::downgrade(server),
        });
        let _ = handler.self_ref.set(Arc::downgrade(&handler));

        Ok(handler)
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Called once registered with the reactor; readiness events may arrive
    /// from this point on.
    pub(crate) fn activate(&self, token: Token) {
        let _ = self.token.set(token);
        let _ = self.write_state.compare_exchange(
            NOT_INITIALIZED,
            IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Deregisters, discards queued sends and refuses further writes.
    pub(crate) fn close(&self) {
        if self.write_state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        if let (Some(&token), Some(server)) = (self.token.get(), self.server.upgrade()) {
            server.reactor.deregister(token);
        }
        while self.pipeline_rx.try_recv().is_ok() {}
    }

    fn read_event(&self) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        let family = server.config.family;

        let mut buf = [0u8; RECEIVE_BUFFER_SIZE];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((amount, from)) => {
                    // * no conceivable DHT message is smaller than 10 bytes
                    // * all DHT messages start with a 'd' for dictionary
                    // * port 0 is reserved
                    // -> discard junk here, before allocating anything for it
                    if amount < 10 || buf[0] != b'd' || from.port() == 0 {
                        continue;
                    }
                    if !family.matches(&from.ip()) {
                        continue;
                    }
                    if server.throttle.is_spam(&from.ip()) {
                        continue;
                    }

                    // copy out of the loop buffer; decoding happens on a worker
                    let packet = Bytes::copy_from_slice(&buf[..amount]);

                    let worker_state = server.clone();
                    server.scheduler.execute(move || {
                        worker_state.handle_packet(packet, from);
                    });

                    server.count_received(amount + family.header_length());
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => {
                    warn!(?error, "recv_from failed unexpectedly");
                    break;
                }
            }
        }
    }

    pub(crate) fn write_event(self: &Arc<Self>) {
        // simply assume nobody else is writing and attempt to do it; if the
        // exchange fails it's the current writer's job to double-check after
        // releasing the claim
        if self
            .write_state
            .compare_exchange(IDLE, WRITING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let Some(server) = self.server.upgrade() else {
            return;
        };
        let family = server.config.family;

        // we are now the exclusive writer for this socket
        while let Ok(send) = self.pipeline_rx.try_recv() {
            let buf = match send.encode(family.max_packet_size()) {
                Ok(buf) => buf,
                Err(error) => {
                    error!(?error, destination = ?send.destination, "encode failed");
                    if let Some(call) = &send.associated_call {
                        call.send_failed();
                    }
                    continue;
                }
            };

            match self.socket.send_to(&buf, send.destination) {
                Ok(0) => {
                    self.await_readiness(&server, send);
                    return;
                }
                Ok(bytes_sent) => {
                    trace!(destination = ?send.destination, length = bytes_sent, "sent message");

                    if let Some(call) = &send.associated_call {
                        call.sent();
                    }

                    server.count_sent(&send.message.message_type, bytes_sent + family.header_length());
                }
                Err(error)
                    if error.kind() == ErrorKind::WouldBlock
                        || error.raw_os_error() == Some(libc::ENOBUFS) =>
                {
                    // network queues are full -> back off until the selector
                    // reports the socket writable again
                    self.await_readiness(&server, send);
                    return;
                }
                Err(error) => {
                    error!(?error, destination = ?send.destination, "error while attempting to send");
                    if let Some(call) = &send.associated_call {
                        call.send_failed();
                    }
                    break;
                }
            }
        }

        // release claim on the socket
        let _ = self
            .write_state
            .compare_exchange(WRITING, IDLE, Ordering::AcqRel, Ordering::Acquire);

        // check if we have to pick it up again due to a racing producer;
        // schedule async to avoid unbounded stacks
        if !self.pipeline_rx.is_empty() {
            let handler = self.clone();
            server.scheduler.execute(move || handler.write_event());
        }
    }

    fn await_readiness(&self, server: &Arc<ServerState>, send: EnqueuedSend) {
        // tail requeue; the protocol does not guarantee cross-peer ordering
        let _ = self.pipeline_tx.send(send);
        self.write_state
            .store(AWAITING_READINESS, Ordering::Release);
        if let Some(&token) = self.token.get() {
            server.reactor.interest_ops_changed(token);
        }
    }
}

impl Selectable for SocketHandler {
    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn interest(&self) -> Interest {
        if self.write_state.load(Ordering::Acquire) == AWAITING_READINESS {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    fn selection_event(&self, readable: bool, writable: bool) {
        // schedule async writes first before spending thread time on reads
        if writable {
            let became_idle = self
                .write_state
                .compare_exchange(
                    AWAITING_READINESS,
                    IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
            if became_idle {
                if let (Some(&token), Some(server)) = (self.token.get(), self.server.upgrade()) {
                    server.reactor.interest_ops_changed(token);

                    if let Some(handler) = self.self_ref.get().and_then(Weak::upgrade) {
                        server.scheduler.execute(move || handler.write_event());
                    }
                }
            }
        }
        if readable {
            self.read_event();
        }
    }

    fn do_state_checks(&self, _now: Instant) {
        // the socket can only close through close(); nothing to detect here
        if self.write_state.load(Ordering::Acquire) == CLOSED {
            debug!("state check on closed socket handler");
        }
    }
}

#[cfg(unix)]
fn set_socket_buffers(socket: &std::net::UdpSocket, size: i32) -> std::io::Result<()> {
    use libc::{setsockopt, SOL_SOCKET, SO_RCVBUF, SO_SNDBUF};
    use std::io::Error;

    let fd = socket.as_raw_fd();

    // The OS may clamp or reject large values depending on sysctl limits.
    let recv = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_RCVBUF,
            &size as *const _ as *const _,
            std::mem::size_of_val(&size) as u32,
        )
    };
    if recv != 0 {
        return Err(Error::last_os_error());
    }

    let send = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_SNDBUF,
            &size as *const _ as *const _,
            std::mem::size_of_val(&size) as u32,
        )
    };
    if send != 0 {
        return Err(Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(unix))]
fn set_socket_buffers(_socket: &std::net::UdpSocket, _size: i32) -> std::io::Result<()> {
    Ok(())
}
