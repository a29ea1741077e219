//! Readiness-notification reactor. One dedicated thread polls the OS selector
//! and dispatches events to registered [Selectable]s; everything else runs on
//! the shared [crate::scheduler::Scheduler].

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{error, trace};

const WAKER_TOKEN: Token = Token(0);
const STATE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A non-blocking endpoint driven by the reactor.
pub trait Selectable: Send + Sync + 'static {
    /// The file descriptor to select on.
    fn raw_fd(&self) -> RawFd;

    /// Current interest set; re-read after [ConnectionManager::interest_ops_changed].
    fn interest(&self) -> Interest;

    /// Readiness delivery, called on the reactor thread. Must not block.
    fn selection_event(&self, readable: bool, writable: bool);

    /// Periodic housekeeping, roughly once per second.
    fn do_state_checks(&self, now: Instant);
}

enum Command {
    Register(Token, Arc<dyn Selectable>),
    Deregister(Token),
    InterestOpsChanged(Token),
    Shutdown,
}

/// Owns the poll loop thread. Registration and interest changes are posted as
/// commands and applied on the reactor thread, so no selector state is shared.
pub struct ConnectionManager {
    cmd_tx: flume::Sender<Command>,
    waker: Waker,
    next_token: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (cmd_tx, cmd_rx) = flume::unbounded();

        let thread = thread::Builder::new()
            .name("krpc-reactor".into())
            .spawn(move || run_loop(poll, cmd_rx))?;

        Ok(Arc::new(Self {
            cmd_tx,
            waker,
            next_token: AtomicUsize::new(1),
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Registers `selectable` with its current interest set and returns its token.
    pub fn register(&self, selectable: Arc<dyn Selectable>) -> Token {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.send(Command::Register(token, selectable));
        token
    }

    pub fn deregister(&self, token: Token) {
        self.send(Command::Deregister(token));
    }

    /// Re-reads the selectable's [Selectable::interest] and updates the selector.
    pub fn interest_ops_changed(&self, token: Token) {
        self.send(Command::InterestOpsChanged(token));
    }

    fn send(&self, cmd: Command) {
        let _ = self.cmd_tx.send(cmd);
        if let Err(e) = self.waker.wake() {
            error!(?e, "failed to wake reactor");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.send(Command::Shutdown);
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_loop(mut poll: Poll, cmd_rx: flume::Receiver<Command>) {
    let mut events = Events::with_capacity(256);
    let mut selectables: HashMap<Token, Arc<dyn Selectable>> = HashMap::new();
    let mut last_state_check = Instant::now();

    loop {
        // Apply pending registrations before sleeping so a register followed
        // by traffic is never missed.
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                Command::Register(token, selectable) => {
                    let fd = selectable.raw_fd();
                    match poll
                        .registry()
                        .register(&mut SourceFd(&fd), token, selectable.interest())
                    {
                        Ok(()) => {
                            trace!(?token, fd, "registered selectable");
                            selectables.insert(token, selectable);
                        }
                        Err(e) => error!(?e, fd, "failed to register selectable"),
                    }
                }
                Command::Deregister(token) => {
                    if let Some(selectable) = selectables.remove(&token) {
                        let fd = selectable.raw_fd();
                        if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
                            error!(?e, fd, "failed to deregister selectable");
                        }
                    }
                }
                Command::InterestOpsChanged(token) => {
                    if let Some(selectable) = selectables.get(&token) {
                        let fd = selectable.raw_fd();
                        if let Err(e) = poll.registry().reregister(
                            &mut SourceFd(&fd),
                            token,
                            selectable.interest(),
                        ) {
                            error!(?e, fd, "failed to update interest ops");
                        }
                    }
                }
                Command::Shutdown => return,
            }
        }

        if let Err(e) = poll.poll(&mut events, Some(STATE_CHECK_INTERVAL)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(?e, "reactor poll failed");
            return;
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            if let Some(selectable) = selectables.get(&event.token()) {
                selectable.selection_event(event.is_readable(), event.is_writable());
            }
        }

        let now = Instant::now();
        if now.duration_since(last_state_check) >= STATE_CHECK_INTERVAL {
            last_state_check = now;
            for selectable in selectables.values() {
                selectable.do_state_checks(now);
            }
        }
    }
}
