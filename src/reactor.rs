//! The event loop: a single dedicated thread that owns every registered
//! socket and drains a cross-thread task queue.
//!
//! Each iteration blocks on the readiness primitive, dispatches every
//! signaled channel to its driver, then drains and runs every currently
//! queued task. Tasks are FIFO among themselves; a panicking driver or task
//! is logged and never terminates the loop thread.
//!
//! All mutation of channel state happens here. Socket handles on other
//! threads interact exclusively by submitting [`Task`]s, which is the only
//! cross-thread synchronization in the core besides the metrics atomics.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::{Events, Registry, Token, Waker};
use tracing::{debug, error, trace};

use crate::error::{NetError, Result};
use crate::event::Readiness;
use crate::handler::{ChannelDriver, DriverStatus, LoopCtx};
use crate::net::queue::WriteEntry;
use crate::poll::{PollHandle, WAKE_TOKEN};

const EVENTS_CAPACITY: usize = 1024;
const POLL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Deferred socket setup (connect/listen/open) that runs on the loop thread.
///
/// `cancel` is invoked instead of `run` when the loop closes before the job
/// executes, so the owner's callback still observes exactly one outcome.
pub(crate) trait LoopJob: Send {
    fn run(self: Box<Self>, core: &mut Core);
    fn cancel(self: Box<Self>);
}

/// Unit of work submitted to the loop thread.
pub(crate) enum Task {
    Setup(Box<dyn LoopJob>),
    Send { token: Token, entry: WriteEntry },
    Close { token: Token },
    User(Box<dyn FnOnce() + Send>),
}

impl Task {
    fn run(self, core: &mut Core) {
        match self {
            Task::Setup(job) => job.run(core),
            Task::Send { token, entry } => core.submit_write(token, entry),
            Task::Close { token } => core.close_channel(token),
            Task::User(f) => f(),
        }
    }

    fn cancel(self) {
        match self {
            Task::Setup(job) => job.cancel(),
            Task::Send { entry, .. } => entry.fail(NetError::LoopClosed),
            Task::Close { .. } | Task::User(_) => {}
        }
    }
}

/// Loop-thread-owned channel table plus the registry drivers use to adjust
/// interest. Never leaves the dispatch thread.
pub(crate) struct Core {
    registry: Registry,
    channels: HashMap<Token, Box<dyn ChannelDriver>>,
}

impl Core {
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Binds a driver to the loop. Exactly one registration per token.
    pub(crate) fn install(&mut self, token: Token, driver: Box<dyn ChannelDriver>) {
        let previous = self.channels.insert(token, driver);
        debug_assert!(previous.is_none(), "token {token:?} registered twice");
    }

    fn dispatch(&mut self, token: Token, readiness: Readiness) {
        // Take-call-reinsert keeps the table free for the driver to mutate
        // (the listener inserts accepted peers, close tears peers down).
        let Some(mut driver) = self.channels.remove(&token) else {
            trace!(?token, "readiness for unregistered channel");
            return;
        };
        let status = {
            let mut ctx = LoopCtx {
                registry: &self.registry,
                channels: &mut self.channels,
            };
            driver.ready(&mut ctx, readiness)
        };
        if status == DriverStatus::Open {
            self.channels.insert(token, driver);
        }
    }

    fn submit_write(&mut self, token: Token, entry: WriteEntry) {
        let Some(mut driver) = self.channels.remove(&token) else {
            entry.fail(NetError::Closed);
            return;
        };
        let status = {
            let mut ctx = LoopCtx {
                registry: &self.registry,
                channels: &mut self.channels,
            };
            driver.enqueue(&mut ctx, entry)
        };
        if status == DriverStatus::Open {
            self.channels.insert(token, driver);
        }
    }

    fn close_channel(&mut self, token: Token) {
        if let Some(mut driver) = self.channels.remove(&token) {
            let mut ctx = LoopCtx {
                registry: &self.registry,
                channels: &mut self.channels,
            };
            driver.close(&mut ctx);
        }
    }

    /// Tears down every remaining channel when the loop closes.
    fn shutdown_all(&mut self) {
        let tokens: Vec<Token> = self.channels.keys().copied().collect();
        for token in tokens {
            self.close_channel(token);
        }
    }
}

struct Reactor {
    poll: PollHandle,
    events: Events,
    tasks: Receiver<Task>,
    closed: Arc<AtomicBool>,
    core: Core,
}

impl Reactor {
    fn run(mut self) {
        debug!("event loop running");
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // A broken poll must not kill the thread; back off and retry.
                error!(error = %e, "readiness poll failed, retrying");
                thread::sleep(POLL_RETRY_DELAY);
                continue;
            }

            if self.closed.load(Ordering::Acquire) {
                break;
            }

            let core = &mut self.core;
            for event in self.events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                let readiness = Readiness::from(event);
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| core.dispatch(token, readiness)));
                if outcome.is_err() {
                    error!(?token, "channel handler panicked; channel dropped");
                }
            }

            loop {
                match self.tasks.try_recv() {
                    Ok(task) => {
                        let outcome =
                            panic::catch_unwind(AssertUnwindSafe(|| task.run(core)));
                        if outcome.is_err() {
                            error!("submitted task panicked");
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
        }

        debug!("event loop closing");
        self.core.shutdown_all();
        // Late tasks still owe their callbacks exactly one outcome.
        while let Ok(task) = self.tasks.try_recv() {
            task.cancel();
        }
    }
}

struct Shared {
    tx: Sender<Task>,
    waker: Waker,
    closed: Arc<AtomicBool>,
    next_token: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

/// Handle to a running event loop.
///
/// Cheap to clone; every clone talks to the same dispatch thread. The loop
/// itself is created by [`EventLoop::new`], which spawns the dedicated
/// thread, and shut down exactly once via [`EventLoop::close`].
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    /// Creates the readiness primitive and spawns the dispatch thread.
    pub fn new() -> Result<Self> {
        let (poll, waker, registry) = PollHandle::new()?;
        let (tx, rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));

        let loop_closed = Arc::clone(&closed);
        let thread = thread::Builder::new()
            .name("millrace-loop".into())
            .spawn(move || {
                // Drivers are not Send; the channel table must be born on
                // the thread that owns it. Only the poll handle, registry,
                // task receiver and stop flag cross over.
                let reactor = Reactor {
                    poll,
                    events: Events::with_capacity(EVENTS_CAPACITY),
                    tasks: rx,
                    closed: loop_closed,
                    core: Core {
                        registry,
                        channels: HashMap::new(),
                    },
                };
                reactor.run()
            })
            .map_err(NetError::Io)?;

        Ok(EventLoop {
            shared: Arc::new(Shared {
                tx,
                waker,
                closed,
                next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Allocates a channel token. Tokens are never reused.
    pub(crate) fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Enqueues a task and wakes the dispatch thread. Safe from any thread,
    /// including from within a callback running on the loop itself.
    pub(crate) fn submit(&self, task: Task) -> Result<()> {
        if self.is_closed() {
            task.cancel();
            return Err(NetError::LoopClosed);
        }
        match self.shared.tx.send(task) {
            Ok(()) => {
                if let Err(e) = self.shared.waker.wake() {
                    trace!(error = %e, "waker failed");
                }
                Ok(())
            }
            Err(mpsc::SendError(task)) => {
                task.cancel();
                Err(NetError::LoopClosed)
            }
        }
    }

    /// Runs `f` on the event loop thread. FIFO with respect to every other
    /// submitted task.
    pub fn execute(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.submit(Task::User(Box::new(f)))
    }

    /// Signals the loop to stop; every still-registered connection observes
    /// `closed()` and queued writes are failed. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.waker.wake();
    }

    /// Waits for the dispatch thread to exit. Must not be called from the
    /// loop thread itself.
    pub fn join(&self) {
        let mut guard = match self.shared.thread.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = guard.take() {
            let _ = handle.join();
        }
    }
}
