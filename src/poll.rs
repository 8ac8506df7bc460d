use std::io;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token, Waker};

/// Token reserved for the loop's wake-up channel; socket tokens start above it.
pub(crate) const WAKE_TOKEN: Token = Token(0);

/// Owns the OS readiness-multiplexing handle for one event loop.
///
/// The handle lives on the loop thread; the paired [`Waker`] and a cloned
/// [`Registry`] are split off at construction so other threads can wake the
/// blocked poll and the dispatch core can (re)register channels.
pub(crate) struct PollHandle {
    poll: Poll,
}

impl PollHandle {
    pub(crate) fn new() -> io::Result<(PollHandle, Waker, Registry)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        Ok((PollHandle { poll }, waker, registry))
    }

    /// Blocks until at least one channel is ready or the waker fires.
    pub(crate) fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(events, timeout)
    }
}
