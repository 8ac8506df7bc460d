use std::collections::HashMap;

use mio::{Registry, Token};

use crate::event::Readiness;
use crate::net::queue::WriteEntry;

/// Outcome of a driver invocation.
///
/// `Closed` means the driver has torn itself down (deregistered, failed its
/// queue, delivered its terminal callback) and must be dropped from the
/// channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverStatus {
    Open,
    Closed,
}

/// Loop-thread context handed to drivers.
///
/// `channels` is the live channel table with the invoked driver temporarily
/// removed, which lets the listener driver insert freshly accepted peers and
/// tear its peers down on close without aliasing the table.
pub(crate) struct LoopCtx<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) channels: &'a mut HashMap<Token, Box<dyn ChannelDriver>>,
}

/// Per-channel readiness visitor.
///
/// Exactly one driver owns each registered socket; every method runs on the
/// event loop thread. Drivers are created on that thread by setup tasks and
/// never cross threads, so they need not be `Send`.
pub(crate) trait ChannelDriver {
    /// The channel became readable and/or writable.
    fn ready(&mut self, ctx: &mut LoopCtx<'_>, readiness: Readiness) -> DriverStatus;

    /// A write was submitted for this channel.
    fn enqueue(&mut self, ctx: &mut LoopCtx<'_>, entry: WriteEntry) -> DriverStatus;

    /// Hard local close: fail all queued writes and deliver the terminal
    /// callback. Called at most once; the driver is already out of the table.
    fn close(&mut self, ctx: &mut LoopCtx<'_>);
}
