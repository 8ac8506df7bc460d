//! Per-connection write queue with outstanding-byte accounting.
//!
//! Entries are strictly FIFO; their completion callbacks fire in enqueue
//! order. A `None` payload is the graceful-close sentinel. The queue only
//! does bookkeeping; ceiling policy (advisory for TCP, hard drop for UDP)
//! lives with the transport that owns the queue.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::{Buf, Bytes};

use crate::error::NetError;
use crate::net::traits::SendCallback;

pub(crate) struct WriteEntry {
    /// Destination for datagram sockets; `None` on stream sockets.
    pub(crate) dest: Option<SocketAddr>,
    /// `None` is the graceful-close sentinel.
    pub(crate) payload: Option<Bytes>,
    pub(crate) cb: Box<dyn SendCallback>,
}

impl WriteEntry {
    pub(crate) fn complete(self) {
        self.cb.sent();
    }

    pub(crate) fn fail(self, err: NetError) {
        self.cb.failed(err);
    }
}

#[derive(Default)]
pub(crate) struct WriteQueue {
    entries: VecDeque<WriteEntry>,
    outstanding: usize,
    shutdown_queued: bool,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        WriteQueue::default()
    }

    /// Sum of not-yet-written payload bytes across all queued entries.
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once the graceful-close sentinel has been queued; every later
    /// send must be rejected by the owner.
    pub(crate) fn shutdown_queued(&self) -> bool {
        self.shutdown_queued
    }

    pub(crate) fn push(&mut self, entry: WriteEntry) {
        match &entry.payload {
            Some(buf) => self.outstanding += buf.len(),
            None => self.shutdown_queued = true,
        }
        self.entries.push_back(entry);
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut WriteEntry> {
        self.entries.front_mut()
    }

    /// Consumes `n` bytes from the head entry after a partial or full write.
    /// Returns true when the head payload is fully drained.
    pub(crate) fn advance_front(&mut self, n: usize) -> bool {
        let front = self
            .entries
            .front_mut()
            .expect("advance_front on empty queue");
        let buf = front
            .payload
            .as_mut()
            .expect("advance_front on close sentinel");
        debug_assert!(n <= buf.len());
        buf.advance(n);
        self.outstanding -= n;
        buf.is_empty()
    }

    pub(crate) fn pop_front(&mut self) -> Option<WriteEntry> {
        let entry = self.entries.pop_front()?;
        if let Some(buf) = &entry.payload {
            self.outstanding -= buf.len();
        }
        Some(entry)
    }

    /// Fails every queued entry in FIFO order, leaving the queue empty.
    pub(crate) fn fail_all(&mut self, mut make_err: impl FnMut() -> NetError) {
        self.outstanding = 0;
        for entry in self.entries.drain(..) {
            entry.cb.failed(make_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn entry(payload: Option<&[u8]>, tag: u32, tx: mpsc::Sender<(u32, bool)>) -> WriteEntry {
        WriteEntry {
            dest: None,
            payload: payload.map(Bytes::copy_from_slice),
            cb: Box::new(move |result: crate::error::Result<()>| {
                tx.send((tag, result.is_ok())).unwrap();
            }),
        }
    }

    #[test]
    fn tracks_outstanding_bytes() {
        let (tx, _rx) = mpsc::channel();
        let mut queue = WriteQueue::new();
        queue.push(entry(Some(b"hello"), 1, tx.clone()));
        queue.push(entry(Some(b"world!"), 2, tx));
        assert_eq!(queue.outstanding(), 11);

        assert!(!queue.advance_front(2));
        assert_eq!(queue.outstanding(), 9);
        assert!(queue.advance_front(3));
        queue.pop_front().unwrap().complete();
        assert_eq!(queue.outstanding(), 6);
    }

    #[test]
    fn fail_all_preserves_fifo_order() {
        let (tx, rx) = mpsc::channel();
        let mut queue = WriteQueue::new();
        for tag in 1..=3 {
            queue.push(entry(Some(b"x"), tag, tx.clone()));
        }
        queue.fail_all(|| NetError::Closed);
        let order: Vec<u32> = rx.try_iter().map(|(tag, _)| tag).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(queue.is_empty());
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn sentinel_sets_shutdown_flag_without_bytes() {
        let (tx, _rx) = mpsc::channel();
        let mut queue = WriteQueue::new();
        queue.push(entry(Some(b"data"), 1, tx.clone()));
        assert!(!queue.shutdown_queued());
        queue.push(entry(None, 2, tx));
        assert!(queue.shutdown_queued());
        assert_eq!(queue.outstanding(), 4);
    }
}
