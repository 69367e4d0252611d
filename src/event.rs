//! Async event delivery
//!
//! Completion notifications arrive in host controller (interrupt) context,
//! where the endpoint monitor must not be entered. They are parked here as
//! fixed records and drained by the delivery task, which does the actual
//! state-machine work.

use alloc::{boxed::Box, vec::Vec};
use core::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    task::{Context, Poll},
};
use crossbeam_queue::ArrayQueue;
use futures_util::task::AtomicWaker;
use spin::Mutex;

use crate::{
    device::DevHandle,
    endpoint::EpHandle,
    pool::Key,
    Result, UsbError,
};

/// Async event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEventKind {
    /// The controller finished the head URB of an endpoint
    UrbComplete,
    /// Aborted URBs waiting for their callbacks
    UrbListFree,
}

/// Async event record
#[derive(Debug)]
pub struct AsyncEvent {
    pub kind: AsyncEventKind,
    pub dev: DevHandle,
    pub ep: EpHandle,
    /// Payload of [`AsyncEventKind::UrbListFree`], in abort order
    pub urbs: Vec<Key>,
    seq: u64,
}

impl AsyncEvent {
    fn blank() -> Box<Self> {
        Box::new(Self {
            kind: AsyncEventKind::UrbComplete,
            dev: DevHandle(Key::from_raw(0)),
            ep: EpHandle(Key::from_raw(0)),
            urbs: Vec::new(),
            seq: 0,
        })
    }
}

/// A completion event popped by the delivery task but not yet processed
#[derive(Debug, Clone, Copy)]
struct InFlight {
    dev: DevHandle,
    ep: EpHandle,
    stale: bool,
}

/// Completions for `ep` posted before sequence number `before` are dropped
#[derive(Debug, Clone, Copy)]
struct Discard {
    dev: DevHandle,
    ep: EpHandle,
    before: u64,
}

/// State only task context touches
#[derive(Default)]
struct TaskSide {
    in_flight: Option<InFlight>,
    discards: Vec<Discard>,
}

/// Free list and pending FIFO of async event records.
///
/// Posting only touches the two lock-free record queues and the waker, so
/// it never contends with the delivery task or an aborter. Purging cannot
/// unlink records from the middle of a lock-free FIFO; it records a discard
/// mark instead, and [`AsyncEventQueue::pop`] drops matching completions.
pub struct AsyncEventQueue {
    free: ArrayQueue<Box<AsyncEvent>>,
    pending: ArrayQueue<Box<AsyncEvent>>,
    seq: AtomicU64,
    /// Posts between taking a sequence number and landing in `pending`
    posting: AtomicUsize,
    task: Mutex<TaskSide>,
    waker: AtomicWaker,
}

impl AsyncEventQueue {
    /// Preallocate `capacity` records
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(UsbError::InvalidArgument);
        }

        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            // Cannot overflow: exactly `capacity` records.
            let _ = free.push(AsyncEvent::blank());
        }

        Ok(Self {
            free,
            pending: ArrayQueue::new(capacity),
            seq: AtomicU64::new(0),
            posting: AtomicUsize::new(0),
            task: Mutex::new(TaskSide::default()),
            waker: AtomicWaker::new(),
        })
    }

    /// Queue an event. Lock-free, so safe from interrupt context.
    pub fn post(
        &self,
        kind: AsyncEventKind,
        dev: DevHandle,
        ep: EpHandle,
        urbs: Vec<Key>,
    ) -> core::result::Result<(), Vec<Key>> {
        self.posting.fetch_add(1, Ordering::SeqCst);
        let result = self.push(kind, dev, ep, urbs);
        self.posting.fetch_sub(1, Ordering::SeqCst);

        if result.is_ok() {
            self.waker.wake();
        }
        result
    }

    fn push(
        &self,
        kind: AsyncEventKind,
        dev: DevHandle,
        ep: EpHandle,
        urbs: Vec<Key>,
    ) -> core::result::Result<(), Vec<Key>> {
        let mut event = match self.free.pop() {
            Some(event) => event,
            None => return Err(urbs),
        };
        event.kind = kind;
        event.dev = dev;
        event.ep = ep;
        event.urbs = urbs;
        event.seq = self.seq.fetch_add(1, Ordering::SeqCst);

        // `pending` holds every record, so this only fails on a foreign one.
        self.pending.push(event).map_err(|mut event| {
            let urbs = core::mem::take(&mut event.urbs);
            log::error!("async event pending queue overflow");
            self.recycle(event);
            urbs
        })
    }

    /// Take the oldest live event, dropping completions an abort has
    /// discarded. A completion event stays marked in flight until
    /// [`AsyncEventQueue::finish`].
    pub fn pop(&self) -> Option<Box<AsyncEvent>> {
        let mut task = self.task.lock();
        loop {
            let event = match self.pending.pop() {
                Some(event) => event,
                None => {
                    // Every post numbered before a discard mark has landed
                    // and been popped.
                    if self.posting.load(Ordering::SeqCst) == 0 {
                        task.discards.clear();
                    }
                    return None;
                }
            };

            if event.kind == AsyncEventKind::UrbComplete {
                let discarded = task.discards.iter().any(|discard| {
                    discard.dev == event.dev && discard.ep == event.ep && event.seq < discard.before
                });
                if discarded {
                    log::trace!("{:?}: dropping completion purged by abort", event.ep);
                    self.recycle(event);
                    continue;
                }
                task.in_flight = Some(InFlight {
                    dev: event.dev,
                    ep: event.ep,
                    stale: false,
                });
            }
            return Some(event);
        }
    }

    /// Clear the in-flight marker; true if an abort overtook the event
    pub fn finish(&self) -> bool {
        self.task
            .lock()
            .in_flight
            .take()
            .map(|in_flight| in_flight.stale)
            .unwrap_or(false)
    }

    /// True if an abort overtook the in-flight event
    pub fn is_stale(&self) -> bool {
        self.task
            .lock()
            .in_flight
            .map(|in_flight| in_flight.stale)
            .unwrap_or(false)
    }

    /// Return a record to the free list
    pub fn recycle(&self, mut event: Box<AsyncEvent>) {
        event.urbs = Vec::new();
        if self.free.push(event).is_err() {
            log::error!("async event free list overflow");
        }
    }

    /// Discard completion events already posted for `ep` and mark an
    /// in-flight one stale
    pub fn purge(&self, dev: DevHandle, ep: EpHandle) {
        let before = self.seq.load(Ordering::SeqCst);
        let mut task = self.task.lock();

        if let Some(in_flight) = task.in_flight.as_mut() {
            if in_flight.dev == dev && in_flight.ep == ep {
                in_flight.stale = true;
            }
        }

        match task
            .discards
            .iter_mut()
            .find(|discard| discard.dev == dev && discard.ep == ep)
        {
            Some(discard) => discard.before = discard.before.max(before),
            None => task.discards.push(Discard { dev, ep, before }),
        }
    }

    /// Posted events not yet popped, including discarded ones
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Resolves once at least one event is pending
    pub fn ready(&self) -> EventReady<'_> {
        EventReady { queue: self }
    }
}

impl core::fmt::Debug for AsyncEventQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncEventQueue")
            .field("pending", &self.pending_len())
            .field("free", &self.free_len())
            .finish()
    }
}

/// Future returned by [`AsyncEventQueue::ready`]
pub struct EventReady<'a> {
    queue: &'a AsyncEventQueue,
}

impl Future for EventReady<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.queue.waker.register(cx.waker());
        if self.queue.pending_len() > 0 {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles(n: u32) -> (DevHandle, EpHandle) {
        (DevHandle(Key::from_raw(0x1_0000)), EpHandle(Key::from_raw(0x1_0000 | n)))
    }

    #[test]
    fn records_are_recycled_not_allocated() {
        let queue = AsyncEventQueue::new(2).unwrap();
        let (dev, ep) = handles(1);
        queue.post(AsyncEventKind::UrbComplete, dev, ep, Vec::new()).unwrap();
        queue.post(AsyncEventKind::UrbComplete, dev, ep, Vec::new()).unwrap();
        assert!(queue.post(AsyncEventKind::UrbComplete, dev, ep, Vec::new()).is_err());

        let event = queue.pop().unwrap();
        assert!(!queue.finish());
        queue.recycle(event);
        assert_eq!(queue.free_len(), 1);
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn events_are_delivered_in_post_order() {
        let queue = AsyncEventQueue::new(4).unwrap();
        let (dev, ep1) = handles(1);
        let (_, ep2) = handles(2);
        queue.post(AsyncEventKind::UrbComplete, dev, ep1, Vec::new()).unwrap();
        queue.post(AsyncEventKind::UrbListFree, dev, ep2, Vec::new()).unwrap();

        assert_eq!(queue.pop().unwrap().ep, ep1);
        queue.finish();
        let second = queue.pop().unwrap();
        assert_eq!(second.kind, AsyncEventKind::UrbListFree);
        assert_eq!(second.ep, ep2);
    }

    #[test]
    fn purge_drops_pending_completions_for_endpoint_only() {
        let queue = AsyncEventQueue::new(4).unwrap();
        let (dev, ep1) = handles(1);
        let (_, ep2) = handles(2);
        queue.post(AsyncEventKind::UrbComplete, dev, ep1, Vec::new()).unwrap();
        queue.post(AsyncEventKind::UrbComplete, dev, ep2, Vec::new()).unwrap();
        queue.post(AsyncEventKind::UrbListFree, dev, ep1, Vec::new()).unwrap();

        queue.purge(dev, ep1);
        let first = queue.pop().unwrap();
        assert_eq!(first.ep, ep2);
        // The discarded record went straight back to the free list.
        assert_eq!(queue.free_len(), 2);
        queue.finish();

        let second = queue.pop().unwrap();
        assert_eq!((second.kind, second.ep), (AsyncEventKind::UrbListFree, ep1));
        assert!(queue.pop().is_none());
        queue.recycle(first);
        queue.recycle(second);
        assert_eq!(queue.free_len(), 4);
    }

    #[test]
    fn completions_posted_after_purge_are_kept() {
        let queue = AsyncEventQueue::new(4).unwrap();
        let (dev, ep) = handles(1);
        queue.post(AsyncEventKind::UrbComplete, dev, ep, Vec::new()).unwrap();
        queue.purge(dev, ep);
        queue.post(AsyncEventKind::UrbComplete, dev, ep, Vec::new()).unwrap();

        let event = queue.pop().unwrap();
        assert_eq!(event.ep, ep);
        assert!(!queue.finish());
        queue.recycle(event);
        assert!(queue.pop().is_none());

        // The discard mark is gone once the queue drained.
        queue.post(AsyncEventKind::UrbComplete, dev, ep, Vec::new()).unwrap();
        assert!(queue.pop().is_some());
    }

    #[test]
    fn post_does_not_wait_for_task_side_lock() {
        let queue = AsyncEventQueue::new(2).unwrap();
        let (dev, ep) = handles(1);
        let task = queue.task.lock();
        // Would spin forever if posting shared the delivery task's lock.
        queue.post(AsyncEventKind::UrbComplete, dev, ep, Vec::new()).unwrap();
        assert_eq!(queue.pending_len(), 1);
        drop(task);
        assert!(queue.pop().is_some());
    }

    #[test]
    fn purge_marks_in_flight_event_stale() {
        let queue = AsyncEventQueue::new(2).unwrap();
        let (dev, ep) = handles(1);
        queue.post(AsyncEventKind::UrbComplete, dev, ep, Vec::new()).unwrap();
        let event = queue.pop().unwrap();
        assert!(!queue.is_stale());

        queue.purge(dev, ep);
        assert!(queue.is_stale());
        assert!(queue.finish());
        queue.recycle(event);
    }
}
