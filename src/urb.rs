//! USB Request Blocks

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    fmt,
    future::Future,
    pin::Pin,
    ptr::NonNull,
    task::{Context, Poll},
};
use futures_util::task::AtomicWaker;
use spin::Mutex;

use crate::{
    device::DevHandle,
    endpoint::EpHandle,
    hcd::HcdUrb,
    kal::{Kernel, Semaphore, TIMEOUT_INFINITE},
    Result, UsbError,
};

/// Packet identifier of a transfer stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Setup,
    In,
    Out,
}

/// Isochronous frame window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsocFrames {
    pub start: u16,
    pub count: u8,
}

/// Raw view of a transfer buffer, as handed to the host controller
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct XferBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl XferBuf {
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
        }
    }

    pub(crate) fn from_slice(buf: &[u8]) -> Self {
        Self {
            // Never written through for OUT and SETUP stages.
            ptr: NonNull::from(buf).cast(),
            len: buf.len(),
        }
    }

    pub(crate) fn from_mut_slice(buf: &mut [u8]) -> Self {
        let len = buf.len();
        Self {
            ptr: NonNull::from(buf).cast(),
            len,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// Only valid between `urb_submit` and the matching `urb_complete` or
    /// `urb_abort`; the submitter keeps the memory alive for that window.
    pub unsafe fn as_slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// # Safety
    ///
    /// As for [`XferBuf::as_slice`], and only for IN stages, which the
    /// submitter always backs with writable memory.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

impl fmt::Debug for XferBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XferBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

// The pointee is owned by the submitter for the URB lifetime.
unsafe impl Send for XferBuf {}
unsafe impl Sync for XferBuf {}

/// Parameters handed to the host controller for one URB
#[derive(Debug, Clone, Copy)]
pub struct UrbParams {
    pub dev: DevHandle,
    pub ep: EpHandle,
    pub dev_address: u8,
    pub ep_address: u8,
    pub buf: XferBuf,
    pub token: Token,
    pub isoc: Option<IsocFrames>,
}

/// Final report for one URB, delivered exactly once
#[derive(Debug)]
pub struct UrbCompletion {
    pub dev: DevHandle,
    pub ep: EpHandle,
    /// Buffer handed over by an async submitter
    pub buf: Option<Vec<u8>>,
    /// Requested length
    pub len: usize,
    /// Bytes actually moved
    pub xfer_len: usize,
    pub status: Result<()>,
}

/// Completion callback
pub type UrbCallback = Box<dyn FnOnce(UrbCompletion) + Send>;

/// Transfer request record
pub(crate) struct Urb {
    pub params: UrbParams,
    /// Keeps async buffers alive while the controller owns `params.buf`
    pub owned: Option<Vec<u8>>,
    pub hcd_urb: Option<HcdUrb>,
    pub callback: UrbCallback,
}

impl Urb {
    /// Consume the record and report its outcome
    pub fn finish(self, xfer_len: usize, status: Result<()>) {
        let completion = UrbCompletion {
            dev: self.params.dev,
            ep: self.params.ep,
            buf: self.owned,
            len: self.params.buf.len(),
            xfer_len,
            status,
        };
        (self.callback)(completion);
    }
}

impl fmt::Debug for Urb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Urb")
            .field("params", &self.params)
            .field("hcd_urb", &self.hcd_urb)
            .finish()
    }
}

/// Completion record for a synchronous transfer
#[derive(Debug)]
pub(crate) struct SyncCompletion {
    sem: Semaphore,
    outcome: Mutex<Option<(usize, Result<()>)>>,
}

impl SyncCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sem: Semaphore::new(0),
            outcome: Mutex::new(None),
        })
    }

    pub fn callback(self: &Arc<Self>) -> UrbCallback {
        let this = self.clone();
        Box::new(move |done: UrbCompletion| {
            *this.outcome.lock() = Some((done.xfer_len, done.status));
            this.sem.post();
        })
    }

    pub fn pend(&self, kernel: &dyn Kernel, timeout_ms: u32) -> Result<()> {
        self.sem.pend(kernel, timeout_ms)
    }

    pub fn pend_forever(&self, kernel: &dyn Kernel) {
        // Cannot time out.
        let _ = self.sem.pend(kernel, TIMEOUT_INFINITE);
    }

    pub fn outcome(&self) -> Result<usize> {
        match self.outcome.lock().take() {
            Some((xfer_len, status)) => status.map(|()| xfer_len),
            None => Err(UsbError::InvalidState),
        }
    }
}

struct FutureState {
    done: Option<UrbCompletion>,
}

/// Awaitable async submission
///
/// Resolves to the buffer and the number of bytes transferred.
pub struct UrbFuture {
    state: Arc<(Mutex<FutureState>, AtomicWaker)>,
    submitted: Option<UsbError>,
}

impl UrbFuture {
    pub(crate) fn new() -> (Self, UrbCallback) {
        let state = Arc::new((Mutex::new(FutureState { done: None }), AtomicWaker::new()));
        let shared = state.clone();
        let callback: UrbCallback = Box::new(move |done: UrbCompletion| {
            shared.0.lock().done = Some(done);
            shared.1.wake();
        });
        (
            Self {
                state,
                submitted: None,
            },
            callback,
        )
    }

    /// Future that resolves immediately to a submission error
    pub(crate) fn failed(mut self, err: UsbError) -> Self {
        self.submitted = Some(err);
        self
    }

    pub fn is_complete(&self) -> bool {
        self.submitted.is_some() || self.state.0.lock().done.is_some()
    }
}

impl Future for UrbFuture {
    type Output = Result<(Vec<u8>, usize)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(err) = self.submitted {
            return Poll::Ready(Err(err));
        }

        self.state.1.register(cx.waker());
        match self.state.0.lock().done.take() {
            Some(done) => Poll::Ready(
                done.status
                    .map(|()| (done.buf.unwrap_or_default(), done.xfer_len)),
            ),
            None => Poll::Pending,
        }
    }
}

impl fmt::Debug for UrbFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrbFuture")
            .field("complete", &self.is_complete())
            .finish()
    }
}
