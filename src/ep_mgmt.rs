//! Per-open-endpoint management
//!
//! One [`EpMgmt`] exists for every open endpoint instance. It owns the URB
//! FIFO and the state field, both behind one short spin lock, and implements
//! the monitor around the transition rules in [`crate::state`].

use alloc::{collections::VecDeque, vec::Vec};
use core::fmt;
use spin::Mutex;

use crate::{
    device::DevHandle,
    endpoint::{EndpointType, EpDescriptor},
    hcd::HcdEp,
    kal::{wait_until, Deadline, Kernel},
    pool::Key,
    state::{self, Eval, EpState},
    Result, UsbError,
};

struct EpQueue {
    state: EpState,
    /// URB keys, oldest first
    urbs: VecDeque<Key>,
}

/// Endpoint management instance
pub(crate) struct EpMgmt {
    dev: DevHandle,
    /// `None` for the implicit default control endpoint
    desc: Option<EpDescriptor>,
    ep0_max_packet_size: u16,
    interface: Option<u8>,
    hcd_ep: Mutex<Option<HcdEp>>,
    inner: Mutex<EpQueue>,
}

impl EpMgmt {
    pub fn new(
        dev: DevHandle,
        desc: Option<EpDescriptor>,
        ep0_max_packet_size: u16,
        interface: Option<u8>,
    ) -> Self {
        Self {
            dev,
            desc,
            ep0_max_packet_size,
            interface,
            hcd_ep: Mutex::new(None),
            inner: Mutex::new(EpQueue {
                state: EpState::None,
                urbs: VecDeque::new(),
            }),
        }
    }

    pub fn dev(&self) -> DevHandle {
        self.dev
    }

    pub fn is_implicit_ctrl(&self) -> bool {
        self.desc.is_none()
    }

    /// Descriptor in effect, synthesised for the implicit control endpoint
    pub fn descriptor(&self) -> EpDescriptor {
        self.desc
            .unwrap_or_else(|| EpDescriptor::default_control(self.ep0_max_packet_size))
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.descriptor().endpoint_type()
    }

    pub fn interface(&self) -> Option<u8> {
        self.interface
    }

    pub fn hcd_ep(&self) -> Result<HcdEp> {
        (*self.hcd_ep.lock()).ok_or(UsbError::InvalidState)
    }

    pub fn set_hcd_ep(&self, hcd_ep: HcdEp) {
        *self.hcd_ep.lock() = Some(hcd_ep);
    }

    pub fn state(&self) -> EpState {
        self.inner.lock().state
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().urbs.len()
    }

    pub fn head(&self) -> Option<Key> {
        self.inner.lock().urbs.front().copied()
    }

    /// Non-blocking transition
    ///
    /// # Panics
    ///
    /// If the prior state makes the transition impossible; the callers'
    /// discipline rules that out.
    pub fn set_state(&self, to: EpState) -> EpState {
        let mut inner = self.inner.lock();
        Self::transition(&mut inner, to)
    }

    fn transition(inner: &mut EpQueue, to: EpState) -> EpState {
        match state::on_enter(inner.state, to) {
            Ok(next) => {
                inner.state = next;
                next
            }
            Err(illegal) => panic!(
                "endpoint state machine: {:?} -> {:?} is not a legal transition",
                illegal.from, illegal.to
            ),
        }
    }

    /// Blocking transition. Waits until `to` may be entered, the request
    /// becomes illegal, or `timeout_ms` elapses.
    pub fn enter(
        &self,
        kernel: &dyn Kernel,
        to: EpState,
        max_queued: usize,
        timeout_ms: u32,
    ) -> Result<EpState> {
        let deadline = Deadline::after(kernel, timeout_ms);
        let mut intent_recorded = false;

        wait_until(kernel, deadline, || {
            let mut inner = self.inner.lock();
            let saturated = inner.urbs.len() >= max_queued;
            match state::on_eval(inner.state, to, saturated, intent_recorded) {
                Ok(Eval::Proceed(next)) => {
                    inner.state = next;
                    Some(Ok(next))
                }
                Ok(Eval::Intent(next)) => {
                    inner.state = next;
                    intent_recorded = true;
                    None
                }
                Ok(Eval::Wait) => None,
                Err(illegal) => {
                    log::debug!("endpoint busy in {:?}, cannot enter {:?}", illegal.from, illegal.to);
                    Some(Err(UsbError::InvalidState))
                }
            }
        })
    }

    /// Leave an exclusive state for whatever the queue depth implies
    pub fn leave(&self) -> EpState {
        let mut inner = self.inner.lock();
        let to = EpState::settled(inner.urbs.len());
        Self::transition(&mut inner, to)
    }

    /// Append a submitted URB and leave `Preparing`
    pub fn leave_with_push(&self, key: Key) -> EpState {
        let mut inner = self.inner.lock();
        inner.urbs.push_back(key);
        Self::transition(&mut inner, EpState::Queued)
    }

    /// Unlink the completed head URB and leave `Completing`
    pub fn leave_with_pop(&self) -> (Option<Key>, EpState) {
        let mut inner = self.inner.lock();
        let head = inner.urbs.pop_front();
        let to = EpState::settled(inner.urbs.len());
        (head, Self::transition(&mut inner, to))
    }

    /// Detach the whole queue, oldest first
    pub fn take_queue(&self) -> Vec<Key> {
        self.inner.lock().urbs.drain(..).collect()
    }
}

impl fmt::Debug for EpMgmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EpMgmt")
            .field("dev", &self.dev)
            .field("address", &format_args!("{:#04x}", self.descriptor().address()))
            .field("state", &inner.state)
            .field("queued", &inner.urbs.len())
            .finish()
    }
}
