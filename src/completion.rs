//! Completion and abort processing
//!
//! Everything here runs on the async delivery task or on the aborting
//! caller, never in controller interrupt context. [`UsbHost::urb_done`] is
//! the only entry point the controller calls from its interrupt handler.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    device::{DevHandle, Device},
    endpoint::EpHandle,
    ep_mgmt::EpMgmt,
    error::PoolKind,
    event::AsyncEventKind,
    host::UsbHost,
    kal::TIMEOUT_INFINITE,
    pool::Key,
    state::EpState,
    Result, UsbError,
};

impl UsbHost {
    /// Report that the controller finished the head URB of `ep`.
    ///
    /// Interrupt safe: only queues an event for the delivery task, without
    /// taking any lock. Fails if every event record is in use, in which case
    /// the controller should report again later.
    pub fn urb_done(&self, dev: DevHandle, ep: EpHandle) -> Result<()> {
        self.events
            .post(AsyncEventKind::UrbComplete, dev, ep, Vec::new())
            .map_err(|_| {
                log::error!("{:?} {:?}: completion dropped, async event pool exhausted", dev, ep);
                UsbError::AllocationFailed(PoolKind::AsyncEvent)
            })
    }

    /// Handle one pending async event. Returns false if none was pending.
    pub fn process_async_event(&self) -> bool {
        let mut event = match self.events.pop() {
            Some(event) => event,
            None => return false,
        };

        match event.kind {
            AsyncEventKind::UrbComplete => {
                let (dev, ep) = (event.dev, event.ep);
                self.events.recycle(event);
                self.process_urb_complete(dev, ep);
                if self.events.finish() {
                    log::trace!("{:?}: completion overtaken by abort", ep);
                }
            }
            AsyncEventKind::UrbListFree => {
                let urbs = core::mem::take(&mut event.urbs);
                self.events.recycle(event);
                self.free_aborted(urbs);
            }
        }
        true
    }

    /// Drain the event queue; returns the number of events handled
    pub fn process_async_events(&self) -> usize {
        let mut handled = 0;
        while self.process_async_event() {
            handled += 1;
        }
        handled
    }

    /// Delivery task body for a dedicated kernel thread
    pub fn run_async_task(&self, stop: &AtomicBool) {
        log::debug!("async delivery task running");
        while !stop.load(Ordering::Acquire) {
            if !self.process_async_event() {
                self.kernel().yield_now();
            }
        }
        log::debug!("async delivery task stopped");
    }

    /// Delivery task body for an executor; never returns
    pub async fn async_task(&self) {
        loop {
            self.events.ready().await;
            self.process_async_events();
        }
    }

    fn process_urb_complete(&self, dev: DevHandle, ep: EpHandle) {
        let (device, mgmt) = match self
            .device_acquire(dev)
            .and_then(|device| Ok((device, self.ep_mgmt(dev, ep)?)))
        {
            Ok(found) => found,
            Err(e) => {
                log::debug!("{:?} {:?}: completion for stale handle: {}", dev, ep, e);
                return;
            }
        };

        if let Err(e) = mgmt.enter(
            self.kernel(),
            EpState::Completing,
            self.config.max_queued_urbs,
            TIMEOUT_INFINITE,
        ) {
            log::debug!("{:?}: endpoint closed before completion: {}", ep, e);
            return;
        }

        // An abort may have emptied the queue, or already aborted the URB
        // this event was raised for.
        let head = match mgmt.head() {
            Some(key) if !self.events.is_stale() => key,
            _ => {
                log::warn!("{:?}: completion with no matching URB queued", ep);
                mgmt.leave();
                return;
            }
        };

        let (xfer_len, status) = self.collect(&mgmt, head);
        let fatal = status == Err(UsbError::IoFatal);
        let (unlinked, _) = mgmt.leave_with_pop();
        debug_assert_eq!(unlinked, Some(head));

        let urb = self.urbs.lock().free(head);
        match urb {
            Some(urb) => urb.finish(xfer_len, status),
            None => log::error!("{:?}: completed URB {:?} missing from pool", ep, head),
        }

        if fatal {
            self.escalate(&device);
        }
    }

    /// Ask the controller for the outcome of the head URB
    fn collect(&self, mgmt: &EpMgmt, key: Key) -> (usize, Result<()>) {
        let urb = self
            .urbs
            .lock()
            .get(key)
            .map(|urb| (urb.hcd_urb, urb.params));
        match (urb, mgmt.hcd_ep()) {
            (Some((Some(hcd_urb), params)), Ok(hcd_ep)) => {
                self.hcd.urb_complete(hcd_ep, hcd_urb, &params)
            }
            _ => (0, Err(UsbError::InvalidState)),
        }
    }

    /// Take the endpoint exclusively, detach its queue and abort every URB
    /// on the controller, newest first. Leaves the endpoint in
    /// `AbortCloseCmpl` and returns the detached URBs in abort order.
    pub(crate) fn abort_flush(
        &self,
        dev: DevHandle,
        ep: EpHandle,
        mgmt: &EpMgmt,
    ) -> Result<Vec<Key>> {
        mgmt.enter(
            self.kernel(),
            EpState::AbortingClosing,
            self.config.max_queued_urbs,
            TIMEOUT_INFINITE,
        )?;

        let mut detached = mgmt.take_queue();
        detached.reverse();

        if let (false, Ok(hcd_ep)) = (detached.is_empty(), mgmt.hcd_ep()) {
            for key in detached.iter() {
                let urb = self.urbs.lock().get(*key).map(|urb| (urb.hcd_urb, urb.params));
                if let Some((Some(hcd_urb), params)) = urb {
                    self.hcd.urb_abort(hcd_ep, hcd_urb, &params);
                }
            }
        }

        self.events.purge(dev, ep);
        log::trace!("{:?}: aborted {} URBs", ep, detached.len());
        Ok(detached)
    }

    /// Hand aborted URBs to the delivery task, or free them here if no
    /// event record is available
    pub(crate) fn release_aborted(&self, dev: DevHandle, ep: EpHandle, urbs: Vec<Key>) {
        if urbs.is_empty() {
            return;
        }
        if let Err(urbs) = self.events.post(AsyncEventKind::UrbListFree, dev, ep, urbs) {
            log::debug!("{:?}: no event record, freeing aborted URBs inline", ep);
            self.free_aborted(urbs);
        }
    }

    fn free_aborted(&self, urbs: Vec<Key>) {
        for key in urbs {
            let urb = self.urbs.lock().free(key);
            if let Some(urb) = urb {
                urb.finish(0, Err(UsbError::Abort));
            }
        }
    }

    /// Abort every URB queued on an endpoint. Callbacks run with
    /// [`UsbError::Abort`]; the endpoint is ready for new work afterwards.
    pub fn abort(&self, dev: DevHandle, ep: EpHandle) -> Result<()> {
        let device = self.device_acquire(dev)?;
        let _list = device.ep_list_lock.acquire(self.kernel(), TIMEOUT_INFINITE)?;
        let mgmt = self.ep_mgmt(dev, ep)?;

        let flushed = self.abort_flush(dev, ep, &mgmt)?;
        let halt_result = mgmt
            .hcd_ep()
            .and_then(|hcd_ep| self.hcd.ep_halt_clr(hcd_ep, false));
        mgmt.set_state(EpState::Ready);

        self.release_aborted(dev, ep, flushed);
        if let Err(e) = halt_result {
            log::warn!("{:?}: halt clear after abort failed: {}", ep, e);
        }
        halt_result
    }

    /// Tear down the device's link after an unrecoverable transfer error
    pub(crate) fn escalate(&self, device: &Device) {
        log::error!(
            "device {}: fatal transfer error, disconnecting port {}",
            device.address(),
            device.port()
        );
        self.hub.request_port_disconnect(device.hub(), device.port());
    }
}
