//! USB host endpoint management
//!
//! [`UsbHost`] owns the device, endpoint and URB pools and the async event
//! queue, and talks to the controller and hub through their traits. Transfer
//! submission lives in `engine`, completion and abort handling in
//! `completion`.

use alloc::{boxed::Box, sync::Arc};
use spin::Mutex;

use crate::{
    config::HostConfig,
    device::{DevHandle, Device, DeviceInfo},
    endpoint::{EpDescriptor, EpHandle},
    ep_mgmt::EpMgmt,
    error::PoolKind,
    event::AsyncEventQueue,
    hcd::{EpOpenParams, HostController, PortControl},
    kal::{Kernel, TIMEOUT_INFINITE},
    pool::{Pool, PoolStats},
    state::EpState,
    urb::Urb,
    Result, UsbError,
};

/// USB host transfer engine
pub struct UsbHost {
    pub(crate) config: HostConfig,
    pub(crate) hcd: Box<dyn HostController>,
    pub(crate) hub: Box<dyn PortControl>,
    pub(crate) kernel: Box<dyn Kernel>,
    pub(crate) devices: Mutex<Pool<Arc<Device>>>,
    pub(crate) eps: Mutex<Pool<Arc<EpMgmt>>>,
    pub(crate) urbs: Mutex<Pool<Urb>>,
    pub(crate) events: AsyncEventQueue,
}

impl UsbHost {
    pub fn new(
        config: HostConfig,
        hcd: impl HostController + 'static,
        hub: impl PortControl + 'static,
        kernel: impl Kernel + 'static,
    ) -> Result<Self> {
        config.validate()?;

        let host = Self {
            devices: Mutex::new(Pool::new(PoolKind::Device, config.devices)?),
            eps: Mutex::new(Pool::new(PoolKind::Endpoint, config.endpoints)?),
            urbs: Mutex::new(Pool::new(PoolKind::Urb, config.urbs)?),
            events: AsyncEventQueue::new(config.async_events)?,
            hcd: Box::new(hcd),
            hub: Box::new(hub),
            kernel: Box::new(kernel),
            config,
        };

        log::info!(
            "USB host engine ready: {:?} devices, {:?} endpoints, {:?} URBs, {} events",
            config.devices,
            config.endpoints,
            config.urbs,
            config.async_events
        );
        Ok(host)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub(crate) fn kernel(&self) -> &dyn Kernel {
        &*self.kernel
    }

    /// Register a device and open its default control endpoint
    pub fn device_attach(&self, info: DeviceInfo) -> Result<DevHandle> {
        let device = Arc::new(Device::new(info));
        let dev = DevHandle(self.devices.lock().alloc(device.clone())?);

        match self.open(dev, None, None) {
            Ok(ep) => device.set_dflt_ep(Some(ep)),
            Err(e) => {
                log::warn!("device {}: default endpoint open failed: {}", info.address, e);
                self.devices.lock().free(dev.0);
                return Err(e);
            }
        }

        log::debug!("device {} attached as {:?}", info.address, dev);
        Ok(dev)
    }

    /// Close every endpoint of a device and release its slot.
    ///
    /// Teardown always completes; the first error met is returned.
    pub fn device_detach(&self, dev: DevHandle) -> Result<()> {
        let device = self.device_acquire(dev)?;
        // Under the list lock, so a racing open either lands in the snapshot
        // or sees the flag and backs out.
        let endpoints = {
            let _list = device.ep_list_lock.acquire(self.kernel(), TIMEOUT_INFINITE)?;
            device.set_closing();
            device.endpoints()
        };

        let dflt_ep = device.dflt_ep();
        let mut first_err = None;
        let others = endpoints.into_iter().filter(|ep| Some(*ep) != dflt_ep);
        for ep in others.chain(dflt_ep) {
            if let Err(e) = self.close(dev, ep) {
                log::warn!("device {}: closing {:?} failed: {}", device.address(), ep, e);
                first_err.get_or_insert(e);
            }
        }

        self.devices.lock().free(dev.0);
        log::debug!("device {} detached", device.address());
        first_err.map_or(Ok(()), Err)
    }

    /// Shared reference to a live device; dropping it releases the device
    pub fn device_acquire(&self, dev: DevHandle) -> Result<Arc<Device>> {
        self.devices
            .lock()
            .get(dev.0)
            .cloned()
            .ok_or(UsbError::InvalidHandle)
    }

    /// Suspend or resume every open endpoint of a device
    pub fn device_suspend(&self, dev: DevHandle, suspend: bool) -> Result<()> {
        let device = self.device_acquire(dev)?;
        let mut first_err = None;
        for ep in device.endpoints() {
            let result = self
                .ep_mgmt(dev, ep)
                .and_then(|mgmt| mgmt.hcd_ep())
                .and_then(|hcd_ep| self.hcd.ep_suspend(hcd_ep, suspend));
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Open an endpoint; `None` opens the implicit default control endpoint
    pub fn open(
        &self,
        dev: DevHandle,
        desc: Option<EpDescriptor>,
        interface: Option<u8>,
    ) -> Result<EpHandle> {
        let device = self.device_acquire(dev)?;
        if device.is_closing() {
            return Err(UsbError::InvalidState);
        }
        if !device.has_free_ep_slot() {
            return Err(UsbError::AllocationFailed(PoolKind::DeviceEndpointTable));
        }

        let mgmt = Arc::new(EpMgmt::new(
            dev,
            desc,
            device.info().ep0_max_packet_size,
            interface,
        ));
        let ep = EpHandle(self.eps.lock().alloc(mgmt.clone())?);

        let ep_desc = mgmt.descriptor();
        let params = EpOpenParams {
            dev,
            ep,
            address: ep_desc.address(),
            ep_type: ep_desc.endpoint_type(),
            max_packet_size: ep_desc.max_packet_size(),
            interval: ep_desc.interval(),
            dev_address: device.address(),
            speed: device.speed(),
        };

        let hcd_ep = match self.hcd.ep_open(&params) {
            Ok(hcd_ep) => hcd_ep,
            Err(e) => {
                log::warn!("device {}: ep {:#04x} open failed: {}", device.address(), params.address, e);
                self.eps.lock().free(ep.0);
                return Err(e);
            }
        };
        mgmt.set_hcd_ep(hcd_ep);
        mgmt.set_state(EpState::Ready);

        let installed = match device.ep_list_lock.acquire(self.kernel(), TIMEOUT_INFINITE) {
            // Detach may have started while the controller was opening.
            Ok(_list) if device.is_closing() => Err(UsbError::InvalidState),
            // Fails if a racing open took the last table slot.
            Ok(_list) => device.install_ep(ep),
            Err(e) => Err(e),
        };
        if let Err(e) = installed {
            log::debug!("device {}: ep {:#04x} open rolled back: {}", device.address(), params.address, e);
            if let Err(close_err) = self.hcd.ep_close(hcd_ep) {
                log::warn!("ep {:#04x}: rollback close failed: {}", params.address, close_err);
            }
            self.eps.lock().free(ep.0);
            return Err(e);
        }

        log::trace!(
            "device {}: opened ep {:#04x} ({:?}) as {:?}",
            device.address(),
            params.address,
            params.ep_type,
            ep
        );
        Ok(ep)
    }

    /// Close an endpoint. Queued transfers complete with
    /// [`UsbError::Abort`]; a controller error from closing is reported
    /// after teardown has finished.
    pub fn close(&self, dev: DevHandle, ep: EpHandle) -> Result<()> {
        let device = self.device_acquire(dev)?;
        let _list = device.ep_list_lock.acquire(self.kernel(), TIMEOUT_INFINITE)?;
        // Looked up under the list lock: a racing close may have won.
        let mgmt = self.ep_mgmt(dev, ep)?;

        let flushed = self.abort_flush(dev, ep, &mgmt)?;
        let close_result = mgmt.hcd_ep().and_then(|hcd_ep| self.hcd.ep_close(hcd_ep));

        device.remove_ep_with(ep, || {
            self.eps.lock().free(ep.0);
        });
        if device.dflt_ep() == Some(ep) {
            device.set_dflt_ep(None);
        }
        mgmt.set_state(EpState::None);

        let address = mgmt.descriptor().address();
        self.release_aborted(dev, ep, flushed);

        if let Err(e) = close_result {
            log::warn!("device {}: ep {:#04x} close error: {}", device.address(), address, e);
        }
        close_result
    }

    pub(crate) fn ep_mgmt(&self, dev: DevHandle, ep: EpHandle) -> Result<Arc<EpMgmt>> {
        match self.eps.lock().get(ep.0) {
            Some(mgmt) if mgmt.dev() == dev => Ok(mgmt.clone()),
            _ => Err(UsbError::InvalidHandle),
        }
    }

    pub fn ep_state(&self, dev: DevHandle, ep: EpHandle) -> Result<EpState> {
        self.ep_mgmt(dev, ep).map(|mgmt| mgmt.state())
    }

    /// URBs queued on the controller for an endpoint
    pub fn queued_count(&self, dev: DevHandle, ep: EpHandle) -> Result<usize> {
        self.ep_mgmt(dev, ep).map(|mgmt| mgmt.queued())
    }

    pub fn ep_address(&self, dev: DevHandle, ep: EpHandle) -> Result<u8> {
        self.ep_mgmt(dev, ep).map(|mgmt| mgmt.descriptor().address())
    }

    pub fn ep_attributes(&self, dev: DevHandle, ep: EpHandle) -> Result<u8> {
        self.ep_mgmt(dev, ep).map(|mgmt| mgmt.descriptor().attributes())
    }

    pub fn ep_max_packet_size(&self, dev: DevHandle, ep: EpHandle) -> Result<u16> {
        self.ep_mgmt(dev, ep).map(|mgmt| mgmt.descriptor().max_packet_size())
    }

    pub fn ep_interval(&self, dev: DevHandle, ep: EpHandle) -> Result<u8> {
        self.ep_mgmt(dev, ep).map(|mgmt| mgmt.descriptor().interval())
    }

    /// Interface the endpoint was opened for
    pub fn ep_interface(&self, dev: DevHandle, ep: EpHandle) -> Result<Option<u8>> {
        self.ep_mgmt(dev, ep).map(|mgmt| mgmt.interface())
    }

    pub fn device_pool_stats(&self) -> PoolStats {
        self.devices.lock().stats()
    }

    pub fn ep_pool_stats(&self) -> PoolStats {
        self.eps.lock().stats()
    }

    pub fn urb_pool_stats(&self) -> PoolStats {
        self.urbs.lock().stats()
    }
}

impl core::fmt::Debug for UsbHost {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UsbHost")
            .field("config", &self.config)
            .field("devices", &self.devices.lock().len())
            .field("endpoints", &self.eps.lock().len())
            .field("urbs", &self.urbs.lock().len())
            .field("events", &self.events)
            .finish()
    }
}
