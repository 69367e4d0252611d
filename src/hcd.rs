//! Host controller and hub collaborator interfaces

use alloc::sync::Arc;

use crate::{
    device::{DevHandle, DeviceSpeed},
    endpoint::{EndpointType, EpHandle},
    urb::UrbParams,
    Result,
};

/// Controller-side endpoint handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HcdEp(pub usize);

/// Controller-side transfer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HcdUrb(pub usize);

/// Parameters for opening an endpoint on the controller
#[derive(Debug, Clone, Copy)]
pub struct EpOpenParams {
    pub dev: DevHandle,
    pub ep: EpHandle,
    pub address: u8,
    pub ep_type: EndpointType,
    pub max_packet_size: u16,
    pub interval: u8,
    pub dev_address: u8,
    pub speed: DeviceSpeed,
}

/// Host controller driver
///
/// The engine guarantees that at most one of `urb_submit`, `urb_complete`,
/// `urb_abort`, `ep_halt_clr` and `ep_close` runs for a given endpoint at a
/// time, and never calls into the driver while holding an engine lock.
/// When a transfer finishes the driver reports it through
/// [`crate::UsbHost::urb_done`], in FIFO order per endpoint. Once
/// `urb_abort` has returned for a transfer it must not be reported.
pub trait HostController: Send + Sync {
    fn ep_open(&self, params: &EpOpenParams) -> Result<HcdEp>;

    fn ep_close(&self, ep: HcdEp) -> Result<()>;

    fn ep_halt_clr(&self, ep: HcdEp, notify: bool) -> Result<()>;

    fn ep_suspend(&self, ep: HcdEp, suspend: bool) -> Result<()>;

    fn urb_submit(&self, ep: HcdEp, params: &UrbParams) -> Result<HcdUrb>;

    fn urb_abort(&self, ep: HcdEp, urb: HcdUrb, params: &UrbParams);

    /// Collect the outcome of a finished transfer: bytes moved and status
    fn urb_complete(&self, ep: HcdEp, urb: HcdUrb, params: &UrbParams) -> (usize, Result<()>);
}

/// Upstream hub port control
pub trait PortControl: Send + Sync {
    /// Tear down the link on `port` of `hub` (`None` for the root hub)
    fn request_port_disconnect(&self, hub: Option<DevHandle>, port: u8);
}

impl<T: HostController + ?Sized> HostController for Arc<T> {
    fn ep_open(&self, params: &EpOpenParams) -> Result<HcdEp> {
        (**self).ep_open(params)
    }

    fn ep_close(&self, ep: HcdEp) -> Result<()> {
        (**self).ep_close(ep)
    }

    fn ep_halt_clr(&self, ep: HcdEp, notify: bool) -> Result<()> {
        (**self).ep_halt_clr(ep, notify)
    }

    fn ep_suspend(&self, ep: HcdEp, suspend: bool) -> Result<()> {
        (**self).ep_suspend(ep, suspend)
    }

    fn urb_submit(&self, ep: HcdEp, params: &UrbParams) -> Result<HcdUrb> {
        (**self).urb_submit(ep, params)
    }

    fn urb_abort(&self, ep: HcdEp, urb: HcdUrb, params: &UrbParams) {
        (**self).urb_abort(ep, urb, params)
    }

    fn urb_complete(&self, ep: HcdEp, urb: HcdUrb, params: &UrbParams) -> (usize, Result<()>) {
        (**self).urb_complete(ep, urb, params)
    }
}

impl<T: PortControl + ?Sized> PortControl for Arc<T> {
    fn request_port_disconnect(&self, hub: Option<DevHandle>, port: u8) {
        (**self).request_port_disconnect(hub, port)
    }
}
