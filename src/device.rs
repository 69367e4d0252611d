//! USB Device records
//!
//! Enumeration and descriptor parsing happen elsewhere; the engine only keeps
//! the fields it needs to address a device and to serialise work on it.

use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};
use heapless::Vec as HVec;
use spin::Mutex;

use crate::{
    endpoint::EpHandle,
    error::PoolKind,
    kal::Lock,
    pool::Key,
    Result, UsbError,
};

/// Endpoints a device can have open at once (16 numbers, two directions)
pub const MAX_EPS_PER_DEVICE: usize = 32;

/// USB Device Speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Low,    // 1.5 Mbps
    Full,   // 12 Mbps
    High,   // 480 Mbps
    Super,  // 5 Gbps
}

impl DeviceSpeed {
    /// Default control endpoint packet size before the device descriptor is read
    pub fn default_ep0_max_packet_size(self) -> u16 {
        match self {
            DeviceSpeed::Low => 8,
            DeviceSpeed::Full | DeviceSpeed::High => 64,
            DeviceSpeed::Super => 512,
        }
    }
}

/// Handle to an attached device
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevHandle(pub(crate) Key);

impl DevHandle {
    pub fn raw(self) -> u32 {
        self.0.raw()
    }
}

impl fmt::Debug for DevHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevHandle({:?})", self.0)
    }
}

/// Cached device fields
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    /// Bus address assigned during enumeration
    pub address: u8,
    pub speed: DeviceSpeed,
    /// Upstream hub, `None` for the root hub
    pub hub: Option<DevHandle>,
    /// Port on the upstream hub
    pub port: u8,
    pub ep0_max_packet_size: u16,
}

impl DeviceInfo {
    pub fn new(address: u8, speed: DeviceSpeed, hub: Option<DevHandle>, port: u8) -> Self {
        Self {
            address,
            speed,
            hub,
            port,
            ep0_max_packet_size: speed.default_ep0_max_packet_size(),
        }
    }
}

/// USB Device
pub struct Device {
    info: DeviceInfo,
    closing: AtomicBool,
    /// Default control endpoint, set once attach has opened it
    dflt_ep: Mutex<Option<EpHandle>>,
    /// Serialises control transfers (setup/data/status never interleave)
    pub(crate) ctrl_lock: Lock,
    /// Serialises abort and close against endpoint removal
    pub(crate) ep_list_lock: Lock,
    eps: Mutex<HVec<EpHandle, MAX_EPS_PER_DEVICE>>,
}

impl Device {
    pub(crate) fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            closing: AtomicBool::new(false),
            dflt_ep: Mutex::new(None),
            ctrl_lock: Lock::new(),
            ep_list_lock: Lock::new(),
            eps: Mutex::new(HVec::new()),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn address(&self) -> u8 {
        self.info.address
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.info.speed
    }

    pub fn hub(&self) -> Option<DevHandle> {
        self.info.hub
    }

    pub fn port(&self) -> u8 {
        self.info.port
    }

    /// True once detach has started
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    pub fn dflt_ep(&self) -> Option<EpHandle> {
        *self.dflt_ep.lock()
    }

    pub(crate) fn set_dflt_ep(&self, ep: Option<EpHandle>) {
        *self.dflt_ep.lock() = ep;
    }

    pub(crate) fn has_free_ep_slot(&self) -> bool {
        !self.eps.lock().is_full()
    }

    pub(crate) fn install_ep(&self, ep: EpHandle) -> Result<()> {
        self.eps
            .lock()
            .push(ep)
            .map_err(|_| UsbError::AllocationFailed(PoolKind::DeviceEndpointTable))
    }

    /// Remove `ep` from the active table; `f` runs in the same critical section
    pub(crate) fn remove_ep_with(&self, ep: EpHandle, f: impl FnOnce()) -> bool {
        let mut eps = self.eps.lock();
        match eps.iter().position(|e| *e == ep) {
            Some(pos) => {
                eps.swap_remove(pos);
                f();
                true
            }
            None => false,
        }
    }

    pub fn endpoints(&self) -> HVec<EpHandle, MAX_EPS_PER_DEVICE> {
        self.eps.lock().clone()
    }

    pub fn endpoint_count(&self) -> usize {
        self.eps.lock().len()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.info.address)
            .field("speed", &self.info.speed)
            .field("port", &self.info.port)
            .field("closing", &self.is_closing())
            .field("endpoints", &self.endpoint_count())
            .finish()
    }
}
