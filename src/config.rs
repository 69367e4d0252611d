//! Host stack configuration

use crate::{pool::PoolCapacity, Result, UsbError};

/// Sizing and timing knobs for [`crate::UsbHost`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    /// Attached devices
    pub devices: PoolCapacity,
    /// Open endpoints across all devices
    pub endpoints: PoolCapacity,
    /// In-flight transfer requests across all endpoints
    pub urbs: PoolCapacity,
    /// Preallocated async event records
    pub async_events: usize,
    /// Transfers one endpoint may have queued; 255 matches an 8-bit
    /// controller counter
    pub max_queued_urbs: usize,
    /// Wait for the device control lock when clearing or setting a halt
    pub ctrl_lock_timeout_ms: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            devices: PoolCapacity::Bounded(16),
            endpoints: PoolCapacity::Bounded(64),
            urbs: PoolCapacity::Bounded(128),
            async_events: 64,
            max_queued_urbs: u8::MAX as usize,
            ctrl_lock_timeout_ms: 5000,
        }
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn devices(mut self, capacity: PoolCapacity) -> Self {
        self.devices = capacity;
        self
    }

    pub fn endpoints(mut self, capacity: PoolCapacity) -> Self {
        self.endpoints = capacity;
        self
    }

    pub fn urbs(mut self, capacity: PoolCapacity) -> Self {
        self.urbs = capacity;
        self
    }

    pub fn async_events(mut self, count: usize) -> Self {
        self.async_events = count;
        self
    }

    pub fn max_queued_urbs(mut self, count: usize) -> Self {
        self.max_queued_urbs = count;
        self
    }

    pub fn ctrl_lock_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.ctrl_lock_timeout_ms = timeout_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let empty = PoolCapacity::Bounded(0);
        if self.devices == empty
            || self.endpoints == empty
            || self.urbs == empty
            || self.async_events == 0
            || self.max_queued_urbs == 0
        {
            return Err(UsbError::InvalidArgument);
        }
        Ok(())
    }
}
