use core::fmt;

/// Pool a failed allocation was drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Attached device records
    Device,
    /// Open endpoint management instances
    Endpoint,
    /// Per-device active endpoint table
    DeviceEndpointTable,
    /// Transfer request records
    Urb,
    /// Async event records
    AsyncEvent,
}

/// USB host error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Handle refers to a slot that was released or never allocated
    InvalidHandle,
    /// Argument out of range for the operation
    InvalidArgument,
    /// Device or endpoint is in the wrong lifecycle phase
    InvalidState,
    /// Token or transfer type does not match the endpoint descriptor
    EndpointInvalid,
    /// Pool exhausted
    AllocationFailed(PoolKind),
    /// Transfer timeout
    Timeout,
    /// Transfer was aborted
    Abort,
    /// Unexpected transferred length
    TransmitError,
    /// Bus-level failure, the device must be disconnected
    IoFatal,
    /// Stall condition
    Stall,
    /// Babble condition
    Babble,
    /// Data buffer error
    DataBuffer,
    /// Transaction error
    TransactionError,
    /// Not supported by the host controller
    NotSupported,
    /// Host controller specific error code
    Hcd(u16),
}

impl UsbError {
    /// Get a human-readable description of the error
    pub fn description(self) -> &'static str {
        match self {
            UsbError::InvalidHandle => "invalid USB handle",
            UsbError::InvalidArgument => "invalid argument",
            UsbError::InvalidState => "device or endpoint in invalid state",
            UsbError::EndpointInvalid => "endpoint type or direction mismatch",
            UsbError::AllocationFailed(PoolKind::Device) => "device pool exhausted",
            UsbError::AllocationFailed(PoolKind::Endpoint) => "endpoint pool exhausted",
            UsbError::AllocationFailed(PoolKind::DeviceEndpointTable) => {
                "device endpoint table full"
            }
            UsbError::AllocationFailed(PoolKind::Urb) => "URB pool exhausted",
            UsbError::AllocationFailed(PoolKind::AsyncEvent) => "async event pool exhausted",
            UsbError::Timeout => "USB transfer timeout",
            UsbError::Abort => "USB transfer aborted",
            UsbError::TransmitError => "unexpected transfer length",
            UsbError::IoFatal => "fatal USB I/O error",
            UsbError::Stall => "USB endpoint stall condition",
            UsbError::Babble => "USB babble condition",
            UsbError::DataBuffer => "USB data buffer error",
            UsbError::TransactionError => "USB transaction error",
            UsbError::NotSupported => "USB operation not supported",
            UsbError::Hcd(_) => "host controller error",
        }
    }

    /// True when the error means the physical link cannot be trusted and the
    /// upstream port has to be disconnected.
    pub fn is_fatal(self) -> bool {
        self == UsbError::IoFatal
    }
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbError::Hcd(code) => write!(f, "{} ({:#06x})", self.description(), code),
            _ => f.write_str(self.description()),
        }
    }
}

/// Result type for USB host operations
pub type Result<T> = core::result::Result<T, UsbError>;
