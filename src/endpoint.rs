//! USB Endpoint descriptor model

use core::fmt;

use crate::{pool::Key, Result, UsbError};

/// Standard endpoint descriptor type code
pub const DESC_TYPE_ENDPOINT: u8 = 0x05;
/// Length of a standard endpoint descriptor
pub const DESC_LEN_ENDPOINT: usize = 7;

/// USB Endpoint Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointType {
    /// Decode bits 1:0 of bmAttributes
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            _ => EndpointType::Interrupt,
        }
    }
}

impl From<EndpointType> for u8 {
    fn from(ep_type: EndpointType) -> u8 {
        match ep_type {
            EndpointType::Control => 0,
            EndpointType::Isochronous => 1,
            EndpointType::Bulk => 2,
            EndpointType::Interrupt => 3,
        }
    }
}

/// USB Endpoint Direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Immutable endpoint descriptor, shared by every open instance of the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpDescriptor {
    address: u8,
    attributes: u8,
    max_packet_size: u16,
    interval: u8,
}

impl EpDescriptor {
    pub fn new(address: u8, attributes: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address,
            attributes,
            max_packet_size,
            interval,
        }
    }

    /// Parse a standard endpoint descriptor
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DESC_LEN_ENDPOINT
            || usize::from(bytes[0]) < DESC_LEN_ENDPOINT
            || bytes[1] != DESC_TYPE_ENDPOINT
        {
            return Err(UsbError::InvalidArgument);
        }

        Ok(Self {
            address: bytes[2],
            attributes: bytes[3],
            max_packet_size: u16::from_le_bytes([bytes[4], bytes[5]]),
            interval: bytes[6],
        })
    }

    /// Descriptor for the implicit default control endpoint
    pub fn default_control(max_packet_size: u16) -> Self {
        Self::new(0, 0, max_packet_size, 0)
    }

    /// Endpoint address (including direction bit)
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    /// Raw wMaxPacketSize, including the high-bandwidth multiplier bits
    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    /// Packet size without the additional-transaction bits 12:11
    pub fn packet_size(&self) -> u16 {
        self.max_packet_size & 0x07FF
    }

    pub fn interval(&self) -> u8 {
        self.interval
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.address)
    }

    pub fn endpoint_type(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }

    pub fn is_control(&self) -> bool {
        self.endpoint_type() == EndpointType::Control
    }

    /// Polling period in (micro)frames for periodic endpoints
    pub fn microframe_interval(&self) -> u16 {
        match self.endpoint_type() {
            EndpointType::Isochronous | EndpointType::Interrupt => match self.interval {
                0 => 1,
                // bInterval is an exponent, 2^(bInterval-1), capped at 2^15.
                n => 1 << (n.min(16) - 1),
            },
            _ => 0,
        }
    }
}

/// Handle to an open endpoint
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EpHandle(pub(crate) Key);

impl EpHandle {
    pub fn raw(self) -> u32 {
        self.0.raw()
    }
}

impl fmt::Debug for EpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EpHandle({:?})", self.0)
    }
}
