//! USB Transfer types and control requests

use static_assertions::assert_eq_size;

use crate::{endpoint::EndpointType, urb::Token};

/// Length of a SETUP stage
pub const SETUP_PACKET_LEN: usize = 8;

/// USB Transfer Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

impl From<TransferType> for EndpointType {
    fn from(xfer_type: TransferType) -> Self {
        match xfer_type {
            TransferType::Control => EndpointType::Control,
            TransferType::Bulk => EndpointType::Bulk,
            TransferType::Interrupt => EndpointType::Interrupt,
            TransferType::Isochronous => EndpointType::Isochronous,
        }
    }
}

/// bmRequestType fields
pub mod request_type {
    pub const DIR_IN: u8 = 0x80;
    pub const DIR_OUT: u8 = 0x00;
    pub const TYPE_STANDARD: u8 = 0x00;
    pub const TYPE_CLASS: u8 = 0x20;
    pub const TYPE_VENDOR: u8 = 0x40;
    pub const RECIPIENT_DEVICE: u8 = 0x00;
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
    pub const RECIPIENT_ENDPOINT: u8 = 0x02;
}

/// Standard request codes
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// Standard feature selectors
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0x00;
    pub const DEVICE_REMOTE_WAKEUP: u16 = 0x01;
}

/// USB Setup Packet for control transfers
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    /// Request type and direction
    pub request_type: u8,
    /// Specific request
    pub request: u8,
    /// Request-specific parameter
    pub value: u16,
    /// Request-specific parameter
    pub index: u16,
    /// Number of bytes to transfer in data stage
    pub length: u16,
}

assert_eq_size!(SetupPacket, [u8; SETUP_PACKET_LEN]);

impl SetupPacket {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// CLEAR_FEATURE(ENDPOINT_HALT) or SET_FEATURE(ENDPOINT_HALT)
    pub fn endpoint_halt(set: bool, ep_address: u8) -> Self {
        Self::new(
            request_type::DIR_OUT | request_type::TYPE_STANDARD | request_type::RECIPIENT_ENDPOINT,
            if set {
                request::SET_FEATURE
            } else {
                request::CLEAR_FEATURE
            },
            feature::ENDPOINT_HALT,
            u16::from(ep_address),
            0,
        )
    }

    /// Check if this is a device-to-host transfer
    pub fn is_device_to_host(&self) -> bool {
        (self.request_type & request_type::DIR_IN) != 0
    }

    /// Wire encoding, multi-byte fields little-endian
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        let (value, index, length) = (self.value, self.index, self.length);
        let mut bytes = [0u8; SETUP_PACKET_LEN];
        bytes[0] = self.request_type;
        bytes[1] = self.request;
        bytes[2..4].copy_from_slice(&value.to_le_bytes());
        bytes[4..6].copy_from_slice(&index.to_le_bytes());
        bytes[6..8].copy_from_slice(&length.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; SETUP_PACKET_LEN]) -> Self {
        Self::new(
            bytes[0],
            bytes[1],
            u16::from_le_bytes([bytes[2], bytes[3]]),
            u16::from_le_bytes([bytes[4], bytes[5]]),
            u16::from_le_bytes([bytes[6], bytes[7]]),
        )
    }

    /// Token of the data stage, if there is one
    pub fn data_token(&self) -> Option<Token> {
        match (self.length, self.is_device_to_host()) {
            (0, _) => None,
            (_, true) => Some(Token::In),
            (_, false) => Some(Token::Out),
        }
    }

    /// Token of the status stage (USB 2.0 §8.5.3): opposite to the data
    /// stage, IN when there is no data stage.
    pub fn status_token(&self) -> Token {
        match self.data_token() {
            Some(Token::In) => Token::Out,
            _ => Token::In,
        }
    }
}
