//! USB host transfer engine for PrismaOS
//!
//! Sits between class drivers and a host controller driver. Class drivers
//! open endpoints and queue transfers through [`UsbHost`]; the controller
//! driver implements [`HostController`] and reports finished transfers with
//! [`UsbHost::urb_done`]. A delivery task ([`UsbHost::run_async_task`] or
//! [`UsbHost::async_task`]) turns those reports into completion callbacks.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod hcd;
pub mod kal;
pub mod pool;
pub mod state;
pub mod transfer;
pub mod urb;

mod completion;
mod engine;
mod ep_mgmt;
mod host;

pub use config::HostConfig;
pub use device::{DevHandle, Device, DeviceInfo, DeviceSpeed, MAX_EPS_PER_DEVICE};
pub use endpoint::{Direction, EndpointType, EpDescriptor, EpHandle};
pub use error::{PoolKind, Result, UsbError};
pub use hcd::{EpOpenParams, HcdEp, HcdUrb, HostController, PortControl};
pub use host::UsbHost;
pub use kal::{Kernel, TIMEOUT_INFINITE};
pub use pool::{PoolCapacity, PoolStats};
pub use state::EpState;
pub use transfer::{SetupPacket, TransferType, SETUP_PACKET_LEN};
pub use urb::{IsocFrames, Token, UrbCompletion, UrbFuture, UrbParams, XferBuf};
