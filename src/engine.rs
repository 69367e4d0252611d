//! Transfer submission
//!
//! Every transfer becomes one URB queued on its endpoint. Synchronous calls
//! are built on the async path: they submit with an internal callback and
//! wait on a semaphore.

use alloc::{boxed::Box, vec::Vec};

use crate::{
    device::{DevHandle, Device},
    endpoint::{Direction, EndpointType, EpHandle},
    ep_mgmt::EpMgmt,
    host::UsbHost,
    kal::TIMEOUT_INFINITE,
    state::EpState,
    transfer::{SetupPacket, TransferType, SETUP_PACKET_LEN},
    urb::{
        IsocFrames, SyncCompletion, Token, Urb, UrbCallback, UrbCompletion, UrbFuture, UrbParams,
        XferBuf,
    },
    Result, UsbError,
};

/// Everything `submit` needs besides the handles
struct Request {
    xfer_type: TransferType,
    token: Token,
    buf: XferBuf,
    owned: Option<Vec<u8>>,
    isoc: Option<IsocFrames>,
    callback: UrbCallback,
}

impl Request {
    fn borrowed(xfer_type: TransferType, token: Token, buf: XferBuf, callback: UrbCallback) -> Self {
        Self {
            xfer_type,
            token,
            buf,
            owned: None,
            isoc: None,
            callback,
        }
    }

    fn owned(xfer_type: TransferType, token: Token, mut buf: Vec<u8>, callback: UrbCallback) -> Self {
        // The heap block does not move when the Vec itself is moved.
        let view = XferBuf::from_mut_slice(&mut buf);
        Self {
            xfer_type,
            token,
            buf: view,
            owned: Some(buf),
            isoc: None,
            callback,
        }
    }
}

impl UsbHost {
    fn submit(&self, dev: DevHandle, ep: EpHandle, req: Request, timeout_ms: u32) -> Result<()> {
        let device = self.device_acquire(dev)?;
        let mgmt = self.ep_mgmt(dev, ep)?;

        let params = UrbParams {
            dev,
            ep,
            dev_address: device.address(),
            ep_address: mgmt.descriptor().address(),
            buf: req.buf,
            token: req.token,
            isoc: req.isoc,
        };
        let key = self.urbs.lock().alloc(Urb {
            params,
            owned: req.owned,
            hcd_urb: None,
            callback: req.callback,
        })?;

        if let Err(e) = mgmt.enter(
            self.kernel(),
            EpState::Preparing,
            self.config.max_queued_urbs,
            timeout_ms,
        ) {
            self.urbs.lock().free(key);
            return Err(e);
        }

        let submitted = Self::check_request(&device, &mgmt, req.xfer_type, req.token)
            .and_then(|()| mgmt.hcd_ep())
            .and_then(|hcd_ep| self.hcd.urb_submit(hcd_ep, &params));

        match submitted {
            Ok(hcd_urb) => {
                if let Some(urb) = self.urbs.lock().get_mut(key) {
                    urb.hcd_urb = Some(hcd_urb);
                }
                mgmt.leave_with_push(key);
                Ok(())
            }
            Err(e) => {
                mgmt.leave();
                self.urbs.lock().free(key);
                log::debug!(
                    "device {}: ep {:#04x} {:?} submit failed: {}",
                    params.dev_address,
                    params.ep_address,
                    params.token,
                    e
                );
                if e.is_fatal() {
                    self.escalate(&device);
                }
                Err(e)
            }
        }
    }

    /// Validation done while holding `Preparing`
    fn check_request(device: &Device, mgmt: &EpMgmt, xfer_type: TransferType, token: Token) -> Result<()> {
        let ep_type = mgmt.endpoint_type();
        if ep_type == EndpointType::Control && device.is_closing() {
            return Err(UsbError::InvalidState);
        }
        if mgmt.is_implicit_ctrl() {
            return Ok(());
        }
        if EndpointType::from(xfer_type) != ep_type {
            return Err(UsbError::EndpointInvalid);
        }

        match (ep_type, token, mgmt.descriptor().direction()) {
            (EndpointType::Control, _, _) => Ok(()),
            (_, Token::In, Direction::In) | (_, Token::Out, Direction::Out) => Ok(()),
            _ => Err(UsbError::EndpointInvalid),
        }
    }

    /// Submit and wait. On timeout the endpoint is aborted and the call
    /// still waits for the aborted URB's callback before returning.
    fn xfer_sync(
        &self,
        dev: DevHandle,
        ep: EpHandle,
        xfer_type: TransferType,
        token: Token,
        buf: XferBuf,
        timeout_ms: u32,
    ) -> Result<usize> {
        let done = SyncCompletion::new();
        let req = Request::borrowed(xfer_type, token, buf, done.callback());
        self.submit(dev, ep, req, timeout_ms)?;

        match done.pend(self.kernel(), timeout_ms) {
            Ok(()) => done.outcome(),
            Err(_) => {
                log::debug!("{:?}: {:?} transfer timed out after {} ms", ep, token, timeout_ms);
                if let Err(e) = self.abort(dev, ep) {
                    log::warn!("{:?}: abort after timeout failed: {}", ep, e);
                }
                // The buffer is borrowed: the callback must have run.
                done.pend_forever(self.kernel());
                Err(UsbError::Timeout)
            }
        }
    }

    fn submit_async(
        &self,
        dev: DevHandle,
        ep: EpHandle,
        xfer_type: TransferType,
        token: Token,
        buf: Vec<u8>,
        isoc: Option<IsocFrames>,
        callback: UrbCallback,
    ) -> Result<()> {
        let mut req = Request::owned(xfer_type, token, buf, callback);
        req.isoc = isoc;
        self.submit(dev, ep, req, TIMEOUT_INFINITE)
    }

    /// Bulk IN, blocking; returns the bytes received
    pub fn bulk_read(&self, dev: DevHandle, ep: EpHandle, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let buf = XferBuf::from_mut_slice(buf);
        self.xfer_sync(dev, ep, TransferType::Bulk, Token::In, buf, timeout_ms)
    }

    /// Bulk OUT, blocking; returns the bytes sent
    pub fn bulk_write(&self, dev: DevHandle, ep: EpHandle, buf: &[u8], timeout_ms: u32) -> Result<usize> {
        let buf = XferBuf::from_slice(buf);
        self.xfer_sync(dev, ep, TransferType::Bulk, Token::Out, buf, timeout_ms)
    }

    pub fn intr_read(&self, dev: DevHandle, ep: EpHandle, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        let buf = XferBuf::from_mut_slice(buf);
        self.xfer_sync(dev, ep, TransferType::Interrupt, Token::In, buf, timeout_ms)
    }

    pub fn intr_write(&self, dev: DevHandle, ep: EpHandle, buf: &[u8], timeout_ms: u32) -> Result<usize> {
        let buf = XferBuf::from_slice(buf);
        self.xfer_sync(dev, ep, TransferType::Interrupt, Token::Out, buf, timeout_ms)
    }

    /// Queue a bulk IN transfer. `callback` receives the buffer back.
    pub fn bulk_read_async(
        &self,
        dev: DevHandle,
        ep: EpHandle,
        buf: Vec<u8>,
        callback: impl FnOnce(UrbCompletion) + Send + 'static,
    ) -> Result<()> {
        self.submit_async(dev, ep, TransferType::Bulk, Token::In, buf, None, Box::new(callback))
    }

    pub fn bulk_write_async(
        &self,
        dev: DevHandle,
        ep: EpHandle,
        buf: Vec<u8>,
        callback: impl FnOnce(UrbCompletion) + Send + 'static,
    ) -> Result<()> {
        self.submit_async(dev, ep, TransferType::Bulk, Token::Out, buf, None, Box::new(callback))
    }

    pub fn intr_read_async(
        &self,
        dev: DevHandle,
        ep: EpHandle,
        buf: Vec<u8>,
        callback: impl FnOnce(UrbCompletion) + Send + 'static,
    ) -> Result<()> {
        self.submit_async(dev, ep, TransferType::Interrupt, Token::In, buf, None, Box::new(callback))
    }

    pub fn intr_write_async(
        &self,
        dev: DevHandle,
        ep: EpHandle,
        buf: Vec<u8>,
        callback: impl FnOnce(UrbCompletion) + Send + 'static,
    ) -> Result<()> {
        self.submit_async(dev, ep, TransferType::Interrupt, Token::Out, buf, None, Box::new(callback))
    }

    /// Queue an isochronous IN transfer over `frame_count` frames
    pub fn isoc_read_async(
        &self,
        dev: DevHandle,
        ep: EpHandle,
        buf: Vec<u8>,
        frame_start: u16,
        frame_count: u8,
        callback: impl FnOnce(UrbCompletion) + Send + 'static,
    ) -> Result<()> {
        let isoc = IsocFrames {
            start: frame_start,
            count: frame_count,
        };
        self.submit_async(dev, ep, TransferType::Isochronous, Token::In, buf, Some(isoc), Box::new(callback))
    }

    pub fn isoc_write_async(
        &self,
        dev: DevHandle,
        ep: EpHandle,
        buf: Vec<u8>,
        frame_start: u16,
        frame_count: u8,
        callback: impl FnOnce(UrbCompletion) + Send + 'static,
    ) -> Result<()> {
        let isoc = IsocFrames {
            start: frame_start,
            count: frame_count,
        };
        self.submit_async(dev, ep, TransferType::Isochronous, Token::Out, buf, Some(isoc), Box::new(callback))
    }

    /// Queue a bulk or interrupt transfer and await it
    pub fn submit_future(
        &self,
        dev: DevHandle,
        ep: EpHandle,
        xfer_type: TransferType,
        token: Token,
        buf: Vec<u8>,
    ) -> UrbFuture {
        let (future, callback) = UrbFuture::new();
        match self.submit_async(dev, ep, xfer_type, token, buf, None, callback) {
            Ok(()) => future,
            Err(e) => future.failed(e),
        }
    }

    /// Control transfer on the device's default endpoint.
    ///
    /// Runs SETUP, an optional DATA stage of `length` bytes from `buf`, and
    /// STATUS as one unit under the device control lock. Returns the bytes
    /// moved in the DATA stage.
    #[allow(clippy::too_many_arguments)]
    pub fn ctrl_xfer(
        &self,
        dev: DevHandle,
        request: u8,
        request_type: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        length: u16,
        timeout_ms: u32,
    ) -> Result<usize> {
        let setup = SetupPacket::new(request_type, request, value, index, length);
        self.ctrl_request(dev, setup, buf, timeout_ms)
    }

    pub(crate) fn ctrl_request(
        &self,
        dev: DevHandle,
        setup: SetupPacket,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize> {
        let length = usize::from(setup.length);
        let data = buf.get_mut(..length).ok_or(UsbError::InvalidArgument)?;

        let device = self.device_acquire(dev)?;
        let ep = device.dflt_ep().ok_or(UsbError::InvalidState)?;
        let _ctrl = device.ctrl_lock.acquire(self.kernel(), timeout_ms)?;

        let mut setup_bytes = setup.to_bytes();
        let sent = self.xfer_sync(
            dev,
            ep,
            TransferType::Control,
            Token::Setup,
            XferBuf::from_mut_slice(&mut setup_bytes),
            timeout_ms,
        )?;
        if sent != SETUP_PACKET_LEN {
            log::warn!("device {}: short SETUP stage ({} bytes)", device.address(), sent);
            return Err(UsbError::TransmitError);
        }

        let xfer_len = match setup.data_token() {
            Some(token) => self.xfer_sync(
                dev,
                ep,
                TransferType::Control,
                token,
                XferBuf::from_mut_slice(data),
                timeout_ms,
            )?,
            None => 0,
        };

        self.xfer_sync(
            dev,
            ep,
            TransferType::Control,
            setup.status_token(),
            XferBuf::empty(),
            timeout_ms,
        )?;
        Ok(xfer_len)
    }

    /// Set or clear the halt condition of an endpoint.
    ///
    /// Clearing resets the controller's data toggle first, then sends
    /// CLEAR_FEATURE(ENDPOINT_HALT); setting only sends SET_FEATURE.
    pub fn set_stall(&self, dev: DevHandle, ep: EpHandle, set: bool) -> Result<()> {
        let mgmt = self.ep_mgmt(dev, ep)?;
        let ep_address = mgmt.descriptor().address();

        if !set {
            mgmt.enter(
                self.kernel(),
                EpState::Preparing,
                self.config.max_queued_urbs,
                TIMEOUT_INFINITE,
            )?;
            let cleared = mgmt
                .hcd_ep()
                .and_then(|hcd_ep| self.hcd.ep_halt_clr(hcd_ep, false));
            mgmt.leave();
            cleared?;
        }

        let setup = SetupPacket::endpoint_halt(set, ep_address);
        self.ctrl_request(dev, setup, &mut [], self.config.ctrl_lock_timeout_ms)
            .map(|_| ())
    }
}
