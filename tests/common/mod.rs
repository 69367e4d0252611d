//! Shared fixtures: a scripted host controller, a recording hub, a
//! std-backed kernel and a harness running the delivery task on a thread.

#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use prisma_usbh::{
    DevHandle, DeviceInfo, DeviceSpeed, EndpointType, EpDescriptor, EpHandle, EpOpenParams,
    HcdEp, HcdUrb, HostConfig, HostController, IsocFrames, Kernel, PortControl, Result, Token,
    UrbParams, UsbError, UsbHost,
};

/// Byte written into every IN buffer the mock fills
pub const IN_PATTERN: u8 = 0xA5;

pub fn bulk_in() -> EpDescriptor {
    EpDescriptor::new(0x81, 0x02, 512, 0)
}

pub fn bulk_out() -> EpDescriptor {
    EpDescriptor::new(0x02, 0x02, 512, 0)
}

pub fn intr_in() -> EpDescriptor {
    EpDescriptor::new(0x83, 0x03, 64, 4)
}

pub fn isoc_in() -> EpDescriptor {
    EpDescriptor::new(0x84, 0x01, 1024, 1)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Open {
        ep: HcdEp,
        address: u8,
        ep_type: EndpointType,
    },
    Close(HcdEp),
    HaltClr(HcdEp),
    Suspend(HcdEp, bool),
    Submit {
        ep: HcdEp,
        urb: HcdUrb,
        token: Token,
        len: usize,
        data: Vec<u8>,
        isoc: Option<IsocFrames>,
        dev_address: u8,
        ep_address: u8,
    },
    Abort {
        ep: HcdEp,
        urb: HcdUrb,
    },
    Complete {
        ep: HcdEp,
        urb: HcdUrb,
    },
}

/// How the simulated hardware answers a transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    Done(usize, Result<()>),
    Hang,
}

pub type Responder = Arc<dyn Fn(&UrbParams) -> Reply + Send + Sync>;

struct InFlight {
    ep: HcdEp,
    urb: HcdUrb,
    params: UrbParams,
    outcome: Option<(usize, Result<()>)>,
}

struct MockState {
    calls: Vec<Call>,
    in_flight: Vec<InFlight>,
    responder: Responder,
    submit_errors: Vec<UsbError>,
    open_error: Option<UsbError>,
    close_error: Option<UsbError>,
}

/// Scripted host controller
pub struct MockHcd {
    state: Mutex<MockState>,
    busy: Mutex<HashSet<HcdEp>>,
    overlaps: AtomicUsize,
    call_delay_us: AtomicU64,
    open_delay_us: AtomicU64,
    next_ep: AtomicUsize,
    next_urb: AtomicUsize,
}

fn complete_all(params: &UrbParams) -> Reply {
    Reply::Done(params.buf.len(), Ok(()))
}

impl MockHcd {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                calls: Vec::new(),
                in_flight: Vec::new(),
                responder: Arc::new(complete_all),
                submit_errors: Vec::new(),
                open_error: None,
                close_error: None,
            }),
            busy: Mutex::new(HashSet::new()),
            overlaps: AtomicUsize::new(0),
            call_delay_us: AtomicU64::new(0),
            open_delay_us: AtomicU64::new(0),
            next_ep: AtomicUsize::new(1),
            next_urb: AtomicUsize::new(1),
        }
    }

    pub fn respond_with(&self, responder: impl Fn(&UrbParams) -> Reply + Send + Sync + 'static) {
        self.state.lock().unwrap().responder = Arc::new(responder);
    }

    pub fn hang(&self) {
        self.respond_with(|_| Reply::Hang);
    }

    pub fn fail_next_submit(&self, err: UsbError) {
        self.state.lock().unwrap().submit_errors.push(err);
    }

    pub fn fail_next_open(&self, err: UsbError) {
        self.state.lock().unwrap().open_error = Some(err);
    }

    pub fn fail_next_close(&self, err: UsbError) {
        self.state.lock().unwrap().close_error = Some(err);
    }

    /// Stretch every endpoint-scoped driver call to widen race windows
    pub fn set_call_delay(&self, delay: Duration) {
        self.call_delay_us
            .store(delay.as_micros() as u64, Ordering::SeqCst);
    }

    /// Make opens of non-default endpoints slow, like a controller that
    /// has to allocate and program a transfer ring first
    pub fn set_open_delay(&self, delay: Duration) {
        self.open_delay_us
            .store(delay.as_micros() as u64, Ordering::SeqCst);
    }

    /// Driver calls that ran concurrently for the same endpoint
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn submits(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Submit { .. }))
            .collect()
    }

    pub fn submitted_urbs(&self) -> Vec<HcdUrb> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Submit { urb, .. } => Some(urb),
                _ => None,
            })
            .collect()
    }

    pub fn aborted_urbs(&self) -> Vec<HcdUrb> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Abort { urb, .. } => Some(urb),
                _ => None,
            })
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    /// Run the simulated hardware once: answer the oldest unanswered
    /// transfer of each endpoint and report it to the host.
    pub fn step(&self, host: &UsbHost) {
        let mut state = self.state.lock().unwrap();
        let responder = state.responder.clone();
        let mut blocked = HashSet::new();

        for entry in state.in_flight.iter_mut() {
            if entry.outcome.is_some() || blocked.contains(&entry.ep) {
                continue;
            }
            match responder(&entry.params) {
                Reply::Hang => {
                    blocked.insert(entry.ep);
                }
                Reply::Done(len, status) => {
                    if entry.params.token == Token::In && status.is_ok() {
                        let mut buf = entry.params.buf;
                        let n = len.min(buf.len());
                        // The submitter keeps the buffer alive until abort or completion.
                        unsafe { buf.as_mut_slice()[..n].fill(IN_PATTERN) };
                    }
                    // Reported under the lock so an abort cannot slip in between.
                    match host.urb_done(entry.params.dev, entry.params.ep) {
                        Ok(()) => entry.outcome = Some((len, status)),
                        Err(_) => {
                            blocked.insert(entry.ep);
                        }
                    }
                }
            }
        }
    }

    fn enter(&self, ep: HcdEp) -> BusyGuard<'_> {
        if !self.busy.lock().unwrap().insert(ep) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let delay = self.call_delay_us.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_micros(delay));
        }
        BusyGuard { hcd: self, ep }
    }
}

struct BusyGuard<'a> {
    hcd: &'a MockHcd,
    ep: HcdEp,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.hcd.busy.lock().unwrap().remove(&self.ep);
    }
}

impl HostController for MockHcd {
    fn ep_open(&self, params: &EpOpenParams) -> Result<HcdEp> {
        let delay = self.open_delay_us.load(Ordering::SeqCst);
        if delay > 0 && params.address != 0 {
            thread::sleep(Duration::from_micros(delay));
        }
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.open_error.take() {
            return Err(err);
        }
        let ep = HcdEp(self.next_ep.fetch_add(1, Ordering::SeqCst));
        state.calls.push(Call::Open {
            ep,
            address: params.address,
            ep_type: params.ep_type,
        });
        Ok(ep)
    }

    fn ep_close(&self, ep: HcdEp) -> Result<()> {
        let _busy = self.enter(ep);
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Close(ep));
        match state.close_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn ep_halt_clr(&self, ep: HcdEp, _notify: bool) -> Result<()> {
        let _busy = self.enter(ep);
        self.state.lock().unwrap().calls.push(Call::HaltClr(ep));
        Ok(())
    }

    fn ep_suspend(&self, ep: HcdEp, suspend: bool) -> Result<()> {
        self.state.lock().unwrap().calls.push(Call::Suspend(ep, suspend));
        Ok(())
    }

    fn urb_submit(&self, ep: HcdEp, params: &UrbParams) -> Result<HcdUrb> {
        let _busy = self.enter(ep);
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.submit_errors.pop() {
            return Err(err);
        }

        let urb = HcdUrb(self.next_urb.fetch_add(1, Ordering::SeqCst));
        let data = match params.token {
            Token::In => Vec::new(),
            // Valid for the duration of this call.
            _ => unsafe { params.buf.as_slice().to_vec() },
        };
        state.calls.push(Call::Submit {
            ep,
            urb,
            token: params.token,
            len: params.buf.len(),
            data,
            isoc: params.isoc,
            dev_address: params.dev_address,
            ep_address: params.ep_address,
        });
        state.in_flight.push(InFlight {
            ep,
            urb,
            params: *params,
            outcome: None,
        });
        Ok(urb)
    }

    fn urb_abort(&self, ep: HcdEp, urb: HcdUrb, _params: &UrbParams) {
        let _busy = self.enter(ep);
        let mut state = self.state.lock().unwrap();
        state.in_flight.retain(|entry| entry.urb != urb);
        state.calls.push(Call::Abort { ep, urb });
    }

    fn urb_complete(&self, ep: HcdEp, urb: HcdUrb, _params: &UrbParams) -> (usize, Result<()>) {
        let _busy = self.enter(ep);
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Complete { ep, urb });
        match state.in_flight.iter().position(|entry| entry.urb == urb) {
            Some(pos) => state
                .in_flight
                .remove(pos)
                .outcome
                .unwrap_or((0, Err(UsbError::InvalidState))),
            None => (0, Err(UsbError::InvalidState)),
        }
    }
}

/// Hub that records disconnect requests
#[derive(Default)]
pub struct RecordingHub {
    requests: Mutex<Vec<(Option<DevHandle>, u8)>>,
}

impl RecordingHub {
    pub fn requests(&self) -> Vec<(Option<DevHandle>, u8)> {
        self.requests.lock().unwrap().clone()
    }
}

impl PortControl for RecordingHub {
    fn request_port_disconnect(&self, hub: Option<DevHandle>, port: u8) {
        self.requests.lock().unwrap().push((hub, port));
    }
}

/// Kernel backed by the std clock
pub struct StdKernel {
    start: Instant,
}

impl StdKernel {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Kernel for StdKernel {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn yield_now(&self) {
        thread::sleep(Duration::from_micros(50));
    }
}

/// Host wired to the mock controller, with hardware and delivery threads
pub struct Harness {
    pub host: Arc<UsbHost>,
    pub hcd: Arc<MockHcd>,
    pub hub: Arc<RecordingHub>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(HostConfig::default())
    }

    pub fn with_config(config: HostConfig) -> Self {
        Self::build(config, true)
    }

    /// No delivery thread; tests drive `process_async_events` themselves
    pub fn without_delivery(config: HostConfig) -> Self {
        Self::build(config, false)
    }

    fn build(config: HostConfig, delivery: bool) -> Self {
        let hcd = Arc::new(MockHcd::new());
        let hub = Arc::new(RecordingHub::default());
        let host = Arc::new(
            UsbHost::new(config, hcd.clone(), hub.clone(), StdKernel::new())
                .expect("host init"),
        );
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        {
            let (host, hcd, stop) = (host.clone(), hcd.clone(), stop.clone());
            threads.push(thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    hcd.step(&host);
                    thread::sleep(Duration::from_micros(100));
                }
            }));
        }
        if delivery {
            let (host, stop) = (host.clone(), stop.clone());
            threads.push(thread::spawn(move || host.run_async_task(&stop)));
        }

        Self {
            host,
            hcd,
            hub,
            stop,
            threads,
        }
    }

    /// Attach a high-speed device on root port `address`
    pub fn attach(&self, address: u8) -> DevHandle {
        let info = DeviceInfo::new(address, DeviceSpeed::High, None, address);
        self.host.device_attach(info).expect("attach")
    }

    pub fn open(&self, dev: DevHandle, desc: EpDescriptor) -> EpHandle {
        self.host.open(dev, Some(desc), Some(0)).expect("open")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

/// Poll `cond` for up to five seconds
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
