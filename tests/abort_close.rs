mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use common::{bulk_in, bulk_out, wait_for, Call, Harness, Reply};
use prisma_usbh::{EpState, HostConfig, PoolKind, UsbError};

const RECV: Duration = Duration::from_secs(5);

#[test]
fn abort_cancels_newest_first() {
    let h = Harness::new();
    let dev = h.attach(1);
    let ep = h.open(dev, bulk_in());
    h.hcd.hang();
    let (tx, rx) = mpsc::channel();

    for len in 1..=4usize {
        let tx = tx.clone();
        h.host
            .bulk_read_async(dev, ep, vec![0u8; len], move |done| {
                let _ = tx.send((done.len, done.status));
            })
            .unwrap();
    }
    assert_eq!(h.host.queued_count(dev, ep), Ok(4));

    h.host.abort(dev, ep).unwrap();

    let mut submitted = h.hcd.submitted_urbs();
    submitted.reverse();
    assert_eq!(h.hcd.aborted_urbs(), submitted);

    // Callbacks follow abort order too.
    for len in (1..=4usize).rev() {
        assert_eq!(rx.recv_timeout(RECV).unwrap(), (len, Err(UsbError::Abort)));
    }
    assert_eq!(h.host.ep_state(dev, ep), Ok(EpState::Ready));
    assert!(h
        .hcd
        .calls()
        .iter()
        .any(|call| matches!(call, Call::HaltClr(_))));
}

#[test]
fn endpoint_accepts_work_after_abort() {
    let h = Harness::new();
    let dev = h.attach(1);
    let ep = h.open(dev, bulk_out());
    h.hcd.hang();

    h.host.bulk_write_async(dev, ep, vec![0u8; 8], |_| {}).unwrap();
    h.host.abort(dev, ep).unwrap();

    h.hcd.respond_with(|params| Reply::Done(params.buf.len(), Ok(())));
    assert_eq!(h.host.bulk_write(dev, ep, &[7u8; 8], 1000), Ok(8));
}

#[test]
fn abort_of_idle_endpoint_is_harmless() {
    let h = Harness::new();
    let dev = h.attach(1);
    let ep = h.open(dev, bulk_in());

    h.host.abort(dev, ep).unwrap();
    assert!(h.hcd.aborted_urbs().is_empty());
    assert_eq!(h.host.ep_state(dev, ep), Ok(EpState::Ready));
}

#[test]
fn close_aborts_queue_before_closing_on_controller() {
    let h = Harness::new();
    let dev = h.attach(1);
    let ep = h.open(dev, bulk_in());
    h.hcd.hang();
    let aborted = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let aborted = aborted.clone();
        h.host
            .bulk_read_async(dev, ep, vec![0u8; 32], move |done| {
                assert_eq!(done.status, Err(UsbError::Abort));
                aborted.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    h.host.close(dev, ep).unwrap();
    assert!(wait_for(|| aborted.load(Ordering::SeqCst) == 3));

    let calls = h.hcd.calls();
    let last_abort = calls
        .iter()
        .rposition(|call| matches!(call, Call::Abort { .. }))
        .unwrap();
    let close = calls
        .iter()
        .position(|call| matches!(call, Call::Close(_)))
        .unwrap();
    assert!(last_abort < close);

    assert_eq!(h.host.ep_state(dev, ep), Err(UsbError::InvalidHandle));
    assert_eq!(h.host.urb_pool_stats().in_use, 0);
}

#[test]
fn callbacks_run_exactly_once_across_completion_and_close() {
    let h = Harness::new();
    let dev = h.attach(1);
    let ep = h.open(dev, bulk_out());
    let calls = Arc::new(AtomicUsize::new(0));

    // Half the transfers finish, the rest are still queued at close.
    h.hcd.respond_with(|params| {
        if params.buf.len() % 2 == 0 {
            Reply::Done(params.buf.len(), Ok(()))
        } else {
            Reply::Hang
        }
    });

    let mut submitted = 0;
    for len in [2usize, 4, 6, 1, 8, 3] {
        let calls = calls.clone();
        h.host
            .bulk_write_async(dev, ep, vec![0u8; len], move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        submitted += 1;
    }
    assert!(wait_for(|| calls.load(Ordering::SeqCst) >= 3));

    h.host.close(dev, ep).unwrap();
    assert!(wait_for(|| calls.load(Ordering::SeqCst) == submitted));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(calls.load(Ordering::SeqCst), submitted);
    assert_eq!(h.host.urb_pool_stats().in_use, 0);
}

#[test]
fn aborted_urbs_are_freed_inline_without_event_records() {
    let h = Harness::without_delivery(HostConfig::new().async_events(1));
    let dev = h.attach(1);
    let ep = h.open(dev, bulk_in());
    let idle = h.open(dev, bulk_out());
    h.hcd.hang();
    let (tx, rx) = mpsc::channel();

    for _ in 0..2 {
        let tx = tx.clone();
        h.host
            .bulk_read_async(dev, ep, vec![0u8; 8], move |done| {
                let _ = tx.send(done.status);
            })
            .unwrap();
    }

    // Occupy the only event record.
    h.host.urb_done(dev, idle).unwrap();
    assert_eq!(
        h.host.urb_done(dev, idle),
        Err(UsbError::AllocationFailed(PoolKind::AsyncEvent))
    );

    h.host.abort(dev, ep).unwrap();
    assert_eq!(rx.try_recv(), Ok(Err(UsbError::Abort)));
    assert_eq!(rx.try_recv(), Ok(Err(UsbError::Abort)));
    assert_eq!(h.host.urb_pool_stats().in_use, 0);

    // The spurious completion finds nothing queued.
    assert_eq!(h.host.process_async_events(), 1);
    assert_eq!(h.host.ep_state(dev, idle), Ok(EpState::Ready));
}

#[test]
fn pending_completion_is_discarded_by_abort() {
    let h = Harness::without_delivery(HostConfig::default());
    let dev = h.attach(1);
    let ep = h.open(dev, bulk_out());
    let (tx, rx) = mpsc::channel();

    let tx_done = tx.clone();
    h.host
        .bulk_write_async(dev, ep, vec![0u8; 8], move |done| {
            let _ = tx_done.send(done.status);
        })
        .unwrap();
    // The hardware reports it, but nobody delivers the event yet.
    assert!(wait_for(|| h.hcd.in_flight() == 1 && h.host.queued_count(dev, ep) == Ok(1)));
    std::thread::sleep(Duration::from_millis(5));

    h.host.abort(dev, ep).unwrap();
    // Only the abort list is left to deliver.
    assert_eq!(h.host.process_async_events(), 1);
    assert_eq!(rx.try_recv(), Ok(Err(UsbError::Abort)));
    assert!(rx.try_recv().is_err());
    drop(tx);
}
