//! The PCIe submission/completion engine driven end-to-end against
//! the emulated controller.

use std::{
    cell::RefCell,
    rc::Rc,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use nvme_engine::{
    core::{alloc_dma, DmaBuf},
    nvme::{
        self,
        pcie::{self, emu::EmuNvmeCtrlr},
        Ctrlr,
        CtrlrOpts,
        GenericStatusCode,
        IoQpairOpts,
        NvmeError,
        NvmeStatus,
        Payload,
        PollGroup,
        Qpair,
        QpairState,
        Request,
        TridEntry,
    },
    pci::{self, EmulatedBus},
};

/// The PCI bus is process wide; the tests in this binary run one at a
/// time.
static BUS: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    BUS.lock().unwrap_or_else(|e| e.into_inner())
}

fn attach(
    blocks: u64,
    addr: &str,
) -> (Arc<EmuNvmeCtrlr>, Rc<Ctrlr>) {
    let emu = EmuNvmeCtrlr::new(blocks);
    let bus = Arc::new(EmulatedBus::new());
    bus.add(emu.pci_device(addr));
    pci::set_bus(bus);

    let entry = TridEntry::parse(&format!(
        "trtype:PCIe traddr:{}",
        addr
    ))
    .unwrap();
    let ctrlr =
        nvme::connect(&entry, &CtrlrOpts::default()).unwrap();
    (emu, ctrlr)
}

fn io_qpair(ctrlr: &Rc<Ctrlr>, depth: u16) -> Rc<Qpair> {
    let opts = IoQpairOpts {
        io_queue_size: depth,
        ..Default::default()
    };
    let qpair = ctrlr.alloc_io_qpair(&opts).unwrap();
    ctrlr.connect_qpair(&qpair).unwrap();
    assert_eq!(qpair.state(), QpairState::Enabled);
    qpair
}

type StatusLog = Rc<RefCell<Vec<NvmeStatus>>>;

fn logging_read(
    lba: u64,
    blocks: u32,
    buf: &DmaBuf,
    log: &StatusLog,
) -> Request {
    let log = Rc::clone(log);
    Request::read(
        1,
        lba,
        blocks,
        Payload::Contig {
            bus: buf.bus_addr(),
            len: blocks as usize * 512,
        },
        Box::new(move |status| log.borrow_mut().push(*status)),
    )
}

#[test]
fn attach_reports_identify_data() {
    let _guard = lock();
    let (_emu, ctrlr) = attach(64, "0000:01:00.0");

    assert_eq!(
        pcie::ctrlr_serial(&ctrlr).unwrap(),
        "EMU00000000000001"
    );
    assert_eq!(
        pcie::ctrlr_model(&ctrlr).unwrap(),
        "ENGINE EMULATED NVME"
    );
    // MDTS of 5 over 4 KiB pages
    assert_eq!(ctrlr.max_xfer_size(), 128 * 1024);
}

#[test]
fn full_ring_returns_no_space_until_polled() {
    let _guard = lock();
    let (_emu, ctrlr) = attach(64, "0000:01:00.0");
    let qpair = io_qpair(&ctrlr, 8);
    assert_eq!(pcie::queue_depth(&qpair), 8);

    let log: StatusLog = Rc::new(RefCell::new(Vec::new()));
    let buf = alloc_dma(4096, 4096).unwrap();

    for _ in 0 .. 8 {
        qpair.submit(logging_read(0, 1, &buf, &log)).unwrap();
    }
    assert_eq!(pcie::free_tracker_count(&qpair), 0);

    match qpair.submit(logging_read(0, 1, &buf, &log)) {
        Err(NvmeError::NoSpace { qid }) => assert_eq!(qid, 1),
        other => panic!("expected NoSpace, got {:?}", other),
    }

    let reaped = qpair.process_completions(0).unwrap();
    assert!(reaped >= 1);
    qpair.submit(logging_read(0, 1, &buf, &log)).unwrap();

    // drain the rest; the free list holds the full ring again
    while pcie::free_tracker_count(&qpair) != 8 {
        qpair.process_completions(0).unwrap();
    }
    assert!(log.borrow().iter().all(|s| s.is_success()));

    ctrlr.free_io_qpair(&qpair).unwrap();
}

#[test]
fn phase_toggles_once_per_ring_wrap() {
    let _guard = lock();
    let (_emu, ctrlr) = attach(64, "0000:01:00.0");
    let qpair = io_qpair(&ctrlr, 8);

    let log: StatusLog = Rc::new(RefCell::new(Vec::new()));
    let buf = alloc_dma(4096, 4096).unwrap();

    // two full trips around the completion ring
    for _ in 0 .. 16 {
        qpair.submit(logging_read(0, 1, &buf, &log)).unwrap();
        assert_eq!(qpair.process_completions(0).unwrap(), 1);
    }

    assert_eq!(pcie::phase_wraps(&qpair), 2);
    let log = log.borrow();
    assert_eq!(log.len(), 16);
    assert!(log.iter().all(|s| s.is_success()));

    ctrlr.free_io_qpair(&qpair).unwrap();
}

#[test]
fn write_read_round_trip_through_prp_list() {
    let _guard = lock();
    let (emu, ctrlr) = attach(64, "0000:01:00.0");
    let qpair = io_qpair(&ctrlr, 16);

    // four pages forces the PRP list in the tracker scratch
    let len = 16 * 1024;
    let blocks = (len / 512) as u32;
    let mut wbuf = alloc_dma(len, 4096).unwrap();
    for (i, byte) in wbuf.as_mut_slice().iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }

    let log: StatusLog = Rc::new(RefCell::new(Vec::new()));
    let wlog = Rc::clone(&log);
    qpair
        .submit(Request::write(
            1,
            0,
            blocks,
            Payload::Contig {
                bus: wbuf.bus_addr(),
                len,
            },
            Box::new(move |status| wlog.borrow_mut().push(*status)),
        ))
        .unwrap();
    assert_eq!(qpair.process_completions(0).unwrap(), 1);

    let rbuf = alloc_dma(len, 4096).unwrap();
    qpair
        .submit(logging_read(0, blocks, &rbuf, &log))
        .unwrap();
    assert_eq!(qpair.process_completions(0).unwrap(), 1);

    assert!(log.borrow().iter().all(|s| s.is_success()));
    assert_eq!(wbuf.as_slice(), rbuf.as_slice());
    assert_eq!(
        &emu.namespace_snapshot()[.. len],
        wbuf.as_slice()
    );

    ctrlr.free_io_qpair(&qpair).unwrap();
}

#[test]
fn deferred_doorbells_ring_on_poll() {
    let _guard = lock();
    let (_emu, ctrlr) = attach(64, "0000:01:00.0");
    let opts = IoQpairOpts {
        io_queue_size: 8,
        delay_cmd_submit: true,
        ..Default::default()
    };
    let qpair = ctrlr.alloc_io_qpair(&opts).unwrap();
    ctrlr.connect_qpair(&qpair).unwrap();

    let log: StatusLog = Rc::new(RefCell::new(Vec::new()));
    let buf = alloc_dma(4096, 4096).unwrap();
    for _ in 0 .. 3 {
        qpair.submit(logging_read(0, 1, &buf, &log)).unwrap();
    }
    // nothing was handed to the device yet
    assert!(log.borrow().is_empty());

    // the poll rings the batched doorbell and reaps the burst
    assert_eq!(qpair.process_completions(0).unwrap(), 3);
    assert_eq!(log.borrow().len(), 3);

    ctrlr.free_io_qpair(&qpair).unwrap();
}

#[test]
fn submit_requires_a_connected_qpair() {
    let _guard = lock();
    let (_emu, ctrlr) = attach(64, "0000:01:00.0");
    let opts = IoQpairOpts {
        io_queue_size: 8,
        ..Default::default()
    };
    let qpair = ctrlr.alloc_io_qpair(&opts).unwrap();
    assert_eq!(qpair.state(), QpairState::Disconnected);

    let buf = alloc_dma(4096, 4096).unwrap();
    let log: StatusLog = Rc::new(RefCell::new(Vec::new()));
    match qpair.submit(logging_read(0, 1, &buf, &log)) {
        Err(NvmeError::NotConnected { state, .. }) => {
            assert_eq!(state, QpairState::Disconnected)
        }
        other => panic!("expected NotConnected, got {:?}", other),
    }

    ctrlr.free_io_qpair(&qpair).unwrap();
}

#[test]
fn abort_fails_everything_in_flight() {
    let _guard = lock();
    let (_emu, ctrlr) = attach(64, "0000:01:00.0");
    let opts = IoQpairOpts {
        io_queue_size: 8,
        delay_cmd_submit: true,
        ..Default::default()
    };
    let qpair = ctrlr.alloc_io_qpair(&opts).unwrap();
    ctrlr.connect_qpair(&qpair).unwrap();

    let log: StatusLog = Rc::new(RefCell::new(Vec::new()));
    let buf = alloc_dma(4096, 4096).unwrap();
    for _ in 0 .. 4 {
        qpair.submit(logging_read(0, 1, &buf, &log)).unwrap();
    }

    qpair.abort_reqs(true).unwrap();
    {
        let log = log.borrow();
        assert_eq!(log.len(), 4);
        assert!(log.iter().all(|s| s.is_aborted()));
        assert!(log.iter().all(|s| s.dnr()));
    }
    assert_eq!(pcie::free_tracker_count(&qpair), 8);

    ctrlr.free_io_qpair(&qpair).unwrap();
}

#[test]
fn reset_returns_the_qpair_to_a_clean_enabled() {
    let _guard = lock();
    let (_emu, ctrlr) = attach(64, "0000:01:00.0");
    let qpair = io_qpair(&ctrlr, 8);

    let log: StatusLog = Rc::new(RefCell::new(Vec::new()));
    let buf = alloc_dma(4096, 4096).unwrap();
    for _ in 0 .. 3 {
        qpair.submit(logging_read(0, 1, &buf, &log)).unwrap();
    }

    qpair.reset().unwrap();
    assert_eq!(qpair.state(), QpairState::Enabled);
    assert_eq!(pcie::free_tracker_count(&qpair), 8);
    assert_eq!(pcie::phase_wraps(&qpair), 0);
    // the in-flight requests were failed over the reset
    assert_eq!(log.borrow().len(), 3);
    assert!(log.borrow().iter().all(|s| s.is_aborted()));

    // the rewound rings still move data
    qpair.submit(logging_read(0, 1, &buf, &log)).unwrap();
    assert_eq!(qpair.process_completions(0).unwrap(), 1);
    assert!(log.borrow().last().unwrap().is_success());

    ctrlr.free_io_qpair(&qpair).unwrap();
}

#[test]
fn injected_device_errors_reach_the_callback() {
    let _guard = lock();
    let (emu, ctrlr) = attach(64, "0000:01:00.0");
    let qpair = io_qpair(&ctrlr, 8);

    emu.inject_io_error(0, 0x02);

    let log: StatusLog = Rc::new(RefCell::new(Vec::new()));
    let buf = alloc_dma(4096, 4096).unwrap();
    qpair.submit(logging_read(0, 1, &buf, &log)).unwrap();
    assert_eq!(qpair.process_completions(0).unwrap(), 1);

    let log = log.borrow();
    assert!(!log[0].is_success());
    assert_eq!(
        log[0].status_code(),
        GenericStatusCode::InvalidField
    );

    ctrlr.free_io_qpair(&qpair).unwrap();
}

#[test]
fn reads_beyond_the_namespace_fail() {
    let _guard = lock();
    let (_emu, ctrlr) = attach(16, "0000:01:00.0");
    let qpair = io_qpair(&ctrlr, 8);

    let log: StatusLog = Rc::new(RefCell::new(Vec::new()));
    let buf = alloc_dma(4096, 4096).unwrap();
    qpair.submit(logging_read(15, 2, &buf, &log)).unwrap();
    assert_eq!(qpair.process_completions(0).unwrap(), 1);

    assert_eq!(
        log.borrow()[0].status_code(),
        GenericStatusCode::LbaOutOfRange
    );

    ctrlr.free_io_qpair(&qpair).unwrap();
}

#[test]
fn fatal_controller_status_surfaces_on_poll() {
    let _guard = lock();
    let (emu, ctrlr) = attach(64, "0000:01:00.0");
    let qpair = io_qpair(&ctrlr, 8);

    emu.set_fatal();
    match qpair.process_completions(0) {
        Err(NvmeError::DeviceFatal { .. }) => {}
        other => panic!("expected DeviceFatal, got {:?}", other),
    }
}

#[test]
fn expired_requests_hit_the_timeout_handler() {
    let _guard = lock();
    let (_emu, ctrlr) = attach(64, "0000:01:00.0");
    let qpair = io_qpair(&ctrlr, 8);

    let expired: Rc<RefCell<Vec<u16>>> =
        Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&expired);
    pcie::set_timeout_handler(&qpair, move |cid| {
        sink.borrow_mut().push(cid)
    });

    let log: StatusLog = Rc::new(RefCell::new(Vec::new()));
    let buf = alloc_dma(4096, 4096).unwrap();
    let req = logging_read(0, 1, &buf, &log)
        .with_timeout(Duration::from_micros(0));
    qpair.submit(req).unwrap();

    assert_eq!(pcie::check_timeouts(&qpair), 1);
    assert_eq!(expired.borrow().len(), 1);
    // a second scan does not report the same tracker again
    assert_eq!(pcie::check_timeouts(&qpair), 0);

    // the completion still retires normally afterwards
    assert_eq!(qpair.process_completions(0).unwrap(), 1);
    assert!(log.borrow()[0].is_success());

    ctrlr.free_io_qpair(&qpair).unwrap();
}

#[test]
fn poll_group_reaps_and_reports_disconnects() {
    let _guard = lock();
    let (_emu, ctrlr) = attach(64, "0000:01:00.0");

    let opts = IoQpairOpts {
        io_queue_size: 8,
        ..Default::default()
    };
    let qpair = ctrlr.alloc_io_qpair(&opts).unwrap();

    let group = PollGroup::new();
    group.add(&qpair).unwrap();
    ctrlr.connect_qpair(&qpair).unwrap();

    let log: StatusLog = Rc::new(RefCell::new(Vec::new()));
    let buf = alloc_dma(4096, 4096).unwrap();
    for _ in 0 .. 3 {
        qpair.submit(logging_read(0, 1, &buf, &log)).unwrap();
    }

    let mut disconnected = Vec::new();
    let total = group
        .process_completions(128, &mut |qp| {
            disconnected.push(qp.qid())
        })
        .unwrap();
    assert_eq!(total, 3);
    assert!(disconnected.is_empty());

    // destroy refuses while the qpair is still in the group
    match group.destroy() {
        Err(NvmeError::Busy { .. }) => {}
        other => panic!("expected Busy, got {:?}", other),
    }

    // a torn down qpair is reported on the next poll
    ctrlr.disconnect_qpair(&qpair);
    assert_eq!(qpair.state(), QpairState::Disconnected);
    let total = group
        .process_completions(128, &mut |qp| {
            disconnected.push(qp.qid())
        })
        .unwrap();
    assert_eq!(total, 0);
    assert_eq!(disconnected, vec![qpair.qid()]);

    group.remove(&qpair).unwrap();
    group.destroy().unwrap();

    ctrlr.free_io_qpair(&qpair).unwrap();
    assert_eq!(ctrlr.io_qpair_count(), 0);
    ctrlr.detach().unwrap();
}
