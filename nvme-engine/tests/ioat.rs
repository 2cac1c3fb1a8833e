//! The I/OAT engine driven end-to-end against the emulated channel.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
    Mutex,
    MutexGuard,
};

use nvme_engine::{
    core::alloc_dma,
    ioat::{self, emu::EmuIoatChannel, IoatError},
    pci::{self, EmulatedBus},
};

/// The PCI bus and the channel free list are process wide; one test
/// at a time.
static BUS: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    BUS.lock().unwrap_or_else(|e| e.into_inner())
}

fn attach_one() {
    let channel = EmuIoatChannel::new();
    let bus = Arc::new(EmulatedBus::new());
    bus.add(channel.pci_device("0000:04:00.0"));
    pci::set_bus(bus);
    assert_eq!(ioat::probe().unwrap(), 1);
}

#[test]
fn copy_moves_bytes_between_buffers() {
    let _guard = lock();
    attach_one();
    ioat::register_thread().unwrap();

    let mut src = alloc_dma(4096, 4096).unwrap();
    let dst = alloc_dma(4096, 4096).unwrap();
    for (i, byte) in src.as_mut_slice().iter_mut().enumerate() {
        *byte = (i % 239) as u8;
    }

    let done = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&done);
    ioat::submit_copy(
        dst.bus_addr(),
        src.bus_addr(),
        4096,
        move || {
            flag.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();

    assert_eq!(ioat::process_events().unwrap(), 1);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(src.as_slice(), dst.as_slice());

    ioat::unregister_thread();
}

#[test]
fn fill_writes_the_pattern() {
    let _guard = lock();
    attach_one();
    ioat::register_thread().unwrap();

    let dst = alloc_dma(4096, 4096).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&done);
    ioat::submit_fill(
        dst.bus_addr(),
        u64::from_le_bytes(*b"\xab\xab\xab\xab\xab\xab\xab\xab"),
        4096,
        move || {
            flag.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();

    assert_eq!(ioat::process_events().unwrap(), 1);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(dst.as_slice().iter().all(|b| *b == 0xab));

    ioat::unregister_thread();
}

#[test]
fn batched_copies_complete_in_submission_order() {
    let _guard = lock();
    attach_one();
    ioat::register_thread().unwrap();

    let mut src = alloc_dma(8 * 512, 4096).unwrap();
    let dst = alloc_dma(8 * 512, 4096).unwrap();
    for (i, byte) in src.as_mut_slice().iter_mut().enumerate() {
        *byte = (i / 512) as u8;
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    ioat::with_channel(|channel| {
        for i in 0 .. 8u64 {
            let order = Arc::clone(&order);
            channel.build_copy(
                dst.bus_addr() + i * 512,
                src.bus_addr() + i * 512,
                512,
                move || order.lock().unwrap().push(i),
            )?;
        }
        channel.flush();
        Ok(())
    })
    .unwrap();

    let mut retired = 0;
    while retired < 8 {
        retired += ioat::process_events().unwrap();
    }
    assert_eq!(retired, 8);
    assert_eq!(*order.lock().unwrap(), (0 .. 8).collect::<Vec<_>>());
    assert_eq!(src.as_slice(), dst.as_slice());

    ioat::unregister_thread();
}

#[test]
fn ring_has_a_hard_capacity() {
    let _guard = lock();
    attach_one();
    ioat::register_thread().unwrap();

    let src = alloc_dma(4096, 4096).unwrap();
    let dst = alloc_dma(4096, 4096).unwrap();

    let result = ioat::with_channel(|channel| {
        // one slot stays free; the ring holds 127 descriptors
        for _ in 0 .. 127 {
            channel.build_copy(
                dst.bus_addr(),
                src.bus_addr(),
                64,
                || {},
            )?;
        }
        match channel.build_copy(
            dst.bus_addr(),
            src.bus_addr(),
            64,
            || {},
        ) {
            Err(IoatError::RingFull) => {}
            other => panic!("expected RingFull, got {:?}", other),
        }
        channel.flush();
        Ok(())
    });
    result.unwrap();

    let mut retired = 0;
    while retired < 127 {
        retired += ioat::process_events().unwrap();
    }
    assert_eq!(retired, 127);

    ioat::unregister_thread();
}

#[test]
fn unregistered_threads_have_no_channel() {
    let _guard = lock();
    match ioat::process_events() {
        Err(IoatError::NoThreadChannel) => {}
        other => panic!("expected NoThreadChannel, got {:?}", other),
    }
}

#[test]
fn oversize_transfers_are_refused() {
    let _guard = lock();
    attach_one();
    ioat::register_thread().unwrap();

    let src = alloc_dma(4096, 4096).unwrap();
    let dst = alloc_dma(4096, 4096).unwrap();
    let result = ioat::with_channel(|channel| {
        channel.submit_copy(
            dst.bus_addr(),
            src.bus_addr(),
            channel.max_xfer_size() + 1,
            || {},
        )
    });
    match result {
        Err(IoatError::TransferTooLarge { .. }) => {}
        other => panic!("expected TransferTooLarge, got {:?}", other),
    }

    ioat::unregister_thread();
}
