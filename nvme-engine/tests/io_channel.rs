//! Lifecycle of I/O devices and their per-reactor channels.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
    Barrier,
    Mutex,
    MutexGuard,
};

use nvme_engine::core::{
    channel_count,
    create_exclusive_channel,
    device_count,
    get_io_channel,
    register_device,
    send_to_all_channels,
    unregister_device,
    CoreError,
    DeviceKey,
    Errno,
    Reactor,
};

/// The device registry is process wide; the tests in this binary run
/// one at a time.
static REGISTRY: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    REGISTRY.lock().unwrap_or_else(|e| e.into_inner())
}

struct Counters {
    creates: AtomicUsize,
    destroys: AtomicUsize,
}

impl Counters {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            creates: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        })
    }
}

fn register_counted(key: DeviceKey, counters: &Arc<Counters>) {
    let creates = Arc::clone(counters);
    let destroys = Arc::clone(counters);
    register_device(
        key,
        "counted",
        Box::new(move |ctx| {
            // the context buffer arrives zeroed
            assert!(ctx.iter().all(|b| *b == 0));
            creates.creates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        Box::new(move |_ctx| {
            destroys.destroys.fetch_add(1, Ordering::SeqCst);
        }),
        8,
    )
    .unwrap();
}

#[test]
fn single_reactor_channel_lifecycle() {
    let _guard = lock();
    let key = DeviceKey(0x1001);
    let counters = Counters::new();
    register_counted(key, &counters);

    let c = Arc::clone(&counters);
    std::thread::spawn(move || {
        Reactor::bind().unwrap();

        let ch1 = get_io_channel(key).unwrap();
        let ch2 = get_io_channel(key).unwrap();
        let ch3 = get_io_channel(key).unwrap();

        // one create, one object
        assert_eq!(c.creates.load(Ordering::SeqCst), 1);
        assert!(ch1.same_channel(&ch2));
        assert!(ch2.same_channel(&ch3));
        assert_eq!(channel_count(key).unwrap(), 1);

        drop(ch1);
        drop(ch2);
        assert_eq!(c.destroys.load(Ordering::SeqCst), 0);
        drop(ch3);
        assert_eq!(c.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(channel_count(key).unwrap(), 0);

        Reactor::unbind().unwrap();
    })
    .join()
    .unwrap();

    let before = device_count();
    unregister_device(key).unwrap();
    assert_eq!(device_count(), before - 1);
}

#[test]
fn cross_reactor_channels_are_distinct() {
    let _guard = lock();
    let key = DeviceKey(0x1002);
    let counters = Counters::new();
    register_counted(key, &counters);

    let both_held = Arc::new(Barrier::new(3));
    let release = Arc::new(Barrier::new(3));

    let mut handles = Vec::new();
    for _ in 0 .. 2 {
        let both_held = Arc::clone(&both_held);
        let release = Arc::clone(&release);
        handles.push(std::thread::spawn(move || {
            Reactor::bind().unwrap();
            let ch = get_io_channel(key).unwrap();
            let owner = ch.reactor();
            both_held.wait();
            release.wait();
            drop(ch);
            Reactor::unbind().unwrap();
            owner
        }));
    }

    both_held.wait();
    // two reactors, two create calls, two live channels
    assert_eq!(counters.creates.load(Ordering::SeqCst), 2);
    assert_eq!(channel_count(key).unwrap(), 2);
    release.wait();

    let mut owners = Vec::new();
    for handle in handles {
        owners.push(handle.join().unwrap());
    }
    assert_ne!(owners[0], owners[1]);

    assert_eq!(counters.destroys.load(Ordering::SeqCst), 2);
    assert_eq!(channel_count(key).unwrap(), 0);
    unregister_device(key).unwrap();
}

#[test]
fn create_failure_leaves_no_state() {
    let _guard = lock();
    let key = DeviceKey(0x1003);
    register_device(
        key,
        "broken",
        Box::new(|_ctx| Err(Errno::ENODEV)),
        Box::new(|_ctx| panic!("destroy must never run")),
        4,
    )
    .unwrap();

    std::thread::spawn(move || {
        Reactor::bind().unwrap();
        match get_io_channel(key) {
            Err(CoreError::ChannelCreate { .. }) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(channel_count(key).unwrap(), 0);
        Reactor::unbind().unwrap();
    })
    .join()
    .unwrap();

    unregister_device(key).unwrap();
}

#[test]
fn unregister_is_strict_about_live_channels() {
    let _guard = lock();
    let key = DeviceKey(0x1004);
    let counters = Counters::new();
    register_counted(key, &counters);

    std::thread::spawn(move || {
        Reactor::bind().unwrap();
        let ch = get_io_channel(key).unwrap();

        match unregister_device(key) {
            Err(CoreError::DeviceBusy { channels: 1, .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }

        drop(ch);
        unregister_device(key).unwrap();
        Reactor::unbind().unwrap();
    })
    .join()
    .unwrap();
}

#[test]
fn registering_the_same_key_twice_fails() {
    let _guard = lock();
    let key = DeviceKey(0x1005);
    let counters = Counters::new();
    register_counted(key, &counters);

    let result = register_device(
        key,
        "counted-again",
        Box::new(|_ctx| Ok(())),
        Box::new(|_ctx| {}),
        8,
    );
    match result {
        Err(CoreError::DeviceExists { .. }) => {}
        other => panic!("unexpected result: {:?}", other),
    }

    unregister_device(key).unwrap();
}

#[test]
fn exclusive_channels_do_not_share() {
    let _guard = lock();
    let key = DeviceKey(0x1006);
    let counters = Counters::new();
    register_counted(key, &counters);

    let c = Arc::clone(&counters);
    std::thread::spawn(move || {
        Reactor::bind().unwrap();

        let shared = get_io_channel(key).unwrap();
        let exclusive = create_exclusive_channel(key).unwrap();
        assert!(!shared.same_channel(&exclusive));
        assert_eq!(c.creates.load(Ordering::SeqCst), 2);
        assert_eq!(channel_count(key).unwrap(), 2);

        // a shared get still resolves to the shared channel
        let again = get_io_channel(key).unwrap();
        assert!(again.same_channel(&shared));

        drop(shared);
        drop(again);
        drop(exclusive);
        assert_eq!(c.destroys.load(Ordering::SeqCst), 2);
        Reactor::unbind().unwrap();
    })
    .join()
    .unwrap();

    unregister_device(key).unwrap();
}

#[test]
fn channel_context_is_per_reactor() {
    let _guard = lock();
    let key = DeviceKey(0x1007);
    register_device(
        key,
        "ctx",
        Box::new(|ctx| {
            ctx[0] = 7;
            Ok(())
        }),
        Box::new(|ctx| assert_eq!(ctx[1], 42)),
        2,
    )
    .unwrap();

    std::thread::spawn(move || {
        Reactor::bind().unwrap();
        let ch = get_io_channel(key).unwrap();
        ch.with_ctx(|ctx| {
            assert_eq!(ctx[0], 7);
            ctx[1] = 42;
        });
        drop(ch);
        Reactor::unbind().unwrap();
    })
    .join()
    .unwrap();

    unregister_device(key).unwrap();
}

#[test]
fn fan_out_reaches_every_channel_owner() {
    let _guard = lock();
    let key = DeviceKey(0x1008);
    let counters = Counters::new();
    register_counted(key, &counters);

    let hits = Arc::new(AtomicUsize::new(0));
    let ready = Arc::new(Barrier::new(3));
    let done = Arc::new(Barrier::new(3));

    let mut handles = Vec::new();
    for _ in 0 .. 2 {
        let ready = Arc::clone(&ready);
        let done = Arc::clone(&done);
        handles.push(std::thread::spawn(move || {
            let reactor = Reactor::bind().unwrap();
            let ch = get_io_channel(key).unwrap();
            ready.wait();
            // wait for the fan-out message to land, then run it
            while reactor.run_once() == 0 {
                std::thread::yield_now();
            }
            done.wait();
            drop(ch);
            Reactor::unbind().unwrap();
        }));
    }

    ready.wait();
    let h = Arc::clone(&hits);
    let sent = send_to_all_channels(
        key,
        Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();
    assert_eq!(sent, 2);
    done.wait();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    unregister_device(key).unwrap();
}
