//! Single-threaded cooperative execution contexts.
//!
//! A reactor owns one OS thread for as long as the thread stays bound.
//! Work arrives over two paths: messages, sent from any thread and run
//! in FIFO order during the next iteration, and pollers, periodic
//! functions installed by the code running on the reactor itself.
//!
//! One iteration first drains the messages that were queued when the
//! iteration started and then runs every poller whose deadline has
//! elapsed, in registration order. Nothing preempts a callback; a
//! handler that spins starves the rest of the reactor. That is the
//! contract, not an accident.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use crossbeam::channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::core::CoreError;

/// A message is any callable shipped from another thread.
pub(crate) type Msg = Box<dyn FnOnce() + Send + 'static>;

/// Stable identity of a reactor, assigned at bind time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ReactorId(u64);

impl fmt::Display for ReactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReactorState {
    Init,
    Running,
    Shutdown,
}

pub(crate) struct PollerEntry {
    pub id: u64,
    pub name: String,
    pub period: Duration,
    pub next_run: Instant,
    pub paused: bool,
    // taken out of the slot while it runs so a poller may register or
    // unregister pollers from inside its own callback
    pub poll_fn: Option<Box<dyn FnMut() -> i32 + 'static>>,
}

/// The per-thread execution context.
pub struct Reactor {
    id: ReactorId,
    sx: Sender<Msg>,
    rx: Receiver<Msg>,
    pollers: RefCell<Vec<PollerEntry>>,
    next_poller_id: Cell<u64>,
    state: Cell<ReactorState>,
}

/// Cloneable, `Send` address of a reactor, used to queue messages from
/// other threads.
#[derive(Clone)]
pub struct ReactorHandle {
    id: ReactorId,
    sx: Sender<Msg>,
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReactorHandle({})", self.id)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Reactor>>> = RefCell::new(None);
}

/// Registry of live reactors; consulted by cross-thread sends and by
/// the channel registry when fanning out work.
static REACTORS: Lazy<Mutex<HashMap<ReactorId, Sender<Msg>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static NEXT_REACTOR_ID: AtomicU64 = AtomicU64::new(1);

impl Reactor {
    /// Bind the current OS thread to a fresh reactor. Fails when the
    /// thread is already bound.
    pub fn bind() -> Result<Rc<Reactor>, CoreError> {
        CURRENT.with(|cur| {
            let mut cur = cur.borrow_mut();
            if let Some(r) = cur.as_ref() {
                return Err(CoreError::AlreadyBound { id: r.id });
            }

            let id =
                ReactorId(NEXT_REACTOR_ID.fetch_add(1, Ordering::Relaxed));
            let (sx, rx) = unbounded::<Msg>();
            let reactor = Rc::new(Reactor {
                id,
                sx: sx.clone(),
                rx,
                pollers: RefCell::new(Vec::new()),
                next_poller_id: Cell::new(1),
                state: Cell::new(ReactorState::Init),
            });

            REACTORS.lock().insert(id, sx);
            *cur = Some(Rc::clone(&reactor));
            debug!("reactor {} bound", id);
            Ok(reactor)
        })
    }

    /// Release the binding of the current thread. Fails while pollers
    /// remain registered; messages still queued are dropped.
    pub fn unbind() -> Result<(), CoreError> {
        CURRENT.with(|cur| {
            let mut cur = cur.borrow_mut();
            let reactor = cur.as_ref().ok_or(CoreError::NotBound)?;

            let count = reactor.pollers.borrow().len();
            if count != 0 {
                return Err(CoreError::PollersRemain {
                    id: reactor.id,
                    count,
                });
            }

            REACTORS.lock().remove(&reactor.id);
            debug!("reactor {} unbound", reactor.id);
            *cur = None;
            Ok(())
        })
    }

    /// The reactor bound to the current thread, if any.
    pub fn current() -> Option<Rc<Reactor>> {
        CURRENT.with(|cur| cur.borrow().clone())
    }

    /// Identity of the current thread's reactor.
    pub fn current_id() -> Option<ReactorId> {
        CURRENT.with(|cur| cur.borrow().as_ref().map(|r| r.id))
    }

    pub fn id(&self) -> ReactorId {
        self.id
    }

    pub fn state(&self) -> ReactorState {
        self.state.get()
    }

    /// A sendable address of this reactor.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            id: self.id,
            sx: self.sx.clone(),
        }
    }

    /// Request the poll loop to stop after the current iteration.
    pub fn shutdown(&self) {
        info!("reactor {} shutdown requested", self.id);
        self.state.set(ReactorState::Shutdown);
    }

    /// Run one iteration: drain the messages that were queued on entry,
    /// then run every poller that is due. Returns the number of
    /// callable units processed.
    pub fn run_once(&self) -> usize {
        let mut processed = 0;

        // bounded drain; messages enqueued by the handlers themselves
        // wait for the next iteration
        let pending = self.rx.len();
        for _ in 0 .. pending {
            match self.rx.try_recv() {
                Ok(msg) => {
                    msg();
                    processed += 1;
                }
                Err(_) => break,
            }
        }

        let now = Instant::now();
        let mut idx = 0;
        loop {
            // the poller list is released while a callback runs so the
            // callback may touch it
            let due = {
                let mut pollers = self.pollers.borrow_mut();
                if idx >= pollers.len() {
                    break;
                }
                let entry = &mut pollers[idx];
                if entry.paused || entry.next_run > now {
                    None
                } else {
                    entry.next_run = now + entry.period;
                    entry
                        .poll_fn
                        .take()
                        .map(|f| (entry.id, entry.name.clone(), f))
                }
            };

            if let Some((id, name, mut poll_fn)) = due {
                let rc = poll_fn();
                if rc < 0 {
                    warn!(
                        "reactor {}: poller '{}' returned error {}",
                        self.id, name, rc
                    );
                }
                processed += 1;

                // the callback may have unregistered its own entry
                let mut pollers = self.pollers.borrow_mut();
                if let Some(entry) =
                    pollers.iter_mut().find(|e| e.id == id)
                {
                    entry.poll_fn = Some(poll_fn);
                }
            }
            idx += 1;
        }

        processed
    }

    /// Poll until shutdown is requested, yielding the CPU whenever an
    /// iteration found no work.
    pub fn run(&self) {
        if self.state.get() == ReactorState::Init {
            self.state.set(ReactorState::Running);
        }
        while self.state.get() == ReactorState::Running {
            if self.run_once() == 0 {
                std::thread::yield_now();
            }
        }
        debug!("reactor {} stopped polling", self.id);
    }

    pub(crate) fn register_poller(
        &self,
        name: String,
        period: Duration,
        poll_fn: Box<dyn FnMut() -> i32 + 'static>,
    ) -> u64 {
        let id = self.next_poller_id.get();
        self.next_poller_id.set(id + 1);
        self.pollers.borrow_mut().push(PollerEntry {
            id,
            name,
            period,
            next_run: Instant::now(),
            paused: false,
            poll_fn: Some(poll_fn),
        });
        id
    }

    pub(crate) fn unregister_poller(&self, id: u64) -> bool {
        let mut pollers = self.pollers.borrow_mut();
        let before = pollers.len();
        pollers.retain(|e| e.id != id);
        pollers.len() != before
    }

    pub(crate) fn set_poller_paused(&self, id: u64, paused: bool) {
        if let Some(entry) =
            self.pollers.borrow_mut().iter_mut().find(|e| e.id == id)
        {
            entry.paused = paused;
        }
    }

    pub(crate) fn poller_count(&self) -> usize {
        self.pollers.borrow().len()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("pollers", &self.pollers.borrow().len())
            .finish()
    }
}

impl ReactorHandle {
    pub fn id(&self) -> ReactorId {
        self.id
    }

    /// Queue `f` for execution on the target reactor's next iteration.
    /// Messages sent to the same target run in the order they were
    /// sent. Fails without enqueuing when the target is unbound.
    pub fn send_msg<F>(&self, f: F) -> Result<(), CoreError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !REACTORS.lock().contains_key(&self.id) {
            return Err(CoreError::ReactorGone { id: self.id });
        }
        self.sx
            .send(Box::new(f))
            .map_err(|_| CoreError::ReactorGone { id: self.id })
    }

    /// Look up the handle of a live reactor by identity.
    pub fn lookup(id: ReactorId) -> Option<ReactorHandle> {
        REACTORS
            .lock()
            .get(&id)
            .map(|sx| ReactorHandle { id, sx: sx.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn bind_twice_fails() {
        let t = std::thread::spawn(|| {
            let r = Reactor::bind().unwrap();
            let id = r.id();
            match Reactor::bind() {
                Err(CoreError::AlreadyBound { id: bound }) => {
                    assert_eq!(bound, id)
                }
                _ => panic!("second bind must fail"),
            }
            Reactor::unbind().unwrap();
            assert!(Reactor::current().is_none());
        });
        t.join().unwrap();
    }

    #[test]
    fn unbind_without_bind_fails() {
        let t = std::thread::spawn(|| {
            assert!(matches!(
                Reactor::unbind(),
                Err(CoreError::NotBound)
            ));
        });
        t.join().unwrap();
    }

    #[test]
    fn messages_run_in_fifo_order() {
        let t = std::thread::spawn(|| {
            let r = Reactor::bind().unwrap();
            let order = Arc::new(Mutex::new(Vec::new()));
            let h = r.handle();
            for i in 0 .. 8 {
                let order = Arc::clone(&order);
                h.send_msg(move || order.lock().push(i)).unwrap();
            }
            let processed = r.run_once();
            assert_eq!(processed, 8);
            assert_eq!(*order.lock(), (0 .. 8).collect::<Vec<_>>());
            Reactor::unbind().unwrap();
        });
        t.join().unwrap();
    }

    #[test]
    fn send_to_unbound_reactor_fails() {
        let handle = std::thread::spawn(|| {
            let r = Reactor::bind().unwrap();
            let h = r.handle();
            Reactor::unbind().unwrap();
            h
        })
        .join()
        .unwrap();

        assert!(matches!(
            handle.send_msg(|| {}),
            Err(CoreError::ReactorGone { .. })
        ));
    }

    #[test]
    fn pollers_fire_in_registration_order() {
        let t = std::thread::spawn(|| {
            let r = Reactor::bind().unwrap();
            let order = Arc::new(Mutex::new(Vec::new()));
            let mut ids = Vec::new();
            for i in 0 .. 3 {
                let order = Arc::clone(&order);
                ids.push(r.register_poller(
                    format!("p{}", i),
                    Duration::from_micros(0),
                    Box::new(move || {
                        order.lock().push(i);
                        0
                    }),
                ));
            }
            r.run_once();
            r.run_once();
            assert_eq!(*order.lock(), vec![0, 1, 2, 0, 1, 2]);

            for id in ids {
                assert!(r.unregister_poller(id));
            }
            Reactor::unbind().unwrap();
        });
        t.join().unwrap();
    }

    #[test]
    fn unbind_with_pollers_fails() {
        let t = std::thread::spawn(|| {
            let r = Reactor::bind().unwrap();
            let id = r.register_poller(
                "stuck".into(),
                Duration::from_micros(0),
                Box::new(|| 0),
            );
            assert!(matches!(
                Reactor::unbind(),
                Err(CoreError::PollersRemain { count: 1, .. })
            ));
            r.unregister_poller(id);
            Reactor::unbind().unwrap();
        });
        t.join().unwrap();
    }

    #[test]
    fn poller_may_unregister_itself() {
        let t = std::thread::spawn(|| {
            let r = Reactor::bind().unwrap();
            let fired = Arc::new(AtomicUsize::new(0));
            let fired2 = Arc::clone(&fired);
            let r2 = Rc::clone(&r);
            // the id the poller will remove is its own
            let id_cell = Rc::new(Cell::new(0u64));
            let id_cell2 = Rc::clone(&id_cell);
            let id = r.register_poller(
                "oneshot".into(),
                Duration::from_micros(0),
                Box::new(move || {
                    fired2.fetch_add(1, Ordering::SeqCst);
                    r2.unregister_poller(id_cell2.get());
                    0
                }),
            );
            id_cell.set(id);

            r.run_once();
            r.run_once();
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert_eq!(r.poller_count(), 0);
            Reactor::unbind().unwrap();
        });
        t.join().unwrap();
    }

    #[test]
    fn periodic_poller_respects_interval() {
        let t = std::thread::spawn(|| {
            let r = Reactor::bind().unwrap();
            let fired = Arc::new(AtomicUsize::new(0));
            let fired2 = Arc::clone(&fired);
            let id = r.register_poller(
                "slow".into(),
                Duration::from_secs(3600),
                Box::new(move || {
                    fired2.fetch_add(1, Ordering::SeqCst);
                    0
                }),
            );
            // due immediately on the first pass, then not for an hour
            r.run_once();
            r.run_once();
            r.run_once();
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            r.unregister_poller(id);
            Reactor::unbind().unwrap();
        });
        t.join().unwrap();
    }
}
