//! Periodic work on a reactor. Pollers can be paused, resumed and
//! stopped; dropping the handle unregisters the poller.

use std::{fmt, marker::PhantomData, time::Duration};

use crate::core::reactor::{Reactor, ReactorId};

/// Handle onto a registered poller. The handle is tied to the reactor
/// the poller was created on and must be dropped there.
pub struct Poller {
    reactor: ReactorId,
    id: u64,
    name: String,
    stopped: bool,
    // pollers never leave their reactor
    _marker: PhantomData<*const ()>,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.name)
            .field("reactor", &self.reactor)
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl Poller {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// stop the given poller and consume self
    pub fn stop(mut self) {
        self.unregister();
        self.stopped = true;
    }

    /// pause the given poller; it stays registered but does not fire
    pub fn pause(&mut self) {
        self.with_reactor(|r, id| r.set_poller_paused(id, true));
    }

    /// resume the given poller
    pub fn resume(&mut self) {
        self.with_reactor(|r, id| r.set_poller_paused(id, false));
    }

    fn with_reactor(&self, f: impl FnOnce(&Reactor, u64)) {
        match Reactor::current() {
            Some(r) if r.id() == self.reactor => f(&r, self.id),
            _ => error!(
                "poller '{}' manipulated off its reactor {}",
                self.name, self.reactor
            ),
        }
    }

    fn unregister(&mut self) {
        self.with_reactor(|r, id| {
            r.unregister_poller(id);
        });
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if !self.stopped {
            self.unregister();
        }
    }
}

/// builder type to create a new poller
pub struct Builder {
    name: Option<String>,
    interval: Duration,
    poll_fn: Option<Box<dyn FnMut() -> i32 + 'static>>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// create a new nameless poller that runs on every iteration of the
    /// reactor it is built on
    pub fn new() -> Self {
        Self {
            name: None,
            interval: Duration::from_micros(0),
            poll_fn: None,
        }
    }

    /// create the poller with a given name
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// set the interval for the poller in usec
    pub fn with_interval(mut self, usec: u64) -> Self {
        self.interval = Duration::from_micros(usec);
        self
    }

    /// set the function for this poller; a negative return value is
    /// logged, the reactor keeps going either way
    pub fn with_poll_fn(
        mut self,
        poll_fn: impl FnMut() -> i32 + 'static,
    ) -> Self {
        self.poll_fn = Some(Box::new(poll_fn));
        self
    }

    /// build a new poller object on the current reactor
    pub fn build(mut self) -> Poller {
        let poll_fn = self
            .poll_fn
            .take()
            .expect("can not start poller without poll function");

        let reactor = Reactor::current()
            .expect("can not start poller without a bound reactor");

        let name = self
            .name
            .take()
            .unwrap_or_else(|| "<unnamed>".to_string());

        let id =
            reactor.register_poller(name.clone(), self.interval, poll_fn);

        Poller {
            reactor: reactor.id(),
            id,
            name,
            stopped: false,
            _marker: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Reactor;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn poller_lifecycle() {
        let t = std::thread::spawn(|| {
            let r = Reactor::bind().unwrap();
            let hits = Arc::new(AtomicUsize::new(0));
            let hits2 = Arc::clone(&hits);

            let mut poller = Builder::new()
                .with_name("ticker")
                .with_interval(0)
                .with_poll_fn(move || {
                    hits2.fetch_add(1, Ordering::SeqCst);
                    1
                })
                .build();

            r.run_once();
            assert_eq!(hits.load(Ordering::SeqCst), 1);

            poller.pause();
            r.run_once();
            assert_eq!(hits.load(Ordering::SeqCst), 1);

            poller.resume();
            r.run_once();
            assert_eq!(hits.load(Ordering::SeqCst), 2);

            poller.stop();
            r.run_once();
            assert_eq!(hits.load(Ordering::SeqCst), 2);
            Reactor::unbind().unwrap();
        });
        t.join().unwrap();
    }

    #[test]
    fn drop_unregisters() {
        let t = std::thread::spawn(|| {
            let r = Reactor::bind().unwrap();
            {
                let _poller = Builder::new()
                    .with_poll_fn(|| 0)
                    .build();
                assert_eq!(r.poller_count(), 1);
            }
            assert_eq!(r.poller_count(), 0);
            Reactor::unbind().unwrap();
        });
        t.join().unwrap();
    }
}
