//! Poll groups: many qpairs, possibly on different transports, reaped
//! by one reactor in a single call.
//!
//! The group keeps one sub-group per transport, created lazily when
//! the first qpair of that transport is added. Each sub-group holds
//! two lists; a qpair sits on the disconnected list from the moment it
//! is added until its transport connects it, and moves back when the
//! transport tears it down.

use std::{cell::RefCell, rc::Rc, sync::Arc};

use crate::nvme::{
    qpair::{Qpair, QpairState},
    transport::NvmeTransport,
    NvmeError,
};

/// Per-transport slice of a poll group.
pub struct TransportPollGroup {
    transport: Arc<dyn NvmeTransport>,
    connected: RefCell<Vec<Rc<Qpair>>>,
    disconnected: RefCell<Vec<Rc<Qpair>>>,
}

impl TransportPollGroup {
    fn new(transport: Arc<dyn NvmeTransport>) -> Rc<Self> {
        Rc::new(Self {
            transport,
            connected: RefCell::new(Vec::new()),
            disconnected: RefCell::new(Vec::new()),
        })
    }

    pub fn transport(&self) -> &Arc<dyn NvmeTransport> {
        &self.transport
    }

    pub(crate) fn insert_disconnected(&self, qpair: &Rc<Qpair>) {
        self.disconnected.borrow_mut().push(Rc::clone(qpair));
    }

    /// Drop the qpair from whichever list holds it.
    pub(crate) fn remove(&self, qpair: &Rc<Qpair>) -> bool {
        let drop_from = |list: &RefCell<Vec<Rc<Qpair>>>| {
            let mut list = list.borrow_mut();
            let before = list.len();
            list.retain(|q| !Rc::ptr_eq(q, qpair));
            list.len() != before
        };
        drop_from(&self.connected) || drop_from(&self.disconnected)
    }

    /// disconnected -> connected; a qpair already connected stays put
    pub(crate) fn mark_connected(
        &self,
        qpair: &Rc<Qpair>,
    ) -> Result<(), NvmeError> {
        let mut disconnected = self.disconnected.borrow_mut();
        if let Some(pos) =
            disconnected.iter().position(|q| Rc::ptr_eq(q, qpair))
        {
            let qpair = disconnected.remove(pos);
            self.connected.borrow_mut().push(qpair);
            return Ok(());
        }
        drop(disconnected);

        if self
            .connected
            .borrow()
            .iter()
            .any(|q| Rc::ptr_eq(q, qpair))
        {
            return Ok(());
        }
        Err(NvmeError::InvalidArgument {
            reason: format!(
                "qpair {} is not in this poll group",
                qpair.qid()
            ),
        })
    }

    /// connected -> disconnected
    pub(crate) fn mark_disconnected(
        &self,
        qpair: &Rc<Qpair>,
    ) -> Result<(), NvmeError> {
        let mut connected = self.connected.borrow_mut();
        if let Some(pos) =
            connected.iter().position(|q| Rc::ptr_eq(q, qpair))
        {
            let qpair = connected.remove(pos);
            self.disconnected.borrow_mut().push(qpair);
            return Ok(());
        }
        drop(connected);

        if self
            .disconnected
            .borrow()
            .iter()
            .any(|q| Rc::ptr_eq(q, qpair))
        {
            return Ok(());
        }
        Err(NvmeError::InvalidArgument {
            reason: format!(
                "qpair {} is not in this poll group",
                qpair.qid()
            ),
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.connected.borrow().is_empty()
            && self.disconnected.borrow().is_empty()
    }

    pub(crate) fn connected_snapshot(&self) -> Vec<Rc<Qpair>> {
        self.connected.borrow().clone()
    }

    pub(crate) fn disconnected_snapshot(&self) -> Vec<Rc<Qpair>> {
        self.disconnected.borrow().clone()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.borrow().len()
    }

    pub fn disconnected_count(&self) -> usize {
        self.disconnected.borrow().len()
    }
}

/// A bundle of qpairs one reactor reaps together.
#[derive(Default)]
pub struct PollGroup {
    tgroups: RefCell<Vec<Rc<TransportPollGroup>>>,
}

impl PollGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn tgroup_for(
        &self,
        transport: &Arc<dyn NvmeTransport>,
    ) -> Option<Rc<TransportPollGroup>> {
        self.tgroups
            .borrow()
            .iter()
            .find(|tg| Arc::ptr_eq(&tg.transport, transport))
            .map(Rc::clone)
    }

    /// Add a qpair; only disconnected qpairs may join a group. The
    /// sub-group of its transport is created on first use.
    pub fn add(&self, qpair: &Rc<Qpair>) -> Result<(), NvmeError> {
        if qpair.state() != QpairState::Disconnected {
            return Err(NvmeError::InvalidArgument {
                reason: format!(
                    "qpair {} must be disconnected to join a poll \
                     group (state {:?})",
                    qpair.qid(),
                    qpair.state()
                ),
            });
        }

        let transport = qpair.transport()?;
        let tgroup = match self.tgroup_for(&transport) {
            Some(tgroup) => tgroup,
            None => {
                let tgroup =
                    TransportPollGroup::new(Arc::clone(&transport));
                self.tgroups.borrow_mut().push(Rc::clone(&tgroup));
                tgroup
            }
        };

        transport.poll_group_add(&tgroup, qpair)
    }

    /// Take a qpair back out of the group.
    pub fn remove(&self, qpair: &Rc<Qpair>) -> Result<(), NvmeError> {
        let transport = qpair.transport()?;
        match self.tgroup_for(&transport) {
            Some(tgroup) => {
                transport.poll_group_remove(&tgroup, qpair)
            }
            None => Err(NvmeError::NoDevice {
                what: format!(
                    "sub-group of transport '{}'",
                    transport.name()
                ),
            }),
        }
    }

    /// Reap every sub-group. Counts are aggregated across sub-groups;
    /// the first error is remembered and returned once every sub-group
    /// has still been polled.
    pub fn process_completions(
        &self,
        completions_per_qpair: u32,
        disconnected_qpair_cb: &mut dyn FnMut(&Rc<Qpair>),
    ) -> Result<i64, NvmeError> {
        let mut total: i64 = 0;
        let mut first_err = None;

        let tgroups = self.tgroups.borrow().clone();
        for tgroup in &tgroups {
            match tgroup.transport.poll_group_process_completions(
                tgroup,
                completions_per_qpair,
                disconnected_qpair_cb,
            ) {
                Ok(n) => total += n,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Tear the group down. Fails with `Busy` while any sub-group
    /// still holds a qpair; the group stays usable in that case.
    pub fn destroy(&self) -> Result<(), NvmeError> {
        let mut tgroups = self.tgroups.borrow_mut();
        while let Some(tgroup) = tgroups.pop() {
            if let Err(e) =
                tgroup.transport.poll_group_destroy(&tgroup)
            {
                tgroups.push(tgroup);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn tgroup_count(&self) -> usize {
        self.tgroups.borrow().len()
    }
}
