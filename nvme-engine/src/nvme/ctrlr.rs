//! Controller handles. A controller owns its qpairs, including the
//! admin qpair, whose command path stays on the reactor that created
//! the controller; crossing reactors to reap admin completions is
//! refused at runtime.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use crate::{
    core::{Reactor, ReactorId},
    nvme::{
        qpair::{Qpair, QpairState, Request},
        transport::{get_transport, NvmeTransport},
        trid::{TransportId, TridEntry},
        NvmeError,
    },
};
use std::sync::Arc;

/// Tunables applied when a controller is attached.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CtrlrOpts {
    /// entries on the admin queue pair
    pub admin_queue_size: u16,
    /// default entries on an I/O queue pair
    pub io_queue_size: u16,
    /// I/O queue pairs to ask the controller for
    pub num_io_queues: u32,
}

impl Default for CtrlrOpts {
    fn default() -> Self {
        Self {
            admin_queue_size: 32,
            io_queue_size: 128,
            num_io_queues: 4,
        }
    }
}

/// Tunables applied when an I/O queue pair is allocated.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IoQpairOpts {
    /// entries on the queue pair; zero takes the controller default
    pub io_queue_size: u16,
    /// batch doorbell writes; a later `process_completions` or an
    /// explicit flush rings the deferred doorbell
    pub delay_cmd_submit: bool,
    /// describe payloads with SGL descriptors instead of PRP lists
    pub use_sgl: bool,
}

/// A handle to an NVMe-family target.
pub struct Ctrlr {
    entry: TridEntry,
    opts: CtrlrOpts,
    /// reactor the controller was created on; admin commands are
    /// serialized here. None when constructed off any reactor.
    owner: Option<ReactorId>,
    admin: RefCell<Option<Rc<Qpair>>>,
    io_qpairs: RefCell<Vec<Rc<Qpair>>>,
    next_qid: Cell<u16>,
    /// transport-private controller state
    pub(crate) private: Box<dyn Any>,
}

impl fmt::Debug for Ctrlr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ctrlr {} ({} io qpairs)",
            self.entry.trid,
            self.io_qpairs.borrow().len()
        )
    }
}

impl Ctrlr {
    pub(crate) fn new(
        entry: TridEntry,
        opts: CtrlrOpts,
        private: Box<dyn Any>,
    ) -> Rc<Ctrlr> {
        Rc::new(Ctrlr {
            entry,
            opts,
            owner: Reactor::current_id(),
            admin: RefCell::new(None),
            io_qpairs: RefCell::new(Vec::new()),
            next_qid: Cell::new(1),
            private,
        })
    }

    pub fn trid(&self) -> &TransportId {
        &self.entry.trid
    }

    pub fn entry(&self) -> &TridEntry {
        &self.entry
    }

    pub fn opts(&self) -> &CtrlrOpts {
        &self.opts
    }

    fn transport(&self) -> Result<Arc<dyn NvmeTransport>, NvmeError> {
        let name = self.entry.trid.trtype.to_string();
        get_transport(&name)
            .ok_or(NvmeError::NoDevice { what: name })
    }

    fn check_admin_affinity(&self) -> Result<(), NvmeError> {
        match self.owner {
            Some(owner) if Reactor::current_id() != Some(owner) => {
                Err(NvmeError::InvalidArgument {
                    reason: format!(
                        "admin queue of {} is owned by reactor {}",
                        self.entry.trid, owner
                    ),
                })
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn set_admin_qpair(&self, qpair: Rc<Qpair>) {
        *self.admin.borrow_mut() = Some(qpair);
    }

    /// The admin qpair, QID 0.
    pub fn admin_qpair(&self) -> Rc<Qpair> {
        Rc::clone(
            self.admin
                .borrow()
                .as_ref()
                .expect("controller has no admin qpair"),
        )
    }

    /// Place an admin command; only legal on the owning reactor.
    pub fn submit_admin(&self, req: Request) -> Result<(), NvmeError> {
        self.check_admin_affinity()?;
        self.admin_qpair().submit(req)
    }

    /// Reap admin completions; only legal on the owning reactor.
    pub fn process_admin_completions(
        &self,
    ) -> Result<u32, NvmeError> {
        self.check_admin_affinity()?;
        self.admin_qpair().process_completions(0)
    }

    /// Allocate an I/O qpair. The qpair caches the transport so the
    /// submission fast path skips the registry.
    pub fn alloc_io_qpair(
        self: &Rc<Self>,
        opts: &IoQpairOpts,
    ) -> Result<Rc<Qpair>, NvmeError> {
        let transport = self.transport()?;
        let qid = self.next_qid.get();
        self.next_qid.set(qid + 1);

        let qpair =
            transport.ctrlr_alloc_io_qpair(self, qid, opts)?;
        qpair.cache_transport(Arc::clone(&transport));
        self.io_qpairs.borrow_mut().push(Rc::clone(&qpair));
        Ok(qpair)
    }

    /// Drive a qpair to `Enabled`. A freshly connected qpair that sits
    /// in a poll group moves to its sub-group's connected list.
    pub fn connect_qpair(
        &self,
        qpair: &Rc<Qpair>,
    ) -> Result<(), NvmeError> {
        let transport = self.transport()?;
        if !qpair.is_admin() {
            qpair.cache_transport(Arc::clone(&transport));
        }
        qpair.set_state(QpairState::Connecting);
        transport.ctrlr_connect_qpair(self, qpair)
    }

    /// Drive a qpair back to `Disconnected`.
    pub fn disconnect_qpair(&self, qpair: &Rc<Qpair>) {
        if let Ok(transport) = self.transport() {
            transport.ctrlr_disconnect_qpair(self, qpair);
        }
    }

    /// Disconnect and free an I/O qpair.
    pub fn free_io_qpair(
        &self,
        qpair: &Rc<Qpair>,
    ) -> Result<(), NvmeError> {
        let transport = self.transport()?;
        if qpair.state() == QpairState::Enabled {
            transport.ctrlr_disconnect_qpair(self, qpair);
        }
        qpair.set_state(QpairState::Destroying);
        self.io_qpairs
            .borrow_mut()
            .retain(|q| !Rc::ptr_eq(q, qpair));
        transport.ctrlr_delete_io_qpair(self, qpair)
    }

    pub fn io_qpair_count(&self) -> usize {
        self.io_qpairs.borrow().len()
    }

    /// Largest single transfer the controller takes.
    pub fn max_xfer_size(&self) -> u32 {
        match self.transport() {
            Ok(t) => t.ctrlr_get_max_xfer_size(self),
            Err(_) => 0,
        }
    }

    /// SGL descriptors per command the controller takes.
    pub fn max_sges(&self) -> u16 {
        match self.transport() {
            Ok(t) => t.ctrlr_get_max_sges(self),
            Err(_) => 0,
        }
    }

    pub fn read_reg32(&self, offset: u32) -> Result<u32, NvmeError> {
        self.transport()?.ctrlr_get_reg_4(self, offset)
    }

    pub fn write_reg32(
        &self,
        offset: u32,
        value: u32,
    ) -> Result<(), NvmeError> {
        self.transport()?.ctrlr_set_reg_4(self, offset, value)
    }

    pub fn read_reg64(&self, offset: u32) -> Result<u64, NvmeError> {
        self.transport()?.ctrlr_get_reg_8(self, offset)
    }

    pub fn write_reg64(
        &self,
        offset: u32,
        value: u64,
    ) -> Result<(), NvmeError> {
        self.transport()?.ctrlr_set_reg_8(self, offset, value)
    }

    /// Controller-level reset: every in-flight request on every I/O
    /// qpair completes with the abort status and the qpairs drop back
    /// to `Disconnected`; the admin qpair is rewound to a clean
    /// `Enabled`.
    pub fn reset(&self) -> Result<(), NvmeError> {
        warn!("resetting controller {}", self.entry.trid);
        let transport = self.transport()?;

        // snapshot; an abort callback may drop its own qpair
        let qpairs: Vec<_> = self.io_qpairs.borrow().clone();
        for qpair in qpairs.iter() {
            transport.ctrlr_disconnect_qpair(self, qpair);
        }

        let admin = self.admin_qpair();
        transport.qpair_reset(&admin)?;
        Ok(())
    }

    /// Tear the controller down; all qpairs must have been freed.
    pub fn detach(&self) -> Result<(), NvmeError> {
        if !self.io_qpairs.borrow().is_empty() {
            return Err(NvmeError::Busy {
                what: format!("controller {}", self.entry.trid),
            });
        }
        let transport = self.transport()?;
        transport.ctrlr_destruct(self)
    }

    pub(crate) fn private_as<T: 'static>(&self) -> &T {
        self.private
            .downcast_ref::<T>()
            .expect("controller private data of the wrong transport")
    }
}
