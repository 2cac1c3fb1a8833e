//! Queue pairs: the command channels of a controller.
//!
//! The common part lives here; the wire-level machinery is owned by
//! the transport that created the qpair and hangs off `private`. A
//! qpair never leaves the reactor it was created on, so the mutable
//! state is plain cells.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
    sync::Arc,
    time::Duration,
};

use once_cell::unsync::OnceCell;

use crate::nvme::{
    ctrlr::Ctrlr,
    poll_group::TransportPollGroup,
    transport::{get_transport, NvmeTransport},
    wire::{admin_opc, nvm_opc, CNS_CTRLR, NvmeStatus, SqEntry},
    NvmeError,
};

/// The connection state machine. Submission is legal only in
/// `Enabled`; `Error` is terminal until an explicit reset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QpairState {
    Disconnected,
    Connecting,
    Enabled,
    Disabling,
    Disconnecting,
    Destroying,
    Error,
}

/// Completion callback of a request; runs on the submitting reactor.
pub type RequestCb = Box<dyn FnOnce(&NvmeStatus) + 'static>;

/// Data buffer of a request, described in bus addresses.
#[derive(Clone, Debug)]
pub enum Payload {
    /// physically contiguous region
    Contig { bus: u64, len: usize },
    /// scattered regions, encoded as SGL descriptors
    Sgl(Vec<SglSegment>),
}

#[derive(Clone, Copy, Debug)]
pub struct SglSegment {
    pub bus: u64,
    pub len: u32,
}

/// One command to be placed on a qpair.
pub struct Request {
    pub cmd: SqEntry,
    pub payload: Option<Payload>,
    pub timeout: Option<Duration>,
    pub cb: RequestCb,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request {:?}", self.cmd)
    }
}

impl Request {
    pub fn new(
        cmd: SqEntry,
        payload: Option<Payload>,
        cb: RequestCb,
    ) -> Self {
        Self {
            cmd,
            payload,
            timeout: None,
            cb,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// An NVM read of `lba_count` blocks starting at `lba`.
    pub fn read(
        nsid: u32,
        lba: u64,
        lba_count: u32,
        payload: Payload,
        cb: RequestCb,
    ) -> Self {
        Self::rw(nvm_opc::READ, nsid, lba, lba_count, payload, cb)
    }

    /// An NVM write of `lba_count` blocks starting at `lba`.
    pub fn write(
        nsid: u32,
        lba: u64,
        lba_count: u32,
        payload: Payload,
        cb: RequestCb,
    ) -> Self {
        Self::rw(nvm_opc::WRITE, nsid, lba, lba_count, payload, cb)
    }

    fn rw(
        opc: u8,
        nsid: u32,
        lba: u64,
        lba_count: u32,
        payload: Payload,
        cb: RequestCb,
    ) -> Self {
        let mut cmd = SqEntry::zeroed();
        cmd.opc = opc;
        cmd.nsid = nsid;
        cmd.cdw10 = lba as u32;
        cmd.cdw11 = (lba >> 32) as u32;
        // zero based count
        cmd.cdw12 = lba_count.saturating_sub(1) & 0xffff;
        Self::new(cmd, Some(payload), cb)
    }

    pub fn flush(nsid: u32, cb: RequestCb) -> Self {
        let mut cmd = SqEntry::zeroed();
        cmd.opc = nvm_opc::FLUSH;
        cmd.nsid = nsid;
        Self::new(cmd, None, cb)
    }

    /// Admin identify-controller into a 4 KiB buffer at `bus`.
    pub fn identify_ctrlr(bus: u64, cb: RequestCb) -> Self {
        let mut cmd = SqEntry::zeroed();
        cmd.opc = admin_opc::IDENTIFY;
        cmd.cdw10 = CNS_CTRLR;
        Self::new(
            cmd,
            Some(Payload::Contig { bus, len: 4096 }),
            cb,
        )
    }
}

/// A bidirectional command channel to a controller.
pub struct Qpair {
    qid: u16,
    state: Cell<QpairState>,
    ctrlr: Weak<Ctrlr>,
    /// cached on I/O qpairs to keep the name lookup off the fast path;
    /// the admin qpair always dispatches through the registry
    transport: OnceCell<Arc<dyn NvmeTransport>>,
    poll_group: RefCell<Option<Weak<TransportPollGroup>>>,
    /// transport-private wire state
    pub(crate) private: Box<dyn Any>,
}

impl fmt::Debug for Qpair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qpair {} ({:?})", self.qid, self.state.get())
    }
}

impl Qpair {
    pub(crate) fn new(
        qid: u16,
        ctrlr: &Rc<Ctrlr>,
        private: Box<dyn Any>,
    ) -> Rc<Qpair> {
        Rc::new(Qpair {
            qid,
            state: Cell::new(QpairState::Disconnected),
            ctrlr: Rc::downgrade(ctrlr),
            transport: OnceCell::new(),
            poll_group: RefCell::new(None),
            private,
        })
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn is_admin(&self) -> bool {
        self.qid == 0
    }

    pub fn state(&self) -> QpairState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: QpairState) {
        trace!(
            "qpair {}: {:?} -> {:?}",
            self.qid,
            self.state.get(),
            state
        );
        self.state.set(state);
    }

    /// The owning controller, while it is alive.
    pub fn ctrlr(&self) -> Option<Rc<Ctrlr>> {
        self.ctrlr.upgrade()
    }

    pub(crate) fn cache_transport(
        &self,
        transport: Arc<dyn NvmeTransport>,
    ) {
        // setting twice keeps the first; the transport of a qpair
        // never changes
        let _ = self.transport.set(transport);
    }

    /// The transport this qpair dispatches through. Admin qpairs look
    /// the transport up by the controller's trid on every call.
    pub fn transport(
        &self,
    ) -> Result<Arc<dyn NvmeTransport>, NvmeError> {
        if !self.is_admin() {
            if let Some(t) = self.transport.get() {
                return Ok(Arc::clone(t));
            }
        }
        let ctrlr = self.ctrlr().ok_or_else(|| NvmeError::NoDevice {
            what: "controller of qpair".to_string(),
        })?;
        let name = ctrlr.trid().trtype.to_string();
        get_transport(&name).ok_or(NvmeError::NoDevice { what: name })
    }

    pub(crate) fn poll_group(&self) -> Option<Rc<TransportPollGroup>> {
        self.poll_group
            .borrow()
            .as_ref()
            .and_then(|weak| weak.upgrade())
    }

    pub(crate) fn set_poll_group(
        &self,
        tgroup: Option<Weak<TransportPollGroup>>,
    ) {
        *self.poll_group.borrow_mut() = tgroup;
    }

    /// Place a request on this qpair. In `Connecting` the request is
    /// queued and submitted once the connect finishes.
    pub fn submit(&self, req: Request) -> Result<(), NvmeError> {
        self.transport()?.qpair_submit_request(self, req)
    }

    /// Reap up to `max` completions (0 means up to the engine's cap),
    /// invoking each retired request's callback on this reactor.
    pub fn process_completions(
        &self,
        max: u32,
    ) -> Result<u32, NvmeError> {
        self.transport()?.qpair_process_completions(self, max)
    }

    /// Fail every outstanding request with an abort status.
    pub fn abort_reqs(&self, dnr: bool) -> Result<(), NvmeError> {
        self.transport()?.qpair_abort_reqs(self, dnr);
        Ok(())
    }

    /// Bring the rings and the state machine back to a clean
    /// `Enabled`.
    pub fn reset(&self) -> Result<(), NvmeError> {
        self.transport()?.qpair_reset(self)
    }

    pub(crate) fn private_as<T: 'static>(&self) -> &T {
        self.private
            .downcast_ref::<T>()
            .expect("qpair private data of the wrong transport")
    }
}
