//! The PCIe transport: controller bring-up through the BAR register
//! window, I/O queue creation over the admin queue, and the
//! submission/completion engine in [`qpair`].

use std::{cell::RefCell, rc::Rc, sync::Arc, time::Duration};

use crate::{
    core::dma::DmaBuf,
    nvme::{
        ctrlr::{Ctrlr, IoQpairOpts},
        probe::ProbeCtx,
        qpair::{Payload, Qpair, QpairState, Request},
        transport::NvmeTransport,
        wire::{admin_opc, regs, IdentifyCtrlrData, NvmeStatus, SqEntry, CNS_CTRLR},
        NvmeError,
    },
    pci::{self, PciAddress, PciBar, PciDevice},
};

use qpair::{PcieQpair, Reaped, MAX_SGL_DESCRIPTORS, PAGE_SIZE};

pub mod emu;
pub(crate) mod qpair;

pub const TRANSPORT_NAME: &str = "PCIe";

/// Transfer size used when the controller does not report MDTS.
const DEFAULT_MAX_XFER_SIZE: u32 = 128 * 1024;

/// Completion polls before a synchronous admin command is declared
/// lost.
const ADMIN_POLL_BUDGET: u32 = 10_000;

/// PCIe-private controller state.
pub(crate) struct PcieCtrlr {
    bar: Arc<dyn PciBar>,
    addr: PciAddress,
    cap: u64,
    stride_u32: u32,
    cdata: RefCell<Option<IdentifyCtrlrData>>,
    max_xfer_size: std::cell::Cell<u32>,
}

impl PcieCtrlr {
    /// Depth limit the hardware reports, in entries.
    fn max_queue_entries(&self) -> u16 {
        regs::cap_mqes(self.cap).saturating_add(1)
    }
}

pub struct PcieTransport;

impl PcieTransport {
    pub fn new() -> Self {
        PcieTransport
    }
}

impl Default for PcieTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn engine(qpair: &Qpair) -> &RefCell<PcieQpair> {
    qpair.private_as::<RefCell<PcieQpair>>()
}

fn pcie_ctrlr(ctrlr: &Ctrlr) -> &PcieCtrlr {
    ctrlr.private_as::<PcieCtrlr>()
}

/// Spin until CSTS.RDY reaches `ready`, bounded by the worst case
/// timeout the controller reports in CAP.TO.
fn wait_ready(
    bar: &Arc<dyn PciBar>,
    cap: u64,
    ready: bool,
) -> Result<(), NvmeError> {
    let budget_ms = (regs::cap_to(cap) as u64 * 500).max(1);
    for _ in 0 ..= budget_ms {
        let rdy = bar.read32(regs::CSTS) & regs::CSTS_RDY != 0;
        if rdy == ready {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Err(NvmeError::Timeout {
        what: format!(
            "controller ready transition to {}",
            ready as u8
        ),
    })
}

/// Drive one poll pass over a qpair engine. Callbacks run with the
/// engine released, so a callback may submit again.
fn process_cell(
    cell: &RefCell<PcieQpair>,
    max: u32,
) -> Result<u32, NvmeError> {
    {
        let mut qp = cell.borrow_mut();
        if qp.controller_fatal() {
            return Err(NvmeError::DeviceFatal {
                reason: "controller fatal status (CSTS.CFS)"
                    .to_string(),
            });
        }
        // a zero-completion poll still flushes deferred doorbells
        qp.flush_doorbell();
    }

    let limit = cell.borrow().completion_cap(max);
    let mut reaped = 0;
    while reaped < limit {
        let outcome = cell.borrow_mut().reap_one();
        match outcome {
            Reaped::Empty => break,
            Reaped::One(req, status) => {
                reaped += 1;
                (req.cb)(&status);
            }
            Reaped::Fatal(reason) => {
                cell.borrow_mut().after_reap(reaped);
                return Err(NvmeError::DeviceFatal { reason });
            }
        }
    }
    cell.borrow_mut().after_reap(reaped);
    Ok(reaped)
}

/// Submit one admin command and poll the admin queue until it
/// retires.
fn admin_command_sync(
    admin: &RefCell<PcieQpair>,
    cmd: SqEntry,
    payload: Option<Payload>,
) -> Result<NvmeStatus, NvmeError> {
    let status = Rc::new(std::cell::Cell::new(None::<NvmeStatus>));
    let status_out = Rc::clone(&status);
    let req = Request::new(
        cmd,
        payload,
        Box::new(move |st| status_out.set(Some(*st))),
    );

    admin.borrow_mut().submit(req).map_err(|(e, _)| e)?;

    for _ in 0 .. ADMIN_POLL_BUDGET {
        process_cell(admin, 0)?;
        if let Some(st) = status.get() {
            return Ok(st);
        }
    }
    Err(NvmeError::Timeout {
        what: "admin command completion".to_string(),
    })
}

/// Create the device-side queues of an I/O qpair.
fn create_io_queues(
    admin: &RefCell<PcieQpair>,
    qpair_cell: &RefCell<PcieQpair>,
) -> Result<(), NvmeError> {
    let (qid, depth, sq_bus, cq_bus) = {
        let qp = qpair_cell.borrow();
        (
            qp.qid(),
            qp.num_entries(),
            qp.sq_bus_addr(),
            qp.cq_bus_addr(),
        )
    };

    let mut cmd = SqEntry::zeroed();
    cmd.opc = admin_opc::CREATE_IO_CQ;
    cmd.cdw10 = ((depth as u32 - 1) << 16) | qid as u32;
    // physically contiguous
    cmd.cdw11 = 1;
    cmd.dptr1 = cq_bus;
    let st = admin_command_sync(admin, cmd, None)?;
    if !st.is_success() {
        return Err(NvmeError::DeviceFatal {
            reason: format!(
                "create I/O completion queue {} failed: {:?}",
                qid,
                st.status_code()
            ),
        });
    }

    let mut cmd = SqEntry::zeroed();
    cmd.opc = admin_opc::CREATE_IO_SQ;
    cmd.cdw10 = ((depth as u32 - 1) << 16) | qid as u32;
    cmd.cdw11 = ((qid as u32) << 16) | 1;
    cmd.dptr1 = sq_bus;
    let st = admin_command_sync(admin, cmd, None)?;
    if !st.is_success() {
        return Err(NvmeError::DeviceFatal {
            reason: format!(
                "create I/O submission queue {} failed: {:?}",
                qid,
                st.status_code()
            ),
        });
    }
    Ok(())
}

/// Delete the device-side queues of an I/O qpair; failures are logged
/// and swallowed, the host side is torn down regardless.
fn delete_io_queues(admin: &RefCell<PcieQpair>, qid: u16) {
    let mut cmd = SqEntry::zeroed();
    cmd.opc = admin_opc::DELETE_IO_SQ;
    cmd.cdw10 = qid as u32;
    if let Err(e) = admin_command_sync(admin, cmd, None) {
        warn!("delete I/O submission queue {}: {}", qid, e);
    }

    let mut cmd = SqEntry::zeroed();
    cmd.opc = admin_opc::DELETE_IO_CQ;
    cmd.cdw10 = qid as u32;
    if let Err(e) = admin_command_sync(admin, cmd, None) {
        warn!("delete I/O completion queue {}: {}", qid, e);
    }
}

impl NvmeTransport for PcieTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn ctrlr_construct(
        &self,
        ctx: &ProbeCtx,
        devhandle: Option<PciDevice>,
    ) -> Result<Rc<Ctrlr>, NvmeError> {
        let device = match devhandle {
            Some(device) => device,
            None => {
                let addr: PciAddress = ctx
                    .entry
                    .trid
                    .traddr
                    .parse()
                    .map_err(|_| NvmeError::InvalidArgument {
                        reason: format!(
                            "bad PCIe transport address '{}'",
                            ctx.entry.trid.traddr
                        ),
                    })?;
                pci::enumerate()
                    .into_iter()
                    .find(|d| d.id.is_nvme() && d.addr == addr)
                    .ok_or(NvmeError::NoDevice {
                        what: format!("NVMe function at {}", addr),
                    })?
            }
        };

        let bar = Arc::clone(&device.bar);
        let cap = bar.read64(regs::CAP);
        let stride_u32 = regs::cap_dstrd(cap);
        let hw_limit = regs::cap_mqes(cap).saturating_add(1);
        let depth = ctx
            .opts
            .admin_queue_size
            .min(hw_limit)
            .max(2);

        let admin_engine = PcieQpair::new(
            0,
            depth,
            Arc::clone(&bar),
            stride_u32,
            false,
            false,
        )?;

        // program the admin queue and enable the controller
        bar.write32(
            regs::AQA,
            ((depth as u32 - 1) << 16) | (depth as u32 - 1),
        );
        bar.write64(regs::ASQ, admin_engine.sq_bus_addr());
        bar.write64(regs::ACQ, admin_engine.cq_bus_addr());
        bar.write32(
            regs::CC,
            regs::CC_EN | regs::CC_IOSQES | regs::CC_IOCQES,
        );
        wait_ready(&bar, cap, true)?;

        let private = PcieCtrlr {
            bar: Arc::clone(&bar),
            addr: device.addr,
            cap,
            stride_u32,
            cdata: RefCell::new(None),
            max_xfer_size: std::cell::Cell::new(DEFAULT_MAX_XFER_SIZE),
        };
        let ctrlr = Ctrlr::new(
            ctx.entry.clone(),
            ctx.opts.clone(),
            Box::new(private),
        );

        let admin_qpair = Qpair::new(
            0,
            &ctrlr,
            Box::new(RefCell::new(admin_engine)),
        );
        admin_qpair.set_state(QpairState::Enabled);
        ctrlr.set_admin_qpair(Rc::clone(&admin_qpair));

        // identify the controller to learn its limits
        let buf = DmaBuf::alloc(4096, PAGE_SIZE).map_err(|_| {
            NvmeError::NoMemory {
                what: "identify buffer".to_string(),
            }
        })?;
        let mut cmd = SqEntry::zeroed();
        cmd.opc = admin_opc::IDENTIFY;
        cmd.cdw10 = CNS_CTRLR;
        cmd.dptr1 = buf.bus_addr();
        let st = admin_command_sync(engine(&admin_qpair), cmd, None)?;
        if !st.is_success() {
            return Err(NvmeError::DeviceFatal {
                reason: format!(
                    "identify controller failed: {:?}",
                    st.status_code()
                ),
            });
        }

        let cdata = IdentifyCtrlrData::from_bytes(buf.as_slice());
        let private = pcie_ctrlr(&ctrlr);
        if cdata.mdts != 0 {
            let mdts_bytes =
                (1u64 << cdata.mdts) * PAGE_SIZE as u64;
            private
                .max_xfer_size
                .set(mdts_bytes.min(u32::MAX as u64) as u32);
        }
        *private.cdata.borrow_mut() = Some(cdata);

        info!(
            "PCIe controller at {} attached, {} queue entries max",
            device.addr, hw_limit
        );
        Ok(ctrlr)
    }

    fn ctrlr_scan(
        &self,
        ctx: &mut ProbeCtx,
        direct_connect: bool,
    ) -> Result<(), NvmeError> {
        let filter: Option<PciAddress> =
            if !ctx.entry.trid.traddr.is_empty() {
                Some(ctx.entry.trid.traddr.parse().map_err(|_| {
                    NvmeError::InvalidArgument {
                        reason: format!(
                            "bad PCIe transport address '{}'",
                            ctx.entry.trid.traddr
                        ),
                    }
                })?)
            } else if direct_connect {
                return Err(NvmeError::InvalidArgument {
                    reason: "direct connect needs a transport address"
                        .to_string(),
                });
            } else {
                None
            };

        for device in pci::enumerate() {
            if !device.id.is_nvme() {
                continue;
            }
            if let Some(addr) = filter {
                if device.addr != addr {
                    continue;
                }
            }

            let mut sub_ctx = ProbeCtx {
                entry: ctx.entry.clone(),
                opts: ctx.opts.clone(),
                attached: Vec::new(),
            };
            sub_ctx.entry.trid.traddr = device.addr.to_string();

            match self.ctrlr_construct(&sub_ctx, Some(device)) {
                Ok(ctrlr) => ctx.attached.push(ctrlr),
                Err(e) => {
                    warn!("skipping controller during scan: {}", e)
                }
            }
        }
        Ok(())
    }

    fn ctrlr_destruct(&self, ctrlr: &Ctrlr) -> Result<(), NvmeError> {
        let private = pcie_ctrlr(ctrlr);
        private.bar.write32(regs::CC, 0);
        wait_ready(&private.bar, private.cap, false)?;
        info!("PCIe controller at {} detached", private.addr);
        Ok(())
    }

    fn ctrlr_get_reg_4(
        &self,
        ctrlr: &Ctrlr,
        offset: u32,
    ) -> Result<u32, NvmeError> {
        Ok(pcie_ctrlr(ctrlr).bar.read32(offset))
    }

    fn ctrlr_set_reg_4(
        &self,
        ctrlr: &Ctrlr,
        offset: u32,
        value: u32,
    ) -> Result<(), NvmeError> {
        pcie_ctrlr(ctrlr).bar.write32(offset, value);
        Ok(())
    }

    fn ctrlr_get_reg_8(
        &self,
        ctrlr: &Ctrlr,
        offset: u32,
    ) -> Result<u64, NvmeError> {
        Ok(pcie_ctrlr(ctrlr).bar.read64(offset))
    }

    fn ctrlr_set_reg_8(
        &self,
        ctrlr: &Ctrlr,
        offset: u32,
        value: u64,
    ) -> Result<(), NvmeError> {
        pcie_ctrlr(ctrlr).bar.write64(offset, value);
        Ok(())
    }

    fn ctrlr_get_max_xfer_size(&self, ctrlr: &Ctrlr) -> u32 {
        pcie_ctrlr(ctrlr).max_xfer_size.get()
    }

    fn ctrlr_get_max_sges(&self, _ctrlr: &Ctrlr) -> u16 {
        MAX_SGL_DESCRIPTORS as u16
    }

    fn ctrlr_alloc_io_qpair(
        &self,
        ctrlr: &Rc<Ctrlr>,
        qid: u16,
        opts: &IoQpairOpts,
    ) -> Result<Rc<Qpair>, NvmeError> {
        let private = pcie_ctrlr(ctrlr);
        let depth = if opts.io_queue_size == 0 {
            ctrlr.opts().io_queue_size
        } else {
            opts.io_queue_size
        }
        .min(private.max_queue_entries())
        .max(2);

        let engine = PcieQpair::new(
            qid,
            depth,
            Arc::clone(&private.bar),
            private.stride_u32,
            opts.delay_cmd_submit,
            opts.use_sgl,
        )?;
        Ok(Qpair::new(qid, ctrlr, Box::new(RefCell::new(engine))))
    }

    fn ctrlr_delete_io_qpair(
        &self,
        ctrlr: &Ctrlr,
        qpair: &Qpair,
    ) -> Result<(), NvmeError> {
        if qpair.state() != QpairState::Disconnected
            && qpair.state() != QpairState::Destroying
        {
            self.disconnect_engine(ctrlr, qpair);
        }
        qpair.set_state(QpairState::Destroying);
        Ok(())
    }

    fn ctrlr_connect_qpair(
        &self,
        ctrlr: &Ctrlr,
        qpair: &Rc<Qpair>,
    ) -> Result<(), NvmeError> {
        let admin_qpair = ctrlr.admin_qpair();
        let admin = engine(&admin_qpair);

        if let Err(e) = create_io_queues(admin, engine(qpair)) {
            qpair.set_state(QpairState::Error);
            return Err(e);
        }
        qpair.set_state(QpairState::Enabled);

        // replay submissions accepted while connecting
        let pending = engine(qpair).borrow_mut().take_pending();
        for req in pending {
            if let Err((e, req)) =
                engine(qpair).borrow_mut().submit(req)
            {
                warn!(
                    "qpair {}: replay after connect failed: {}",
                    qpair.qid(),
                    e
                );
                (req.cb)(&qpair::replay_failure_status());
            }
        }

        if qpair.poll_group().is_some() {
            self.poll_group_connect_qpair(qpair)?;
        }
        Ok(())
    }

    fn ctrlr_disconnect_qpair(&self, ctrlr: &Ctrlr, qpair: &Rc<Qpair>) {
        self.disconnect_engine(ctrlr, qpair);
        if qpair.poll_group().is_some() {
            let _ = self.poll_group_disconnect_qpair(qpair);
        }
    }

    fn qpair_submit_request(
        &self,
        qpair: &Qpair,
        req: Request,
    ) -> Result<(), NvmeError> {
        match qpair.state() {
            QpairState::Enabled => engine(qpair)
                .borrow_mut()
                .submit(req)
                .map_err(|(e, _)| e),
            QpairState::Connecting => {
                engine(qpair).borrow_mut().queue_pending(req);
                Ok(())
            }
            state => Err(NvmeError::NotConnected {
                qid: qpair.qid(),
                state,
            }),
        }
    }

    fn qpair_process_completions(
        &self,
        qpair: &Qpair,
        max: u32,
    ) -> Result<u32, NvmeError> {
        match qpair.state() {
            QpairState::Enabled
            | QpairState::Connecting
            | QpairState::Disabling => process_cell(engine(qpair), max),
            state => Err(NvmeError::NotConnected {
                qid: qpair.qid(),
                state,
            }),
        }
    }

    fn qpair_abort_reqs(&self, qpair: &Qpair, dnr: bool) {
        let drained = engine(qpair).borrow_mut().drain_requests();
        let status = NvmeStatus::aborted_by_reset(dnr);
        for req in drained {
            (req.cb)(&status);
        }
    }

    fn qpair_reset(&self, qpair: &Qpair) -> Result<(), NvmeError> {
        let ctrlr = qpair.ctrlr().ok_or(NvmeError::NoDevice {
            what: "controller of qpair".to_string(),
        })?;

        self.qpair_abort_reqs(qpair, false);

        if qpair.is_admin() {
            // a clean admin qpair needs the controller itself rewound
            let private = pcie_ctrlr(&ctrlr);
            private.bar.write32(regs::CC, 0);
            wait_ready(&private.bar, private.cap, false)?;

            let mut qp = engine(qpair).borrow_mut();
            qp.rewind();
            let depth = qp.num_entries();
            private.bar.write32(
                regs::AQA,
                ((depth as u32 - 1) << 16) | (depth as u32 - 1),
            );
            private.bar.write64(regs::ASQ, qp.sq_bus_addr());
            private.bar.write64(regs::ACQ, qp.cq_bus_addr());
            private.bar.write32(
                regs::CC,
                regs::CC_EN | regs::CC_IOSQES | regs::CC_IOCQES,
            );
            drop(qp);
            wait_ready(&private.bar, private.cap, true)?;
        } else {
            let admin_qpair = ctrlr.admin_qpair();
            delete_io_queues(engine(&admin_qpair), qpair.qid());
            engine(qpair).borrow_mut().rewind();
            create_io_queues(engine(&admin_qpair), engine(qpair))?;
        }

        qpair.set_state(QpairState::Enabled);
        Ok(())
    }
}

impl PcieTransport {
    /// DISABLING: fail the in-flight requests, DISCONNECTING: tear the
    /// device queues down, then DISCONNECTED.
    fn disconnect_engine(&self, ctrlr: &Ctrlr, qpair: &Qpair) {
        if qpair.state() == QpairState::Disconnected {
            return;
        }
        qpair.set_state(QpairState::Disabling);
        let drained = engine(qpair).borrow_mut().drain_requests();

        qpair.set_state(QpairState::Disconnecting);
        if !qpair.is_admin() {
            let admin_qpair = ctrlr.admin_qpair();
            delete_io_queues(engine(&admin_qpair), qpair.qid());
        }
        engine(qpair).borrow_mut().rewind();
        qpair.set_state(QpairState::Disconnected);

        let status = NvmeStatus::aborted_by_reset(false);
        for req in drained {
            (req.cb)(&status);
        }
    }
}

/// How often the engine's expected phase has toggled; diagnostics.
pub fn phase_wraps(qpair: &Qpair) -> u64 {
    engine(qpair).borrow().phase_wraps()
}

/// Trackers currently on the free list; diagnostics.
pub fn free_tracker_count(qpair: &Qpair) -> u32 {
    engine(qpair).borrow().free_tracker_count()
}

/// Ring depth of the qpair.
pub fn queue_depth(qpair: &Qpair) -> u16 {
    engine(qpair).borrow().num_entries()
}

/// Serial number from the identify data, pad stripped.
pub fn ctrlr_serial(ctrlr: &Ctrlr) -> Option<String> {
    let private = pcie_ctrlr(ctrlr);
    let cdata = private.cdata.borrow();
    cdata.as_ref().map(|cdata| {
        let len = crate::util::string::padded_len(&cdata.sn, b' ');
        String::from_utf8_lossy(&cdata.sn[.. len]).into_owned()
    })
}

/// Model number from the identify data, pad stripped.
pub fn ctrlr_model(ctrlr: &Ctrlr) -> Option<String> {
    let private = pcie_ctrlr(ctrlr);
    let cdata = private.cdata.borrow();
    cdata.as_ref().map(|cdata| {
        let len = crate::util::string::padded_len(&cdata.mn, b' ');
        String::from_utf8_lossy(&cdata.mn[.. len]).into_owned()
    })
}

/// Ring any doorbell deferred by `delay_cmd_submit` without reaping.
pub fn flush_doorbells(qpair: &Qpair) {
    engine(qpair).borrow_mut().flush_doorbell();
}

/// Install the callback invoked with the command id of a request whose
/// deadline elapsed. Without one, an expiry forces a qpair reset.
pub fn set_timeout_handler(
    qpair: &Qpair,
    cb: impl FnMut(u16) + 'static,
) {
    engine(qpair)
        .borrow_mut()
        .set_timeout_cb(Some(Box::new(cb)));
}

/// Scan the in-flight trackers for expired deadlines; meant to run
/// from a periodic poller. Returns the number of requests that
/// expired on this pass.
pub fn check_timeouts(qpair: &Qpair) -> usize {
    let expired = engine(qpair).borrow_mut().expired_trackers();
    if expired.is_empty() {
        return 0;
    }

    let cb = engine(qpair).borrow_mut().take_timeout_cb();
    match cb {
        Some(mut cb) => {
            for cid in &expired {
                cb(*cid);
            }
            engine(qpair).borrow_mut().restore_timeout_cb(Some(cb));
        }
        None => {
            warn!(
                "qpair {}: request timeout with no handler, \
                 resetting",
                qpair.qid()
            );
            if let Err(e) = qpair.reset() {
                error!(
                    "qpair {}: reset after timeout failed: {}",
                    qpair.qid(),
                    e
                );
            }
        }
    }
    expired.len()
}
