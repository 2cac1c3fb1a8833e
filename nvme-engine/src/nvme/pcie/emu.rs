//! A software NVMe controller behind the `PciBar` trait.
//!
//! The model implements the register window, the admin commands the
//! driver issues (identify, queue create/delete, features) and the
//! NVM read/write/flush path against an in-memory namespace. Commands
//! are executed synchronously inside the doorbell write, which keeps
//! the model single-threaded from the driver's point of view while
//! still exercising the full ring, PRP and phase-bit machinery.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
    core::dma,
    nvme::wire::{
        admin_opc,
        nvm_opc,
        regs,
        CqEntry,
        IdentifyCtrlrData,
        SqEntry,
        FEAT_NUMBER_OF_QUEUES,
        SCT_GENERIC,
    },
    pci::{PciBar, PciDevice, PciDeviceId, PCI_VENDOR_ID_INTEL},
    util::string::copy_padded,
};

const PAGE: u64 = 4096;
const BLOCK_SIZE: usize = 512;

// generic status codes the model produces
const SC_SUCCESS: u8 = 0x00;
const SC_INVALID_OPCODE: u8 = 0x01;
const SC_INVALID_FIELD: u8 = 0x02;
const SC_DATA_TRANSFER_ERROR: u8 = 0x04;
const SC_INVALID_NAMESPACE: u8 = 0x0b;
const SC_LBA_OUT_OF_RANGE: u8 = 0x80;

/// MQES 255 (256 entries), CQR, TO of one 500 ms unit, DSTRD 0, the
/// NVM command set.
const CAP_VALUE: u64 = 0xff | (1 << 16) | (1 << 24) | (1 << 37);
const VS_VALUE: u32 = 0x0001_0300;

struct DevSq {
    base: u64,
    size: u16,
    head: u16,
    cqid: u16,
}

struct DevCq {
    base: u64,
    size: u16,
    tail: u16,
    phase: bool,
}

struct EmuInner {
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    sqs: BTreeMap<u16, DevSq>,
    cqs: BTreeMap<u16, DevCq>,
    ns: Vec<u8>,
    serial: String,
    model: String,
    firmware: String,
    /// log2 max transfer, units of the minimum page
    mdts: u8,
    /// consumed by the next I/O command
    inject: Option<(u8, u8)>,
}

/// The software controller; hand its [`PciDevice`] to an emulated bus
/// or drive the BAR directly.
pub struct EmuNvmeCtrlr {
    inner: Mutex<EmuInner>,
}

impl EmuNvmeCtrlr {
    pub fn new(blocks: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(EmuInner {
                cc: 0,
                csts: 0,
                aqa: 0,
                asq: 0,
                acq: 0,
                sqs: BTreeMap::new(),
                cqs: BTreeMap::new(),
                ns: vec![0u8; blocks as usize * BLOCK_SIZE],
                serial: "EMU00000000000001".to_string(),
                model: "ENGINE EMULATED NVME".to_string(),
                firmware: "1.0".to_string(),
                mdts: 5,
                inject: None,
            }),
        })
    }

    /// Present this controller as a PCI function at `addr`.
    pub fn pci_device(self: &Arc<Self>, addr: &str) -> PciDevice {
        PciDevice {
            addr: addr.parse().expect("valid PCI address"),
            id: PciDeviceId {
                vendor: PCI_VENDOR_ID_INTEL,
                device: 0x0953,
            },
            bar: Arc::clone(self) as Arc<dyn PciBar>,
        }
    }

    /// Fail the next I/O command with the given status.
    pub fn inject_io_error(&self, sct: u8, sc: u8) {
        self.inner.lock().inject = Some((sct, sc));
    }

    /// Latch controller fatal status; the driver sees CSTS.CFS.
    pub fn set_fatal(&self) {
        self.inner.lock().csts |= regs::CSTS_CFS;
    }

    /// Direct view of the namespace for test assertions.
    pub fn namespace_snapshot(&self) -> Vec<u8> {
        self.inner.lock().ns.clone()
    }
}

impl PciBar for EmuNvmeCtrlr {
    fn read32(&self, offset: u32) -> u32 {
        let inner = self.inner.lock();
        match offset {
            regs::CC => inner.cc,
            regs::CSTS => inner.csts,
            regs::VS => VS_VALUE,
            regs::AQA => inner.aqa,
            _ => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut inner = self.inner.lock();
        match offset {
            regs::CC => handle_cc_write(&mut inner, value),
            regs::AQA => inner.aqa = value,
            _ if offset >= regs::DOORBELL_BASE => {
                let idx = (offset - regs::DOORBELL_BASE) / 4;
                let qid = (idx / 2) as u16;
                if idx % 2 == 0 {
                    process_sq(&mut inner, qid, value as u16);
                } else {
                    // consumer head; the model never backpressures
                    // on completion queue space
                    trace!(
                        "emu: queue {} consumer head {}",
                        qid,
                        value
                    );
                }
            }
            _ => warn!("emu: write to unknown register {:#x}", offset),
        }
    }

    fn read64(&self, offset: u32) -> u64 {
        let inner = self.inner.lock();
        match offset {
            regs::CAP => CAP_VALUE,
            regs::ASQ => inner.asq,
            regs::ACQ => inner.acq,
            _ => 0,
        }
    }

    fn write64(&self, offset: u32, value: u64) {
        let mut inner = self.inner.lock();
        match offset {
            regs::ASQ => inner.asq = value,
            regs::ACQ => inner.acq = value,
            _ => warn!("emu: write64 to unknown register {:#x}", offset),
        }
    }
}

fn handle_cc_write(inner: &mut EmuInner, value: u32) {
    let was_enabled = inner.cc & regs::CC_EN != 0;
    let enable = value & regs::CC_EN != 0;
    inner.cc = value;

    if enable && !was_enabled {
        let asqs = (inner.aqa & 0xfff) as u16 + 1;
        let acqs = ((inner.aqa >> 16) & 0xfff) as u16 + 1;
        inner.sqs.insert(
            0,
            DevSq {
                base: inner.asq,
                size: asqs,
                head: 0,
                cqid: 0,
            },
        );
        inner.cqs.insert(
            0,
            DevCq {
                base: inner.acq,
                size: acqs,
                tail: 0,
                phase: true,
            },
        );
        inner.csts |= regs::CSTS_RDY;
    } else if !enable && was_enabled {
        inner.sqs.clear();
        inner.cqs.clear();
        inner.csts &= !regs::CSTS_RDY;
    }
}

/// Consume submission entries up to the new tail and complete each
/// one.
fn process_sq(inner: &mut EmuInner, qid: u16, new_tail: u16) {
    let (base, size, cqid, mut head) = match inner.sqs.get(&qid) {
        Some(sq) => (sq.base, sq.size, sq.cqid, sq.head),
        None => {
            warn!("emu: doorbell for unknown submission queue {}", qid);
            return;
        }
    };

    if new_tail >= size {
        warn!("emu: doorbell beyond queue {} size", qid);
        return;
    }

    while head != new_tail {
        let mut raw = [0u8; 64];
        if dma::bus_read(base + head as u64 * 64, &mut raw).is_err() {
            error!("emu: cannot fetch entry {} of queue {}", head, qid);
            return;
        }
        let sqe = SqEntry::from_bytes(&raw);
        head = (head + 1) % size;

        let (cdw0, sct, sc) = if qid == 0 {
            execute_admin(inner, &sqe)
        } else {
            execute_io(inner, &sqe)
        };
        post_cpl(inner, cqid, qid, head, sqe.cid, cdw0, sct, sc);
    }

    if let Some(sq) = inner.sqs.get_mut(&qid) {
        sq.head = head;
    }
}

fn post_cpl(
    inner: &mut EmuInner,
    cqid: u16,
    sqid: u16,
    sqhd: u16,
    cid: u16,
    cdw0: u32,
    sct: u8,
    sc: u8,
) {
    let cq = match inner.cqs.get_mut(&cqid) {
        Some(cq) => cq,
        None => {
            warn!("emu: completion for unknown queue {}", cqid);
            return;
        }
    };

    let mut cpl = CqEntry {
        cdw0,
        rsvd1: 0,
        sqhd,
        sqid,
        cid,
        status: 0,
    };
    cpl.set_status(sct, sc, false, cq.phase);

    let slot = cq.base + cq.tail as u64 * 16;
    if dma::bus_write(slot, cpl.as_bytes()).is_err() {
        error!("emu: cannot post completion to queue {}", cqid);
        return;
    }

    cq.tail += 1;
    if cq.tail == cq.size {
        cq.tail = 0;
        cq.phase = !cq.phase;
    }
}

/// Resolve the data pointer of a command into `(bus, len)` chunks the
/// way the hardware walks PRPs.
fn gather_prps(
    prp1: u64,
    prp2: u64,
    len: usize,
) -> Result<Vec<(u64, usize)>, ()> {
    let mut chunks = Vec::new();
    let first = (PAGE - (prp1 % PAGE)) as usize;
    let take = len.min(first);
    chunks.push((prp1, take));
    let mut remaining = len - take;

    if remaining == 0 {
        return Ok(chunks);
    }
    if remaining <= PAGE as usize {
        chunks.push((prp2, remaining));
        return Ok(chunks);
    }

    // PRP2 points at a list of page entries
    let entries = (remaining + PAGE as usize - 1) / PAGE as usize;
    let mut raw = vec![0u8; entries * 8];
    dma::bus_read(prp2, &mut raw).map_err(|_| ())?;
    for i in 0 .. entries {
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&raw[i * 8 .. i * 8 + 8]);
        let addr = u64::from_le_bytes(addr);
        let take = remaining.min(PAGE as usize);
        chunks.push((addr, take));
        remaining -= take;
    }
    Ok(chunks)
}

fn execute_admin(inner: &mut EmuInner, sqe: &SqEntry) -> (u32, u8, u8) {
    match sqe.opc {
        admin_opc::IDENTIFY => {
            if sqe.cdw10 & 0xff != 1 {
                return (0, SCT_GENERIC, SC_INVALID_FIELD);
            }
            let mut cdata = IdentifyCtrlrData::zeroed();
            cdata.vid = PCI_VENDOR_ID_INTEL;
            cdata.ssvid = PCI_VENDOR_ID_INTEL;
            copy_padded(&mut cdata.sn, &inner.serial, b' ');
            copy_padded(&mut cdata.mn, &inner.model, b' ');
            copy_padded(&mut cdata.fr, &inner.firmware, b' ');
            cdata.mdts = inner.mdts;
            cdata.nn = 1;

            let bytes = cdata.as_bytes();
            match gather_prps(sqe.dptr1, sqe.dptr2, bytes.len()) {
                Ok(chunks) => {
                    let mut off = 0;
                    for (bus, len) in chunks {
                        if dma::bus_write(
                            bus,
                            &bytes[off .. off + len],
                        )
                        .is_err()
                        {
                            return (
                                0,
                                SCT_GENERIC,
                                SC_DATA_TRANSFER_ERROR,
                            );
                        }
                        off += len;
                    }
                    (0, SCT_GENERIC, SC_SUCCESS)
                }
                Err(_) => (0, SCT_GENERIC, SC_DATA_TRANSFER_ERROR),
            }
        }
        admin_opc::CREATE_IO_CQ => {
            let qid = (sqe.cdw10 & 0xffff) as u16;
            let size = ((sqe.cdw10 >> 16) & 0xffff) as u16 + 1;
            // only physically contiguous queues
            if qid == 0
                || size < 2
                || sqe.cdw11 & 1 == 0
                || inner.cqs.contains_key(&qid)
            {
                return (0, SCT_GENERIC, SC_INVALID_FIELD);
            }
            inner.cqs.insert(
                qid,
                DevCq {
                    base: sqe.dptr1,
                    size,
                    tail: 0,
                    phase: true,
                },
            );
            (0, SCT_GENERIC, SC_SUCCESS)
        }
        admin_opc::CREATE_IO_SQ => {
            let qid = (sqe.cdw10 & 0xffff) as u16;
            let size = ((sqe.cdw10 >> 16) & 0xffff) as u16 + 1;
            let cqid = (sqe.cdw11 >> 16) as u16;
            if qid == 0
                || size < 2
                || sqe.cdw11 & 1 == 0
                || inner.sqs.contains_key(&qid)
                || !inner.cqs.contains_key(&cqid)
            {
                return (0, SCT_GENERIC, SC_INVALID_FIELD);
            }
            inner.sqs.insert(
                qid,
                DevSq {
                    base: sqe.dptr1,
                    size,
                    head: 0,
                    cqid,
                },
            );
            (0, SCT_GENERIC, SC_SUCCESS)
        }
        admin_opc::DELETE_IO_SQ => {
            let qid = (sqe.cdw10 & 0xffff) as u16;
            if qid == 0 || inner.sqs.remove(&qid).is_none() {
                return (0, SCT_GENERIC, SC_INVALID_FIELD);
            }
            (0, SCT_GENERIC, SC_SUCCESS)
        }
        admin_opc::DELETE_IO_CQ => {
            let qid = (sqe.cdw10 & 0xffff) as u16;
            let in_use =
                inner.sqs.values().any(|sq| sq.cqid == qid);
            if qid == 0 || in_use {
                return (0, SCT_GENERIC, SC_INVALID_FIELD);
            }
            if inner.cqs.remove(&qid).is_none() {
                return (0, SCT_GENERIC, SC_INVALID_FIELD);
            }
            (0, SCT_GENERIC, SC_SUCCESS)
        }
        admin_opc::SET_FEATURES | admin_opc::GET_FEATURES => {
            if sqe.cdw10 & 0xff == FEAT_NUMBER_OF_QUEUES {
                // grant whatever was asked
                (sqe.cdw11, SCT_GENERIC, SC_SUCCESS)
            } else {
                (0, SCT_GENERIC, SC_INVALID_FIELD)
            }
        }
        admin_opc::ABORT => {
            // nothing is ever in flight inside the model
            (1, SCT_GENERIC, SC_SUCCESS)
        }
        _ => (0, SCT_GENERIC, SC_INVALID_OPCODE),
    }
}

fn execute_io(inner: &mut EmuInner, sqe: &SqEntry) -> (u32, u8, u8) {
    if let Some((sct, sc)) = inner.inject.take() {
        return (0, sct, sc);
    }

    match sqe.opc {
        nvm_opc::READ | nvm_opc::WRITE => {
            if sqe.nsid != 1 {
                return (0, SCT_GENERIC, SC_INVALID_NAMESPACE);
            }
            let lba =
                sqe.cdw10 as u64 | ((sqe.cdw11 as u64) << 32);
            let blocks = (sqe.cdw12 & 0xffff) as u64 + 1;
            let ns_blocks = (inner.ns.len() / BLOCK_SIZE) as u64;
            if lba + blocks > ns_blocks {
                return (0, SCT_GENERIC, SC_LBA_OUT_OF_RANGE);
            }

            let len = (blocks as usize) * BLOCK_SIZE;
            let chunks = match gather_prps(sqe.dptr1, sqe.dptr2, len)
            {
                Ok(chunks) => chunks,
                Err(_) => {
                    return (0, SCT_GENERIC, SC_DATA_TRANSFER_ERROR)
                }
            };

            let mut off = lba as usize * BLOCK_SIZE;
            for (bus, chunk_len) in chunks {
                let result = if sqe.opc == nvm_opc::WRITE {
                    dma::bus_read(
                        bus,
                        &mut inner.ns[off .. off + chunk_len],
                    )
                } else {
                    dma::bus_write(
                        bus,
                        &inner.ns[off .. off + chunk_len],
                    )
                };
                if result.is_err() {
                    return (0, SCT_GENERIC, SC_DATA_TRANSFER_ERROR);
                }
                off += chunk_len;
            }
            (0, SCT_GENERIC, SC_SUCCESS)
        }
        nvm_opc::FLUSH => (0, SCT_GENERIC, SC_SUCCESS),
        _ => (0, SCT_GENERIC, SC_INVALID_OPCODE),
    }
}
