//! The wire-level submission/completion engine of a PCIe queue pair.
//!
//! All hot state lives in one struct: the two rings, the tracker
//! array and its free list, the ring cursors and the expected phase.
//! The only synchronization with the device is the phase bit in each
//! completion entry and the doorbell writes; there are no locks on
//! this path.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::Instant,
};

use crate::{
    core::dma::DmaBuf,
    nvme::{
        qpair::{Payload, Request, SglSegment},
        wire::{
            regs,
            CqEntry,
            GenericStatusCode,
            NvmeStatus,
            SglDescriptor,
            SqEntry,
            SGL_TYPE_DATA_BLOCK,
            SGL_TYPE_LAST_SEGMENT,
        },
        NvmeError,
    },
    pci::PciBar,
};

/// Host page size; PRP entries address pages of this size.
pub(crate) const PAGE_SIZE: usize = 4096;

/// Capacity of the per-tracker scratch page.
pub(crate) const MAX_PRP_LIST_ENTRIES: usize = 506;
pub(crate) const MAX_SGL_DESCRIPTORS: usize = 253;

const TR_NONE: u32 = u32::MAX;
const TR_FLAG_ACTIVE: u16 = 1 << 0;
const TR_FLAG_TIMED_OUT: u16 = 1 << 1;

/// Byte offset of the PRP/SGL scratch area within a tracker.
const SCRATCH_OFFSET: usize = 48;

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) union PrpSglScratch {
    pub prp: [u64; MAX_PRP_LIST_ENTRIES],
    pub sgl: [SglDescriptor; MAX_SGL_DESCRIPTORS],
}

/// Bookkeeping slot of one in-flight command. The command id written
/// into the submission entry equals the tracker's index, and the
/// scratch area holds the PRP list or SGL segment the entry points
/// at.
#[repr(C, align(4096))]
pub(crate) struct Tracker {
    pub cid: u16,
    pub flags: u16,
    /// next free tracker index, TR_NONE at the tail
    pub next_free: u32,
    /// expiry in microseconds since qpair creation; zero means none
    pub deadline_us: u64,
    /// bus address of the scratch area below
    pub prp_sgl_bus_addr: u64,
    _rsvd1: u64,
    _rsvd2: u64,
    _rsvd3: u64,
    pub u: PrpSglScratch,
}

// The tracker must stay one page so the PRP list never crosses a page
// boundary and the scratch stays naturally aligned.
const _: () = assert!(std::mem::size_of::<Tracker>() == 4096);
const _: () = assert!(SCRATCH_OFFSET % 8 == 0);

type TimeoutCb = Box<dyn FnMut(u16)>;

pub(crate) struct PcieQpair {
    qid: u16,
    num_entries: u16,

    /// submission ring, `num_entries` 64-byte entries
    sq: DmaBuf,
    /// completion ring, `num_entries` 16-byte entries
    cq: DmaBuf,
    /// tracker array, one page per entry
    tr: DmaBuf,
    /// in-flight requests indexed by command id
    requests: Vec<Option<Request>>,
    /// submissions accepted while the qpair was still connecting
    queued: VecDeque<Request>,

    free_head: u32,
    sq_tail: u16,
    sq_head: u16,
    cq_head: u16,
    /// expected phase of the next completion entry; toggles on every
    /// ring wrap
    phase: bool,
    phase_wraps: u64,

    max_completions_cap: u16,

    sq_tdbl: u32,
    cq_hdbl: u32,
    bar: Arc<dyn PciBar>,

    delay_cmd_submit: bool,
    doorbell_pending: bool,
    use_sgl: bool,

    t0: Instant,
    timeout_cb: Option<TimeoutCb>,
}

impl PcieQpair {
    pub(crate) fn new(
        qid: u16,
        num_entries: u16,
        bar: Arc<dyn PciBar>,
        stride_u32: u32,
        delay_cmd_submit: bool,
        use_sgl: bool,
    ) -> Result<Self, NvmeError> {
        if num_entries < 2 {
            return Err(NvmeError::InvalidArgument {
                reason: format!(
                    "queue depth {} is below the minimum of 2",
                    num_entries
                ),
            });
        }

        let alloc = |len: usize, what: &str| {
            DmaBuf::alloc(len, PAGE_SIZE).map_err(|_| {
                NvmeError::NoMemory {
                    what: what.to_string(),
                }
            })
        };

        let sq = alloc(num_entries as usize * 64, "submission ring")?;
        let cq = alloc(num_entries as usize * 16, "completion ring")?;
        let tr = alloc(
            num_entries as usize * std::mem::size_of::<Tracker>(),
            "tracker array",
        )?;

        let mut qp = Self {
            qid,
            num_entries,
            sq,
            cq,
            tr,
            requests: (0 .. num_entries).map(|_| None).collect(),
            queued: VecDeque::new(),
            free_head: 0,
            sq_tail: 0,
            sq_head: 0,
            cq_head: 0,
            phase: true,
            phase_wraps: 0,
            max_completions_cap: (num_entries - 1).max(1),
            sq_tdbl: regs::doorbell_offset(qid, false, stride_u32),
            cq_hdbl: regs::doorbell_offset(qid, true, stride_u32),
            bar,
            delay_cmd_submit,
            doorbell_pending: false,
            use_sgl,
            t0: Instant::now(),
            timeout_cb: None,
        };
        qp.init_trackers();
        Ok(qp)
    }

    fn init_trackers(&mut self) {
        let base = self.tr.bus_addr();
        for i in 0 .. self.num_entries as u32 {
            let tr = self.tracker_mut(i);
            tr.cid = i as u16;
            tr.flags = 0;
            tr.deadline_us = 0;
            tr.next_free = if i + 1 < self.num_entries as u32 {
                i + 1
            } else {
                TR_NONE
            };
            tr.prp_sgl_bus_addr = base
                + i as u64 * std::mem::size_of::<Tracker>() as u64
                + SCRATCH_OFFSET as u64;
        }
        self.free_head = 0;
    }

    pub(crate) fn qid(&self) -> u16 {
        self.qid
    }

    pub(crate) fn num_entries(&self) -> u16 {
        self.num_entries
    }

    pub(crate) fn sq_bus_addr(&self) -> u64 {
        self.sq.bus_addr()
    }

    pub(crate) fn cq_bus_addr(&self) -> u64 {
        self.cq.bus_addr()
    }

    /// Number of trackers currently on the free list.
    pub(crate) fn free_tracker_count(&self) -> u32 {
        let mut count = 0;
        let mut idx = self.free_head;
        while idx != TR_NONE {
            count += 1;
            idx = self.tracker(idx).next_free;
        }
        count
    }

    /// How often the expected phase has toggled since creation.
    pub(crate) fn phase_wraps(&self) -> u64 {
        self.phase_wraps
    }

    pub(crate) fn set_timeout_cb(&mut self, cb: Option<TimeoutCb>) {
        self.timeout_cb = cb;
    }

    pub(crate) fn queue_pending(&mut self, req: Request) {
        self.queued.push_back(req);
    }

    pub(crate) fn take_pending(&mut self) -> VecDeque<Request> {
        std::mem::take(&mut self.queued)
    }

    #[allow(clippy::mut_from_ref)]
    fn tracker_mut(&self, idx: u32) -> &mut Tracker {
        debug_assert!(idx < self.num_entries as u32);
        unsafe {
            &mut *(self.tr.as_ptr() as *mut Tracker).add(idx as usize)
        }
    }

    fn tracker(&self, idx: u32) -> &Tracker {
        debug_assert!(idx < self.num_entries as u32);
        unsafe {
            &*(self.tr.as_ptr() as *const Tracker).add(idx as usize)
        }
    }

    fn read_cqe(&self, idx: u16) -> CqEntry {
        unsafe {
            (self.cq.as_ptr() as *const CqEntry)
                .add(idx as usize)
                .read_volatile()
        }
    }

    fn write_sqe(&mut self, idx: u16, sqe: &SqEntry) {
        unsafe {
            (self.sq.as_ptr() as *mut SqEntry)
                .add(idx as usize)
                .write_volatile(*sqe);
        }
    }

    fn ring_sq_doorbell(&mut self) {
        self.bar.write32(self.sq_tdbl, self.sq_tail as u32);
        self.doorbell_pending = false;
    }

    fn ring_cq_doorbell(&mut self) {
        self.bar.write32(self.cq_hdbl, self.cq_head as u32);
    }

    /// Flush a doorbell deferred by `delay_cmd_submit`.
    pub(crate) fn flush_doorbell(&mut self) {
        if self.doorbell_pending {
            self.ring_sq_doorbell();
        }
    }

    /// Encode and place one request. The tracker is only taken once
    /// every argument check passed, so a failed submission leaves the
    /// rings exactly as they were; the request is handed back with the
    /// error and its callback is never invoked.
    pub(crate) fn submit(
        &mut self,
        req: Request,
    ) -> Result<(), (NvmeError, Request)> {
        if let Some(payload) = &req.payload {
            if let Err(e) = self.check_payload(payload) {
                return Err((e, req));
            }
        }

        if self.free_head == TR_NONE {
            return Err((NvmeError::NoSpace { qid: self.qid }, req));
        }
        let tr_idx = self.free_head;
        self.free_head = self.tracker(tr_idx).next_free;

        let mut cmd = req.cmd;
        cmd.cid = tr_idx as u16;

        match &req.payload {
            // admin commands carry queue addresses directly in the
            // data pointer; leave it as built
            None => {}
            Some(Payload::Contig { bus, len }) => {
                let (prp1, prp2) =
                    self.build_prps(tr_idx, *bus, *len);
                cmd.dptr1 = prp1;
                cmd.dptr2 = prp2;
            }
            Some(Payload::Sgl(segments)) => {
                let (addr, len_field, type_field) =
                    self.build_sgl(tr_idx, segments);
                // PSDT 01b: SGL used for the data transfer
                cmd.flags |= 0x40;
                cmd.dptr1 = addr;
                cmd.dptr2 = ((type_field as u64) << 56)
                    | ((len_field as u64) & 0xffff_ffff);
            }
        }

        {
            let deadline = match req.timeout {
                Some(timeout) => {
                    self.t0.elapsed().as_micros() as u64
                        + timeout.as_micros() as u64
                }
                None => 0,
            };
            let tr = self.tracker_mut(tr_idx);
            tr.flags = TR_FLAG_ACTIVE;
            tr.deadline_us = deadline;
        }
        self.requests[tr_idx as usize] = Some(req);

        let slot = self.sq_tail;
        self.write_sqe(slot, &cmd);
        self.sq_tail = (self.sq_tail + 1) % self.num_entries;

        if self.delay_cmd_submit {
            self.doorbell_pending = true;
        } else {
            self.ring_sq_doorbell();
        }
        Ok(())
    }

    fn check_payload(
        &self,
        payload: &Payload,
    ) -> Result<(), NvmeError> {
        match payload {
            Payload::Contig { bus, len } => {
                if *len == 0 {
                    return Err(NvmeError::InvalidArgument {
                        reason: "zero length payload".to_string(),
                    });
                }
                if bus % 4 != 0 {
                    return Err(NvmeError::InvalidArgument {
                        reason: format!(
                            "payload at {:#x} is not dword aligned",
                            bus
                        ),
                    });
                }
                // one entry for the head page plus one per page of the
                // remainder has to fit the scratch page
                let first = PAGE_SIZE - (*bus as usize % PAGE_SIZE);
                if *len > first {
                    let pages =
                        (*len - first + PAGE_SIZE - 1) / PAGE_SIZE;
                    if pages > MAX_PRP_LIST_ENTRIES {
                        return Err(NvmeError::InvalidArgument {
                            reason: format!(
                                "{} byte transfer exceeds the \
                                 largest PRP list",
                                len
                            ),
                        });
                    }
                }
                Ok(())
            }
            Payload::Sgl(segments) => {
                if !self.use_sgl {
                    return Err(NvmeError::InvalidArgument {
                        reason: "scattered payload on a PRP qpair"
                            .to_string(),
                    });
                }
                if segments.is_empty()
                    || segments.len() > MAX_SGL_DESCRIPTORS
                {
                    return Err(NvmeError::InvalidArgument {
                        reason: format!(
                            "{} SGL segments",
                            segments.len()
                        ),
                    });
                }
                for segment in segments {
                    if segment.len == 0 || segment.bus % 4 != 0 {
                        return Err(NvmeError::InvalidArgument {
                            reason: "misaligned SGL segment"
                                .to_string(),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// PRP1 carries the (possibly unaligned) head; PRP2 is the second
    /// page for two-page transfers and the bus address of the tracker
    /// scratch list beyond that.
    fn build_prps(
        &mut self,
        tr_idx: u32,
        bus: u64,
        len: usize,
    ) -> (u64, u64) {
        let first = PAGE_SIZE - (bus as usize % PAGE_SIZE);
        if len <= first {
            return (bus, 0);
        }

        let second = bus + first as u64;
        let remaining = len - first;
        if remaining <= PAGE_SIZE {
            return (bus, second);
        }

        let pages = (remaining + PAGE_SIZE - 1) / PAGE_SIZE;
        let tr = self.tracker_mut(tr_idx);
        for i in 0 .. pages {
            unsafe {
                tr.u.prp[i] = second + (i * PAGE_SIZE) as u64;
            }
        }
        (bus, tr.prp_sgl_bus_addr)
    }

    /// One segment is described inline; more go through a last-segment
    /// descriptor pointing at the list in the tracker scratch.
    fn build_sgl(
        &mut self,
        tr_idx: u32,
        segments: &[SglSegment],
    ) -> (u64, u32, u8) {
        if segments.len() == 1 {
            return (
                segments[0].bus,
                segments[0].len,
                SGL_TYPE_DATA_BLOCK,
            );
        }

        let tr = self.tracker_mut(tr_idx);
        for (i, segment) in segments.iter().enumerate() {
            let descriptor = SglDescriptor {
                address: segment.bus,
                length: segment.len,
                rsvd: [0; 3],
                type_field: SGL_TYPE_DATA_BLOCK,
            };
            unsafe {
                tr.u.sgl[i] = descriptor;
            }
        }
        (
            tr.prp_sgl_bus_addr,
            (segments.len() * std::mem::size_of::<SglDescriptor>())
                as u32,
            SGL_TYPE_LAST_SEGMENT,
        )
    }

    /// Outcome of looking at the next completion slot.
    pub(crate) fn reap_one(&mut self) -> Reaped {
        let cqe = self.read_cqe(self.cq_head);
        if cqe.phase() != self.phase {
            return Reaped::Empty;
        }

        let idx = cqe.cid as u32;
        if idx >= self.num_entries as u32 {
            return Reaped::Fatal(format!(
                "completion carries command id {} beyond the ring",
                idx
            ));
        }

        self.sq_head = cqe.sqhd;

        let tr = self.tracker_mut(idx);
        if tr.flags & TR_FLAG_ACTIVE == 0 {
            return Reaped::Fatal(format!(
                "completion for idle command id {}",
                idx
            ));
        }
        tr.flags = 0;
        tr.deadline_us = 0;
        tr.next_free = self.free_head;
        self.free_head = idx;

        let req = match self.requests[idx as usize].take() {
            Some(req) => req,
            None => {
                return Reaped::Fatal(format!(
                    "tracker {} has no request attached",
                    idx
                ));
            }
        };

        self.cq_head += 1;
        if self.cq_head == self.num_entries {
            self.cq_head = 0;
            self.phase = !self.phase;
            self.phase_wraps += 1;
        }

        Reaped::One(req, NvmeStatus::from(&cqe))
    }

    pub(crate) fn completion_cap(&self, max: u32) -> u32 {
        if max == 0 {
            self.max_completions_cap as u32
        } else {
            max.min(self.max_completions_cap as u32)
        }
    }

    pub(crate) fn after_reap(&mut self, reaped: u32) {
        if reaped > 0 {
            trace!(
                "qpair {}: reaped {}, sq head {} cq head {}",
                self.qid,
                reaped,
                self.sq_head,
                self.cq_head
            );
            self.ring_cq_doorbell();
        }
    }

    /// Controller fatal status is checked once per poll; the caller
    /// initiates the reset.
    pub(crate) fn controller_fatal(&self) -> bool {
        self.bar.read32(regs::CSTS) & regs::CSTS_CFS != 0
    }

    /// Take every in-flight and every pending request off the qpair.
    /// The callbacks are returned so the caller can run them without
    /// holding the engine borrowed. Submissions sitting in the ring
    /// behind a deferred doorbell never reach the device.
    pub(crate) fn drain_requests(&mut self) -> Vec<Request> {
        self.doorbell_pending = false;
        let mut drained = Vec::new();
        for i in 0 .. self.num_entries as u32 {
            let tr = self.tracker_mut(i);
            if tr.flags & TR_FLAG_ACTIVE != 0 {
                tr.flags = 0;
                tr.deadline_us = 0;
                tr.next_free = self.free_head;
                self.free_head = i;
                if let Some(req) = self.requests[i as usize].take() {
                    drained.push(req);
                }
            }
        }
        drained.extend(self.queued.drain(..));
        drained
    }

    /// Rewind the rings to a clean initial state. Outstanding
    /// requests must have been drained first.
    pub(crate) fn rewind(&mut self) {
        self.sq_tail = 0;
        self.sq_head = 0;
        self.cq_head = 0;
        self.phase = true;
        self.phase_wraps = 0;
        self.doorbell_pending = false;
        self.sq.as_mut_slice().iter_mut().for_each(|b| *b = 0);
        self.cq.as_mut_slice().iter_mut().for_each(|b| *b = 0);
        self.init_trackers();
        self.requests.iter_mut().for_each(|r| *r = None);
    }

    /// Expired command ids; each is reported once.
    pub(crate) fn expired_trackers(&mut self) -> Vec<u16> {
        let now = self.t0.elapsed().as_micros() as u64;
        let mut expired = Vec::new();
        for i in 0 .. self.num_entries as u32 {
            let tr = self.tracker_mut(i);
            if tr.flags & TR_FLAG_ACTIVE != 0
                && tr.flags & TR_FLAG_TIMED_OUT == 0
                && tr.deadline_us != 0
                && tr.deadline_us <= now
            {
                tr.flags |= TR_FLAG_TIMED_OUT;
                expired.push(tr.cid);
            }
        }
        expired
    }

    pub(crate) fn take_timeout_cb(&mut self) -> Option<TimeoutCb> {
        self.timeout_cb.take()
    }

    pub(crate) fn restore_timeout_cb(&mut self, cb: Option<TimeoutCb>) {
        if self.timeout_cb.is_none() {
            self.timeout_cb = cb;
        }
    }
}

pub(crate) enum Reaped {
    /// opposite phase observed, the ring holds nothing newer
    Empty,
    One(Request, NvmeStatus),
    Fatal(String),
}

/// Status used when a queued submission cannot be replayed after
/// connect.
pub(crate) fn replay_failure_status() -> NvmeStatus {
    NvmeStatus::generic(GenericStatusCode::InternalDeviceError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_is_one_page() {
        assert_eq!(std::mem::size_of::<Tracker>(), 4096);
        assert_eq!(std::mem::align_of::<Tracker>(), 4096);
    }

    #[test]
    fn scratch_is_qword_aligned() {
        let tr: Box<Tracker> = unsafe {
            Box::new(std::mem::zeroed())
        };
        let base = &*tr as *const Tracker as usize;
        let scratch = unsafe { &tr.u.prp } as *const _ as usize;
        assert_eq!(scratch - base, SCRATCH_OFFSET);
        assert_eq!(scratch % 8, 0);
    }

    #[test]
    fn scratch_capacities_fill_the_page() {
        assert_eq!(
            std::mem::size_of::<PrpSglScratch>(),
            4096 - SCRATCH_OFFSET
        );
        assert_eq!(MAX_PRP_LIST_ENTRIES * 8, 4048);
        assert_eq!(MAX_SGL_DESCRIPTORS * 16, 4048);
    }
}
