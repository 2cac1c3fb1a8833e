//! Driver for the I/OAT DMA engine, the close relative of the NVMe
//! queue engine: one descriptor ring, head and tail cursors, a
//! doorbell (DMACOUNT) and a completion writeback address instead of
//! a completion ring.
//!
//! Attached channels park on a free list until a thread claims one;
//! a channel serves exactly one thread at a time and all of its
//! cursors are thread-affine.

use std::{
    cell::{Cell, RefCell},
    sync::Arc,
    time::Duration,
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use snafu::Snafu;

use crate::{
    core::dma::DmaBuf,
    pci::{self, PciAddress, PciBar},
};

pub mod emu;

/// Channel register map, one channel per function.
pub(crate) mod regs {
    pub const CHANCNT: u32 = 0x00;
    pub const XFERCAP: u32 = 0x01;
    pub const CBVER: u32 = 0x08;
    pub const CHANCTRL: u32 = 0x80;
    pub const CHANCMD: u32 = 0x84;
    pub const DMACOUNT: u32 = 0x86;
    pub const CHANSTS: u32 = 0x88;
    pub const CHAINADDR: u32 = 0x90;
    pub const CHANCMP: u32 = 0x98;
    pub const CHANERR: u32 = 0xa8;

    pub const CHANCMD_RESET: u8 = 0x20;
    pub const CHANCMD_SUSPEND: u8 = 0x04;

    pub const CHANSTS_STATUS: u64 = 0x7;
    pub const CHANSTS_ACTIVE: u64 = 0x0;
    pub const CHANSTS_IDLE: u64 = 0x1;
    pub const CHANSTS_HALTED: u64 = 0x3;
    /// the rest of the word is the address of the last completed
    /// descriptor, 64-byte aligned
    pub const CHANSTS_COMPLETED_ADDR_MASK: u64 = !0x3f;
}

const CTL_COMPLETION_UPDATE: u32 = 1 << 3;
const CTL_NULL: u32 = 1 << 5;
const OP_SHIFT: u32 = 24;
const OP_COPY: u32 = 0x00;
const OP_FILL: u32 = 0x01;

/// Ring of 128 descriptors per channel.
const RING_SIZE_ORDER: u32 = 7;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum IoatError {
    #[snafu(display("no I/OAT channel is registered to this thread"))]
    NoThreadChannel,
    #[snafu(display("all attached I/OAT channels are taken"))]
    NoFreeChannels,
    #[snafu(display("descriptor ring is full"))]
    RingFull,
    #[snafu(display(
        "transfer of {} bytes exceeds the channel limit of {}",
        len,
        max
    ))]
    TransferTooLarge { len: u64, max: u64 },
    #[snafu(display("fill length {} is not a multiple of 8", len))]
    UnalignedFill { len: u64 },
    #[snafu(display("channel init failed: {}", reason))]
    HardwareInit { reason: String },
    #[snafu(display("channel halted, CHANERR {:#x}", chanerr))]
    Halted { chanerr: u32 },
    #[snafu(display("out of memory for {}", what))]
    NoMemory { what: String },
}

/// The hardware descriptor, 64 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
struct IoatHwDescriptor {
    size: u32,
    control: u32,
    src_addr: u64,
    dest_addr: u64,
    next: u64,
    op_specific: [u64; 4],
}

const _: () =
    assert!(std::mem::size_of::<IoatHwDescriptor>() == 64);

/// Software side of one ring slot.
struct IoatDescriptor {
    cb: Option<Box<dyn FnOnce() + Send>>,
}

/// One DMA channel. Cursors are plain cells; the channel belongs to
/// one thread at a time.
pub struct IoatChannel {
    bar: Arc<dyn PciBar>,
    addr: PciAddress,
    head: Cell<u32>,
    tail: Cell<u32>,
    ring: RefCell<Vec<IoatDescriptor>>,
    hw_ring: DmaBuf,
    completion: DmaBuf,
    last_seen: Cell<u64>,
    max_xfer_size: u64,
}

impl IoatChannel {
    fn ring_size(&self) -> u32 {
        1 << RING_SIZE_ORDER
    }

    fn ring_mask(&self) -> u32 {
        self.ring_size() - 1
    }

    fn active(&self) -> u32 {
        self.head.get().wrapping_sub(self.tail.get())
            & self.ring_mask()
    }

    /// One slot always stays free so head catching tail is
    /// unambiguous.
    fn ring_space(&self) -> u32 {
        self.ring_size() - self.active() - 1
    }

    fn desc_phys(&self, index: u32) -> u64 {
        self.hw_ring.bus_addr()
            + (index & self.ring_mask()) as u64 * 64
    }

    fn write_hw_desc(&self, index: u32, desc: &IoatHwDescriptor) {
        let slot = (index & self.ring_mask()) as usize;
        unsafe {
            (self.hw_ring.as_ptr() as *mut IoatHwDescriptor)
                .add(slot)
                .write_volatile(*desc);
        }
    }

    pub fn address(&self) -> PciAddress {
        self.addr
    }

    pub fn max_xfer_size(&self) -> u64 {
        self.max_xfer_size
    }

    fn prep(
        &self,
        hw_desc: IoatHwDescriptor,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), IoatError> {
        if self.ring_space() < 1 {
            return Err(IoatError::RingFull);
        }

        let head = self.head.get();
        let mut hw_desc = hw_desc;
        hw_desc.next = self.desc_phys(head.wrapping_add(1));
        self.write_hw_desc(head, &hw_desc);
        self.ring.borrow_mut()
            [(head & self.ring_mask()) as usize]
            .cb = cb;
        self.head.set(head.wrapping_add(1));
        Ok(())
    }

    /// Queue a copy without ringing the doorbell.
    pub fn build_copy(
        &self,
        dst: u64,
        src: u64,
        len: u64,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<(), IoatError> {
        if len > self.max_xfer_size {
            return Err(IoatError::TransferTooLarge {
                len,
                max: self.max_xfer_size,
            });
        }
        self.prep(
            IoatHwDescriptor {
                size: len as u32,
                control: CTL_COMPLETION_UPDATE
                    | (OP_COPY << OP_SHIFT),
                src_addr: src,
                dest_addr: dst,
                next: 0,
                op_specific: [0; 4],
            },
            Some(Box::new(cb)),
        )
    }

    /// Queue a fill of the 8-byte `pattern` without ringing the
    /// doorbell.
    pub fn build_fill(
        &self,
        dst: u64,
        pattern: u64,
        len: u64,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<(), IoatError> {
        if len & 7 != 0 {
            return Err(IoatError::UnalignedFill { len });
        }
        if len > self.max_xfer_size {
            return Err(IoatError::TransferTooLarge {
                len,
                max: self.max_xfer_size,
            });
        }
        self.prep(
            IoatHwDescriptor {
                size: len as u32,
                control: CTL_COMPLETION_UPDATE
                    | (OP_FILL << OP_SHIFT),
                src_addr: pattern,
                dest_addr: dst,
                next: 0,
                op_specific: [0; 4],
            },
            Some(Box::new(cb)),
        )
    }

    fn prep_null(&self) -> Result<(), IoatError> {
        self.prep(
            IoatHwDescriptor {
                size: 8,
                control: CTL_COMPLETION_UPDATE
                    | CTL_NULL
                    | (OP_COPY << OP_SHIFT),
                src_addr: 0,
                dest_addr: 0,
                next: 0,
                op_specific: [0; 4],
            },
            None,
        )
    }

    /// Ring the doorbell for everything built so far.
    pub fn flush(&self) {
        self.bar
            .write16(regs::DMACOUNT, self.head.get() as u16);
    }

    pub fn submit_copy(
        &self,
        dst: u64,
        src: u64,
        len: u64,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<(), IoatError> {
        self.build_copy(dst, src, len, cb)?;
        self.flush();
        Ok(())
    }

    pub fn submit_fill(
        &self,
        dst: u64,
        pattern: u64,
        len: u64,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<(), IoatError> {
        self.build_fill(dst, pattern, len, cb)?;
        self.flush();
        Ok(())
    }

    fn read_completion(&self) -> u64 {
        unsafe {
            (self.completion.as_ptr() as *const u64).read_volatile()
        }
    }

    /// Retire completed descriptors, running callbacks in submission
    /// order. Returns the number retired.
    pub fn process_events(&self) -> Result<usize, IoatError> {
        let status = self.read_completion();
        if status & regs::CHANSTS_STATUS == regs::CHANSTS_HALTED {
            let chanerr = self.bar.read32(regs::CHANERR);
            return Err(IoatError::Halted { chanerr });
        }

        let completed = status & regs::CHANSTS_COMPLETED_ADDR_MASK;
        if completed == self.last_seen.get() {
            return Ok(0);
        }

        let mut events = 0;
        loop {
            let tail = self.tail.get();
            let cb = self.ring.borrow_mut()
                [(tail & self.ring_mask()) as usize]
                .cb
                .take();
            if let Some(cb) = cb {
                cb();
            }

            let phys = self.desc_phys(tail);
            self.tail.set(tail.wrapping_add(1));
            events += 1;

            if phys == completed {
                self.last_seen.set(phys);
                break;
            }
        }
        Ok(events)
    }
}

/// The suspend / clear-errors / reset dance, bounded the way the
/// hardware manual prescribes.
fn reset_hw(bar: &Arc<dyn PciBar>) -> Result<(), IoatError> {
    let mut status = bar.read64(regs::CHANSTS);
    let busy = |status: u64| {
        let state = status & regs::CHANSTS_STATUS;
        state == regs::CHANSTS_ACTIVE || state == regs::CHANSTS_IDLE
    };

    if busy(status) {
        bar.write8(regs::CHANCMD, regs::CHANCMD_SUSPEND);
    }
    let mut timeout = 20;
    while busy(status) {
        std::thread::sleep(Duration::from_millis(1));
        timeout -= 1;
        if timeout == 0 {
            return Err(IoatError::HardwareInit {
                reason: "timed out waiting for suspend".to_string(),
            });
        }
        status = bar.read64(regs::CHANSTS);
    }

    // CHANERR is write-1-to-clear
    let chanerr = bar.read32(regs::CHANERR);
    bar.write32(regs::CHANERR, chanerr);

    bar.write8(regs::CHANCMD, regs::CHANCMD_RESET);
    let mut timeout = 20;
    while bar.read8(regs::CHANCMD) & regs::CHANCMD_RESET != 0 {
        std::thread::sleep(Duration::from_millis(1));
        timeout -= 1;
        if timeout == 0 {
            return Err(IoatError::HardwareInit {
                reason: "timed out waiting for reset".to_string(),
            });
        }
    }
    Ok(())
}

fn channel_start(
    bar: Arc<dyn PciBar>,
    addr: PciAddress,
) -> Result<IoatChannel, IoatError> {
    let chancnt = bar.read8(regs::CHANCNT);
    if chancnt == 0 {
        return Err(IoatError::HardwareInit {
            reason: "function reports no channels".to_string(),
        });
    }

    let version = bar.read8(regs::CBVER);
    if version < 0x30 {
        return Err(IoatError::HardwareInit {
            reason: format!(
                "unsupported channel version {:#x}",
                version
            ),
        });
    }

    let xfercap = bar.read8(regs::XFERCAP);
    let max_xfer_size = if xfercap == 0 || xfercap > 32 {
        1 << 20
    } else {
        1u64 << xfercap
    };

    let ring_entries = 1usize << RING_SIZE_ORDER;
    let hw_ring =
        DmaBuf::alloc(ring_entries * 64, 64).map_err(|_| {
            IoatError::NoMemory {
                what: "descriptor ring".to_string(),
            }
        })?;
    let completion = DmaBuf::alloc(64, 64).map_err(|_| {
        IoatError::NoMemory {
            what: "completion writeback".to_string(),
        }
    })?;

    let channel = IoatChannel {
        bar,
        addr,
        head: Cell::new(0),
        tail: Cell::new(0),
        ring: RefCell::new(
            (0 .. ring_entries)
                .map(|_| IoatDescriptor { cb: None })
                .collect(),
        ),
        hw_ring,
        completion,
        last_seen: Cell::new(0),
        max_xfer_size,
    };

    channel.bar.write16(regs::CHANCTRL, 0);
    channel
        .bar
        .write64(regs::CHANCMP, channel.completion.bus_addr());
    channel
        .bar
        .write64(regs::CHAINADDR, channel.hw_ring.bus_addr());

    // prove the channel moves data before handing it out
    channel.prep_null()?;
    channel.flush();
    let mut timeout = 100;
    loop {
        match channel.process_events()? {
            0 => {
                std::thread::sleep(Duration::from_millis(1));
                timeout -= 1;
                if timeout == 0 {
                    return Err(IoatError::HardwareInit {
                        reason: "null descriptor never completed"
                            .to_string(),
                    });
                }
            }
            _ => break,
        }
    }

    info!(
        "I/OAT channel at {} started, {} byte transfer cap",
        channel.addr, channel.max_xfer_size
    );
    Ok(channel)
}

/// Channels attached but not yet claimed by a thread.
static FREE_CHANNELS: Lazy<Mutex<Vec<IoatChannel>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

thread_local! {
    static THREAD_CHANNEL: RefCell<Option<IoatChannel>> =
        RefCell::new(None);
}

/// Attach every I/OAT function on the bus; returns how many channels
/// joined the free list.
pub fn probe() -> Result<usize, IoatError> {
    let mut attached = 0;
    for device in pci::enumerate() {
        if !device.id.is_ioat() {
            continue;
        }
        reset_hw(&device.bar)?;
        let channel =
            channel_start(Arc::clone(&device.bar), device.addr)?;
        FREE_CHANNELS.lock().push(channel);
        attached += 1;
    }
    Ok(attached)
}

/// Claim a channel for the calling thread. A thread that already
/// holds one keeps it.
pub fn register_thread() -> Result<(), IoatError> {
    THREAD_CHANNEL.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Ok(());
        }
        match FREE_CHANNELS.lock().pop() {
            Some(channel) => {
                *slot = Some(channel);
                Ok(())
            }
            None => Err(IoatError::NoFreeChannels),
        }
    })
}

/// Return the calling thread's channel to the free list.
pub fn unregister_thread() {
    THREAD_CHANNEL.with(|slot| {
        if let Some(channel) = slot.borrow_mut().take() {
            FREE_CHANNELS.lock().push(channel);
        }
    });
}

/// Run `f` against the calling thread's channel.
pub fn with_channel<R>(
    f: impl FnOnce(&IoatChannel) -> Result<R, IoatError>,
) -> Result<R, IoatError> {
    THREAD_CHANNEL.with(|slot| match slot.borrow().as_ref() {
        Some(channel) => f(channel),
        None => Err(IoatError::NoThreadChannel),
    })
}

/// Copy `len` bytes between bus addresses on this thread's channel.
pub fn submit_copy(
    dst: u64,
    src: u64,
    len: u64,
    cb: impl FnOnce() + Send + 'static,
) -> Result<(), IoatError> {
    with_channel(|channel| channel.submit_copy(dst, src, len, cb))
}

/// Fill `len` bytes at a bus address with the 8-byte pattern.
pub fn submit_fill(
    dst: u64,
    pattern: u64,
    len: u64,
    cb: impl FnOnce() + Send + 'static,
) -> Result<(), IoatError> {
    with_channel(|channel| {
        channel.submit_fill(dst, pattern, len, cb)
    })
}

/// Retire completions on this thread's channel.
pub fn process_events() -> Result<usize, IoatError> {
    with_channel(|channel| channel.process_events())
}
