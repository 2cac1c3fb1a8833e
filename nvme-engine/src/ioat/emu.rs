//! A software I/OAT channel behind the `PciBar` trait. Descriptors
//! are fetched and executed synchronously inside the DMACOUNT write,
//! and completion is reported through the writeback address the way
//! the hardware does it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    core::dma,
    ioat::regs,
    pci::{PciBar, PciDevice, PciDeviceId, PCI_VENDOR_ID_INTEL},
};

const OP_SHIFT: u32 = 24;
const OP_COPY: u32 = 0x00;
const OP_FILL: u32 = 0x01;
const CTL_NULL: u32 = 1 << 5;

struct EmuIoatInner {
    chainaddr: u64,
    chancmp: u64,
    chanerr: u32,
    chansts: u64,
    dmacount: u16,
    processed: u16,
    /// bus address of the next descriptor to fetch
    next_fetch: u64,
}

/// One emulated DMA channel per PCI function.
pub struct EmuIoatChannel {
    inner: Mutex<EmuIoatInner>,
}

impl EmuIoatChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(EmuIoatInner {
                chainaddr: 0,
                chancmp: 0,
                chanerr: 0,
                chansts: regs::CHANSTS_ACTIVE,
                dmacount: 0,
                processed: 0,
                next_fetch: 0,
            }),
        })
    }

    /// Present this channel as a PCI function at `addr`.
    pub fn pci_device(self: &Arc<Self>, addr: &str) -> PciDevice {
        PciDevice {
            addr: addr.parse().expect("valid PCI address"),
            id: PciDeviceId {
                vendor: PCI_VENDOR_ID_INTEL,
                device: 0x2f20,
            },
            bar: Arc::clone(self) as Arc<dyn PciBar>,
        }
    }
}

fn execute(inner: &mut EmuIoatInner) {
    while inner.processed != inner.dmacount {
        let mut raw = [0u8; 64];
        if dma::bus_read(inner.next_fetch, &mut raw).is_err() {
            error!(
                "ioat emu: cannot fetch descriptor at {:#x}",
                inner.next_fetch
            );
            inner.chanerr |= 1;
            inner.chansts = regs::CHANSTS_HALTED;
            break;
        }

        let word = |off: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&raw[off .. off + 4]);
            u32::from_le_bytes(bytes)
        };
        let qword = |off: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&raw[off .. off + 8]);
            u64::from_le_bytes(bytes)
        };

        let size = word(0) as usize;
        let control = word(4);
        let src = qword(8);
        let dst = qword(16);
        let next = qword(24);

        let op = (control >> OP_SHIFT) & 0xff;
        let failed = if control & CTL_NULL != 0 {
            false
        } else if op == OP_COPY {
            let mut bounce = vec![0u8; size];
            dma::bus_read(src, &mut bounce).is_err()
                || dma::bus_write(dst, &bounce).is_err()
        } else if op == OP_FILL {
            let pattern = src.to_le_bytes();
            let mut bounce = vec![0u8; size];
            for (i, byte) in bounce.iter_mut().enumerate() {
                *byte = pattern[i % 8];
            }
            dma::bus_write(dst, &bounce).is_err()
        } else {
            true
        };

        if failed {
            error!("ioat emu: descriptor execution failed");
            inner.chanerr |= 1;
            inner.chansts = regs::CHANSTS_HALTED;
            break;
        }

        let completed = inner.next_fetch;
        inner.next_fetch = next;
        inner.processed = inner.processed.wrapping_add(1);

        // completion writeback: last completed descriptor plus the
        // channel state in the low bits
        inner.chansts = (completed
            & regs::CHANSTS_COMPLETED_ADDR_MASK)
            | regs::CHANSTS_IDLE;
        let writeback = inner.chansts.to_le_bytes();
        if inner.chancmp != 0 {
            if dma::bus_write(inner.chancmp, &writeback).is_err() {
                error!("ioat emu: completion writeback failed");
                inner.chanerr |= 1;
            }
        }
    }
}

impl PciBar for EmuIoatChannel {
    fn read32(&self, offset: u32) -> u32 {
        match offset {
            regs::CHANERR => self.inner.lock().chanerr,
            _ => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        if offset == regs::CHANERR {
            // write one to clear
            self.inner.lock().chanerr &= !value;
        }
    }

    fn read64(&self, offset: u32) -> u64 {
        let inner = self.inner.lock();
        match offset {
            regs::CHANSTS => inner.chansts,
            regs::CHAINADDR => inner.chainaddr,
            regs::CHANCMP => inner.chancmp,
            _ => 0,
        }
    }

    fn write64(&self, offset: u32, value: u64) {
        let mut inner = self.inner.lock();
        match offset {
            regs::CHAINADDR => {
                inner.chainaddr = value;
                inner.next_fetch = value;
            }
            regs::CHANCMP => inner.chancmp = value,
            _ => warn!(
                "ioat emu: write64 to unknown register {:#x}",
                offset
            ),
        }
    }

    fn read8(&self, offset: u32) -> u8 {
        match offset {
            regs::CHANCNT => 1,
            // 1 MiB transfer cap
            regs::XFERCAP => 20,
            regs::CBVER => 0x33,
            // resets complete instantly, the bit never reads back
            regs::CHANCMD => 0,
            _ => 0,
        }
    }

    fn write8(&self, offset: u32, value: u8) {
        if offset != regs::CHANCMD {
            return;
        }
        let mut inner = self.inner.lock();
        if value & regs::CHANCMD_RESET != 0 {
            inner.dmacount = 0;
            inner.processed = 0;
            inner.next_fetch = inner.chainaddr;
            inner.chanerr = 0;
            inner.chansts = regs::CHANSTS_ACTIVE;
        } else if value & regs::CHANCMD_SUSPEND != 0 {
            inner.chansts = (inner.chansts
                & regs::CHANSTS_COMPLETED_ADDR_MASK)
                | 0x2;
        }
    }

    fn read16(&self, offset: u32) -> u16 {
        match offset {
            regs::DMACOUNT => self.inner.lock().dmacount,
            _ => 0,
        }
    }

    fn write16(&self, offset: u32, value: u16) {
        match offset {
            regs::DMACOUNT => {
                let mut inner = self.inner.lock();
                inner.dmacount = value;
                execute(&mut inner);
            }
            regs::CHANCTRL => {}
            _ => warn!(
                "ioat emu: write16 to unknown register {:#x}",
                offset
            ),
        }
    }
}
