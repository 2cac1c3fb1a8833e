//! Minimal PCI plumbing: BDF addresses, the device identity
//! allow-lists, and the bus/BAR traits the queue engines sit on.
//!
//! Nothing here talks to a real bus. The register window of a device
//! is a trait so the engines can be driven against the in-process
//! device models, and a bus is a trait so discovery enumerates
//! whatever the process installed.

use std::{fmt, str::FromStr, sync::Arc};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum PciError {
    #[snafu(display("invalid PCI address '{}'", text))]
    InvalidAddress { text: String },
}

/// A Bus/Device/Function address, `DDDD:BB:DD.F`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[derive(Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.dev, self.func
        )
    }
}

impl FromStr for PciAddress {
    type Err = PciError;

    /// Accepts `DDDD:BB:DD.F` and the domain-less `BB:DD.F` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PciError::InvalidAddress {
            text: s.to_string(),
        };

        let mut parts: Vec<&str> = s.split(':').collect();
        let domain = match parts.len() {
            3 => u32::from_str_radix(parts.remove(0), 16)
                .map_err(|_| invalid())?,
            2 => 0,
            _ => return Err(invalid()),
        };

        let bus =
            u8::from_str_radix(parts[0], 16).map_err(|_| invalid())?;

        let mut df = parts[1].split('.');
        let dev = df
            .next()
            .and_then(|d| u8::from_str_radix(d, 16).ok())
            .ok_or_else(invalid)?;
        let func = df
            .next()
            .and_then(|fr| u8::from_str_radix(fr, 16).ok())
            .ok_or_else(invalid)?;
        if df.next().is_some() || dev > 0x1f || func > 0x7 {
            return Err(invalid());
        }

        Ok(PciAddress {
            domain,
            bus,
            dev,
            func,
        })
    }
}

/// Vendor/device identity of a function.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PciDeviceId {
    pub vendor: u16,
    pub device: u16,
}

pub const PCI_VENDOR_ID_INTEL: u16 = 0x8086;

/// Intel NVMe SSD functions the driver claims.
const NVME_DEVICE_IDS: [u16; 4] = [0x0953, 0x0a53, 0x0a54, 0x0a55];

/// The I/OAT DMA engine family, one id per channel variant.
const IOAT_DEVICE_IDS: [u16; 42] = [
    // SNB
    0x3c20, 0x3c21, 0x3c22, 0x3c23, 0x3c24, 0x3c25, 0x3c26, 0x3c27,
    // IVB
    0x0e20, 0x0e21, 0x0e22, 0x0e23, 0x0e24, 0x0e25, 0x0e26, 0x0e27,
    // HSW
    0x2f20, 0x2f21, 0x2f22, 0x2f23, 0x2f24, 0x2f25, 0x2f26, 0x2f27,
    // BDX
    0x6f20, 0x6f21, 0x6f22, 0x6f23, 0x6f24, 0x6f25, 0x6f26, 0x6f27,
    0x6f28, 0x6f29,
    // BWD
    0x0c50, 0x0c51, 0x0c52, 0x0c53,
    // BDX-DE
    0x6f50, 0x6f51, 0x6f52, 0x6f53,
];

impl PciDeviceId {
    pub fn is_nvme(&self) -> bool {
        self.vendor == PCI_VENDOR_ID_INTEL
            && NVME_DEVICE_IDS.contains(&self.device)
    }

    pub fn is_ioat(&self) -> bool {
        self.vendor == PCI_VENDOR_ID_INTEL
            && IOAT_DEVICE_IDS.contains(&self.device)
    }
}

/// The mapped register window (BAR 0) of a function. Offsets are byte
/// offsets into the window; accesses have the width of the method.
/// The narrow accessors default through the 32-bit ones for devices
/// whose registers are all dword sized.
pub trait PciBar: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
    fn read64(&self, offset: u32) -> u64;
    fn write64(&self, offset: u32, value: u64);

    fn read8(&self, offset: u32) -> u8 {
        self.read32(offset) as u8
    }
    fn write8(&self, offset: u32, value: u8) {
        self.write32(offset, value as u32)
    }
    fn read16(&self, offset: u32) -> u16 {
        self.read32(offset) as u16
    }
    fn write16(&self, offset: u32, value: u16) {
        self.write32(offset, value as u32)
    }
}

/// A function found during enumeration.
#[derive(Clone)]
pub struct PciDevice {
    pub addr: PciAddress,
    pub id: PciDeviceId,
    pub bar: Arc<dyn PciBar>,
}

impl fmt::Debug for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pci device {} [{:04x}:{:04x}]",
            self.addr, self.id.vendor, self.id.device
        )
    }
}

/// Whatever enumerates functions for this process.
pub trait PciBus: Send + Sync {
    fn devices(&self) -> Vec<PciDevice>;
}

static BUS: Lazy<Mutex<Option<Arc<dyn PciBus>>>> =
    Lazy::new(|| Mutex::new(None));

/// Install the process-wide bus used by discovery.
pub fn set_bus(bus: Arc<dyn PciBus>) {
    *BUS.lock() = Some(bus);
}

/// Enumerate the installed bus; an empty vec when none is installed.
pub fn enumerate() -> Vec<PciDevice> {
    match BUS.lock().as_ref() {
        Some(bus) => bus.devices(),
        None => Vec::new(),
    }
}

/// An in-process bus holding hand-registered devices, used by the
/// device models and the tests.
#[derive(Default)]
pub struct EmulatedBus {
    devices: Mutex<Vec<PciDevice>>,
}

impl EmulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, device: PciDevice) {
        debug!("emulated bus: added {:?}", device);
        self.devices.lock().push(device);
    }
}

impl PciBus for EmulatedBus {
    fn devices(&self) -> Vec<PciDevice> {
        self.devices.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip() {
        let addr: PciAddress = "0000:81:00.0".parse().unwrap();
        assert_eq!(
            addr,
            PciAddress {
                domain: 0,
                bus: 0x81,
                dev: 0,
                func: 0
            }
        );
        assert_eq!(addr.to_string(), "0000:81:00.0");
        assert_eq!(addr.to_string().parse::<PciAddress>().unwrap(), addr);
    }

    #[test]
    fn address_without_domain() {
        let addr: PciAddress = "5e:03.1".parse().unwrap();
        assert_eq!(addr.domain, 0);
        assert_eq!(addr.bus, 0x5e);
        assert_eq!(addr.dev, 3);
        assert_eq!(addr.func, 1);
    }

    #[test]
    fn bad_addresses() {
        for text in
            &["", "81", "0000:81:00", "zz:00.0", "00:20.0", "00:00.8"]
        {
            assert!(
                text.parse::<PciAddress>().is_err(),
                "{} must not parse",
                text
            );
        }
    }

    #[test]
    fn id_tables() {
        let nvme = PciDeviceId {
            vendor: PCI_VENDOR_ID_INTEL,
            device: 0x0953,
        };
        assert!(nvme.is_nvme());
        assert!(!nvme.is_ioat());

        let ioat = PciDeviceId {
            vendor: PCI_VENDOR_ID_INTEL,
            device: 0x2f20,
        };
        assert!(ioat.is_ioat());

        let other = PciDeviceId {
            vendor: 0x1af4,
            device: 0x0953,
        };
        assert!(!other.is_nvme());
    }
}
