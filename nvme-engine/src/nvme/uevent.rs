//! Hot-plug events from the kernel object uevent netlink socket.
//!
//! Only `uio` and `vfio-pci` events are recognized. For `uio` the PCI
//! address is dug out of the device path; for `vfio-pci` it arrives in
//! `PCI_SLOT_NAME`, a bind of the driver counts as the arrival of the
//! device, and a plain `add` is ignored. That asymmetry is what the
//! kernel actually emits for the two frameworks.

use crate::{nvme::NvmeError, pci::PciAddress};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UeventAction {
    Add,
    Remove,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UeventSubsystem {
    Uio,
    VfioPci,
}

/// A recognized hot-plug event.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Uevent {
    pub action: UeventAction,
    pub subsystem: UeventSubsystem,
    pub traddr: PciAddress,
}

fn invalid(reason: String) -> NvmeError {
    NvmeError::InvalidArgument { reason }
}

/// Parse one uevent datagram: NUL-separated `KEY=value` lines.
/// `Ok(None)` when the event belongs to a subsystem this driver does
/// not watch.
pub fn parse_event(buf: &str) -> Result<Option<Uevent>, NvmeError> {
    let mut action = "";
    let mut subsystem = "";
    let mut devpath = "";
    let mut driver = "";
    let mut slot_name = "";

    for line in buf.split('\0') {
        if let Some(value) = line.strip_prefix("ACTION=") {
            action = value;
        } else if let Some(value) = line.strip_prefix("SUBSYSTEM=") {
            subsystem = value;
        } else if let Some(value) = line.strip_prefix("DEVPATH=") {
            devpath = value;
        } else if let Some(value) = line.strip_prefix("DRIVER=") {
            driver = value;
        } else if let Some(value) = line.strip_prefix("PCI_SLOT_NAME=")
        {
            slot_name = value;
        }
    }

    if subsystem == "uio" {
        let action = match action {
            "add" => UeventAction::Add,
            "remove" => UeventAction::Remove,
            _ => return Ok(None),
        };

        // .../0000:81:00.0/uio/uio0, the function is the component
        // right before the uio node
        let prefix = match devpath.find("/uio/") {
            Some(idx) => &devpath[.. idx],
            None => {
                return Err(invalid(format!(
                    "unexpected uio device path '{}'",
                    devpath
                )));
            }
        };
        let bdf = prefix.rsplit('/').next().unwrap_or("");
        let traddr = bdf.parse::<PciAddress>().map_err(|_| {
            invalid(format!("bad PCI function '{}' in uevent", bdf))
        })?;

        return Ok(Some(Uevent {
            action,
            subsystem: UeventSubsystem::Uio,
            traddr,
        }));
    }

    if driver == "vfio-pci" {
        let action = match action {
            "bind" => UeventAction::Add,
            "remove" => UeventAction::Remove,
            _ => return Ok(None),
        };
        let traddr = slot_name.parse::<PciAddress>().map_err(|_| {
            invalid(format!(
                "bad PCI function '{}' in uevent",
                slot_name
            ))
        })?;

        return Ok(Some(Uevent {
            action,
            subsystem: UeventSubsystem::VfioPci,
            traddr,
        }));
    }

    Ok(None)
}

#[cfg(target_os = "linux")]
pub use monitor::UeventMonitor;

#[cfg(target_os = "linux")]
mod monitor {
    use std::os::unix::io::{AsRawFd, OwnedFd};

    use nix::sys::socket::{
        bind,
        recv,
        socket,
        sockopt,
        setsockopt,
        AddressFamily,
        MsgFlags,
        NetlinkAddr,
        SockFlag,
        SockProtocol,
        SockType,
    };

    use super::{parse_event, Uevent};
    use crate::nvme::NvmeError;

    const RECV_BUF_SIZE: usize = 1024 * 1024;
    const MSG_LEN: usize = 4096;

    /// A non-blocking kobject-uevent subscription.
    pub struct UeventMonitor {
        fd: OwnedFd,
    }

    impl UeventMonitor {
        /// Open and bind the netlink socket; meant to be polled from
        /// a reactor poller.
        pub fn connect() -> Result<Self, NvmeError> {
            let fd = socket(
                AddressFamily::Netlink,
                SockType::Datagram,
                SockFlag::SOCK_NONBLOCK,
                SockProtocol::NetlinkKObjectUEvent,
            )
            .map_err(|e| NvmeError::NoDevice {
                what: format!("uevent netlink socket: {}", e),
            })?;

            // a burst of hot-plug events must not overflow the socket
            if let Err(e) =
                setsockopt(&fd, sockopt::RcvBuf, &RECV_BUF_SIZE)
            {
                warn!("uevent receive buffer not grown: {}", e);
            }

            let addr =
                NetlinkAddr::new(std::process::id(), 0xffff_ffff);
            bind(fd.as_raw_fd(), &addr).map_err(|e| {
                NvmeError::NoDevice {
                    what: format!("uevent netlink bind: {}", e),
                }
            })?;

            Ok(Self { fd })
        }

        /// One non-blocking receive. `Ok(None)` when nothing is
        /// queued or the event is not for us.
        pub fn poll(&self) -> Result<Option<Uevent>, NvmeError> {
            let mut buf = [0u8; MSG_LEN];
            match recv(
                self.fd.as_raw_fd(),
                &mut buf,
                MsgFlags::MSG_DONTWAIT,
            ) {
                Ok(0) => Ok(None),
                Ok(n) => {
                    let text = String::from_utf8_lossy(&buf[.. n])
                        .into_owned();
                    parse_event(&text)
                }
                Err(nix::errno::Errno::EAGAIN) => Ok(None),
                Err(e) => Err(NvmeError::NoDevice {
                    what: format!("uevent socket read: {}", e),
                }),
            }
        }
    }
}
