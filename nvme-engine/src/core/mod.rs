//!
//! core contains the execution substrate: reactors with their message
//! inboxes and pollers, the I/O device and channel registry, and the
//! DMA buffer shim shared by all queue engines.

use snafu::Snafu;

/// Errno is the currency of the channel callbacks; re-exported so
/// callers do not need their own nix.
pub use nix::errno::Errno;

pub use channel::{create_exclusive_channel, get_io_channel, IoChannel};
pub use dma::{alloc_dma, vtophys, DmaBuf};
pub use io_device::{
    channel_count,
    device_count,
    register_device,
    send_to_all_channels,
    unregister_device,
    ChannelCreateCb,
    ChannelDestroyCb,
    DeviceKey,
};
pub use poller::Poller;
pub use reactor::{Reactor, ReactorHandle, ReactorId, ReactorState};

mod channel;
pub mod dma;
mod io_device;
pub mod poller;
mod reactor;

/// Errors raised by the execution substrate. Hardware-facing errors
/// live in [`crate::nvme::NvmeError`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum CoreError {
    #[snafu(display("thread is already bound to reactor {}", id))]
    AlreadyBound { id: ReactorId },
    #[snafu(display("no reactor is bound to the current thread"))]
    NotBound,
    #[snafu(display("reactor {} still has {} pollers registered", id, count))]
    PollersRemain { id: ReactorId, count: usize },
    #[snafu(display("reactor {} is gone", id))]
    ReactorGone { id: ReactorId },
    #[snafu(display("i/o device {:?} is already registered", key))]
    DeviceExists { key: DeviceKey },
    #[snafu(display("i/o device {:?} is not registered", key))]
    DeviceNotFound { key: DeviceKey },
    #[snafu(display(
        "i/o device {:?} still has {} channels",
        key,
        channels
    ))]
    DeviceBusy { key: DeviceKey, channels: usize },
    #[snafu(display("channel create callback failed: {}", source))]
    ChannelCreate { source: Errno },
    #[snafu(display(
        "channel owned by reactor {} used from reactor {:?}",
        owner,
        current
    ))]
    WrongReactor {
        owner: ReactorId,
        current: Option<ReactorId>,
    },
    #[snafu(display("out of memory allocating {} bytes", size))]
    NoMemory { size: usize },
    #[snafu(display("bus address {:#x} is not mapped", bus))]
    BadBusAddress { bus: u64 },
}
