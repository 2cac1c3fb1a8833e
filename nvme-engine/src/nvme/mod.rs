//!
//! The NVMe execution core: the transport abstraction and its
//! registry, queue pairs with their state machine, poll groups, the
//! PCIe submission/completion engine, discovery and hot-plug.

use snafu::Snafu;

pub use ctrlr::{Ctrlr, CtrlrOpts, IoQpairOpts};
pub use poll_group::PollGroup;
pub use probe::{connect, probe};
pub use qpair::{Payload, Qpair, QpairState, Request};
pub use trid::{AddressFamily, TransportId, TridEntry, TransportType};
pub use transport::{
    get_transport,
    register_transport,
    transport_available,
    NvmeTransport,
};
pub use wire::{GenericStatusCode, NvmeStatus};

pub mod ctrlr;
pub mod pcie;
pub mod poll_group;
pub mod probe;
pub mod qpair;
pub mod transport;
pub mod trid;
pub mod uevent;
pub mod wire;

/// The discovery service NQN, the default subsystem of a trid.
pub const DISCOVERY_NQN: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// Longest accepted NQN, transport address and service id.
pub const NQN_MAX_LEN: usize = 223;
pub const TRADDR_MAX_LEN: usize = 256;
pub const TRSVCID_MAX_LEN: usize = 32;

/// Errors of the NVMe core. Tagged values, never unwinding; the
/// variants follow the taxonomy the callers dispatch on.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum NvmeError {
    #[snafu(display("invalid argument: {}", reason))]
    InvalidArgument { reason: String },
    #[snafu(display("no device: {}", what))]
    NoDevice { what: String },
    #[snafu(display("allocation failed: {}", what))]
    NoMemory { what: String },
    #[snafu(display("no free slot on qpair {}", qid))]
    NoSpace { qid: u16 },
    #[snafu(display(
        "qpair {} is not connected (state {:?})",
        qid,
        state
    ))]
    NotConnected { qid: u16, state: qpair::QpairState },
    #[snafu(display("{} is busy", what))]
    Busy { what: String },
    #[snafu(display("controller fatal status: {}", reason))]
    DeviceFatal { reason: String },
    #[snafu(display("aborted by qpair reset"))]
    AbortedByReset,
    #[snafu(display("timed out waiting for {}", what))]
    Timeout { what: String },
}
