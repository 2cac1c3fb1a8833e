//! An asynchronous NVMe queue pair execution engine.
//!
//! Work is partitioned over reactors, single-threaded cooperative
//! contexts pinned to OS threads; they exchange messages over
//! lockless queues and run registered pollers every iteration. Shared
//! devices hand out one I/O channel per `(device, reactor)` pair, so
//! per-thread state needs no locks at all. Queue pairs carry commands
//! to controllers through a transport dispatch table; the PCIe
//! transport implements the wire-level submission/completion rings
//! with their phase-bit protocol and command-id trackers, and poll
//! groups aggregate many queue pairs into one reaping call per
//! reactor. The I/OAT DMA engine rides the same ring machinery with a
//! completion writeback instead of a completion queue.
//!
//! Cooperative progress is the contract throughout: a reactor that
//! polls gets its completions delivered on itself, a reactor that
//! does not poll never stalls anyone else's work.

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate serde;

pub mod core;
pub mod ioat;
pub mod logger;
pub mod nvme;
pub mod pci;
pub mod util;
