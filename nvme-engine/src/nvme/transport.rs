//! The transport abstraction and its process-wide registry.
//!
//! Transports register once, in registration order, and are found by
//! case-insensitive name. Admin queues are always dispatched through
//! a registry lookup on the controller's trid; I/O queues cache the
//! transport they were created on so the fast path never touches the
//! registry (see [`crate::nvme::qpair::Qpair::transport`]).

use std::{rc::Rc, sync::Arc};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::nvme::{
    ctrlr::{Ctrlr, IoQpairOpts},
    pcie::PcieTransport,
    poll_group::TransportPollGroup,
    probe::ProbeCtx,
    qpair::{Qpair, Request},
    NvmeError,
};

/// The operations a transport provides. The poll-group operations have
/// default bodies implementing the standard two-list discipline; a
/// transport with its own grouping overrides them.
pub trait NvmeTransport: Send + Sync {
    /// Name the registry matches on, case-insensitively.
    fn name(&self) -> &str;

    fn ctrlr_construct(
        &self,
        ctx: &ProbeCtx,
        devhandle: Option<crate::pci::PciDevice>,
    ) -> Result<Rc<Ctrlr>, NvmeError>;

    /// Enumerate candidate devices, constructing a controller for each
    /// match and recording it on `ctx`.
    fn ctrlr_scan(
        &self,
        ctx: &mut ProbeCtx,
        direct_connect: bool,
    ) -> Result<(), NvmeError>;

    fn ctrlr_destruct(&self, ctrlr: &Ctrlr) -> Result<(), NvmeError>;

    fn ctrlr_get_reg_4(
        &self,
        ctrlr: &Ctrlr,
        offset: u32,
    ) -> Result<u32, NvmeError>;
    fn ctrlr_set_reg_4(
        &self,
        ctrlr: &Ctrlr,
        offset: u32,
        value: u32,
    ) -> Result<(), NvmeError>;
    fn ctrlr_get_reg_8(
        &self,
        ctrlr: &Ctrlr,
        offset: u32,
    ) -> Result<u64, NvmeError>;
    fn ctrlr_set_reg_8(
        &self,
        ctrlr: &Ctrlr,
        offset: u32,
        value: u64,
    ) -> Result<(), NvmeError>;

    fn ctrlr_get_max_xfer_size(&self, ctrlr: &Ctrlr) -> u32;
    fn ctrlr_get_max_sges(&self, ctrlr: &Ctrlr) -> u16;

    fn ctrlr_alloc_io_qpair(
        &self,
        ctrlr: &Rc<Ctrlr>,
        qid: u16,
        opts: &IoQpairOpts,
    ) -> Result<Rc<Qpair>, NvmeError>;
    fn ctrlr_delete_io_qpair(
        &self,
        ctrlr: &Ctrlr,
        qpair: &Qpair,
    ) -> Result<(), NvmeError>;
    fn ctrlr_connect_qpair(
        &self,
        ctrlr: &Ctrlr,
        qpair: &Rc<Qpair>,
    ) -> Result<(), NvmeError>;
    fn ctrlr_disconnect_qpair(&self, ctrlr: &Ctrlr, qpair: &Rc<Qpair>);

    fn qpair_submit_request(
        &self,
        qpair: &Qpair,
        req: Request,
    ) -> Result<(), NvmeError>;
    fn qpair_process_completions(
        &self,
        qpair: &Qpair,
        max: u32,
    ) -> Result<u32, NvmeError>;
    fn qpair_abort_reqs(&self, qpair: &Qpair, dnr: bool);
    fn qpair_reset(&self, qpair: &Qpair) -> Result<(), NvmeError>;

    /// Insert a qpair into the sub-group; it lands on the
    /// disconnected list until the transport connects it.
    fn poll_group_add(
        &self,
        tgroup: &Rc<TransportPollGroup>,
        qpair: &Rc<Qpair>,
    ) -> Result<(), NvmeError> {
        tgroup.insert_disconnected(qpair);
        qpair.set_poll_group(Some(Rc::downgrade(tgroup)));
        Ok(())
    }

    fn poll_group_remove(
        &self,
        tgroup: &Rc<TransportPollGroup>,
        qpair: &Rc<Qpair>,
    ) -> Result<(), NvmeError> {
        if !tgroup.remove(qpair) {
            return Err(NvmeError::NoDevice {
                what: format!("qpair {} in poll group", qpair.qid()),
            });
        }
        qpair.set_poll_group(None);
        Ok(())
    }

    /// Move a connected qpair onto the connected list of its own
    /// sub-group, and nowhere else.
    fn poll_group_connect_qpair(
        &self,
        qpair: &Rc<Qpair>,
    ) -> Result<(), NvmeError> {
        match qpair.poll_group() {
            Some(tgroup) => tgroup.mark_connected(qpair),
            None => Ok(()),
        }
    }

    fn poll_group_disconnect_qpair(
        &self,
        qpair: &Rc<Qpair>,
    ) -> Result<(), NvmeError> {
        match qpair.poll_group() {
            Some(tgroup) => tgroup.mark_disconnected(qpair),
            None => Ok(()),
        }
    }

    /// Reap up to `completions_per_qpair` completions from every
    /// connected qpair and report the qpairs found disconnected.
    fn poll_group_process_completions(
        &self,
        tgroup: &TransportPollGroup,
        completions_per_qpair: u32,
        disconnected_qpair_cb: &mut dyn FnMut(&Rc<Qpair>),
    ) -> Result<i64, NvmeError> {
        let mut total: i64 = 0;
        let mut first_err = None;

        for qpair in tgroup.connected_snapshot() {
            match self
                .qpair_process_completions(&qpair, completions_per_qpair)
            {
                Ok(n) => total += n as i64,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        for qpair in tgroup.disconnected_snapshot() {
            disconnected_qpair_cb(&qpair);
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Refuse to tear down a sub-group that still holds qpairs.
    fn poll_group_destroy(
        &self,
        tgroup: &TransportPollGroup,
    ) -> Result<(), NvmeError> {
        if tgroup.is_empty() {
            Ok(())
        } else {
            Err(NvmeError::Busy {
                what: "transport poll group".to_string(),
            })
        }
    }
}

/// Registration-order list of transports. PCIe is built in, the way
/// the compiled-in transports of the original register themselves at
/// startup.
static TRANSPORTS: Lazy<Mutex<Vec<Arc<dyn NvmeTransport>>>> =
    Lazy::new(|| {
        let builtin: Vec<Arc<dyn NvmeTransport>> =
            vec![Arc::new(PcieTransport::new())];
        Mutex::new(builtin)
    });

/// Register a transport. Registering a name twice is refused.
pub fn register_transport(
    transport: Arc<dyn NvmeTransport>,
) -> Result<(), NvmeError> {
    let mut transports = TRANSPORTS.lock();
    if transports
        .iter()
        .any(|t| t.name().eq_ignore_ascii_case(transport.name()))
    {
        return Err(NvmeError::InvalidArgument {
            reason: format!(
                "transport '{}' is already registered",
                transport.name()
            ),
        });
    }
    debug!("transport '{}' registered", transport.name());
    transports.push(transport);
    Ok(())
}

/// Find a transport by name, case-insensitively.
pub fn get_transport(name: &str) -> Option<Arc<dyn NvmeTransport>> {
    TRANSPORTS
        .lock()
        .iter()
        .find(|t| t.name().eq_ignore_ascii_case(name))
        .map(Arc::clone)
}

pub fn transport_available(name: &str) -> bool {
    get_transport(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme::pcie::TRANSPORT_NAME;

    #[test]
    fn pcie_is_built_in() {
        assert!(transport_available(TRANSPORT_NAME));
        // lookup is case-insensitive
        assert!(get_transport("pcie").is_some());
        assert!(get_transport("PCIE").is_some());
        assert!(get_transport("tcp").is_none());
    }

    #[test]
    fn duplicate_names_are_refused() {
        let dup = get_transport("pcie").unwrap();
        assert!(register_transport(dup).is_err());
    }
}
