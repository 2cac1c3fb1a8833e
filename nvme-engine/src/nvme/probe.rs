//! Controller discovery: enumerate what a transport can see and
//! attach to it.

use std::rc::Rc;

use crate::nvme::{
    ctrlr::{Ctrlr, CtrlrOpts},
    transport::get_transport,
    trid::TridEntry,
    NvmeError,
};

/// State of one discovery pass, threaded through the transport's
/// scan operation.
pub struct ProbeCtx {
    pub entry: TridEntry,
    pub opts: CtrlrOpts,
    /// controllers constructed during the scan
    pub attached: Vec<Rc<Ctrlr>>,
}

fn transport_of(
    entry: &TridEntry,
) -> Result<std::sync::Arc<dyn crate::nvme::NvmeTransport>, NvmeError> {
    let name = entry.trid.trtype.to_string();
    get_transport(&name).ok_or(NvmeError::NoDevice { what: name })
}

/// Enumerate every controller the trid's transport can reach. With a
/// transport address in `entry` the scan is narrowed to that address.
pub fn probe(
    entry: &TridEntry,
    opts: &CtrlrOpts,
) -> Result<Vec<Rc<Ctrlr>>, NvmeError> {
    let transport = transport_of(entry)?;
    let mut ctx = ProbeCtx {
        entry: entry.clone(),
        opts: opts.clone(),
        attached: Vec::new(),
    };
    transport.ctrlr_scan(&mut ctx, false)?;
    Ok(ctx.attached)
}

/// Attach to exactly the controller the trid names.
pub fn connect(
    entry: &TridEntry,
    opts: &CtrlrOpts,
) -> Result<Rc<Ctrlr>, NvmeError> {
    let transport = transport_of(entry)?;
    let mut ctx = ProbeCtx {
        entry: entry.clone(),
        opts: opts.clone(),
        attached: Vec::new(),
    };
    transport.ctrlr_scan(&mut ctx, true)?;
    ctx.attached
        .into_iter()
        .next()
        .ok_or_else(|| NvmeError::NoDevice {
            what: entry.trid.to_string(),
        })
}
