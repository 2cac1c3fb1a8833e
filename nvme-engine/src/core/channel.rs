//! Per-reactor channels onto registered I/O devices.
//!
//! The first reference taken on a `(device, reactor)` pair allocates
//! the channel and runs the device's create callback; further
//! references on the same pair share the object. The last handle to go
//! away runs the destroy callback. Distinct reactors always get
//! distinct channels. All of this is reference counting on one thread:
//! the count is a plain cell, valid because a channel may only be
//! touched from its owning reactor, which is checked at runtime.

use std::{
    cell::{Cell, RefCell},
    fmt,
    sync::Arc,
};

use crate::core::{
    io_device::{DeviceRecord, DEVICES},
    reactor::{Reactor, ReactorId},
    CoreError,
    DeviceKey,
};

pub(crate) struct ChannelShared {
    device: Arc<DeviceRecord>,
    owner: ReactorId,
    exclusive: bool,
    refs: Cell<u32>,
    ctx: RefCell<Box<[u8]>>,
}

// membership lives in the global registry, but the mutable parts are
// only ever touched from the owning reactor
unsafe impl Send for ChannelShared {}
unsafe impl Sync for ChannelShared {}

impl ChannelShared {
    pub(crate) fn owner(&self) -> ReactorId {
        self.owner
    }
}

/// A counted handle onto a per-reactor channel. Dropping the handle
/// releases the reference; the last drop destroys the channel.
pub struct IoChannel {
    shared: Arc<ChannelShared>,
}

impl fmt::Debug for IoChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "io channel {:p} to device {} on reactor {}",
            Arc::as_ptr(&self.shared),
            self.shared.device.name,
            self.shared.owner,
        )
    }
}

impl IoChannel {
    pub fn device_key(&self) -> DeviceKey {
        self.shared.device.key
    }

    /// The reactor this channel belongs to.
    pub fn reactor(&self) -> ReactorId {
        self.shared.owner
    }

    /// True when both handles refer to the same underlying channel.
    pub fn same_channel(&self, other: &IoChannel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Run `f` with the channel's per-thread context buffer.
    pub fn with_ctx<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.assert_affinity("context access");
        f(&mut self.shared.ctx.borrow_mut())
    }

    fn assert_affinity(&self, what: &str) {
        let current = Reactor::current_id();
        assert!(
            current == Some(self.shared.owner),
            "{} on channel of reactor {} from reactor {:?}",
            what,
            self.shared.owner,
            current,
        );
    }
}

impl Clone for IoChannel {
    fn clone(&self) -> Self {
        self.assert_affinity("clone");
        self.shared.refs.set(self.shared.refs.get() + 1);
        IoChannel {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for IoChannel {
    fn drop(&mut self) {
        let shared = &self.shared;
        if Reactor::current_id() != Some(shared.owner) {
            // cannot run the destroy callback on a foreign thread;
            // leak the reference and complain
            error!(
                "channel of device {} dropped off its reactor {}",
                shared.device.name, shared.owner
            );
            return;
        }

        let refs = shared.refs.get();
        if refs == 0 {
            error!(
                "channel of device {} released with refcount zero",
                shared.device.name
            );
            return;
        }
        shared.refs.set(refs - 1);

        if refs == 1 {
            {
                let mut devices = DEVICES.lock();
                if let Some(entry) = devices.get_mut(&shared.device.key)
                {
                    entry
                        .channels
                        .retain(|c| !Arc::ptr_eq(c, shared));
                }
            }
            trace!("[D] {:?}", self);
            (shared.device.destroy_cb)(&mut shared.ctx.borrow_mut());
        }
    }
}

fn create_channel(
    key: DeviceKey,
    exclusive: bool,
) -> Result<IoChannel, CoreError> {
    let rid = Reactor::current_id().ok_or(CoreError::NotBound)?;

    let shared = {
        let mut devices = DEVICES.lock();
        let entry = devices
            .get_mut(&key)
            .ok_or(CoreError::DeviceNotFound { key })?;

        if !exclusive {
            if let Some(ch) = entry
                .channels
                .iter()
                .find(|c| c.owner == rid && !c.exclusive)
            {
                // an I/O channel already exists for this device on
                // this reactor, share it
                ch.refs.set(ch.refs.get() + 1);
                return Ok(IoChannel {
                    shared: Arc::clone(ch),
                });
            }
        }

        let shared = Arc::new(ChannelShared {
            device: Arc::clone(&entry.record),
            owner: rid,
            exclusive,
            refs: Cell::new(1),
            ctx: RefCell::new(
                vec![0u8; entry.record.ctx_size].into_boxed_slice(),
            ),
        });
        entry.channels.push(Arc::clone(&shared));
        shared
    };

    // the create callback runs outside the registry lock; on failure
    // the half-made channel is taken back out so no partial state
    // remains
    let rc = (shared.device.create_cb)(&mut shared.ctx.borrow_mut());
    if let Err(errno) = rc {
        let mut devices = DEVICES.lock();
        if let Some(entry) = devices.get_mut(&key) {
            entry.channels.retain(|c| !Arc::ptr_eq(c, &shared));
        }
        return Err(CoreError::ChannelCreate { source: errno });
    }

    Ok(IoChannel { shared })
}

/// Take a reference on the calling reactor's shared channel of the
/// device, creating it on the first call.
pub fn get_io_channel(key: DeviceKey) -> Result<IoChannel, CoreError> {
    create_channel(key, false)
}

/// Create a channel of its own even when a shared one already exists
/// on this reactor. Exclusive channels are never handed out by
/// [`get_io_channel`].
pub fn create_exclusive_channel(
    key: DeviceKey,
) -> Result<IoChannel, CoreError> {
    create_channel(key, true)
}
