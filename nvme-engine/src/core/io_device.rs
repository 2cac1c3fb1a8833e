//! The I/O device registry.
//!
//! Modules register a device once and hand out per-reactor channels
//! onto it. The registry is the only cross-thread state here; a single
//! coarse mutex guards the device list and the per-device channel
//! lists, which is fine because registration and unregistration are
//! rare. The channels themselves are thread-affine and never touched
//! under the lock beyond list membership.

use std::{collections::HashMap, sync::Arc};

use nix::errno::Errno;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::core::{
    channel::ChannelShared,
    reactor::ReactorHandle,
    CoreError,
};

/// Opaque, identity-compared key under which a module registers its
/// device. Two registrations are the same device only when the keys
/// are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DeviceKey(pub u64);

/// Runs on the reactor taking the first reference; gets the zeroed
/// per-channel context buffer.
pub type ChannelCreateCb =
    Box<dyn Fn(&mut [u8]) -> Result<(), Errno> + Send + Sync>;

/// Runs on the reactor dropping the last reference.
pub type ChannelDestroyCb = Box<dyn Fn(&mut [u8]) + Send + Sync>;

/// Immutable per-device record shared with every channel.
pub(crate) struct DeviceRecord {
    pub key: DeviceKey,
    pub name: String,
    pub ctx_size: usize,
    pub create_cb: ChannelCreateCb,
    pub destroy_cb: ChannelDestroyCb,
}

pub(crate) struct DeviceEntry {
    pub record: Arc<DeviceRecord>,
    pub channels: Vec<Arc<ChannelShared>>,
}

pub(crate) static DEVICES: Lazy<Mutex<HashMap<DeviceKey, DeviceEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Register an I/O device. `ctx_size` bytes of zeroed context are
/// allocated for every channel before `create_cb` runs.
pub fn register_device(
    key: DeviceKey,
    name: &str,
    create_cb: ChannelCreateCb,
    destroy_cb: ChannelDestroyCb,
    ctx_size: usize,
) -> Result<(), CoreError> {
    let mut devices = DEVICES.lock();
    if devices.contains_key(&key) {
        return Err(CoreError::DeviceExists { key });
    }

    devices.insert(
        key,
        DeviceEntry {
            record: Arc::new(DeviceRecord {
                key,
                name: name.to_string(),
                ctx_size,
                create_cb,
                destroy_cb,
            }),
            channels: Vec::new(),
        },
    );
    debug!("i/o device {:?} ({}) registered", key, name);
    Ok(())
}

/// Unregister a device. Strict: fails with `DeviceBusy` while any
/// channel is still held.
pub fn unregister_device(key: DeviceKey) -> Result<(), CoreError> {
    let mut devices = DEVICES.lock();
    let entry = devices
        .get(&key)
        .ok_or(CoreError::DeviceNotFound { key })?;

    if !entry.channels.is_empty() {
        return Err(CoreError::DeviceBusy {
            key,
            channels: entry.channels.len(),
        });
    }

    let entry = devices.remove(&key).unwrap();
    debug!("i/o device {:?} ({}) unregistered", key, entry.record.name);
    Ok(())
}

/// Number of registered devices.
pub fn device_count() -> usize {
    DEVICES.lock().len()
}

/// Number of live channels of a device.
pub fn channel_count(key: DeviceKey) -> Result<usize, CoreError> {
    DEVICES
        .lock()
        .get(&key)
        .map(|e| e.channels.len())
        .ok_or(CoreError::DeviceNotFound { key })
}

/// Queue `f` on the owning reactor of every live channel of the
/// device, one message per channel. Returns the number of messages
/// sent. Channels taken or released after the snapshot are not
/// considered.
pub fn send_to_all_channels(
    key: DeviceKey,
    f: Arc<dyn Fn() + Send + Sync>,
) -> Result<usize, CoreError> {
    let owners: Vec<_> = {
        let devices = DEVICES.lock();
        let entry = devices
            .get(&key)
            .ok_or(CoreError::DeviceNotFound { key })?;
        entry.channels.iter().map(|c| c.owner()).collect()
    };

    let mut sent = 0;
    for owner in owners {
        if let Some(handle) = ReactorHandle::lookup(owner) {
            let f = Arc::clone(&f);
            if handle.send_msg(move || f()).is_ok() {
                sent += 1;
            }
        }
    }
    Ok(sent)
}
