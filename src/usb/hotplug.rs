//! USB event source
//!
//! Wraps rusb hotplug delivery. Callbacks fire inside `handle_events` on
//! the loop thread; they only push onto a queue the loop drains afterwards,
//! so registry state is never touched from callback context.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use tracing::{debug, warn};

use crate::usb::types::{DeviceKey, DeviceSnapshot, PortPath};

/// Hotplug event carried from the callback into the loop.
#[derive(Debug, Clone)]
pub enum HotplugEvent {
    Arrived(DeviceSnapshot),
    Left(DeviceKey),
}

type EventQueue = Arc<Mutex<VecDeque<HotplugEvent>>>;

struct QueueingCallback {
    queue: EventQueue,
}

impl Hotplug<Context> for QueueingCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        match snapshot(&device) {
            Ok(snap) => {
                debug!(
                    "hotplug arrival: {:04x}:{:04x} at {}",
                    snap.vid, snap.pid, snap.path
                );
                self.queue.lock().unwrap().push_back(HotplugEvent::Arrived(snap));
            }
            Err(e) => warn!("ignoring arrival, descriptor read failed: {}", e),
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        let key = key_of(&device);
        debug!("hotplug departure: {}", key);
        self.queue.lock().unwrap().push_back(HotplugEvent::Left(key));
    }
}

pub fn key_of(device: &Device<Context>) -> DeviceKey {
    DeviceKey {
        bus: device.bus_number(),
        address: device.address(),
    }
}

/// Read descriptor and topology into the plain form the model layer uses.
pub fn snapshot(device: &Device<Context>) -> Result<DeviceSnapshot, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let path = PortPath::new(device.bus_number(), device.port_numbers()?);
    Ok(DeviceSnapshot {
        key: key_of(device),
        vid: descriptor.vendor_id(),
        pid: descriptor.product_id(),
        class: descriptor.class_code(),
        path,
    })
}

/// The USB side of the event loop: context, hotplug registration, and the
/// queue of pending events.
pub struct UsbSource {
    context: Context,
    queue: EventQueue,
    _registration: Registration<Context>,
}

impl UsbSource {
    /// Create the context and register for arrivals and departures. The
    /// library also synthesizes arrivals for devices already present.
    pub fn new() -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let queue: EventQueue = Arc::default();
        let registration = HotplugBuilder::new().enumerate(true).register(
            &context,
            Box::new(QueueingCallback {
                queue: Arc::clone(&queue),
            }),
        )?;
        Ok(Self {
            context,
            queue,
            _registration: registration,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Bounded wait for USB events; hotplug callbacks run inside this call.
    pub fn handle_events(&self, timeout: Duration) -> rusb::Result<()> {
        self.context.handle_events(Some(timeout))
    }

    /// Take every event queued since the last drain.
    pub fn drain(&self) -> Vec<HotplugEvent> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    /// Snapshot every device currently on the bus, for hub re-walks and the
    /// periodic device sweep.
    pub fn snapshot_all(&self) -> Vec<DeviceSnapshot> {
        let mut snapshots = Vec::new();
        match self.context.devices() {
            Ok(list) => {
                for device in list.iter() {
                    match snapshot(&device) {
                        Ok(snap) => snapshots.push(snap),
                        Err(e) => debug!("skipping device during walk: {}", e),
                    }
                }
            }
            Err(e) => warn!("device list walk failed: {}", e),
        }
        snapshots
    }
}
