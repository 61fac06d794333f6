//! Hardware backends
//!
//! The probe and power-switching capability set sits behind a trait so the
//! state machine can be exercised without hardware. `UsbDriver` talks to
//! real devices through rusb and drives GPIO lines through sysfs.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use thiserror::Error;
use tracing::{debug, warn};

use crate::usb::registry::{BackendKind, Hub, Port};
use crate::usb::types::DeviceKey;

/// Timeout for liveness probes and power commands.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);

/// USB standard GET_STATUS request.
const REQUEST_GET_STATUS: u8 = 0x00;
/// HID SET_REPORT request.
const HID_SET_REPORT: u8 = 0x09;
/// wValue selecting an output report with report id 0.
const HID_REPORT_OUTPUT: u16 = 0x0200;

/// YKUSH command bases; the port number is or-ed in.
const YKUSH_PORT_OFF: u8 = 0x10;
const YKUSH_PORT_ON: u8 = 0x11;

/// Where exported GPIO lines live.
pub const GPIO_SYSFS_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("control transfer failed: {0}")]
    Transfer(#[from] rusb::Error),
    #[error("GPIO write failed: {0}")]
    Gpio(#[from] std::io::Error),
    #[error("no device to address")]
    NoDevice,
    #[error("port has no power control")]
    Unsupported,
}

/// Hardware operations the port supervisor depends on.
pub trait PortDriver {
    /// Liveness probe: standard GET_STATUS to endpoint zero of the device
    /// bound to this port.
    fn probe(&mut self, port: &Port) -> Result<(), DriverError>;

    /// Switch power for one hub port.
    fn set_power(&mut self, hub: &Hub, port: &Port, on: bool) -> Result<(), DriverError>;

    /// Drop any cached handle for this device node.
    fn release(&mut self, key: DeviceKey);
}

/// One-byte YKUSH power command for a port.
pub fn ykush_command(port_num: u8, on: bool) -> u8 {
    if on {
        YKUSH_PORT_ON | port_num
    } else {
        YKUSH_PORT_OFF | port_num
    }
}

/// Production driver: rusb control transfers plus sysfs GPIO writes.
///
/// Device handles are opened lazily per device node and cached until the
/// node goes away or a transfer on it fails; a failed handle may belong to
/// a re-enumerated device, so it is dropped and reopened on the next use.
pub struct UsbDriver {
    context: Context,
    handles: HashMap<DeviceKey, DeviceHandle<Context>>,
    gpio: GpioBackend,
}

impl UsbDriver {
    pub fn new(context: Context) -> Self {
        Self {
            context,
            handles: HashMap::new(),
            gpio: GpioBackend::new(GPIO_SYSFS_ROOT),
        }
    }

    fn find_device(context: &Context, key: DeviceKey) -> Result<Device<Context>, DriverError> {
        for device in context.devices()?.iter() {
            if device.bus_number() == key.bus && device.address() == key.address {
                return Ok(device);
            }
        }
        Err(DriverError::NoDevice)
    }

    fn handle_for(&mut self, key: DeviceKey) -> Result<&DeviceHandle<Context>, DriverError> {
        if !self.handles.contains_key(&key) {
            let device = Self::find_device(&self.context, key)?;
            self.handles.insert(key, device.open()?);
        }
        self.handles.get(&key).ok_or(DriverError::NoDevice)
    }
}

impl PortDriver for UsbDriver {
    fn probe(&mut self, port: &Port) -> Result<(), DriverError> {
        let key = port.device.ok_or(DriverError::NoDevice)?;
        let request_type = rusb::request_type(Direction::In, RequestType::Standard, Recipient::Device);
        let mut status = [0u8; 2];
        let handle = self.handle_for(key)?;
        match handle.read_control(
            request_type,
            REQUEST_GET_STATUS,
            0,
            0,
            &mut status,
            TRANSFER_TIMEOUT,
        ) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.handles.remove(&key);
                Err(e.into())
            }
        }
    }

    fn set_power(&mut self, hub: &Hub, port: &Port, on: bool) -> Result<(), DriverError> {
        match hub.backend {
            BackendKind::Ykush => {
                let key = hub.device.ok_or(DriverError::Unsupported)?;
                let command = [ykush_command(port.port_num, on)];
                let request_type =
                    rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface);
                let handle = self.handle_for(key)?;
                // usbhid owns the control interface; borrow it for the
                // one transfer
                if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
                    debug!("kernel driver auto-detach unavailable: {}", e);
                }
                handle.claim_interface(0)?;
                let result = handle.write_control(
                    request_type,
                    HID_SET_REPORT,
                    HID_REPORT_OUTPUT,
                    0,
                    &command,
                    TRANSFER_TIMEOUT,
                );
                if let Err(e) = handle.release_interface(0) {
                    debug!("release of hub control interface failed: {}", e);
                }
                match result {
                    Ok(_) => {
                        debug!(
                            "hub {} port {} power {}",
                            key,
                            port.port_num,
                            if on { "on" } else { "off" }
                        );
                        Ok(())
                    }
                    Err(e) => {
                        self.handles.remove(&key);
                        Err(e.into())
                    }
                }
            }
            BackendKind::Gpio => {
                let line = port.gpio_line.ok_or(DriverError::Unsupported)?;
                self.gpio.set(line, on).map_err(DriverError::from)
            }
        }
    }

    fn release(&mut self, key: DeviceKey) {
        if self.handles.remove(&key).is_some() {
            debug!("dropped handle for {}", key);
        }
    }
}

/// Writes port power through exported sysfs GPIO lines.
#[derive(Debug, Clone)]
pub struct GpioBackend {
    root: PathBuf,
}

impl GpioBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write ASCII `"1"`/`"0"` to the line's value file.
    pub fn set(&self, line: u32, on: bool) -> std::io::Result<()> {
        let path = self.root.join(format!("gpio{line}")).join("value");
        let mut file = OpenOptions::new().write(true).open(&path).map_err(|e| {
            warn!("cannot open {}: {}", path.display(), e);
            e
        })?;
        file.write_all(if on { b"1" } else { b"0" })
    }
}
