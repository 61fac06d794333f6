//! Port supervision state machine
//!
//! Tracks which devices sit on which switched ports, probes them for
//! liveness, and orders power cycles when a device stops answering. All
//! transitions run on the loop thread; timer handlers re-read port state
//! before acting, so a deadline left over from an abandoned state is
//! harmless.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::GpioPort;
use crate::usb::driver::PortDriver;
use crate::usb::registry::{BackendKind, Port, Registry};
use crate::usb::types::{
    ConnectionStatus, DeviceKey, DeviceSnapshot, MessageMode, PortId, PowerState, USB_CLASS_HUB,
    YKUSH_PID, YKUSH_PORT_COUNT, YKUSH_VID,
};

/// Cadence of liveness probes for a healthy device.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// Wait before the first probe after arrival, long enough for mode-switching
/// tools to finish re-enumerating the device.
pub const ARRIVAL_GRACE: Duration = Duration::from_secs(10);
/// Failed probes tolerated before the port is power-cycled.
pub const RETRANS_LIMIT: u8 = 5;
/// One success log line per this many successful probes.
pub const PING_LOG_EVERY: u64 = 20;
/// How long a port is held off during a power cycle.
pub const POWER_OFF_HOLD: Duration = Duration::from_secs(1);

/// What an arrival did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// A new switching hub was onboarded. The caller should re-walk the
    /// device list: children of the hub may have enumerated before its
    /// control device did.
    HubOnboarded,
    /// The device was bound to a supervised port.
    Bound(PortId),
    /// Nothing to do: unknown path, nested hub, or duplicate arrival.
    Ignored,
}

/// The per-port state machine over the topology registry.
///
/// Hardware access goes through the [`PortDriver`] the caller passes in;
/// time is an absolute microsecond count on a monotonic clock.
#[derive(Debug, Default)]
pub struct Supervisor {
    registry: Registry,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Create the synthetic hub holding the GPIO-switched ports named in
    /// the configuration.
    pub fn install_gpio_ports(&mut self, ports: &[GpioPort]) {
        if ports.is_empty() {
            return;
        }
        let hub = self
            .registry
            .add_hub(None, None, ports.len() as u8, BackendKind::Gpio);
        for (index, entry) in ports.iter().enumerate() {
            if self.registry.find_port_by_path(&entry.path).is_some() {
                warn!("duplicate supervised path {}, ignoring", entry.path);
                continue;
            }
            self.registry
                .add_port(hub, entry.path.clone(), (index + 1) as u8, Some(entry.gpio));
            debug!("GPIO port {} on line {} registered", entry.path, entry.gpio);
        }
    }

    /// Route an arrival: switching hubs are onboarded, other hubs ignored,
    /// and anything else is matched against the supervised ports.
    pub fn device_added(
        &mut self,
        driver: &mut dyn PortDriver,
        snap: &DeviceSnapshot,
        now: u64,
    ) -> Arrival {
        if snap.vid == YKUSH_VID && snap.pid == YKUSH_PID {
            return self.onboard_ykush(snap);
        }
        if snap.class == USB_CLASS_HUB {
            // hubs below our hubs are not supervised
            return Arrival::Ignored;
        }
        match self.registry.find_port_by_path(&snap.path) {
            Some(id) => self.bind_port(driver, id, snap, now),
            None => Arrival::Ignored,
        }
    }

    fn onboard_ykush(&mut self, snap: &DeviceSnapshot) -> Arrival {
        if self.registry.find_hub_by_device(snap.key).is_some() {
            return Arrival::Ignored;
        }
        let Some(base) = snap.path.parent() else {
            warn!("YKUSH control device {} has no parent hub path", snap.key);
            return Arrival::Ignored;
        };
        let hub = self.registry.add_hub(
            Some(snap.key),
            Some(base.clone()),
            YKUSH_PORT_COUNT,
            BackendKind::Ykush,
        );
        for n in 1..=YKUSH_PORT_COUNT {
            let path = base.child(n);
            if self.registry.find_port_by_path(&path).is_some() {
                debug!("port {} already supervised", path);
                continue;
            }
            self.registry.add_port(hub, path, n, None);
        }
        info!("YKUSH hub onboarded at {} ({} ports)", base, YKUSH_PORT_COUNT);
        self.log_ports();
        Arrival::HubOnboarded
    }

    fn bind_port(
        &mut self,
        driver: &mut dyn PortDriver,
        id: PortId,
        snap: &DeviceSnapshot,
        now: u64,
    ) -> Arrival {
        {
            let Some(port) = self.registry.port_mut(id) else {
                return Arrival::Ignored;
            };
            if port.device == Some(snap.key) {
                // both the initial enumeration and a hub re-walk can deliver
                // the same device; the existing binding makes this a no-op
                return Arrival::Ignored;
            }
            if let Some(old) = port.device {
                // the device re-enumerated under a new address
                driver.release(old);
            }
            info!("device {:04x}:{:04x} added at {}", snap.vid, snap.pid, snap.path);
            port.device = Some(snap.key);
            port.vid = snap.vid;
            port.pid = snap.pid;
            port.status = ConnectionStatus::Connected;
            port.mode = MessageMode::Ping;
            port.retrans = 0;
        }
        self.registry
            .schedule(id, now + ARRIVAL_GRACE.as_micros() as u64);
        self.log_ports();
        Arrival::Bound(id)
    }

    /// Route a departure. A key that matches neither a hub's control device
    /// nor a port binding is not ours to care about.
    pub fn device_removed(&mut self, driver: &mut dyn PortDriver, key: DeviceKey) {
        if let Some(hub_id) = self.registry.find_hub_by_device(key) {
            driver.release(key);
            let removed = self.registry.remove_hub(hub_id);
            for port in &removed {
                if let Some(dev) = port.device {
                    driver.release(dev);
                }
            }
            info!("switching hub {} removed with {} ports", key, removed.len());
            self.log_ports();
            return;
        }
        let Some(id) = self.registry.find_port_by_device(key) else {
            return;
        };
        self.unbind_port(driver, id);
        self.log_ports();
    }

    fn unbind_port(&mut self, driver: &mut dyn PortDriver, id: PortId) {
        {
            let Some(port) = self.registry.port_mut(id) else {
                return;
            };
            if let Some(key) = port.device {
                driver.release(key);
            }
            info!("device {:04x}:{:04x} left {}", port.vid, port.pid, port.path);
            port.clear_device();
        }
        self.registry.cancel_timeout(id);
    }

    /// Fire every deadline at or before `now`. Each port is detached from
    /// the timeout set before its handler runs, so the handler can re-enroll
    /// it cleanly.
    pub fn check_timeouts(&mut self, driver: &mut dyn PortDriver, now: u64) {
        for id in self.registry.expired(now) {
            self.registry.cancel_timeout(id);
            self.handle_timeout(driver, id, now);
        }
    }

    pub fn handle_timeout(&mut self, driver: &mut dyn PortDriver, id: PortId, now: u64) {
        let Some(port) = self.registry.port(id) else {
            return;
        };
        match port.mode {
            MessageMode::Ping => self.ping(driver, id, now),
            MessageMode::Reset => self.reset_step(driver, id, now),
            // the port left the state that armed this deadline
            MessageMode::Idle => {}
        }
    }

    fn ping(&mut self, driver: &mut dyn PortDriver, id: PortId, now: u64) {
        let result = {
            let Some(port) = self.registry.port(id) else {
                return;
            };
            if port.status != ConnectionStatus::Connected || port.device.is_none() {
                return;
            }
            driver.probe(port)
        };
        match result {
            Ok(()) => {
                {
                    let Some(port) = self.registry.port_mut(id) else {
                        return;
                    };
                    port.retrans = 0;
                    port.ping_count += 1;
                    if port.ping_count % PING_LOG_EVERY == 0 {
                        info!(
                            "device {:04x}:{:04x} at {} answered {} probes",
                            port.vid, port.pid, port.path, port.ping_count
                        );
                    }
                }
                self.registry
                    .schedule(id, now + PROBE_INTERVAL.as_micros() as u64);
            }
            Err(e) => {
                let exceeded = {
                    let Some(port) = self.registry.port_mut(id) else {
                        return;
                    };
                    port.retrans += 1;
                    debug!(
                        "probe failed for {} ({}/{}): {}",
                        port.path, port.retrans, RETRANS_LIMIT, e
                    );
                    if port.retrans >= RETRANS_LIMIT {
                        warn!(
                            "device {:04x}:{:04x} at {} is unresponsive, cycling power",
                            port.vid, port.pid, port.path
                        );
                        true
                    } else {
                        false
                    }
                };
                if exceeded {
                    self.start_reset(driver, id, now);
                } else {
                    // retry on the next tick
                    self.registry.schedule(id, now);
                }
            }
        }
    }

    /// Begin a power cycle. Ports already mid-cycle are left alone.
    pub fn start_reset(&mut self, driver: &mut dyn PortDriver, id: PortId, now: u64) {
        {
            let Some(port) = self.registry.port_mut(id) else {
                return;
            };
            if port.mode == MessageMode::Reset {
                return;
            }
            if let Some(key) = port.device {
                // cutting power bounces the device; drop the binding now so
                // the induced departure no longer matches this port
                driver.release(key);
            }
            port.device = None;
            port.status = ConnectionStatus::NoDevice;
            port.mode = MessageMode::Reset;
        }
        self.registry.cancel_timeout(id);
        self.reset_step(driver, id, now);
    }

    /// One phase of the power cycle. Power still assumed on means the off
    /// command is due (first entry, or a failed attempt being retried);
    /// power off means the hold expired and the port comes back up.
    fn reset_step(&mut self, driver: &mut dyn PortDriver, id: PortId, now: u64) {
        let (turning_on, path) = {
            let Some(port) = self.registry.port(id) else {
                return;
            };
            (port.power == PowerState::Off, port.path.clone())
        };
        let result = {
            let Some(port) = self.registry.port(id) else {
                return;
            };
            let Some(hub) = self.registry.hub(port.hub) else {
                return;
            };
            driver.set_power(hub, port, turning_on)
        };
        match result {
            Ok(()) if turning_on => {
                if let Some(port) = self.registry.port_mut(id) {
                    port.power = PowerState::On;
                    port.mode = MessageMode::Idle;
                    port.retrans = 0;
                }
                info!("port {} powered back on", path);
            }
            Ok(()) => {
                if let Some(port) = self.registry.port_mut(id) {
                    port.power = PowerState::Off;
                }
                info!("port {} powered off", path);
                self.registry
                    .schedule(id, now + POWER_OFF_HOLD.as_micros() as u64);
            }
            Err(e) => {
                // leave the phase as-is; the rearmed timer retries it
                warn!("power command for port {} failed: {}", path, e);
                self.registry
                    .schedule(id, now + POWER_OFF_HOLD.as_micros() as u64);
            }
        }
    }

    /// Restart sweep. Forced sweeps cycle every port; unforced sweeps only
    /// ports that never saw a device come back.
    pub fn reset_all(&mut self, driver: &mut dyn PortDriver, now: u64, forced: bool) {
        for id in self.registry.port_ids() {
            let eligible = {
                let Some(port) = self.registry.port(id) else {
                    continue;
                };
                forced
                    || (port.status == ConnectionStatus::NoDevice
                        && port.mode != MessageMode::Reset)
            };
            if eligible {
                self.start_reset(driver, id, now);
            }
        }
    }

    /// Write the one-line status of every supervised port to the log sink.
    pub fn log_ports(&self) {
        for id in self.registry.port_ids() {
            if let Some(port) = self.registry.port(id) {
                info!("{}", describe(port));
            }
        }
    }
}

/// Human-readable status line for a port.
pub fn describe(port: &Port) -> String {
    let device = match port.status {
        ConnectionStatus::Connected => format!("{:04x}:{:04x}", port.vid, port.pid),
        ConnectionStatus::NoDevice => "no device".to_string(),
    };
    format!(
        "port {}: {} [{} power {} retrans {}]",
        port.path, device, port.mode, port.power, port.retrans
    )
}
