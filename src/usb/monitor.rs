//! Supervision loop
//!
//! One tick: pump libusb events with a bounded wait, apply queued hotplug
//! arrivals and departures, honor an operator reset request, fire expired
//! deadlines, and run the slow consistency sweeps. Everything happens on
//! this one thread; nothing here ever terminates the loop.

use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::service;
use crate::usb::driver::UsbDriver;
use crate::usb::hotplug::{HotplugEvent, UsbSource};
use crate::usb::supervisor::{Arrival, Supervisor};

/// Bounded wait inside the USB event pump.
const EVENT_WAIT: Duration = Duration::from_secs(1);
/// Seconds between full device-list sweeps.
const DEVICE_SCAN_INTERVAL: u64 = 30;
/// Seconds between restart sweeps for ports that never saw a device.
const RESTART_SWEEP_INTERVAL: u64 = 60;

/// Owns the USB source, the hardware driver, and the supervisor, and runs
/// them as a single-threaded loop.
pub struct Monitor {
    source: UsbSource,
    driver: UsbDriver,
    supervisor: Supervisor,
    origin: Instant,
    last_device_scan: u64,
    last_restart_sweep: u64,
}

impl Monitor {
    pub fn new(config: &Config) -> Result<Self> {
        let source = UsbSource::new().context("USB subsystem initialization failed")?;
        let driver = UsbDriver::new(source.context().clone());
        let mut supervisor = Supervisor::new();
        supervisor.install_gpio_ports(config.gpio_ports());
        Ok(Self {
            source,
            driver,
            supervisor,
            origin: Instant::now(),
            last_device_scan: 0,
            last_restart_sweep: 0,
        })
    }

    /// Monotonic microseconds since the monitor was created.
    fn now(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// Log the full port table.
    pub fn log_initial_state(&self) {
        info!("initial state:");
        self.supervisor.log_ports();
    }

    pub fn run(&mut self) -> ! {
        loop {
            self.tick();
        }
    }

    fn tick(&mut self) {
        match self.source.handle_events(EVENT_WAIT) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => debug!("USB event wait interrupted"),
            Err(e) => warn!("USB event handling failed: {}", e),
        }

        for event in self.source.drain() {
            let now = self.now();
            match event {
                HotplugEvent::Arrived(snap) => {
                    if self.supervisor.device_added(&mut self.driver, &snap, now)
                        == Arrival::HubOnboarded
                    {
                        self.rescan_devices();
                    }
                }
                HotplugEvent::Left(key) => {
                    self.supervisor.device_removed(&mut self.driver, key);
                }
            }
        }

        if service::take_reset_request() {
            info!("operator requested restart of all ports");
            let now = self.now();
            self.supervisor.reset_all(&mut self.driver, now, true);
        }

        let now = self.now();
        self.supervisor.check_timeouts(&mut self.driver, now);

        // never run both slow sweeps in the same tick
        let now_secs = now / 1_000_000;
        if now_secs.saturating_sub(self.last_device_scan) > DEVICE_SCAN_INTERVAL {
            self.last_device_scan = now_secs;
            self.rescan_devices();
        } else if now_secs.saturating_sub(self.last_restart_sweep) > RESTART_SWEEP_INTERVAL {
            self.last_restart_sweep = now_secs;
            let now = self.now();
            self.supervisor.reset_all(&mut self.driver, now, false);
        }
    }

    /// Walk the current device list and replay arrivals the registry missed,
    /// either because a hub enumerated after its children or because a
    /// hotplug event was lost. Already-bound devices make the replay a no-op.
    fn rescan_devices(&mut self) {
        let now = self.now();
        for snap in self.source.snapshot_all() {
            if self.supervisor.device_added(&mut self.driver, &snap, now)
                == Arrival::HubOnboarded
            {
                // a hub surfaced mid-walk; start over so its children bind
                self.rescan_devices();
                return;
            }
        }
    }
}
