//! Hub and port registry
//!
//! Owning collections for the switching hubs, the supervised ports, and the
//! subset of ports with a pending deadline. Ports are created when their
//! parent hub is discovered and live until the hub goes away; device
//! bindings on a port come and go with hotplug events.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::usb::types::{
    ConnectionStatus, DeviceKey, HubId, MessageMode, PortId, PortPath, PowerState,
};

/// How power is switched for a hub's ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// HID command to the hub's control device.
    Ykush,
    /// Host GPIO line per port.
    Gpio,
}

/// One programmable switching hub.
#[derive(Debug)]
pub struct Hub {
    pub id: HubId,
    /// USB node of the device that accepts power commands. `None` for the
    /// synthetic GPIO hub, which has no control device on the bus.
    pub device: Option<DeviceKey>,
    /// Base path the hub's port paths derive from (bus-discovered hubs only).
    pub path: Option<PortPath>,
    pub port_count: u8,
    pub backend: BackendKind,
}

/// One supervised downstream position on a hub.
#[derive(Debug)]
pub struct Port {
    pub id: PortId,
    /// Parent hub, by registry handle so the port cannot keep it alive.
    pub hub: HubId,
    pub path: PortPath,
    /// 1-based index on the parent hub.
    pub port_num: u8,
    /// Currently bound device, if any.
    pub device: Option<DeviceKey>,
    /// Vendor/product of the last bound device, kept for the status line.
    pub vid: u16,
    pub pid: u16,
    pub status: ConnectionStatus,
    pub power: PowerState,
    pub mode: MessageMode,
    /// Consecutive failed probes for the current device.
    pub retrans: u8,
    pub ping_count: u64,
    /// Absolute monotonic deadline in microseconds, when enrolled.
    pub deadline: Option<u64>,
    /// Exported GPIO line switching this port (GPIO backend only).
    pub gpio_line: Option<u32>,
}

impl Port {
    fn new(id: PortId, hub: HubId, path: PortPath, port_num: u8, gpio_line: Option<u32>) -> Self {
        Self {
            id,
            hub,
            path,
            port_num,
            device: None,
            vid: 0,
            pid: 0,
            status: ConnectionStatus::NoDevice,
            power: PowerState::On,
            mode: MessageMode::Idle,
            retrans: 0,
            ping_count: 0,
            deadline: None,
            gpio_line,
        }
    }

    /// Return the port to its unbound state.
    pub fn clear_device(&mut self) {
        self.device = None;
        self.status = ConnectionStatus::NoDevice;
        self.mode = MessageMode::Idle;
        self.retrans = 0;
    }
}

/// Registry of hubs, ports, and pending deadlines.
///
/// The timeout set is unordered; the population is bounded by the number of
/// physical ports, so the event loop just scans it each tick.
#[derive(Debug, Default)]
pub struct Registry {
    hubs: HashMap<HubId, Hub>,
    ports: HashMap<PortId, Port>,
    timeouts: HashSet<PortId>,
    next_hub: u32,
    next_port: u32,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hub(
        &mut self,
        device: Option<DeviceKey>,
        path: Option<PortPath>,
        port_count: u8,
        backend: BackendKind,
    ) -> HubId {
        let id = HubId(self.next_hub);
        self.next_hub += 1;
        self.hubs.insert(
            id,
            Hub {
                id,
                device,
                path,
                port_count,
                backend,
            },
        );
        id
    }

    /// Remove a hub and every port that hangs off it, returning the removed
    /// ports so the caller can drop any handles still held for them.
    pub fn remove_hub(&mut self, id: HubId) -> Vec<Port> {
        let orphaned: Vec<PortId> = self
            .ports
            .values()
            .filter(|p| p.hub == id)
            .map(|p| p.id)
            .collect();
        let mut removed = Vec::with_capacity(orphaned.len());
        for port_id in orphaned {
            if let Some(port) = self.remove_port(port_id) {
                removed.push(port);
            }
        }
        if self.hubs.remove(&id).is_some() {
            debug!("hub {:?} removed with {} ports", id, removed.len());
        }
        removed
    }

    /// Identity compare against the hub's control device.
    pub fn find_hub_by_device(&self, key: DeviceKey) -> Option<HubId> {
        self.hubs
            .values()
            .find(|h| h.device == Some(key))
            .map(|h| h.id)
    }

    pub fn hub(&self, id: HubId) -> Option<&Hub> {
        self.hubs.get(&id)
    }

    pub fn hub_count(&self) -> usize {
        self.hubs.len()
    }

    pub fn add_port(
        &mut self,
        hub: HubId,
        path: PortPath,
        port_num: u8,
        gpio_line: Option<u32>,
    ) -> PortId {
        debug_assert!(self.find_port_by_path(&path).is_none());
        let id = PortId(self.next_port);
        self.next_port += 1;
        self.ports
            .insert(id, Port::new(id, hub, path, port_num, gpio_line));
        id
    }

    /// Remove a port, making sure it is also gone from the timeout set.
    pub fn remove_port(&mut self, id: PortId) -> Option<Port> {
        self.timeouts.remove(&id);
        self.ports.remove(&id)
    }

    /// Linear scan; paths compare byte for byte.
    pub fn find_port_by_path(&self, path: &PortPath) -> Option<PortId> {
        self.ports
            .values()
            .find(|p| p.path == *path)
            .map(|p| p.id)
    }

    pub fn find_port_by_device(&self, key: DeviceKey) -> Option<PortId> {
        self.ports
            .values()
            .find(|p| p.device == Some(key))
            .map(|p| p.id)
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.ports.get(&id)
    }

    pub fn port_mut(&mut self, id: PortId) -> Option<&mut Port> {
        self.ports.get_mut(&id)
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }

    /// All port handles, in creation order for stable iteration.
    pub fn port_ids(&self) -> Vec<PortId> {
        let mut ids: Vec<PortId> = self.ports.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Arm the port's deadline and enroll it in the timeout set. A port that
    /// is already enrolled just gets its deadline replaced.
    pub fn schedule(&mut self, id: PortId, deadline: u64) {
        if let Some(port) = self.ports.get_mut(&id) {
            port.deadline = Some(deadline);
            self.timeouts.insert(id);
        }
    }

    /// Deenroll the port; harmless if it was not enrolled.
    pub fn cancel_timeout(&mut self, id: PortId) {
        self.timeouts.remove(&id);
        if let Some(port) = self.ports.get_mut(&id) {
            port.deadline = None;
        }
    }

    pub fn is_scheduled(&self, id: PortId) -> bool {
        self.timeouts.contains(&id)
    }

    pub fn scheduled_ids(&self) -> Vec<PortId> {
        let mut ids: Vec<PortId> = self.timeouts.iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn timeout_count(&self) -> usize {
        self.timeouts.len()
    }

    /// Enrolled ports whose deadline has passed.
    pub fn expired(&self, now: u64) -> Vec<PortId> {
        let mut ids: Vec<PortId> = self
            .timeouts
            .iter()
            .copied()
            .filter(|id| {
                self.ports
                    .get(id)
                    .and_then(|p| p.deadline)
                    .is_some_and(|d| d <= now)
            })
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> PortPath {
        text.parse().unwrap()
    }

    fn hub_with_ports(registry: &mut Registry, base: &str, count: u8) -> (HubId, Vec<PortId>) {
        let base = path(base);
        let hub = registry.add_hub(
            Some(DeviceKey { bus: 1, address: 9 }),
            Some(base.clone()),
            count,
            BackendKind::Ykush,
        );
        let ports = (1..=count)
            .map(|n| registry.add_port(hub, base.child(n), n, None))
            .collect();
        (hub, ports)
    }

    #[test]
    fn test_find_port_by_path() {
        let mut registry = Registry::new();
        let (_, ports) = hub_with_ports(&mut registry, "1-2", 3);
        assert_eq!(registry.find_port_by_path(&path("1-2.2")), Some(ports[1]));
        assert_eq!(registry.find_port_by_path(&path("1-2.4")), None);
        assert_eq!(registry.find_port_by_path(&path("2-2.2")), None);
    }

    #[test]
    fn test_hub_removal_cascades() {
        let mut registry = Registry::new();
        let (hub, ports) = hub_with_ports(&mut registry, "1-2", 3);
        let (other_hub, other_ports) = hub_with_ports(&mut registry, "1-3", 2);
        registry.schedule(ports[0], 1_000);
        registry.schedule(other_ports[0], 1_000);

        let removed = registry.remove_hub(hub);
        assert_eq!(removed.len(), 3);
        assert_eq!(registry.hub_count(), 1);
        assert_eq!(registry.port_count(), 2);
        assert!(!registry.is_scheduled(ports[0]));
        assert!(registry.is_scheduled(other_ports[0]));
        assert!(registry.hub(other_hub).is_some());
    }

    #[test]
    fn test_timeouts_are_a_subset_of_ports() {
        let mut registry = Registry::new();
        let (_, ports) = hub_with_ports(&mut registry, "1-2", 3);
        for port in &ports {
            registry.schedule(*port, 5);
        }
        registry.remove_port(ports[1]);
        for id in registry.scheduled_ids() {
            assert!(registry.port(id).is_some());
        }
        assert_eq!(registry.timeout_count(), 2);
    }

    #[test]
    fn test_schedule_and_cancel_are_idempotent() {
        let mut registry = Registry::new();
        let (_, ports) = hub_with_ports(&mut registry, "1-2", 1);
        registry.schedule(ports[0], 10);
        registry.schedule(ports[0], 20);
        assert_eq!(registry.timeout_count(), 1);
        assert_eq!(registry.port(ports[0]).unwrap().deadline, Some(20));

        registry.cancel_timeout(ports[0]);
        registry.cancel_timeout(ports[0]);
        assert_eq!(registry.timeout_count(), 0);
        assert_eq!(registry.port(ports[0]).unwrap().deadline, None);
    }

    #[test]
    fn test_expired_respects_deadlines() {
        let mut registry = Registry::new();
        let (_, ports) = hub_with_ports(&mut registry, "1-2", 3);
        registry.schedule(ports[0], 10);
        registry.schedule(ports[1], 20);
        registry.schedule(ports[2], 30);

        assert_eq!(registry.expired(9), Vec::<PortId>::new());
        assert_eq!(registry.expired(20), vec![ports[0], ports[1]]);
        assert_eq!(registry.expired(100), ports);
    }

    #[test]
    fn test_schedule_unknown_port_is_ignored() {
        let mut registry = Registry::new();
        registry.schedule(PortId(42), 10);
        assert_eq!(registry.timeout_count(), 0);
    }
}
