//! USB boundary types
//!
//! Plain data captured at the rusb boundary. Everything above the driver
//! layer (registry, state machine, event loop decisions) works on these
//! types only, so the supervision logic can be exercised without hardware.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Vendor id of the YKUSH switchable hub family.
pub const YKUSH_VID: u16 = 0x04d8;
/// Product id of the YKUSH HID control device.
pub const YKUSH_PID: u16 = 0x0042;
/// Downstream switched ports on a YKUSH board.
pub const YKUSH_PORT_COUNT: u8 = 3;

/// USB device class code for hubs.
pub const USB_CLASS_HUB: u8 = 0x09;

/// Deepest hub chain the USB topology allows below a bus.
pub const MAX_CHAIN_DEPTH: usize = 7;

/// Identity of a USB device node: bus number plus bus address.
///
/// Addresses are reassigned when a device re-enumerates, so a key always
/// names one attachment of one device, which is exactly what port bindings
/// and hub lookups need to compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Topological path of a device: bus number plus the chain of hub port
/// numbers leading to it.
///
/// Renders in the sysfs style, e.g. `1-2.3` for bus 1, hub port 2, then
/// port 3. The chain is empty for a root hub itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortPath {
    bus: u8,
    chain: Vec<u8>,
}

impl PortPath {
    pub fn new(bus: u8, chain: Vec<u8>) -> Self {
        debug_assert!(chain.len() <= MAX_CHAIN_DEPTH);
        Self { bus, chain }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn chain(&self) -> &[u8] {
        &self.chain
    }

    /// Path of the device on port `port` of the hub at this path.
    pub fn child(&self, port: u8) -> PortPath {
        let mut chain = self.chain.clone();
        chain.push(port);
        PortPath { bus: self.bus, chain }
    }

    /// Path of the hub this device hangs off, if it is not a root hub.
    pub fn parent(&self) -> Option<PortPath> {
        if self.chain.is_empty() {
            return None;
        }
        Some(PortPath {
            bus: self.bus,
            chain: self.chain[..self.chain.len() - 1].to_vec(),
        })
    }
}

impl fmt::Display for PortPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bus)?;
        for (i, port) in self.chain.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { '-' } else { '.' }, port)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathParseError {
    #[error("expected `<bus>-<port>[.<port>...]`")]
    Format,
    #[error("invalid number {0:?} in path")]
    Number(String),
    #[error("hub chain deeper than {MAX_CHAIN_DEPTH}")]
    TooDeep,
}

impl FromStr for PortPath {
    type Err = PathParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bus, rest) = s.split_once('-').ok_or(PathParseError::Format)?;
        let bus: u8 = bus
            .parse()
            .map_err(|_| PathParseError::Number(bus.to_string()))?;
        let mut chain = Vec::new();
        for part in rest.split('.') {
            let port: u8 = part
                .parse()
                .map_err(|_| PathParseError::Number(part.to_string()))?;
            chain.push(port);
        }
        if chain.len() > MAX_CHAIN_DEPTH {
            return Err(PathParseError::TooDeep);
        }
        Ok(PortPath { bus, chain })
    }
}

/// Descriptor data captured when a device shows up on the bus.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub key: DeviceKey,
    pub vid: u16,
    pub pid: u16,
    pub class: u8,
    pub path: PortPath,
}

/// Whether a supervised port currently has a device bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NoDevice,
    Connected,
}

/// Assumed power state of a port.
///
/// The hardware does not report the truth (the YKUSH has no power readback),
/// so ports start out assumed on and the restart sweep corrects drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    On,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerState::Off => "off",
            PowerState::On => "on",
        })
    }
}

/// Stage of a port's supervision cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageMode {
    Idle,
    Ping,
    Reset,
}

impl fmt::Display for MessageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageMode::Idle => "idle",
            MessageMode::Ping => "ping",
            MessageMode::Reset => "reset",
        })
    }
}

/// Handle of a switching hub in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HubId(pub u32);

/// Handle of a supervised port in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_roundtrip() {
        for text in ["1-2", "1-2.3", "4-1.2.3.4.5.6.7", "255-255"] {
            let path: PortPath = text.parse().unwrap();
            assert_eq!(path.to_string(), text);
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!("1".parse::<PortPath>(), Err(PathParseError::Format));
        assert_eq!(
            "bus-2".parse::<PortPath>(),
            Err(PathParseError::Number("bus".to_string()))
        );
        assert_eq!(
            "1-2.x".parse::<PortPath>(),
            Err(PathParseError::Number("x".to_string()))
        );
        assert_eq!(
            "1-".parse::<PortPath>(),
            Err(PathParseError::Number(String::new()))
        );
        assert_eq!(
            "1-1.2.3.4.5.6.7.8".parse::<PortPath>(),
            Err(PathParseError::TooDeep)
        );
    }

    #[test]
    fn test_child_and_parent() {
        let hub: PortPath = "1-2".parse().unwrap();
        let dev = hub.child(3);
        assert_eq!(dev.to_string(), "1-2.3");
        assert_eq!(dev.parent(), Some(hub.clone()));

        let root = hub.parent().unwrap();
        assert_eq!(root.to_string(), "1");
        assert_eq!(root.chain(), &[] as &[u8]);
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn test_paths_compare_by_bus_and_chain() {
        let a = PortPath::new(1, vec![2, 3]);
        let b: PortPath = "1-2.3".parse().unwrap();
        let c = PortPath::new(2, vec![2, 3]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
