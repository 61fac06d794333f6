//! USB supervision subsystem
//!
//! The layers, leaves first: plain boundary types, the hub/port registry,
//! the hardware driver (rusb control transfers and sysfs GPIO), the hotplug
//! event source, the per-port state machine, and the loop tying them
//! together. Only `driver` and `hotplug` touch rusb; everything above them
//! runs the same against fakes.

pub mod driver;
pub mod hotplug;
pub mod monitor;
pub mod registry;
pub mod supervisor;
pub mod types;

pub use monitor::Monitor;
pub use supervisor::Supervisor;
