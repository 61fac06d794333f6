//! usb-supervisor
//!
//! Keeps USB devices on software-switchable hubs alive. Every supervised
//! port is probed for liveness on a timer; a device that stops answering
//! gets its port power-cycled, either through a YKUSH HID-controlled hub
//! or a host GPIO line. Built for embedded gateways where flaky modems and
//! radios must recover without an operator.

pub mod config;
pub mod logging;
pub mod service;
pub mod usb;
