//! Configuration loading
//!
//! The supervisor reads a small JSON document naming power-switching
//! handlers. The only recognized top-level key is `handlers`, an ordered
//! sequence of `{name, ports}` mappings; the only recognized handler is
//! `GPIO`, whose payload maps port paths to exported GPIO lines. YKUSH
//! hubs need no configuration, they are discovered on the bus.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context as _, Result};
use serde::Deserialize;

use crate::usb::types::PortPath;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    handlers: Vec<RawHandler>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHandler {
    name: String,
    ports: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGpioPort {
    path: String,
    gpio: u32,
}

/// One GPIO-switched port: where it sits and which line cuts its power.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpioPort {
    pub path: PortPath,
    pub gpio: u32,
}

/// Parsed supervisor configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    gpio_ports: Vec<GpioPort>,
}

impl Config {
    /// Read and validate the configuration document at `path`. The whole
    /// file is read; document size is not capped.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        tracing::info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(text).context("failed to parse JSON")?;
        let mut gpio_ports: Vec<GpioPort> = Vec::new();
        for handler in raw.handlers {
            match handler.name.as_str() {
                "GPIO" => {
                    let ports: Vec<RawGpioPort> = serde_json::from_value(handler.ports)
                        .context("invalid GPIO ports payload")?;
                    for port in ports {
                        let path: PortPath = port
                            .path
                            .parse()
                            .with_context(|| format!("invalid port path {:?}", port.path))?;
                        if gpio_ports.iter().any(|p| p.path == path) {
                            bail!("duplicate port path {} in GPIO handler", path);
                        }
                        gpio_ports.push(GpioPort {
                            path,
                            gpio: port.gpio,
                        });
                    }
                }
                other => bail!("unknown handler {:?} in configuration", other),
            }
        }
        Ok(Self { gpio_ports })
    }

    pub fn gpio_ports(&self) -> &[GpioPort] {
        &self.gpio_ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpio_handler() {
        let config = Config::parse(
            r#"{
                "handlers": [
                    {
                        "name": "GPIO",
                        "ports": [
                            {"path": "1-2.1", "gpio": 17},
                            {"path": "1-2.2", "gpio": 27}
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.gpio_ports().len(), 2);
        assert_eq!(config.gpio_ports()[0].gpio, 17);
        assert_eq!(config.gpio_ports()[1].path, "1-2.2".parse().unwrap());
    }

    #[test]
    fn test_empty_document_is_valid() {
        let config = Config::parse("{}").unwrap();
        assert!(config.gpio_ports().is_empty());
    }

    #[test]
    fn test_unknown_top_level_key_fails() {
        assert!(Config::parse(r#"{"handlers": [], "extra": 1}"#).is_err());
    }

    #[test]
    fn test_unknown_handler_name_fails() {
        let err = Config::parse(r#"{"handlers": [{"name": "PoE", "ports": []}]}"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("unknown handler"));
    }

    #[test]
    fn test_unknown_handler_key_fails() {
        assert!(Config::parse(
            r#"{"handlers": [{"name": "GPIO", "ports": [], "mode": "push"}]}"#
        )
        .is_err());
    }

    #[test]
    fn test_bad_ports_payload_fails() {
        assert!(Config::parse(r#"{"handlers": [{"name": "GPIO", "ports": 7}]}"#).is_err());
        assert!(Config::parse(
            r#"{"handlers": [{"name": "GPIO", "ports": [{"path": "1-2.1"}]}]}"#
        )
        .is_err());
        assert!(Config::parse(
            r#"{"handlers": [{"name": "GPIO", "ports": [{"path": "nope", "gpio": 4}]}]}"#
        )
        .is_err());
    }

    #[test]
    fn test_duplicate_path_fails() {
        let err = Config::parse(
            r#"{"handlers": [{"name": "GPIO", "ports": [
                {"path": "1-2.1", "gpio": 17},
                {"path": "1-2.1", "gpio": 18}
            ]}]}"#,
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("duplicate port path"));
    }

    #[test]
    fn test_large_document_is_read_in_full() {
        // far past one kilobyte; every entry must survive parsing
        let ports: Vec<String> = (0..120)
            .map(|i| format!(r#"{{"path": "1-2.{}.{}", "gpio": {}}}"#, i / 7 + 1, i % 7 + 1, i))
            .collect();
        let text = format!(
            r#"{{"handlers": [{{"name": "GPIO", "ports": [{}]}}]}}"#,
            ports.join(",")
        );
        assert!(text.len() > 4096);
        let config = Config::parse(&text).unwrap();
        assert_eq!(config.gpio_ports().len(), 120);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.json");
        std::fs::write(
            &path,
            r#"{"handlers": [{"name": "GPIO", "ports": [{"path": "2-1.3", "gpio": 4}]}]}"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.gpio_ports().len(), 1);

        assert!(Config::load(&dir.path().join("missing.json")).is_err());
    }
}
