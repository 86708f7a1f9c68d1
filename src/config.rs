//! `MachineConfig`: the minimal, spec-faithful stand-in for the
//! out-of-scope configuration/object tree — just enough `serde`/`toml`
//! structure to describe a runnable device layout for the CLI.
//!
//! Grounded on `amoljassal-sis-kernel-showcase`'s workspace dependency
//! table for the `serde` + `toml` pairing; the shape here (a flat list of
//! tagged descriptors, each knowing how to grow the bus by its own byte
//! range) mirrors the teacher's `Mapper` construction-order contract in
//! `src/mapper.rs`, generalized from "one cartridge mapper" to "any number
//! of device descriptors".

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::devices::{CharDisplay, ComputerInfo, Keyboard, NullDevice, Ram, Rom};
use crate::membus::{Address, Bus, DeviceKind, Mapping};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file `{path}`: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("cannot parse config file `{path}`: {source}")]
    Parse { path: String, source: toml::de::Error },
    #[error("cannot read program image `{path}`: {source}")]
    Image { path: String, source: std::io::Error },
}

/// One device descriptor. `kind` selects the concrete back-end; `path` is
/// meaningful only for `Rom` (the assembled/raw program image to load).
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    pub kind: DeviceSpecKind,
    pub address_start: Address,
    pub range: Address,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceSpecKind {
    Null,
    Ram,
    Rom,
    CharDisplay,
    Keyboard,
}

/// A runnable machine description: the devices to wire up, plus the
/// core's initial program counter and stack pointer. Out of scope: the
/// full hierarchical configuration/object tree spec.md excludes — this is
/// a flat list sufficient to stand up a bus with RAM + ROM +
/// computer-info and (optionally) a character display and keyboard.
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub entry_point: Address,
    #[serde(default)]
    pub stack_pointer: Address,
    pub devices: Vec<DeviceSpec>,
}

impl MachineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
    }

    /// Registers every descriptor onto `bus` in declaration order, then
    /// appends a trailing `ComputerInfo` device enumerating everything
    /// registered so far (spec §6, "computer info device"). Returns the
    /// byte range the computer-info device itself claims, so the caller
    /// can map it if it wants it addressable too.
    pub fn build_bus(&self, bus: &mut Bus, computer_info_start: Address) -> Result<(), ConfigError> {
        let mut entries = Vec::with_capacity(self.devices.len());
        for spec in &self.devices {
            let mapping = Mapping::new(spec.address_start, spec.range);
            let kind = match spec.kind {
                DeviceSpecKind::Null => {
                    bus.register(mapping, Box::new(NullDevice));
                    DeviceKind::Null
                }
                DeviceSpecKind::Ram => {
                    bus.register(mapping, Box::new(Ram::new(spec.range as usize)));
                    DeviceKind::Ram
                }
                DeviceSpecKind::Rom => {
                    let image = match &spec.path {
                        Some(p) => std::fs::read(p).map_err(|source| ConfigError::Image { path: p.clone(), source })?,
                        None => vec![0u8; spec.range as usize],
                    };
                    bus.register(mapping, Box::new(Rom::new(image)));
                    DeviceKind::Rom
                }
                DeviceSpecKind::CharDisplay => {
                    bus.register(mapping, Box::new(CharDisplay::new(spec.range as usize, 1)));
                    DeviceKind::CharDisplay
                }
                DeviceSpecKind::Keyboard => {
                    bus.register(mapping, Box::new(Keyboard::new()));
                    DeviceKind::Keyboard
                }
            };
            entries.push((kind, spec.address_start, spec.range));
        }
        let info = ComputerInfo::new(&entries);
        let info_range = info.byte_len() as Address;
        bus.register(Mapping::new(computer_info_start, info_range), Box::new(info));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_toml_description() {
        let toml = r#"
            entry_point = 0
            stack_pointer = 0x2000

            [[devices]]
            kind = "rom"
            address_start = 0
            range = 256

            [[devices]]
            kind = "ram"
            address_start = 0x1000
            range = 0x1000
        "#;
        let cfg: MachineConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.stack_pointer, 0x2000);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[0].kind, DeviceSpecKind::Rom);
    }

    #[test]
    fn build_bus_appends_a_trailing_computer_info_device() {
        let toml = r#"
            [[devices]]
            kind = "ram"
            address_start = 0
            range = 16
        "#;
        let cfg: MachineConfig = toml::from_str(toml).unwrap();
        let mut bus = Bus::new();
        cfg.build_bus(&mut bus, 0x1000).unwrap();
        assert_eq!(bus.devices().count(), 2);
    }
}
