use std::fmt;

use crate::error::DescriptorError;
use crate::memory::{DfuMemory, parse_memory_descriptor};

const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
const DFU_PROTOCOL_DFU: u8 = 0x02;

/// Which side of the DFU detach the interface belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuMode {
    /// Application firmware exposing a DETACH-only interface.
    Runtime,
    /// Bootloader accepting DNLOAD/UPLOAD.
    Dfu,
}

impl DfuMode {
    pub(crate) fn from_protocol(protocol: u8) -> Option<Self> {
        match protocol {
            DFU_PROTOCOL_RUNTIME => Some(DfuMode::Runtime),
            DFU_PROTOCOL_DFU => Some(DfuMode::Dfu),
            _ => None,
        }
    }
}

impl fmt::Display for DfuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuMode::Runtime => write!(f, "Runtime"),
            DfuMode::Dfu => write!(f, "DFU"),
        }
    }
}

/// One DFU-capable alternate setting of a device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuInterface {
    config: u8,
    interface: u8,
    alt_setting: u8,
    mode: DfuMode,
    name_index: u8,
    name: Option<String>,
}

impl DfuInterface {
    pub(crate) fn new(
        config: u8,
        interface: u8,
        alt_setting: u8,
        mode: DfuMode,
        name_index: u8,
    ) -> Self {
        Self {
            config,
            interface,
            alt_setting,
            mode,
            name_index,
            name: None,
        }
    }

    pub fn config(&self) -> u8 {
        self.config
    }
    pub fn interface(&self) -> u8 {
        self.interface
    }
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }
    pub fn mode(&self) -> DfuMode {
        self.mode
    }
    /// `iInterface` string index, 0 when the interface has no name.
    pub fn name_index(&self) -> u8 {
        self.name_index
    }
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    /// A name is expected but could not be read.
    pub fn needs_name(&self) -> bool {
        self.name_index != 0 && self.name.is_none()
    }

    /// DfuSe memory layout encoded in the interface name.
    pub fn memory(&self) -> Option<Result<DfuMemory, DescriptorError>> {
        self.name.as_deref().map(parse_memory_descriptor)
    }
}

impl fmt::Display for DfuInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: cfg={}, intf={}, alt={}, name=\"{}\"",
            self.mode,
            self.config,
            self.interface,
            self.alt_setting,
            self.name.as_deref().unwrap_or("UNKNOWN"),
        )
    }
}
