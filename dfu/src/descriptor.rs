//! Standard and DFU-class descriptor parsing.
//!
//! All functions here are pure: they take the raw bytes returned by
//! `GET_DESCRIPTOR` and never touch a device.

use crate::error::DescriptorError;
use crate::interface::{DfuInterface, DfuMode};

pub(crate) const DT_DEVICE: u8 = 0x01;
pub(crate) const DT_CONFIGURATION: u8 = 0x02;
pub(crate) const DT_STRING: u8 = 0x03;
pub(crate) const DT_INTERFACE: u8 = 0x04;
pub(crate) const DFU_DESC_TYPE: u8 = 0x21;

pub(crate) const DEVICE_DESC_LEN: usize = 18;
pub(crate) const CONFIG_DESC_LEN: usize = 9;
pub(crate) const INTERFACE_DESC_LEN: usize = 9;
pub(crate) const DFU_DESC_LEN: usize = 9;
const DFU_1_0_DESC_LEN: usize = 7;

pub(crate) const DFU_CLASS: u8 = 0xFE;
pub(crate) const DFU_SUBCLASS: u8 = 0x01;

pub const DFUSE_VERSION_NUMBER: u16 = 0x11A;

fn check_len(
    kind: &'static str,
    data: &[u8],
    expected: usize,
) -> Result<(), DescriptorError> {
    if data.len() < expected {
        Err(DescriptorError::Truncated {
            kind,
            len: data.len(),
            expected,
        })
    } else {
        Ok(())
    }
}

fn check_type(data: &[u8], expected: u8) -> Result<(), DescriptorError> {
    if data[1] != expected {
        Err(DescriptorError::UnexpectedType {
            expected,
            found: data[1],
        })
    } else {
        Ok(())
    }
}

fn le16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Standard device descriptor (USB 2.0, section 9.6.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DescriptorError> {
        check_len("device", data, DEVICE_DESC_LEN)?;
        check_type(data, DT_DEVICE)?;
        Ok(DeviceDescriptor {
            usb_version: le16(data, 2),
            device_class: data[4],
            device_subclass: data[5],
            device_protocol: data[6],
            max_packet_size: data[7],
            vendor_id: le16(data, 8),
            product_id: le16(data, 10),
            device_version: le16(data, 12),
            manufacturer_index: data[14],
            product_index: data[15],
            serial_number_index: data[16],
            num_configurations: data[17],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![DEVICE_DESC_LEN as u8, DT_DEVICE];
        out.extend(self.usb_version.to_le_bytes());
        out.extend([
            self.device_class,
            self.device_subclass,
            self.device_protocol,
            self.max_packet_size,
        ]);
        out.extend(self.vendor_id.to_le_bytes());
        out.extend(self.product_id.to_le_bytes());
        out.extend(self.device_version.to_le_bytes());
        out.extend([
            self.manufacturer_index,
            self.product_index,
            self.serial_number_index,
            self.num_configurations,
        ]);
        out
    }
}

/// Configuration descriptor with every descriptor that follows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub string_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    /// Sub-descriptors in the order the device reported them.
    pub descriptors: Vec<Descriptor>,
}

impl ConfigDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DescriptorError> {
        check_len("configuration", data, CONFIG_DESC_LEN)?;
        check_type(data, DT_CONFIGURATION)?;
        let total_length = le16(data, 2) as usize;
        let end = data.len().min(total_length.max(CONFIG_DESC_LEN));
        Ok(ConfigDescriptor {
            num_interfaces: data[4],
            configuration_value: data[5],
            string_index: data[6],
            attributes: data[7],
            max_power: data[8],
            descriptors: parse_sub_descriptors(&data[CONFIG_DESC_LEN..end])?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let body: Vec<u8> =
            self.descriptors.iter().flat_map(Descriptor::to_bytes).collect();
        let total_length = (CONFIG_DESC_LEN + body.len()) as u16;
        let mut out = vec![CONFIG_DESC_LEN as u8, DT_CONFIGURATION];
        out.extend(total_length.to_le_bytes());
        out.extend([
            self.num_interfaces,
            self.configuration_value,
            self.string_index,
            self.attributes,
            self.max_power,
        ]);
        out.extend(body);
        out
    }

    /// Interface descriptors, each with the descriptors nested under it.
    pub fn interfaces(
        &self,
    ) -> impl Iterator<Item = (&InterfaceDescriptor, &[Descriptor])> {
        self.descriptors
            .iter()
            .enumerate()
            .filter_map(move |(pos, desc)| match desc {
                Descriptor::Interface(intf) => {
                    let rest = &self.descriptors[pos + 1..];
                    let len = rest
                        .iter()
                        .position(|d| matches!(d, Descriptor::Interface(_)))
                        .unwrap_or(rest.len());
                    Some((intf, &rest[..len]))
                }
                _ => None,
            })
    }

    /// DFU functional descriptor of the given interface/alternate setting,
    /// falling back to the first one anywhere in the configuration.
    pub fn dfu_descriptor(
        &self,
        interface: u8,
        alt_setting: u8,
    ) -> Option<DfuDescriptor> {
        let nested = self.interfaces().find_map(|(intf, nested)| {
            if intf.interface_number != interface
                || intf.alternate_setting != alt_setting
            {
                return None;
            }
            nested.iter().find_map(Descriptor::as_dfu)
        });
        nested.or_else(|| self.descriptors.iter().find_map(Descriptor::as_dfu))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Interface(InterfaceDescriptor),
    /// Only recognised inside a DFU-class interface.
    Dfu(DfuDescriptor),
    Other { descriptor_type: u8, data: Vec<u8> },
}

impl Descriptor {
    pub fn descriptor_type(&self) -> u8 {
        match self {
            Descriptor::Interface(_) => DT_INTERFACE,
            Descriptor::Dfu(_) => DFU_DESC_TYPE,
            Descriptor::Other {
                descriptor_type, ..
            } => *descriptor_type,
        }
    }

    fn as_dfu(&self) -> Option<DfuDescriptor> {
        match self {
            Descriptor::Dfu(desc) => Some(desc.clone()),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Descriptor::Interface(intf) => intf.to_bytes(),
            Descriptor::Dfu(desc) => desc.to_bytes(),
            Descriptor::Other {
                descriptor_type,
                data,
            } => {
                let mut out = vec![(data.len() + 2) as u8, *descriptor_type];
                out.extend(data);
                out
            }
        }
    }
}

/// Standard interface descriptor (USB 2.0, section 9.6.5).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub string_index: u8,
}

impl InterfaceDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, DescriptorError> {
        check_len("interface", data, INTERFACE_DESC_LEN)?;
        check_type(data, DT_INTERFACE)?;
        Ok(InterfaceDescriptor {
            interface_number: data[2],
            alternate_setting: data[3],
            num_endpoints: data[4],
            class: data[5],
            subclass: data[6],
            protocol: data[7],
            string_index: data[8],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        vec![
            INTERFACE_DESC_LEN as u8,
            DT_INTERFACE,
            self.interface_number,
            self.alternate_setting,
            self.num_endpoints,
            self.class,
            self.subclass,
            self.protocol,
            self.string_index,
        ]
    }

    pub fn is_dfu(&self) -> bool {
        self.class == DFU_CLASS && self.subclass == DFU_SUBCLASS
    }
}

/// Walk a `bLength`/`bDescriptorType` stream.
///
/// Functional descriptors are only decoded while inside an interface of
/// the DFU class; everything else is kept opaque.
pub fn parse_sub_descriptors(
    data: &[u8],
) -> Result<Vec<Descriptor>, DescriptorError> {
    let mut descriptors = Vec::new();
    let mut in_dfu_interface = false;
    let mut offset = 0;

    while data.len() - offset >= 2 {
        let length = data[offset];
        let descriptor_type = data[offset + 1];
        if (length as usize) < 2 || offset + length as usize > data.len() {
            return Err(DescriptorError::InvalidLength { offset, length });
        }
        let raw = &data[offset..offset + length as usize];

        let desc = match descriptor_type {
            DT_INTERFACE => {
                let intf = InterfaceDescriptor::parse(raw)?;
                in_dfu_interface = intf.is_dfu();
                Descriptor::Interface(intf)
            }
            DFU_DESC_TYPE if in_dfu_interface => {
                Descriptor::Dfu(DfuDescriptor::parse(raw)?)
            }
            _ => Descriptor::Other {
                descriptor_type,
                data: raw[2..].to_vec(),
            },
        };
        descriptors.push(desc);
        offset += length as usize;
    }

    Ok(descriptors)
}

/// DFU-capable alternate settings across all configurations.
///
/// Both runtime (protocol 1) and DFU mode (protocol 2) interfaces are
/// returned. Names are left unresolved.
pub fn find_dfu_interfaces(configs: &[ConfigDescriptor]) -> Vec<DfuInterface> {
    configs
        .iter()
        .flat_map(|config| {
            config.interfaces().filter_map(move |(intf, _)| {
                if !intf.is_dfu() {
                    return None;
                }
                let mode = DfuMode::from_protocol(intf.protocol)?;
                Some(DfuInterface::new(
                    config.configuration_value,
                    intf.interface_number,
                    intf.alternate_setting,
                    mode,
                    intf.string_index,
                ))
            })
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StringDescriptor {
    /// String index 0: the supported language IDs.
    Languages(Vec<u16>),
    Text(String),
}

/// Decode a string descriptor read with `lang_id`.
///
/// With `lang_id == 0` the payload is the language ID table and is
/// returned verbatim; otherwise it is decoded from UTF-16LE.
pub fn decode_string_descriptor(
    data: &[u8],
    lang_id: u16,
) -> Result<StringDescriptor, DescriptorError> {
    check_len("string", data, 2)?;
    let length = data[0] as usize;
    if length < 2 || length > data.len() {
        return Err(DescriptorError::InvalidLength {
            offset: 0,
            length: data[0],
        });
    }
    check_type(data, DT_STRING)?;

    let words: Vec<u16> = data[2..length]
        .chunks_exact(2)
        .map(|w| u16::from_le_bytes([w[0], w[1]]))
        .collect();
    Ok(if lang_id == 0 {
        StringDescriptor::Languages(words)
    } else {
        StringDescriptor::Text(String::from_utf16_lossy(&words))
    })
}

/// DFU functional descriptor
///
/// Represents the DFU functional descriptor as described in section 4.1.3.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuDescriptor {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl Default for DfuDescriptor {
    /// Used when a device omits the functional descriptor.
    fn default() -> Self {
        DfuDescriptor {
            attributes: Self::BIT_CAN_DNLOAD
                | Self::BIT_CAN_UPLOAD
                | Self::BIT_MANIFESTATION_TOLERANT,
            detach_timeout: 1000,
            transfer_size: crate::DEFAULT_TRANSFER_SIZE,
            dfu_version: 0x0110,
        }
    }
}

impl DfuDescriptor {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    pub fn new(
        attributes: u8,
        detach_timeout: u16,
        transfer_size: u16,
        dfu_version: u16,
    ) -> Self {
        Self {
            attributes,
            detach_timeout,
            transfer_size,
            dfu_version,
        }
    }

    /// Parse the 9-byte DFU 1.1 layout, or the 7-byte DFU 1.0 one.
    pub fn parse(raw_desc: &[u8]) -> Result<Self, DescriptorError> {
        check_len("DFU functional", raw_desc, DFU_1_0_DESC_LEN)?;
        check_type(raw_desc, DFU_DESC_TYPE)?;
        let dfu_version = if raw_desc.len() >= DFU_DESC_LEN {
            le16(raw_desc, 7)
        } else {
            0x0100
        };
        Ok(Self {
            attributes: raw_desc[2],
            detach_timeout: le16(raw_desc, 3),
            transfer_size: le16(raw_desc, 5),
            dfu_version,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            vec![DFU_DESC_LEN as u8, DFU_DESC_TYPE, self.attributes];
        out.extend(self.detach_timeout.to_le_bytes());
        out.extend(self.transfer_size.to_le_bytes());
        out.extend(self.dfu_version.to_le_bytes());
        out
    }

    /// Download capable (`bitCanDnload`)
    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// Upload capable (`bitCanUpload`)
    #[doc(alias = "bitCanUpload")]
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// Device is able to communicate via USB after
    /// Manifestation phase (`bitManifestationTolerant`)
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device will perform a bus detach-attach sequence when it receives
    /// a `DFU_DETACH` request (`bitWillDetach`). The host must not issue a
    /// USB Reset.
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// Time, in milliseconds, that the device will wait after receipt of the
    /// `DFU_DETACH` request (`wDetachTimeOut`).
    #[doc(alias = "wDetachTimeout")]
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Maximum number of bytes that the device can accept per control-write
    /// transaction (`wTransferSize`).
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Numeric expression identifying the version of the DFU Specification
    /// release (`bcdDFUVersion`).
    #[doc(alias = "bcdDFUVersion")]
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }
}
