use std::collections::HashMap;

use log::{debug, warn};

use crate::descriptor::*;
use crate::error::*;
use crate::interface::{DfuInterface, DfuMode};
use crate::session::DeviceFilter;
use crate::transport::{ControlRequest, NusbTransport, Transport};

const GET_DESCRIPTOR: u8 = 0x06;
const LANG_ID_EN_US: u16 = 0x0409;

/// `(configuration value, interface number, alternate setting)`
pub type InterfaceKey = (u8, u8, u8);

async fn get_descriptor<T: Transport>(
    transport: &T,
    descriptor_type: u8,
    index: u8,
    lang_id: u16,
    length: u16,
) -> Result<Vec<u8>, TransportError> {
    let value = (descriptor_type as u16) << 8 | index as u16;
    transport
        .control_in(
            ControlRequest::standard(GET_DESCRIPTOR, value, lang_id),
            length,
        )
        .await
}

pub async fn read_device_descriptor<T: Transport>(
    transport: &T,
) -> Result<DeviceDescriptor, DfuError> {
    let data = get_descriptor(
        transport,
        DT_DEVICE,
        0,
        0,
        DEVICE_DESC_LEN as u16,
    )
    .await?;
    Ok(DeviceDescriptor::parse(&data)?)
}

/// Read configuration `index`: the header first for `wTotalLength`,
/// then the whole descriptor set.
pub async fn read_configuration_descriptor<T: Transport>(
    transport: &T,
    index: u8,
) -> Result<ConfigDescriptor, DfuError> {
    let header =
        get_descriptor(transport, DT_CONFIGURATION, index, 0, 4).await?;
    if header.len() < 4 {
        return Err(DescriptorError::Truncated {
            kind: "configuration",
            len: header.len(),
            expected: 4,
        }
        .into());
    }
    let total_length = u16::from_le_bytes([header[2], header[3]]);
    let data =
        get_descriptor(transport, DT_CONFIGURATION, index, 0, total_length)
            .await?;
    Ok(ConfigDescriptor::parse(&data)?)
}

/// Read string descriptor `index`: one byte for `bLength`, then the rest.
pub async fn read_string_descriptor<T: Transport>(
    transport: &T,
    index: u8,
    lang_id: u16,
) -> Result<StringDescriptor, DfuError> {
    let header = get_descriptor(transport, DT_STRING, index, lang_id, 1).await?;
    let length = header.first().copied().ok_or(DescriptorError::Truncated {
        kind: "string",
        len: 0,
        expected: 1,
    })?;
    let data =
        get_descriptor(transport, DT_STRING, index, lang_id, length as u16)
            .await?;
    Ok(decode_string_descriptor(&data, lang_id)?)
}

async fn read_string<T: Transport>(transport: &T, index: u8) -> Option<String> {
    match read_string_descriptor(transport, index, LANG_ID_EN_US).await {
        Ok(StringDescriptor::Text(text)) => Some(text),
        Ok(StringDescriptor::Languages(_)) => None,
        Err(err) => {
            debug!("Unable to read string descriptor {index}: {err}");
            None
        }
    }
}

/// Names of every interface alternate setting of every configuration.
///
/// Unreadable names map to `None`.
pub async fn read_interface_names<T: Transport>(
    transport: &T,
    num_configurations: u8,
) -> HashMap<InterfaceKey, Option<String>> {
    let mut names = HashMap::new();
    for index in 0..num_configurations {
        let config = match read_configuration_descriptor(transport, index).await
        {
            Ok(config) => config,
            Err(err) => {
                warn!("Unable to read configuration {index}: {err}");
                continue;
            }
        };
        for (intf, _) in config.interfaces() {
            let name = match intf.string_index {
                0 => None,
                string_index => read_string(transport, string_index).await,
            };
            names.insert(
                (
                    config.configuration_value,
                    intf.interface_number,
                    intf.alternate_setting,
                ),
                name,
            );
        }
    }
    names
}

async fn claim_default_setting<T: Transport>(
    transport: &mut T,
    config: u8,
    number: u8,
) -> Result<(), TransportError> {
    transport.select_configuration(config).await?;
    transport.claim_interface(number).await?;
    transport.select_alternate(number, 0).await
}

/// Some devices only answer string requests once an interface is
/// claimed; retry the missing names with alternate setting 0 selected.
async fn fix_interface_names<T: Transport>(
    transport: &mut T,
    interfaces: &mut [DfuInterface],
    num_configurations: u8,
) {
    let Some(first) = interfaces.first() else {
        return;
    };
    if !interfaces.iter().any(DfuInterface::needs_name) {
        return;
    }
    let (config, number) = (first.config(), first.interface());
    if let Err(err) = claim_default_setting(transport, config, number).await {
        warn!("Unable to claim interface {number} to read its name: {err}");
        return;
    }

    let names = read_interface_names(transport, num_configurations).await;
    for intf in interfaces.iter_mut().filter(|intf| intf.needs_name()) {
        let key = (intf.config(), intf.interface(), intf.alt_setting());
        if let Some(name) = names.get(&key) {
            intf.set_name(name.clone());
        }
    }
}

/// DFU device representation
pub struct DfuDevice<T> {
    transport: T,
    descriptor: DeviceDescriptor,
    configurations: Vec<ConfigDescriptor>,
    interfaces: Vec<DfuInterface>,
}

impl<T: Transport> DfuDevice<T> {
    /// Read the descriptors and interface names of a device.
    ///
    /// The transport is closed again afterwards. Returns `None` when the
    /// device has no DFU interface.
    pub async fn discover(mut transport: T) -> Result<Option<Self>, DfuError> {
        transport.open().await?;
        let result = Self::read_descriptors(&mut transport).await;
        transport.close().await;

        let (descriptor, configurations, interfaces) = result?;
        if interfaces.is_empty() {
            return Ok(None);
        }
        Ok(Some(DfuDevice {
            transport,
            descriptor,
            configurations,
            interfaces,
        }))
    }

    async fn read_descriptors(
        transport: &mut T,
    ) -> Result<
        (DeviceDescriptor, Vec<ConfigDescriptor>, Vec<DfuInterface>),
        DfuError,
    > {
        let descriptor = read_device_descriptor(transport).await?;
        let mut configurations =
            Vec::with_capacity(descriptor.num_configurations as usize);
        for index in 0..descriptor.num_configurations {
            configurations
                .push(read_configuration_descriptor(transport, index).await?);
        }

        let mut interfaces = find_dfu_interfaces(&configurations);
        for intf in interfaces.iter_mut() {
            if intf.name_index() != 0 {
                let name = read_string(transport, intf.name_index()).await;
                intf.set_name(name);
            }
        }
        fix_interface_names(
            transport,
            &mut interfaces,
            descriptor.num_configurations,
        )
        .await;

        Ok((descriptor, configurations, interfaces))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }

    pub fn configurations(&self) -> &[ConfigDescriptor] {
        &self.configurations
    }

    /// DFU interfaces and alternate settings combined
    pub fn interfaces(&self) -> &[DfuInterface] {
        &self.interfaces
    }

    /// Pick the interface to program.
    ///
    /// With several DFU interfaces, the first whose name contains
    /// `flash_token` wins; no match is an error.
    pub fn select_interface(
        &self,
        flash_token: &str,
    ) -> Result<&DfuInterface, ConfigurationError> {
        match self.interfaces.as_slice() {
            [] => Err(ConfigurationError::NoDfuInterfaces),
            [only] => Ok(only),
            many => many
                .iter()
                .find(|intf| {
                    intf.name().is_some_and(|name| name.contains(flash_token))
                })
                .ok_or_else(|| {
                    ConfigurationError::NoFlashInterface(
                        flash_token.to_string(),
                    )
                }),
        }
    }

    /// Functional descriptor for `interface`, if the device has one.
    pub fn functional_descriptor(
        &self,
        interface: &DfuInterface,
    ) -> Option<DfuDescriptor> {
        self.configurations
            .iter()
            .find(|c| c.configuration_value == interface.config())
            .and_then(|c| {
                c.dfu_descriptor(interface.interface(), interface.alt_setting())
            })
    }

    /// DfuSe is a DFU-mode interface advertising DFU version 1.1a.
    pub fn is_dfuse(&self, interface: &DfuInterface) -> bool {
        interface.mode() == DfuMode::Dfu
            && self
                .functional_descriptor(interface)
                .is_some_and(|desc| desc.dfu_version() == DFUSE_VERSION_NUMBER)
    }
}

impl DfuDevice<NusbTransport> {
    pub fn device_info(&self) -> &nusb::DeviceInfo {
        self.transport.info()
    }

    pub fn id(&self) -> nusb::DeviceId {
        self.device_info().id()
    }

    pub fn bus_id(&self) -> &str {
        self.device_info().bus_id()
    }

    pub fn device_address(&self) -> u8 {
        self.device_info().device_address()
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.device_info().serial_number()
    }

    pub fn product_string(&self) -> Option<&str> {
        self.device_info().product_string()
    }
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

/// Enumerate DFU devices selected by `filter`.
///
/// Devices that cannot be opened are skipped with a warning.
pub async fn find_dfu_devices(
    filter: &DeviceFilter,
) -> Result<Vec<DfuDevice<NusbTransport>>, DfuError> {
    let candidates: Vec<nusb::DeviceInfo> = nusb::list_devices()
        .await
        .map_err(TransportError::from)?
        .filter(|dev| {
            filter.matches(
                dev.vendor_id(),
                dev.product_id(),
                dev.serial_number(),
            )
        })
        .filter(is_dfu_device)
        .collect();

    let mut devices = Vec::with_capacity(candidates.len());
    for info in candidates {
        let (vid, pid) = (info.vendor_id(), info.product_id());
        match DfuDevice::discover(NusbTransport::new(info)).await {
            Ok(Some(device)) => devices.push(device),
            Ok(None) => {}
            Err(err) => warn!("Skipping {vid:04x}:{pid:04x}: {err}"),
        }
    }
    Ok(devices)
}
