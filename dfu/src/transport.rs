use std::fmt;

use futures::{
    StreamExt, future,
    stream::{LocalBoxStream, Stream},
};
use log::{debug, trace};
use nusb::{
    hotplug::HotplugEvent,
    transfer::{ControlIn, ControlOut, ControlType, Recipient},
};

use crate::DEFAULT_TIMEOUT;
use crate::error::TransportError;

const GET_DESCRIPTOR: u8 = 0x06;

/// Setup packet of a control transfer, minus the length.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    pub control_type: ControlType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlRequest {
    /// Class request addressed to a DFU interface.
    pub fn class(request: u8, value: u16, interface: u8) -> Self {
        ControlRequest {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: interface as u16,
        }
    }

    /// Standard request addressed to the device.
    pub fn standard(request: u8, value: u16, index: u16) -> Self {
        ControlRequest {
            control_type: ControlType::Standard,
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }
}

/// Host-side access to one USB device.
///
/// Only the control-transfer primitives DFU needs are exposed. Every
/// operation may suspend; none is retried internally.
#[allow(async_fn_in_trait)]
pub trait Transport {
    type DeviceId: Clone + PartialEq + fmt::Debug;
    type Disconnects: Stream<Item = Self::DeviceId> + Unpin;

    fn device_id(&self) -> Self::DeviceId;

    async fn open(&mut self) -> Result<(), TransportError>;

    async fn select_configuration(
        &mut self,
        value: u8,
    ) -> Result<(), TransportError>;

    async fn claim_interface(&mut self, number: u8)
    -> Result<(), TransportError>;

    async fn select_alternate(
        &mut self,
        number: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError>;

    /// Returns the number of bytes written.
    async fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
    ) -> Result<usize, TransportError>;

    async fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
    ) -> Result<Vec<u8>, TransportError>;

    async fn reset(&self) -> Result<(), TransportError>;

    /// Release the device. Failures are logged, never returned.
    async fn close(&mut self);

    /// Subscribe to disconnect notifications for all devices.
    fn watch_disconnects(&self) -> Result<Self::Disconnects, TransportError>;
}

/// `(type, index, language)` of a standard GET_DESCRIPTOR request.
///
/// These go through `nusb::Device::get_descriptor`, which every platform
/// supports; every other request needs the claimed interface.
fn descriptor_request(request: &ControlRequest) -> Option<(u8, u8, u16)> {
    let get_descriptor =
        matches!(request.control_type, ControlType::Standard)
            && matches!(request.recipient, Recipient::Device)
            && request.request == GET_DESCRIPTOR;
    get_descriptor.then(|| {
        let [desc_type, index] = request.value.to_be_bytes();
        (desc_type, index, request.index)
    })
}

/// [`Transport`] backed by [`nusb`].
pub struct NusbTransport {
    info: nusb::DeviceInfo,
    device: Option<nusb::Device>,
    interface: Option<nusb::Interface>,
}

impl NusbTransport {
    pub fn new(info: nusb::DeviceInfo) -> Self {
        NusbTransport {
            info,
            device: None,
            interface: None,
        }
    }

    pub fn info(&self) -> &nusb::DeviceInfo {
        &self.info
    }

    fn device(&self) -> Result<&nusb::Device, TransportError> {
        self.device.as_ref().ok_or(TransportError::NotOpen)
    }

    fn interface(&self) -> Result<&nusb::Interface, TransportError> {
        self.device()?;
        self.interface.as_ref().ok_or(TransportError::NotClaimed)
    }
}

impl Transport for NusbTransport {
    type DeviceId = nusb::DeviceId;
    type Disconnects = LocalBoxStream<'static, nusb::DeviceId>;

    fn device_id(&self) -> nusb::DeviceId {
        self.info.id()
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        if self.device.is_none() {
            debug!(
                "Opening {:04x}:{:04x}",
                self.info.vendor_id(),
                self.info.product_id()
            );
            self.device = Some(self.info.open().await?);
        }
        Ok(())
    }

    async fn select_configuration(
        &mut self,
        value: u8,
    ) -> Result<(), TransportError> {
        let device = self.device()?;
        let active = device
            .active_configuration()
            .map(|config| config.configuration_value())
            .ok();
        if active != Some(value) {
            debug!("Selecting configuration {value}");
            device.set_configuration(value).await?;
        }
        Ok(())
    }

    async fn claim_interface(
        &mut self,
        number: u8,
    ) -> Result<(), TransportError> {
        let claimed = self
            .interface
            .as_ref()
            .is_some_and(|intf| intf.interface_number() == number);
        if !claimed {
            let interface =
                self.device()?.detach_and_claim_interface(number).await?;
            self.interface = Some(interface);
        }
        Ok(())
    }

    async fn select_alternate(
        &mut self,
        number: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError> {
        let interface = self
            .interface
            .as_ref()
            .filter(|intf| intf.interface_number() == number)
            .ok_or(TransportError::NotClaimed)?;
        interface.set_alt_setting(alt_setting).await?;
        Ok(())
    }

    async fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        trace!("OUT {request:?} ({} bytes)", data.len());
        let transfer = ControlOut {
            control_type: request.control_type,
            recipient: request.recipient,
            request: request.request,
            value: request.value,
            index: request.index,
            data,
        };
        self.interface()?
            .control_out(transfer, DEFAULT_TIMEOUT)
            .await?;
        Ok(data.len())
    }

    async fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        trace!("IN {request:?} ({length} bytes)");
        if let Some((desc_type, index, lang_id)) = descriptor_request(&request)
        {
            let mut data = self
                .device()?
                .get_descriptor(desc_type, index, lang_id, DEFAULT_TIMEOUT)
                .await?;
            data.truncate(length as usize);
            return Ok(data);
        }

        let transfer = ControlIn {
            control_type: request.control_type,
            recipient: request.recipient,
            request: request.request,
            value: request.value,
            index: request.index,
            length,
        };
        Ok(self
            .interface()?
            .control_in(transfer, DEFAULT_TIMEOUT)
            .await?)
    }

    async fn reset(&self) -> Result<(), TransportError> {
        debug!("Resetting device");
        self.device()?.reset().await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.interface = None;
        if self.device.take().is_some() {
            debug!(
                "Closed {:04x}:{:04x}",
                self.info.vendor_id(),
                self.info.product_id()
            );
        }
    }

    fn watch_disconnects(
        &self,
    ) -> Result<LocalBoxStream<'static, nusb::DeviceId>, TransportError> {
        let watch = nusb::watch_devices()?;
        Ok(watch
            .filter_map(|event| {
                future::ready(match event {
                    HotplugEvent::Disconnected(id) => Some(id),
                    _ => None,
                })
            })
            .boxed_local())
    }
}
