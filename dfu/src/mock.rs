//! Scripted DFU 1.1 / DfuSe device behind the [`Transport`] trait.

use std::{
    cell::{Cell, RefCell, RefMut},
    collections::HashMap,
    rc::Rc,
};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use log::Level;
use nusb::transfer::ControlType;

use crate::connection::{DfuState, DfuStatusCode};
use crate::descriptor::*;
use crate::error::TransportError;
use crate::report::Reporter;
use crate::transport::{ControlRequest, Transport};

pub(crate) const MOCK_DEVICE_ID: u32 = 7;
pub(crate) const FLASH_BASE: u32 = 0x0800_0000;
pub(crate) const F4_FLASH: &str =
    "@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg";
pub(crate) const OPTION_BYTES: &str = "@Option Bytes  /0x1FFFC000/01*016 e";

const GET_DESCRIPTOR: u8 = 0x06;
const FIRST_NAME_INDEX: u8 = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Request {
    Open,
    SelectConfiguration(u8),
    ClaimInterface(u8),
    SelectAlternate(u8, u8),
    Detach,
    Dnload { block: u16, data: Vec<u8> },
    Upload { block: u16, length: u16 },
    /// Carries the state the device answered with.
    GetStatus(DfuState),
    ClrStatus,
    GetState,
    Abort,
    GetDescriptor { descriptor_type: u8, index: u8 },
    Reset,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResetBehavior {
    /// Reset succeeds and the device leaves the bus.
    Reenumerate,
    /// Reset succeeds and nothing else happens.
    Ignore,
    FailDisconnected,
    FailStall,
}

pub(crate) struct DeviceSim {
    pub id: u32,
    pub connected: bool,
    pub open: bool,
    pub claimed: Option<u8>,
    pub state: DfuState,
    pub status: DfuStatusCode,
    pub poll_timeout: u32,

    pub device_descriptor: Vec<u8>,
    pub configurations: Vec<Vec<u8>>,
    pub strings: HashMap<u8, String>,
    pub strings_need_claim: bool,

    pub dfuse: bool,
    pub transfer_size: u16,
    pub manifestation_tolerant: bool,
    pub wait_reset_when_tolerant: bool,

    /// GETSTATUS answers reporting dfuDNBUSY after every DNLOAD.
    pub busy_polls: u32,
    busy_remaining: u32,
    pub fail_block: Option<(u16, DfuStatusCode)>,
    pub fail_command: Option<u8>,
    pending_error: Option<DfuStatusCode>,
    pub disconnect_on_manifest: bool,
    pub reset: ResetBehavior,
    pub abort_ignored: bool,

    pub downloaded: Vec<u8>,
    pub address_pointer: u32,
    pub erased: Vec<u32>,
    pub written: Vec<(u32, Vec<u8>)>,
    pub upload_data: Vec<u8>,
    pub upload_base: u32,
    upload_pos: usize,
    pub short_block_at: Option<u16>,

    pub requests: Vec<Request>,
    pub violations: Vec<String>,
    subscribers: Vec<UnboundedSender<u32>>,
}

impl DeviceSim {
    fn require_open(&self) -> Result<(), TransportError> {
        if !self.connected {
            Err(TransportError::Disconnected)
        } else if !self.open {
            Err(TransportError::NotOpen)
        } else {
            Ok(())
        }
    }

    fn stall(&mut self) -> TransportError {
        self.state = DfuState::Error;
        self.status = DfuStatusCode::ErrStalledPkt;
        TransportError::Stall
    }

    pub(crate) fn disconnect(&mut self) {
        self.connected = false;
        self.open = false;
        self.claimed = None;
        let id = self.id;
        self.subscribers
            .retain(|tx| tx.unbounded_send(id).is_ok());
    }

    fn dnload(
        &mut self,
        block: u16,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        self.requests.push(Request::Dnload {
            block,
            data: data.to_vec(),
        });
        match self.state {
            DfuState::DnBusy => {
                self.violations
                    .push(format!("DNLOAD block {block} while dfuDNBUSY"));
                return Err(self.stall());
            }
            DfuState::DnloadIdle => {}
            DfuState::DfuIdle if !data.is_empty() => {}
            _ => return Err(self.stall()),
        }

        if data.is_empty() {
            self.state = DfuState::ManifestSync;
            return Ok(0);
        }

        if self.dfuse && block == 0 {
            self.dfuse_command(data)?;
        } else if self.dfuse && block >= 2 {
            let offset = (block as u32 - 2) * self.transfer_size as u32;
            self.written
                .push((self.address_pointer + offset, data.to_vec()));
        } else if self.dfuse {
            return Err(self.stall());
        } else {
            self.downloaded.extend_from_slice(data);
        }

        if let Some((failing, status)) = self.fail_block {
            let is_data = !self.dfuse || block >= 2;
            if is_data && failing == block {
                self.pending_error = Some(status);
            }
        }
        self.state = DfuState::DnloadSync;
        self.busy_remaining = self.busy_polls;
        Ok(data.len())
    }

    fn dfuse_command(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.fail_command == Some(data[0]) {
            self.pending_error = Some(DfuStatusCode::ErrTarget);
            return Ok(());
        }
        let param = || u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        match (data[0], data.len()) {
            (0x00, 1) => {}
            (0x21, 5) => self.address_pointer = param(),
            (0x41, 5) => self.erased.push(param()),
            _ => return Err(self.stall()),
        }
        Ok(())
    }

    fn upload(
        &mut self,
        block: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        self.requests.push(Request::Upload { block, length });
        match self.state {
            DfuState::DnBusy => {
                self.violations
                    .push(format!("UPLOAD block {block} while dfuDNBUSY"));
                return Err(self.stall());
            }
            DfuState::DfuIdle | DfuState::UploadIdle => {}
            _ => return Err(self.stall()),
        }

        let start = if self.dfuse {
            if block < 2 {
                return Err(self.stall());
            }
            let offset = (block as u32 - 2) * self.transfer_size as u32;
            (self.address_pointer + offset).saturating_sub(self.upload_base)
                as usize
        } else {
            self.upload_pos
        };
        let mut length = length as usize;
        if self.short_block_at == Some(block) {
            length /= 2;
        }
        let end = (start + length).min(self.upload_data.len());
        let chunk = self
            .upload_data
            .get(start..end)
            .unwrap_or_default()
            .to_vec();
        self.upload_pos = start + chunk.len();

        self.state = if chunk.len() < length {
            DfuState::DfuIdle
        } else {
            DfuState::UploadIdle
        };
        Ok(chunk)
    }

    fn get_status(&mut self) -> Result<Vec<u8>, TransportError> {
        let reported = match self.state {
            DfuState::DnloadSync | DfuState::DnBusy => {
                if self.busy_remaining > 0 {
                    self.busy_remaining -= 1;
                    DfuState::DnBusy
                } else if let Some(status) = self.pending_error.take() {
                    self.status = status;
                    DfuState::Error
                } else {
                    DfuState::DnloadIdle
                }
            }
            DfuState::ManifestSync => {
                if self.disconnect_on_manifest {
                    self.disconnect();
                    return Err(TransportError::Disconnected);
                }
                DfuState::Manifest
            }
            DfuState::Manifest => {
                if self.manifestation_tolerant && !self.wait_reset_when_tolerant
                {
                    DfuState::DfuIdle
                } else {
                    DfuState::ManifestWaitReset
                }
            }
            state => state,
        };
        self.state = reported;
        self.requests.push(Request::GetStatus(reported));

        let timeout = self.poll_timeout.to_le_bytes();
        Ok(vec![
            self.status.code(),
            timeout[0],
            timeout[1],
            timeout[2],
            reported.code(),
            0,
        ])
    }

    fn get_descriptor(
        &mut self,
        value: u16,
        lang_id: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let descriptor_type = (value >> 8) as u8;
        let index = value as u8;
        self.requests.push(Request::GetDescriptor {
            descriptor_type,
            index,
        });

        let data = match descriptor_type {
            DT_DEVICE => self.device_descriptor.clone(),
            DT_CONFIGURATION => self
                .configurations
                .get(index as usize)
                .cloned()
                .ok_or(TransportError::Stall)?,
            DT_STRING if index == 0 => vec![4, DT_STRING, 0x09, 0x04],
            DT_STRING => {
                if self.strings_need_claim && self.claimed.is_none() {
                    return Err(TransportError::Stall);
                }
                if lang_id != 0x0409 {
                    return Err(TransportError::Stall);
                }
                let text =
                    self.strings.get(&index).ok_or(TransportError::Stall)?;
                string_descriptor(text)
            }
            _ => return Err(TransportError::Stall),
        };
        Ok(data[..data.len().min(length as usize)].to_vec())
    }
}

pub(crate) fn string_descriptor(text: &str) -> Vec<u8> {
    let mut out = vec![0, DT_STRING];
    out.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
    out[0] = out.len() as u8;
    out
}

/// Shared handle to a [`DeviceSim`]; clones observe the same device.
#[derive(Clone)]
pub(crate) struct MockDevice {
    sim: Rc<RefCell<DeviceSim>>,
}

impl MockDevice {
    fn build(
        protocol: u8,
        names: &[&str],
        functional: Option<DfuDescriptor>,
    ) -> Self {
        let device_descriptor = DeviceDescriptor {
            usb_version: 0x0200,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size: 64,
            vendor_id: 0x0483,
            product_id: 0xDF11,
            device_version: 0x2200,
            manufacturer_index: 1,
            product_index: 2,
            serial_number_index: 3,
            num_configurations: 1,
        };

        let mut descriptors: Vec<Descriptor> = names
            .iter()
            .enumerate()
            .map(|(alt, _)| {
                Descriptor::Interface(InterfaceDescriptor {
                    interface_number: 0,
                    alternate_setting: alt as u8,
                    num_endpoints: 0,
                    class: DFU_CLASS,
                    subclass: DFU_SUBCLASS,
                    protocol,
                    string_index: FIRST_NAME_INDEX + alt as u8,
                })
            })
            .collect();
        if let Some(desc) = &functional {
            descriptors.push(Descriptor::Dfu(desc.clone()));
        }
        let config = ConfigDescriptor {
            num_interfaces: 1,
            configuration_value: 1,
            string_index: 0,
            attributes: 0x80,
            max_power: 50,
            descriptors,
        };

        let mut strings = HashMap::from([
            (1, "STMicroelectronics".to_string()),
            (2, "STM32 BOOTLOADER".to_string()),
            (3, "3574364C3034".to_string()),
        ]);
        for (alt, name) in names.iter().enumerate() {
            strings.insert(FIRST_NAME_INDEX + alt as u8, name.to_string());
        }

        let functional = functional.unwrap_or_default();

        MockDevice {
            sim: Rc::new(RefCell::new(DeviceSim {
                id: MOCK_DEVICE_ID,
                connected: true,
                open: false,
                claimed: None,
                state: if protocol == 1 {
                    DfuState::AppIdle
                } else {
                    DfuState::DfuIdle
                },
                status: DfuStatusCode::Ok,
                poll_timeout: 0,
                device_descriptor: device_descriptor.to_bytes(),
                configurations: vec![config.to_bytes()],
                strings,
                strings_need_claim: false,
                dfuse: functional.dfu_version() == DFUSE_VERSION_NUMBER,
                transfer_size: functional.transfer_size(),
                manifestation_tolerant: functional.manifestation_tolerant(),
                wait_reset_when_tolerant: false,
                busy_polls: 0,
                busy_remaining: 0,
                fail_block: None,
                fail_command: None,
                pending_error: None,
                disconnect_on_manifest: false,
                reset: ResetBehavior::Reenumerate,
                abort_ignored: false,
                downloaded: Vec::new(),
                address_pointer: 0,
                erased: Vec::new(),
                written: Vec::new(),
                upload_data: Vec::new(),
                upload_base: FLASH_BASE,
                upload_pos: 0,
                short_block_at: None,
                requests: Vec::new(),
                violations: Vec::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    /// Plain DFU 1.1 bootloader with one alternate setting.
    pub(crate) fn dfu(attributes: u8) -> Self {
        Self::dfu_sized(attributes, 1024)
    }

    pub(crate) fn dfu_sized(attributes: u8, transfer_size: u16) -> Self {
        Self::build(
            2,
            &["DFU"],
            Some(DfuDescriptor::new(attributes, 1000, transfer_size, 0x0110)),
        )
    }

    /// DfuSe bootloader exposing one alternate setting per name.
    pub(crate) fn dfuse(names: &[&str], attributes: u8) -> Self {
        Self::build(
            2,
            names,
            Some(DfuDescriptor::new(
                attributes,
                255,
                2048,
                DFUSE_VERSION_NUMBER,
            )),
        )
    }

    /// Application firmware with a runtime DFU interface.
    pub(crate) fn runtime(attributes: u8) -> Self {
        Self::build(
            1,
            &["Runtime"],
            Some(DfuDescriptor::new(attributes, 500, 1024, 0x0110)),
        )
    }

    /// DFU bootloader without a functional descriptor.
    pub(crate) fn without_functional_descriptor() -> Self {
        Self::build(2, &["DFU"], None)
    }

    pub(crate) fn sim(&self) -> RefMut<'_, DeviceSim> {
        self.sim.borrow_mut()
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.sim.borrow().requests.clone()
    }

    pub(crate) fn clear_requests(&self) {
        self.sim().requests.clear();
    }

    /// Deliver a disconnect notification without changing the device.
    pub(crate) fn emit_disconnect(&self) {
        let mut sim = self.sim();
        let id = sim.id;
        sim.subscribers.retain(|tx| tx.unbounded_send(id).is_ok());
    }
}

impl Transport for MockDevice {
    type DeviceId = u32;
    type Disconnects = UnboundedReceiver<u32>;

    fn device_id(&self) -> u32 {
        self.sim.borrow().id
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let mut sim = self.sim();
        sim.requests.push(Request::Open);
        if !sim.connected {
            return Err(TransportError::Disconnected);
        }
        sim.open = true;
        Ok(())
    }

    async fn select_configuration(
        &mut self,
        value: u8,
    ) -> Result<(), TransportError> {
        let mut sim = self.sim();
        sim.require_open()?;
        sim.requests.push(Request::SelectConfiguration(value));
        Ok(())
    }

    async fn claim_interface(
        &mut self,
        number: u8,
    ) -> Result<(), TransportError> {
        let mut sim = self.sim();
        sim.require_open()?;
        sim.requests.push(Request::ClaimInterface(number));
        sim.claimed = Some(number);
        Ok(())
    }

    async fn select_alternate(
        &mut self,
        number: u8,
        alt_setting: u8,
    ) -> Result<(), TransportError> {
        let mut sim = self.sim();
        sim.require_open()?;
        if sim.claimed != Some(number) {
            return Err(TransportError::NotClaimed);
        }
        sim.requests.push(Request::SelectAlternate(number, alt_setting));
        Ok(())
    }

    async fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        let mut sim = self.sim();
        sim.require_open()?;
        if !matches!(request.control_type, ControlType::Class) {
            return Err(TransportError::Stall);
        }
        match request.request {
            0 => {
                sim.requests.push(Request::Detach);
                if sim.state != DfuState::AppIdle {
                    return Err(sim.stall());
                }
                sim.state = DfuState::AppDetach;
                Ok(0)
            }
            1 => sim.dnload(request.value, data),
            4 => {
                sim.requests.push(Request::ClrStatus);
                if sim.state == DfuState::Error {
                    sim.state = DfuState::DfuIdle;
                    sim.status = DfuStatusCode::Ok;
                }
                Ok(0)
            }
            6 => {
                sim.requests.push(Request::Abort);
                let idle = matches!(
                    sim.state,
                    DfuState::DfuIdle
                        | DfuState::DnloadSync
                        | DfuState::DnloadIdle
                        | DfuState::ManifestSync
                        | DfuState::UploadIdle
                );
                if idle && !sim.abort_ignored {
                    sim.state = DfuState::DfuIdle;
                }
                Ok(0)
            }
            _ => Err(sim.stall()),
        }
    }

    async fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let mut sim = self.sim();
        sim.require_open()?;
        match (request.control_type, request.request) {
            (ControlType::Standard, GET_DESCRIPTOR) => {
                sim.get_descriptor(request.value, request.index, length)
            }
            (ControlType::Class, 2) => sim.upload(request.value, length),
            (ControlType::Class, 3) => sim.get_status(),
            (ControlType::Class, 5) => {
                sim.requests.push(Request::GetState);
                Ok(vec![sim.state.code()])
            }
            _ => Err(TransportError::Stall),
        }
    }

    async fn reset(&self) -> Result<(), TransportError> {
        let mut sim = self.sim();
        sim.requests.push(Request::Reset);
        if !sim.connected {
            return Err(TransportError::Disconnected);
        }
        match sim.reset {
            ResetBehavior::Reenumerate => {
                sim.disconnect();
                Ok(())
            }
            ResetBehavior::Ignore => Ok(()),
            ResetBehavior::FailDisconnected => {
                sim.disconnect();
                Err(TransportError::Disconnected)
            }
            ResetBehavior::FailStall => Err(TransportError::Stall),
        }
    }

    async fn close(&mut self) {
        let mut sim = self.sim();
        sim.requests.push(Request::Close);
        sim.open = false;
        sim.claimed = None;
    }

    fn watch_disconnects(
        &self,
    ) -> Result<UnboundedReceiver<u32>, TransportError> {
        let (tx, rx) = mpsc::unbounded();
        self.sim().subscribers.push(tx);
        Ok(rx)
    }
}

/// [`Reporter`] that keeps everything it is given.
#[derive(Clone, Default)]
pub(crate) struct RecordingReporter {
    lines: Rc<RefCell<Vec<(Level, String)>>>,
    progress: Rc<RefCell<Vec<(usize, Option<usize>)>>>,
    disconnects: Rc<Cell<u32>>,
}

impl RecordingReporter {
    pub(crate) fn lines_at(&self, level: Level) -> Vec<String> {
        self.lines
            .borrow()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub(crate) fn progress_updates(&self) -> Vec<(usize, Option<usize>)> {
        self.progress.borrow().clone()
    }

    pub(crate) fn disconnects(&self) -> u32 {
        self.disconnects.get()
    }
}

impl Reporter for RecordingReporter {
    fn log(&self, level: Level, message: &str) {
        self.lines.borrow_mut().push((level, message.to_string()));
    }

    fn progress(&self, done: usize, total: Option<usize>) {
        self.progress.borrow_mut().push((done, total));
    }

    fn disconnected(&self) {
        self.disconnects.set(self.disconnects.get() + 1);
    }
}
