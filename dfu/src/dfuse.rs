use crate::connection::{DfuConnection, DfuState};
use crate::error::*;
use crate::memory::{DfuMemory, EraseStep};
use crate::transfer::FirmwareTransfer;
use crate::transport::Transport;

const DFUSE_CMD_GET_COMMANDS: u8 = 0x00;
const DFUSE_CMD_SET_ADDRESS: u8 = 0x21;
const DFUSE_CMD_ERASE_SECTOR: u8 = 0x41;

/// Block 0 carries commands, data blocks are numbered from 2.
const DFUSE_DATA_BLOCK: u16 = 2;

/// DfuSe special commands, sent as DNLOAD block 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuseCommand {
    GetCommands,
    SetAddress(u32),
    EraseSector(u32),
}

impl DfuseCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DfuseCommand::GetCommands => "GET_COMMANDS",
            DfuseCommand::SetAddress(_) => "SET_ADDRESS",
            DfuseCommand::EraseSector(_) => "ERASE_SECTOR",
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        let (command, address) = match *self {
            DfuseCommand::GetCommands => return vec![DFUSE_CMD_GET_COMMANDS],
            DfuseCommand::SetAddress(addr) => (DFUSE_CMD_SET_ADDRESS, addr),
            DfuseCommand::EraseSector(addr) => (DFUSE_CMD_ERASE_SECTOR, addr),
        };
        let mut payload = vec![command];
        payload.extend(address.to_le_bytes());
        payload
    }
}

/// Send `command` and wait until the device is no longer busy with it.
pub async fn dfuse_command<T: Transport>(
    conn: &DfuConnection<T>,
    command: DfuseCommand,
) -> Result<(), DfuError> {
    conn.dnload(0, &command.payload()).await?;
    let status = conn.poll_until(|state| state != DfuState::DnBusy).await?;
    if !status.is_ok() {
        return Err(ProtocolError::CommandFailed {
            command: command.name(),
            state: status.state,
            status: status.status,
        }
        .into());
    }
    Ok(())
}

/// Address-aware erase/program/read for ST DfuSe bootloaders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuseTransfer {
    memory: Option<DfuMemory>,
    start_address: Option<u32>,
}

impl DfuseTransfer {
    pub fn new(memory: Option<DfuMemory>, start_address: Option<u32>) -> Self {
        DfuseTransfer {
            memory,
            start_address,
        }
    }

    pub fn memory(&self) -> Option<&DfuMemory> {
        self.memory.as_ref()
    }

    pub fn start_address(&self) -> Option<u32> {
        self.start_address
    }

    fn memory_map(&self) -> Result<&DfuMemory, ConfigurationError> {
        self.memory.as_ref().ok_or(ConfigurationError::NoMemoryMap)
    }

    /// Start of a transfer: the configured address, else the start of
    /// the map. An address outside the map is only accepted when not
    /// `strict`.
    fn resolve_start<T: Transport>(
        &self,
        conn: &DfuConnection<T>,
        strict: bool,
    ) -> Result<u32, ConfigurationError> {
        let memory = self.memory_map()?;
        match self.start_address {
            None => {
                let start = memory.segments.first().start_addr();
                conn.reporter().warn(&format!(
                    "Using inferred start address 0x{start:08x}"
                ));
                Ok(start)
            }
            Some(addr) if memory.get_segment(addr).is_none() => {
                if strict {
                    return Err(ConfigurationError::AddressOutOfRange(addr));
                }
                conn.reporter().warn(&format!(
                    "Start address 0x{addr:08x} outside of memory map bounds"
                ));
                Ok(addr)
            }
            Some(addr) => Ok(addr),
        }
    }

    /// Readable bytes from `start_addr` through contiguous segments.
    pub fn max_read_size(&self, start_addr: u32) -> Result<u32, DfuError> {
        Ok(self.memory_map()?.max_read_size(start_addr))
    }

    /// Erase every sector overlapping `[start_addr, start_addr + length)`.
    ///
    /// The whole plan is computed first, so an address outside the map
    /// fails before any command is sent.
    pub async fn erase<T: Transport>(
        &self,
        conn: &DfuConnection<T>,
        start_addr: u32,
        length: u32,
    ) -> Result<(), DfuError> {
        let steps = self.memory_map()?.erase_steps(start_addr, length)?;
        // the steps tile the sector-aligned span exactly
        let total: usize = steps.iter().map(|step| step.len() as usize).sum();
        let mut erased = 0;
        if total > 0 {
            conn.reporter().progress(erased, Some(total));
        }

        for step in steps {
            if let EraseStep::Erase { address, size } = step {
                conn.reporter()
                    .debug(&format!("Erasing {size}B at 0x{address:08x}"));
                dfuse_command(conn, DfuseCommand::EraseSector(address)).await?;
            }
            erased = (erased + step.len() as usize).min(total);
            conn.reporter().progress(erased, Some(total));
        }
        Ok(())
    }
}

impl FirmwareTransfer for DfuseTransfer {
    async fn download<T: Transport>(
        &self,
        conn: &DfuConnection<T>,
        data: &[u8],
        _manifestation_tolerant: bool,
    ) -> Result<(), DfuError> {
        self.memory_map()?;
        let reporter = conn.reporter();
        reporter.info("Erasing DFU device memory");

        let start_address = self.resolve_start(conn, true)?;
        let expected_size = data.len();
        let length = u32::try_from(expected_size)
            .map_err(|_| ConfigurationError::AddressOutOfRange(start_address))?;
        self.erase(conn, start_address, length).await?;

        reporter.info("Copying data to DFU device");
        let mut address = start_address;
        let mut bytes_sent = 0;
        reporter.progress(bytes_sent, Some(expected_size));

        for chunk in data.chunks(conn.transfer_size() as usize) {
            dfuse_command(conn, DfuseCommand::SetAddress(address)).await?;
            reporter.debug(&format!("Set address to 0x{address:08x}"));

            let bytes_written = conn.dnload(DFUSE_DATA_BLOCK, chunk).await?;
            reporter.debug(&format!("Sent {bytes_written} bytes"));
            let status = conn.poll_until_idle(DfuState::DnloadIdle).await?;
            status.check("DFU DOWNLOAD")?;
            if bytes_written != chunk.len() {
                return Err(ProtocolError::ShortWrite {
                    written: bytes_written,
                    expected: chunk.len(),
                }
                .into());
            }

            address = address.wrapping_add(bytes_written as u32);
            bytes_sent += bytes_written;
            reporter.progress(bytes_sent, Some(expected_size));
        }
        reporter.info(&format!("Wrote {bytes_sent} bytes"));

        reporter.info("Manifesting new firmware");
        dfuse_command(conn, DfuseCommand::SetAddress(start_address)).await?;
        conn.dnload(0, &[]).await?;

        // the device usually leaves the bus right here
        match conn.poll_until(|state| state == DfuState::Manifest).await {
            Ok(status) if status.state == DfuState::Manifest => {
                reporter.debug("Device is manifesting");
            }
            Ok(status) => reporter.error(&format!(
                "DfuSe manifestation failed state={}, status={}",
                status.state, status.status
            )),
            Err(err) => reporter.error(&err.to_string()),
        }
        Ok(())
    }

    async fn upload<T: Transport>(
        &self,
        conn: &DfuConnection<T>,
        max_size: Option<usize>,
    ) -> Result<Vec<u8>, DfuError> {
        let start_address = self.resolve_start(conn, false)?;
        conn.reporter().info(&match max_size {
            Some(max) => format!(
                "Reading up to 0x{max:x} bytes starting at \
                 0x{start_address:08x}"
            ),
            None => format!("Reading from 0x{start_address:08x}"),
        });

        if conn.get_state().await? != DfuState::DfuIdle {
            conn.abort_to_idle().await?;
        }
        dfuse_command(conn, DfuseCommand::SetAddress(start_address)).await?;
        conn.abort_to_idle().await?;

        // the read address is the pointer plus (block - 2) * transfer size
        conn.do_upload(conn.transfer_size(), max_size, DFUSE_DATA_BLOCK)
            .await
    }
}

#[cfg(test)]
mod tests {
    use log::Level;

    use super::*;
    use crate::connection::DfuStatusCode;
    use crate::memory::parse_memory_descriptor;
    use crate::mock::{
        F4_FLASH, FLASH_BASE, MockDevice, RecordingReporter, Request,
    };

    fn f4_transfer(start: Option<u32>) -> DfuseTransfer {
        DfuseTransfer::new(parse_memory_descriptor(F4_FLASH).ok(), start)
    }

    fn connection(
        device: &MockDevice,
    ) -> (DfuConnection<MockDevice>, RecordingReporter) {
        let reporter = RecordingReporter::default();
        device.sim().open = true;
        let conn = DfuConnection::new(
            device.clone(),
            0,
            device.sim().transfer_size,
            Box::new(reporter.clone()),
        );
        (conn, reporter)
    }

    #[test]
    fn test_command_payloads() {
        assert_eq!(DfuseCommand::GetCommands.payload(), vec![0x00]);
        assert_eq!(
            DfuseCommand::SetAddress(0x0800_4000).payload(),
            vec![0x21, 0x00, 0x40, 0x00, 0x08]
        );
        assert_eq!(
            DfuseCommand::EraseSector(0x0801_0000).payload(),
            vec![0x41, 0x00, 0x00, 0x01, 0x08]
        );
    }

    #[test]
    fn test_command_waits_while_busy() {
        let device = MockDevice::dfuse(&[F4_FLASH], 0x0B);
        device.sim().busy_polls = 2;
        let (conn, _) = connection(&device);
        async_io::block_on(dfuse_command(&conn, DfuseCommand::GetCommands))
            .unwrap();
        assert_eq!(
            device.requests(),
            vec![
                Request::Dnload {
                    block: 0,
                    data: vec![0x00]
                },
                Request::GetStatus(DfuState::DnBusy),
                Request::GetStatus(DfuState::DnBusy),
                Request::GetStatus(DfuState::DnloadIdle),
            ]
        );
    }

    #[test]
    fn test_command_failure_names_command() {
        let device = MockDevice::dfuse(&[F4_FLASH], 0x0B);
        device.sim().fail_command = Some(0x41);
        let (conn, _) = connection(&device);
        let err = async_io::block_on(f4_transfer(None).erase(
            &conn,
            FLASH_BASE,
            100,
        ))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "special DfuSe command ERASE_SECTOR failed \
             state=dfuERROR, status=errTARGET"
        );
    }

    #[test]
    fn test_erase_skips_read_only_sectors() {
        let memory =
            parse_memory_descriptor("@Flash /0x08000000/2*4Ka,2*4Kg").unwrap();
        let transfer = DfuseTransfer::new(Some(memory), None);
        let device = MockDevice::dfuse(&[F4_FLASH], 0x0B);
        let (conn, reporter) = connection(&device);

        async_io::block_on(transfer.erase(&conn, FLASH_BASE, 0x4000)).unwrap();
        assert_eq!(device.sim().erased, vec![0x0800_2000, 0x0800_3000]);
        assert_eq!(
            reporter.progress_updates(),
            vec![
                (0, Some(0x4000)),
                (0x2000, Some(0x4000)),
                (0x3000, Some(0x4000)),
                (0x4000, Some(0x4000)),
            ]
        );
    }

    #[test]
    fn test_erase_progress_counts_span_only() {
        let memory =
            parse_memory_descriptor("@X /0x08000000/16*004Ka,04*004Kg")
                .unwrap();
        let transfer = DfuseTransfer::new(Some(memory), None);
        let device = MockDevice::dfuse(&[F4_FLASH], 0x0B);
        let (conn, reporter) = connection(&device);

        async_io::block_on(transfer.erase(&conn, FLASH_BASE, 0x100)).unwrap();
        assert!(device.sim().erased.is_empty());
        assert_eq!(
            reporter.progress_updates(),
            vec![(0, Some(0x1000)), (0x1000, Some(0x1000))]
        );
    }

    #[test]
    fn test_download() {
        let device = MockDevice::dfuse(&[F4_FLASH], 0x0B);
        let (conn, reporter) = connection(&device);
        let image: Vec<u8> = (0..40_000).map(|i| (i % 251) as u8).collect();

        async_io::block_on(f4_transfer(Some(FLASH_BASE)).download(
            &conn, &image, false,
        ))
        .unwrap();

        let sim = device.sim();
        assert_eq!(sim.erased, vec![0x0800_0000, 0x0800_4000, 0x0800_8000]);
        let mut expected_addr = FLASH_BASE;
        let mut readback: Vec<u8> = Vec::new();
        for (addr, data) in &sim.written {
            assert_eq!(*addr, expected_addr);
            expected_addr += data.len() as u32;
            readback.extend(data);
        }
        assert_eq!(readback, image);
        assert_eq!(sim.written.len(), 20);

        // every data block is preceded by SET_ADDRESS and uses block 2
        let dnloads: Vec<(u16, Vec<u8>)> = sim
            .requests
            .iter()
            .filter_map(|r| match r {
                Request::Dnload { block, data } => Some((*block, data.clone())),
                _ => None,
            })
            .skip(3)
            .collect();
        for pair in dnloads[..40].chunks(2) {
            assert_eq!(pair[0].0, 0);
            assert_eq!(pair[0].1[0], 0x21);
            assert_eq!(pair[1].0, 2);
        }
        assert_eq!(
            dnloads[40..],
            [
                (0, DfuseCommand::SetAddress(FLASH_BASE).payload()),
                (0, vec![])
            ]
        );
        assert_eq!(
            sim.requests.last(),
            Some(&Request::GetStatus(DfuState::Manifest))
        );
        assert!(!sim.requests.contains(&Request::Reset));
        drop(sim);
        assert!(reporter.lines_at(Level::Warn).is_empty());
        assert!(reporter.lines_at(Level::Error).is_empty());
    }

    #[test]
    fn test_download_inferred_start_address() {
        let device = MockDevice::dfuse(&[F4_FLASH], 0x0B);
        let (conn, reporter) = connection(&device);
        async_io::block_on(f4_transfer(None).download(&conn, &[0; 16], false))
            .unwrap();
        assert_eq!(
            reporter.lines_at(Level::Warn),
            vec!["Using inferred start address 0x08000000".to_string()]
        );
        assert_eq!(device.sim().written[0].0, FLASH_BASE);
    }

    #[test]
    fn test_download_rejects_address_outside_map() {
        let device = MockDevice::dfuse(&[F4_FLASH], 0x0B);
        let (conn, _) = connection(&device);
        let err = async_io::block_on(
            f4_transfer(Some(0x2000_0000)).download(&conn, &[0; 16], false),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DfuError::Configuration(ConfigurationError::AddressOutOfRange(
                0x2000_0000
            ))
        ));
        // image running past the end of the map is caught before erasing
        let err = async_io::block_on(f4_transfer(Some(0x080F_FF00)).download(
            &conn,
            &[0; 0x200],
            false,
        ))
        .unwrap_err();
        assert!(matches!(err, DfuError::Configuration(_)));
        assert!(device.requests().is_empty());
    }

    #[test]
    fn test_download_requires_memory_map() {
        let device = MockDevice::dfuse(&["DFU"], 0x0B);
        let (conn, _) = connection(&device);
        let err = async_io::block_on(
            DfuseTransfer::new(None, None).download(&conn, &[0; 16], false),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DfuError::Configuration(ConfigurationError::NoMemoryMap)
        ));
    }

    #[test]
    fn test_download_data_error() {
        let device = MockDevice::dfuse(&[F4_FLASH], 0x0B);
        device.sim().fail_block = Some((2, DfuStatusCode::ErrVerify));
        let (conn, _) = connection(&device);
        let err = async_io::block_on(
            f4_transfer(Some(FLASH_BASE)).download(&conn, &[0; 100], false),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "DFU DOWNLOAD failed state=dfuERROR, status=errVERIFY"
        );
    }

    #[test]
    fn test_manifest_poll_failure_is_logged() {
        let device = MockDevice::dfuse(&[F4_FLASH], 0x0B);
        device.sim().disconnect_on_manifest = true;
        let (conn, reporter) = connection(&device);
        async_io::block_on(
            f4_transfer(Some(FLASH_BASE)).download(&conn, &[0; 100], false),
        )
        .unwrap();
        assert_eq!(
            reporter.lines_at(Level::Error),
            vec!["device disconnected".to_string()]
        );
    }

    #[test]
    fn test_upload() {
        let device = MockDevice::dfuse(&[F4_FLASH], 0x0B);
        device.sim().upload_data = (0..8192).map(|i| (i % 253) as u8).collect();
        device.sim().state = DfuState::UploadIdle;
        let (conn, _) = connection(&device);

        let data = async_io::block_on(
            f4_transfer(Some(FLASH_BASE + 0x100)).upload(&conn, Some(5000)),
        )
        .unwrap();
        assert_eq!(data, device.sim().upload_data[0x100..0x100 + 5000]);

        let requests = device.requests();
        let first_upload = requests
            .iter()
            .position(|r| matches!(r, Request::Upload { .. }))
            .unwrap();
        assert_eq!(
            requests[..3],
            [Request::GetState, Request::Abort, Request::GetState]
        );
        assert_eq!(
            requests[first_upload - 2..first_upload],
            [Request::Abort, Request::GetState]
        );
        let uploads: Vec<&Request> = requests
            .iter()
            .filter(|r| matches!(r, Request::Upload { .. }))
            .collect();
        assert_eq!(
            uploads,
            vec![
                &Request::Upload {
                    block: 2,
                    length: 2048
                },
                &Request::Upload {
                    block: 3,
                    length: 2048
                },
                &Request::Upload {
                    block: 4,
                    length: 904
                },
            ]
        );
        assert_eq!(device.sim().state, DfuState::DfuIdle);
    }

    #[test]
    fn test_upload_outside_map_warns() {
        let device = MockDevice::dfuse(&[F4_FLASH], 0x0B);
        let (conn, reporter) = connection(&device);
        let data = async_io::block_on(
            f4_transfer(Some(0x2000_0000)).upload(&conn, Some(64)),
        )
        .unwrap();
        assert!(data.is_empty());
        assert_eq!(
            reporter.lines_at(Level::Warn),
            vec![
                "Start address 0x20000000 outside of memory map bounds"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_max_read_size() {
        assert_eq!(
            f4_transfer(None).max_read_size(FLASH_BASE).unwrap(),
            0x10_0000
        );
        assert!(
            DfuseTransfer::new(None, None)
                .max_read_size(FLASH_BASE)
                .is_err()
        );
    }
}
