use std::{fmt, sync::LazyLock};

use nonempty::NonEmpty;
use regex::Regex;

use crate::error::{ConfigurationError, DescriptorError};

static CONTIGUOUS_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"/\s*0x([0-9a-fA-F]{1,8})\s*/((?:\s*[0-9]+\s*\*\s*[0-9]+\s?[ BKM]\s*[a-g]\s*,?\s*)+)",
    )
    .expect("valid block regex")
});

static SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9]+)\s*\*\s*([0-9]+)\s?([ BKM])\s*([a-g])\s*,?\s*")
        .expect("valid segment regex")
});

/// DfuSe memory map, as encoded in an alternate setting name.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DfuMemory {
    pub name: String,
    pub segments: NonEmpty<DfuMemSegment>,
}

/// Run of equally sized sectors sharing the same access rights.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DfuMemSegment {
    start_addr: u32,
    end_addr: u32,
    sector_size: u32,
    mem_type: u8,
}

/// One step of an erase, in address order.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EraseStep {
    /// Issue `ERASE_SECTOR` for the sector at `address`.
    Erase { address: u32, size: u32 },
    /// Non-erasable memory, only progress advances.
    Skip { from: u32, to: u32 },
}

impl EraseStep {
    pub fn len(&self) -> u32 {
        match *self {
            EraseStep::Erase { size, .. } => size,
            EraseStep::Skip { from, to } => to - from,
        }
    }
}

impl DfuMemory {
    /// Segment containing `addr`.
    pub fn get_segment(&self, addr: u32) -> Option<&DfuMemSegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    pub fn sector_start(&self, addr: u32) -> Result<u32, ConfigurationError> {
        self.get_segment(addr)
            .map(|s| s.sector_start(addr))
            .ok_or(ConfigurationError::AddressOutOfRange(addr))
    }

    pub fn sector_end(&self, addr: u32) -> Result<u32, ConfigurationError> {
        self.get_segment(addr)
            .map(|s| s.sector_start(addr) + s.sector_size)
            .ok_or(ConfigurationError::AddressOutOfRange(addr))
    }

    pub fn first_writable_segment(&self) -> Option<&DfuMemSegment> {
        self.segments.iter().find(|s| s.writable())
    }

    /// Bytes readable from `start_addr` through contiguous readable segments.
    pub fn max_read_size(&self, start_addr: u32) -> u32 {
        let mut num_bytes = 0;
        for segment in &self.segments {
            if segment.contains(start_addr) {
                if !segment.readable() {
                    return 0;
                }
                num_bytes += segment.end_addr - start_addr;
            } else if num_bytes > 0
                && segment.start_addr == start_addr + num_bytes
            {
                if !segment.readable() {
                    break;
                }
                num_bytes += segment.end_addr - segment.start_addr;
            }
        }
        num_bytes
    }

    /// Sectors to erase (or skip) so that `[start_addr, start_addr + length)`
    /// can be programmed.
    pub fn erase_steps(
        &self,
        start_addr: u32,
        length: u32,
    ) -> Result<Vec<EraseStep>, ConfigurationError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let last_addr = start_addr
            .checked_add(length - 1)
            .ok_or(ConfigurationError::AddressOutOfRange(u32::MAX))?;
        let mut segment = self
            .get_segment(start_addr)
            .ok_or(ConfigurationError::AddressOutOfRange(start_addr))?;
        let mut addr = segment.sector_start(start_addr);
        let end_addr = self.sector_end(last_addr)?;

        let mut steps = Vec::new();
        while addr < end_addr {
            if segment.end_addr <= addr {
                segment = self
                    .get_segment(addr)
                    .ok_or(ConfigurationError::AddressOutOfRange(addr))?;
            }
            if !segment.erasable() {
                let to = segment.end_addr.min(end_addr);
                steps.push(EraseStep::Skip { from: addr, to });
                addr = to;
                continue;
            }
            let sector_addr = segment.sector_start(addr);
            steps.push(EraseStep::Erase {
                address: sector_addr,
                size: segment.sector_size,
            });
            addr = sector_addr + segment.sector_size;
        }
        Ok(steps)
    }

    pub fn total_size(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| (s.end_addr - s.start_addr) as u64)
            .sum()
    }
}

impl DfuMemSegment {
    pub fn start_addr(&self) -> u32 {
        self.start_addr
    }
    pub fn end_addr(&self) -> u32 {
        self.end_addr
    }
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }
    pub fn sectors(&self) -> u32 {
        (self.end_addr - self.start_addr) / self.sector_size
    }
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start_addr && addr < self.end_addr
    }
    fn sector_start(&self, addr: u32) -> u32 {
        let sector = (addr - self.start_addr) / self.sector_size;
        self.start_addr + sector * self.sector_size
    }
    pub fn readable(&self) -> bool {
        self.mem_type & 1 == 1
    }
    pub fn erasable(&self) -> bool {
        self.mem_type & 2 == 2
    }
    pub fn writable(&self) -> bool {
        self.mem_type & 4 == 4
    }
}

impl fmt::Display for DfuMemSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let props: Vec<&str> = [
            (self.readable(), "readable"),
            (self.erasable(), "erasable"),
            (self.writable(), "writable"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        write!(
            f,
            "0x{:08x}-0x{:08x} ({})",
            self.start_addr,
            self.end_addr - 1,
            if props.is_empty() {
                "inaccessible".to_string()
            } else {
                props.join(", ")
            }
        )
    }
}

/// Parse a DfuSe interface name such as
/// `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg`.
///
/// Each `/0xADDR/` block starts a contiguous run; within a run every
/// segment starts where the previous one ended.
pub fn parse_memory_descriptor(
    desc: &str,
) -> Result<DfuMemory, DescriptorError> {
    let not_memory = || DescriptorError::NotMemoryDescriptor(desc.into());

    let name_end = desc.find('/').ok_or_else(not_memory)?;
    if !desc.starts_with('@') {
        return Err(not_memory());
    }
    let name = desc[1..name_end].trim().to_string();

    let mut segments = Vec::new();
    for block in CONTIGUOUS_BLOCK.captures_iter(&desc[name_end..]) {
        let mut current_addr =
            u32::from_str_radix(&block[1], 16).map_err(|_| not_memory())?;

        for seg_match in SEGMENT.captures_iter(&block[2]) {
            let sectors: u32 = seg_match[1].parse().map_err(|_| not_memory())?;
            let sector_size: u32 =
                seg_match[2].parse().map_err(|_| not_memory())?;
            let multiplier = match &seg_match[3] {
                "K" => 1024,
                "M" => 1024 * 1024,
                _ => 1,
            };
            let sector_size = sector_size
                .checked_mul(multiplier)
                .filter(|&size| size > 0)
                .ok_or_else(not_memory)?;
            let mem_type = seg_match[4].as_bytes()[0] - b'a' + 1;
            let end_addr = sector_size
                .checked_mul(sectors)
                .and_then(|len| current_addr.checked_add(len))
                .ok_or_else(not_memory)?;

            segments.push(DfuMemSegment {
                start_addr: current_addr,
                end_addr,
                sector_size,
                mem_type,
            });
            current_addr = end_addr;
        }
    }

    NonEmpty::from_vec(segments)
        .map(|segments| DfuMemory { name, segments })
        .ok_or_else(not_memory)
}
