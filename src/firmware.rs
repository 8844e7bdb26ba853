//! Firmware images as produced by the block editors.
//!
//! A partial-flash capable image is an Intel HEX file whose program region
//! starts with a 16-byte magic record, immediately followed by a record
//! holding two 8-byte hashes:
//!
//! ```text
//! :10xxxx00 708E3B92C615A841C49866C975EE5197 cc   magic
//! :10xxxx00 <DAL hash 8B><program hash 8B>   cc   hashes
//! :10xxxx00 <program data ...>               cc
//! ...
//! :10xxxx00 41140E2FB82FA2BB...              cc   embedded source, not flashed
//! ```
//!
//! The DAL hash names the runtime the program was linked against. Partial
//! flashing is only valid when the device reports the same hash.

use crate::chunker::PacketChunker;
use crate::error::{Error, Result};
use crate::package::{self, DfuPackage};
use std::path::Path;

/// Opens the program region of a partial-flash capable image.
pub const PROGRAM_MAGIC: [u8; 16] = [
    0x70, 0x8E, 0x3B, 0x92, 0xC6, 0x15, 0xA8, 0x41, 0xC4, 0x98, 0x66, 0xC9, 0x75, 0xEE, 0x51, 0x97,
];

/// Start of the embedded source blob that trails the program.
pub const SOURCE_MAGIC: [u8; 8] = [0x41, 0x14, 0x0E, 0x2F, 0xB8, 0x2F, 0xA2, 0xBB];

/// Fill value for gaps in the program region (erased flash).
const FILL: u8 = 0xFF;

/// Largest hole tolerated inside the program region, one flash page.
const MAX_GAP: usize = 1024;

/// Intel HEX record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Data,
    EndOfFile,
    ExtendedSegment,
    StartSegment,
    ExtendedLinear,
    StartLinear,
}

impl TryFrom<u8> for RecordKind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0x00 => Ok(Self::Data),
            0x01 => Ok(Self::EndOfFile),
            0x02 => Ok(Self::ExtendedSegment),
            0x03 => Ok(Self::StartSegment),
            0x04 => Ok(Self::ExtendedLinear),
            0x05 => Ok(Self::StartLinear),
            other => Err(other),
        }
    }
}

/// A data record with its absolute address resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DataRecord {
    address: u32,
    data: Vec<u8>,
}

fn parse_line(line_no: usize, line: &str) -> Result<(RecordKind, u16, Vec<u8>)> {
    let err = |msg: &str| Error::Hex(format!("line {line_no}: {msg}"));

    let body = line.strip_prefix(':').ok_or_else(|| err("missing ':'"))?;
    if !body.is_ascii() || body.len() % 2 != 0 || body.len() < 10 {
        return Err(err("bad record length"));
    }
    let bytes = hex::decode(body).map_err(|e| err(&e.to_string()))?;

    let len = bytes[0] as usize;
    if bytes.len() != len + 5 {
        return Err(err("byte count does not match record"));
    }
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err(err("checksum mismatch"));
    }
    let offset = u16::from_be_bytes([bytes[1], bytes[2]]);
    let kind = RecordKind::try_from(bytes[3])
        .map_err(|t| err(&format!("unknown record type {t:#04x}")))?;
    Ok((kind, offset, bytes[4..4 + len].to_vec()))
}

/// Parse Intel HEX text into data records with absolute addresses.
fn parse_records(text: &str) -> Result<Vec<DataRecord>> {
    let mut base: u32 = 0;
    let mut records = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (kind, offset, data) = parse_line(idx + 1, line)?;
        match kind {
            RecordKind::Data => records.push(DataRecord {
                address: base.wrapping_add(offset as u32),
                data,
            }),
            RecordKind::EndOfFile => break,
            RecordKind::ExtendedSegment | RecordKind::ExtendedLinear => {
                if data.len() != 2 {
                    return Err(Error::Hex(format!("line {}: bad address record", idx + 1)));
                }
                let value = u16::from_be_bytes([data[0], data[1]]) as u32;
                base = if kind == RecordKind::ExtendedLinear {
                    value << 16
                } else {
                    value << 4
                };
            }
            RecordKind::StartSegment | RecordKind::StartLinear => {}
        }
    }
    Ok(records)
}

/// Metadata and program bytes needed for partial flashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFlashInfo {
    /// Hash of the DAL the program was built for.
    pub file_hash: [u8; 8],
    /// Hash of the program region. Logged only.
    pub program_hash: [u8; 8],
    /// Absolute flash address of the first program byte.
    pub program_start: u32,
    /// Contiguous program region, gaps filled with 0xFF.
    pub program: Vec<u8>,
}

impl PartialFlashInfo {
    fn locate(records: &[DataRecord]) -> Result<Option<Self>> {
        let Some(magic_idx) = records
            .iter()
            .position(|r| r.data.starts_with(&PROGRAM_MAGIC))
        else {
            return Ok(None);
        };

        let hashes = records
            .get(magic_idx + 1)
            .filter(|r| r.data.len() >= 16)
            .ok_or_else(|| Error::Hex("partial flash magic without hash record".into()))?;
        let mut file_hash = [0u8; 8];
        let mut program_hash = [0u8; 8];
        file_hash.copy_from_slice(&hashes.data[0..8]);
        program_hash.copy_from_slice(&hashes.data[8..16]);

        let program_start = records[magic_idx].address;
        let mut program: Vec<u8> = Vec::new();
        for record in &records[magic_idx..] {
            if record.data.starts_with(&SOURCE_MAGIC) {
                break;
            }
            // anything outside the run of program records (UICR, config) ends the region
            let Some(offset) = record.address.checked_sub(program_start).map(|o| o as usize) else {
                break;
            };
            if offset > program.len() + MAX_GAP {
                break;
            }
            let end = offset + record.data.len();
            if program.len() < end {
                program.resize(end, FILL);
            }
            program[offset..end].copy_from_slice(&record.data);
        }

        Ok(Some(Self {
            file_hash,
            program_hash,
            program_start,
            program,
        }))
    }
}

/// Firmware selected for one upload.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    raw: Vec<u8>,
    partial: Option<PartialFlashInfo>,
    dfu: Option<DfuPackage>,
}

impl FirmwareImage {
    pub fn from_hex(text: &str) -> Result<Self> {
        let records = parse_records(text)?;
        let partial = PartialFlashInfo::locate(&records)?;
        Ok(Self {
            raw: text.as_bytes().to_vec(),
            partial,
            dfu: None,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_hex(&text)
    }

    /// Attach the DFU package used when partial flashing is not possible.
    pub fn with_dfu_package(mut self, package: DfuPackage) -> Self {
        self.dfu = Some(package);
        self
    }

    pub fn with_dfu_package_file(self, path: impl AsRef<Path>) -> Result<Self> {
        Ok(self.with_dfu_package(package::extract(path)?))
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn partial_flash(&self) -> Option<&PartialFlashInfo> {
        self.partial.as_ref()
    }

    pub fn dfu_package(&self) -> Option<&DfuPackage> {
        self.dfu.as_ref()
    }

    /// Chunk plan over the program region, `None` without partial flash metadata.
    pub fn chunks(&self, chunk_size: usize) -> Option<PacketChunker<'_>> {
        self.partial
            .as_ref()
            .map(|info| PacketChunker::new(info.program_start, &info.program, chunk_size))
    }
}
