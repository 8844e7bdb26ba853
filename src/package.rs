use crate::error::{Error, Result};
use std::io::prelude::*;
use std::path::Path;

/// Application image for a full DFU transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuPackage {
    pub init_packet: Vec<u8>,
    pub firmware: Vec<u8>,
}

pub fn extract(path: impl AsRef<Path>) -> Result<DfuPackage> {
    let reader = std::fs::File::open(path)?;
    read(reader)
}

pub fn read<R: Read + Seek>(reader: R) -> Result<DfuPackage> {
    let mut zip = zip::ZipArchive::new(reader)?;

    let manifest_raw = zip.by_name("manifest.json")?;
    let manifest: serde_json::Value = serde_json::from_reader(manifest_raw)?;

    let bl = &manifest["manifest"]["bootloader"];
    if bl.is_object() {
        return Err(Error::Package("packages with bootloader are not supported".into()));
    }

    let sd = &manifest["manifest"]["softdevice"];
    if sd.is_object() {
        return Err(Error::Package("packages with softdevice are not supported".into()));
    }

    let app = &manifest["manifest"]["application"];
    let dat_name = app["dat_file"]
        .as_str()
        .ok_or_else(|| Error::Package("manifest has no application dat_file".into()))?;
    let bin_name = app["bin_file"]
        .as_str()
        .ok_or_else(|| Error::Package("manifest has no application bin_file".into()))?;

    let mut init_packet = Vec::new();
    zip.by_name(dat_name)?.read_to_end(&mut init_packet)?;

    let mut firmware = Vec::new();
    zip.by_name(bin_name)?.read_to_end(&mut firmware)?;

    Ok(DfuPackage { init_packet, firmware })
}
