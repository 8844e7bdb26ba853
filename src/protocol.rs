use crate::error::{Error, Result};
use crate::transport::DfuTransport;
use crate::upload::{EventSender, UploadEvent};

use log::{debug, info};
use num_enum::{IntoPrimitive, TryFromPrimitive};

// As defined in nRF5_SDK_17.1.0_ddde560/components/libraries/bootloader/dfu/nrf_dfu_req_handler.h

/// DFU Object variants
#[derive(Debug, Copy, Clone, IntoPrimitive)]
#[repr(u8)]
enum Object {
    Command = 0x01,
    Data = 0x02,
}

/// DFU Command opcodes
#[allow(dead_code)]
#[derive(Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum OpCode {
    ProtocolVersion = 0x00,
    ObjectCreate = 0x01,
    ReceiptNotifSet = 0x02,
    CrcGet = 0x03,
    ObjectExecute = 0x04,
    ObjectSelect = 0x06,
    MtuGet = 0x07,
    ObjectWrite = 0x08,
    Ping = 0x09,
    HardwareVersion = 0x0A,
    FirmwareVersion = 0x0B,
    Abort = 0x0C,
}

/// DFU Response codes
#[derive(Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
enum ResponseCode {
    Invalid = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtError = 0x0B,
}

fn crc32(buf: &[u8], init: u32) -> u32 {
    let mut h = crc32fast::Hasher::new_with_initial(init);
    h.update(buf);
    h.finalize()
}

fn le_u32(bytes: &[u8], at: usize) -> Result<u32> {
    bytes
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| Error::Dfu("short response".into()))
}

// More requests are available when `NRF_DFU_PROTOCOL_REDUCED` is not defined
// in `nRF5_SDK_17.1.0_ddde560/components/libraries/bootloader/dfu/nrf_dfu_req_handler.c`
struct DfuTarget<'a, T: DfuTransport> {
    transport: &'a T,
}

impl<'a, T: DfuTransport> DfuTarget<'a, T> {
    fn verify_header(opcode: u8, bytes: &[u8]) -> Result<()> {
        if bytes.len() < 3 {
            return Err(Error::Dfu("invalid response length".into()));
        }
        if bytes[0] != 0x60 {
            return Err(Error::Dfu("invalid response header".into()));
        }
        if bytes[1] != opcode {
            return Err(Error::Dfu("invalid response opcode".into()));
        }
        let result = ResponseCode::try_from(bytes[2])
            .map_err(|_| Error::Dfu(format!("unknown result code {:#04x}", bytes[2])))?;
        if result != ResponseCode::Success {
            return Err(Error::Dfu(format!("{:?}", result)));
        }
        Ok(())
    }

    async fn write_data(&self, bytes: &[u8]) -> Result<()> {
        self.transport.write_data(bytes).await
    }

    async fn request_ctrl(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        for _retry in 0..3 {
            match self.transport.request_ctrl(bytes).await {
                // response timed out, retry
                Err(Error::Timeout(_)) => continue,
                other => return other,
            }
        }
        Err(Error::Dfu("No response after multiple tries".into()))
    }

    async fn set_prn(&self, value: u32) -> Result<()> {
        let opcode: u8 = OpCode::ReceiptNotifSet.into();
        let mut payload: Vec<u8> = vec![opcode];
        payload.extend_from_slice(&value.to_le_bytes());
        let response = self.request_ctrl(&payload).await?;
        Self::verify_header(opcode, &response)
    }

    async fn get_crc(&self) -> Result<(usize, u32)> {
        let opcode: u8 = OpCode::CrcGet.into();
        let response = self.request_ctrl(&[opcode]).await?;
        Self::verify_header(opcode, &response)?;
        let offset = le_u32(&response, 3)?;
        let checksum = le_u32(&response, 7)?;
        Ok((offset as usize, checksum))
    }

    async fn select_object(&self, obj_type: Object) -> Result<(usize, usize, u32)> {
        let opcode: u8 = OpCode::ObjectSelect.into();
        let arg: u8 = obj_type.into();
        let response = self.request_ctrl(&[opcode, arg]).await?;
        Self::verify_header(opcode, &response)?;
        let max_size = le_u32(&response, 3)?;
        let offset = le_u32(&response, 7)?;
        let checksum = le_u32(&response, 11)?;
        Ok((max_size as usize, offset as usize, checksum))
    }

    async fn create_object(&self, obj_type: Object, len: usize) -> Result<()> {
        let opcode: u8 = OpCode::ObjectCreate.into();
        let mut payload: Vec<u8> = vec![opcode, obj_type.into()];
        payload.extend_from_slice(&(len as u32).to_le_bytes());
        let response = self.request_ctrl(&payload).await?;
        Self::verify_header(opcode, &response)
    }

    async fn execute(&self) -> Result<()> {
        let opcode: u8 = OpCode::ObjectExecute.into();
        let response = self.request_ctrl(&[opcode]).await?;
        Self::verify_header(opcode, &response)
    }

    async fn verify_crc(&self, offset: usize, checksum: u32) -> Result<()> {
        let (off, crc) = self.get_crc().await?;
        if offset != off {
            return Err(Error::Dfu("Length mismatch".into()));
        }
        if checksum != crc {
            return Err(Error::Dfu("CRC mismatch".into()));
        }
        Ok(())
    }
}

/// Run DFU procedure as specified in
/// [DFU Protocol](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/lib_dfu_transport_ble.html)
pub async fn dfu_run(
    transport: &impl DfuTransport,
    init_pkt: &[u8],
    fw_pkt: &[u8],
    events: &EventSender,
) -> Result<()> {
    let target = DfuTarget { transport };
    target.set_prn(0).await?;

    target.create_object(Object::Command, init_pkt.len()).await?;
    target.write_data(init_pkt).await?;
    target.verify_crc(init_pkt.len(), crc32(init_pkt, 0)).await?;
    target.execute().await?;

    let (max_size, offset, checksum) = target.select_object(Object::Data).await?;
    if offset != 0 || checksum != 0 {
        return Err(Error::Dfu("DFU resumption is not supported".into()));
    }
    if max_size == 0 {
        return Err(Error::Dfu("target reported zero object size".into()));
    }
    let mut checksum: u32 = 0;
    let mut offset: usize = 0;

    info!("Started DFU upload of {} bytes", fw_pkt.len());
    let _ = events.send(UploadEvent::Log(format!("full flashing {} bytes", fw_pkt.len())));
    let mtu = transport.mtu().await;
    for chunk in fw_pkt.chunks(max_size) {
        target.create_object(Object::Data, chunk.len()).await?;
        for shard in chunk.chunks(mtu) {
            checksum = crc32(shard, checksum);
            offset += shard.len();
            target.write_data(shard).await?;
            target.verify_crc(offset, checksum).await?;
            debug!("Uploaded {}/{} bytes", offset, fw_pkt.len());
            let _ = events.send(UploadEvent::Progress {
                done: offset,
                total: fw_pkt.len(),
            });
        }
        target.execute().await?;
    }

    info!("Finished DFU upload of {} bytes", fw_pkt.len());
    Ok(())
}
