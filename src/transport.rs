use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// nRF DFU service & characteristic UUIDs
///
/// from [DFU BLE Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/group__nrf__dfu__ble.html)
/// and [Buttonless DFU Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/service_dfu.html)
pub mod dfu_uuids {
    /// Control Point Characteristic
    pub const CTRL_PT: uuid::Uuid = uuid::Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
    /// Data Characteristic
    pub const DATA_PT: uuid::Uuid = uuid::Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);
    /// Buttonless DFU trigger without bonds Characteristic
    pub const BTTNLSS: uuid::Uuid = uuid::Uuid::from_u128(0x8EC90003_F315_4F60_9FB8_838830DAEA50);
}

/// Calliope mini / micro:bit characteristic UUIDs
pub mod calliope_uuids {
    /// Partial Flashing Characteristic (write without response + notify)
    pub const PARTIAL_FLASH: uuid::Uuid = uuid::Uuid::from_u128(0xE97D3B10_251D_470A_A062_FA1922DFA9A8);
    /// DFU Control Characteristic, reading it triggers pairing, writing 0x01 enters the bootloader
    pub const DFU_CONTROL: uuid::Uuid = uuid::Uuid::from_u128(0xE95D93B1_251D_470A_A062_FA1922DFA9A8);
}

/// Connection lifecycle as seen by the link layer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeviceState {
    Discovered,
    UsageReady,
    WillReset,
    Disconnected,
}

/// Everything a partial flashing session reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineInput {
    /// Value notified on the partial flashing characteristic.
    Notification(Vec<u8>),
    Lifecycle(DeviceState),
    Cancel,
}

/// Device connection used by the partial flashing engine
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Whether the device exposes the partial flashing characteristic
    fn has_partial_flash(&self) -> bool;
    /// Start forwarding notifications and lifecycle changes into `inputs`
    async fn listen(&self, inputs: mpsc::Sender<EngineInput>) -> Result<()>;
    /// Enable notifications on the partial flashing characteristic
    async fn subscribe(&self) -> Result<()>;
    async fn unsubscribe(&self) -> Result<()>;
    /// Write a frame to the partial flashing characteristic
    async fn send(&self, frame: &[u8], require_ack: bool) -> Result<()>;
    /// The device is about to reset; report `UsageReady` once it is back
    fn announce_reset(&self);
    /// Read the DFU control point so the OS asks for bonding
    async fn trigger_pairing(&self) -> Result<()>;
    /// Ask the application to restart into its DFU bootloader
    async fn enter_bootloader(&self) -> Result<()>;
}

/// nRF DFU transport interface
#[async_trait]
pub trait DfuTransport: Send + Sync {
    /// MTU of the BLE link
    async fn mtu(&self) -> usize;
    /// Send data to data point
    async fn write_data(&self, bytes: &[u8]) -> Result<()>;
    /// Exchange request with control point
    async fn request_ctrl(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}
