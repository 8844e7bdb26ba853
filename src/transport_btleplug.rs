use crate::error::{Error, Result};
use crate::transport::calliope_uuids::*;
use crate::transport::dfu_uuids::*;
use crate::transport::{DeviceLink, DeviceState, DfuTransport, EngineInput};

use async_trait::async_trait;
use btleplug::api::BDAddr;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::Adapter;
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const RECONNECT_ATTEMPTS: usize = 10;
const RECONNECT_DELAY: Duration = Duration::from_millis(500);
const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

fn find_characteristic_by_uuid(peripheral: &Peripheral, uuid: uuid::Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| Error::Transport(format!("characteristic {uuid} not found")))
}

async fn scan_for(central: &Adapter, in_name: &str, in_addr: Option<BDAddr>) -> Result<Peripheral> {
    let mut events = central.events().await?;
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDiscovered(id) = event {
            let Some(props) = central.peripheral(&id).await?.properties().await? else {
                continue;
            };
            let name_matches = !in_name.is_empty() && props.local_name.as_deref() == Some(in_name);
            if in_addr == Some(props.address) || name_matches {
                info!("Found [{:?}] at [{}]", props.local_name, id);
                return Ok(central.peripheral(&id).await?);
            }
        }
    }
    Err(Error::Transport("unexpected end of stream".into()))
}

async fn find_peripheral(central: &Adapter, in_name: &str, in_addr: Option<BDAddr>) -> Result<Peripheral> {
    if in_name.is_empty() && in_addr.is_none() {
        return Err(Error::Transport("no device name or address to search for".into()));
    }
    info!("Searching for {:?} and {:?}...", in_name, in_addr);
    central.start_scan(ScanFilter::default()).await?;
    let found = tokio::time::timeout(SCAN_TIMEOUT, scan_for(central, in_name, in_addr)).await;
    central.stop_scan().await?;
    if found.is_err() {
        warn!("{:?} / {:?} not seen within {:?}", in_name, in_addr, SCAN_TIMEOUT);
    }
    found?
}

async fn first_adapter() -> Result<Adapter> {
    let manager = btleplug::platform::Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| Error::Transport("no BLE adapter".into()))
}

async fn timeout<F: std::future::Future>(future: F) -> std::result::Result<F::Output, tokio::time::error::Elapsed> {
    tokio::time::timeout(std::time::Duration::from_millis(500), future).await
}

/// Connection to a Calliope mini running its application or BLE-only mode.
pub struct BleLink {
    central: Adapter,
    peripheral: Peripheral,
    partial_flash: Option<Characteristic>,
    dfu_control: Option<Characteristic>,
    reset_pending: Arc<AtomicBool>,
    subscribed: Arc<AtomicBool>,
    /// Bumped on every reconnect so stale notification streams go quiet.
    generation: Arc<AtomicUsize>,
    inputs: Mutex<Option<mpsc::Sender<EngineInput>>>,
}

impl BleLink {
    pub async fn connect(name: &str, addr: Option<BDAddr>) -> Result<Self> {
        let central = first_adapter().await?;
        let peripheral = find_peripheral(&central, name, addr).await?;
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let partial_flash = find_characteristic_by_uuid(&peripheral, PARTIAL_FLASH).ok();
        let dfu_control = find_characteristic_by_uuid(&peripheral, DFU_CONTROL).ok();
        info!(
            "connected, partial flashing {}, DFU control {}",
            if partial_flash.is_some() { "available" } else { "missing" },
            if dfu_control.is_some() { "available" } else { "missing" },
        );

        Ok(Self {
            central,
            peripheral,
            partial_flash,
            dfu_control,
            reset_pending: Arc::new(AtomicBool::new(false)),
            subscribed: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicUsize::new(0)),
            inputs: Mutex::new(None),
        })
    }

    fn partial_flash(&self) -> Result<&Characteristic> {
        self.partial_flash
            .as_ref()
            .ok_or_else(|| Error::Transport("partial flashing characteristic unavailable".into()))
    }

    fn dfu_control(&self) -> Result<&Characteristic> {
        self.dfu_control
            .as_ref()
            .ok_or_else(|| Error::Transport("DFU control characteristic unavailable".into()))
    }
}

/// Forward partial flashing notifications until the stream ends or is superseded.
async fn forward_notifications(
    peripheral: Peripheral,
    inputs: mpsc::Sender<EngineInput>,
    generation: Arc<AtomicUsize>,
) -> Result<()> {
    let mine = generation.load(Ordering::SeqCst);
    let mut notifications = peripheral.notifications().await?;
    tokio::spawn(async move {
        while let Some(ntf) = notifications.next().await {
            if generation.load(Ordering::SeqCst) != mine {
                break;
            }
            if ntf.uuid == PARTIAL_FLASH && inputs.send(EngineInput::Notification(ntf.value)).await.is_err() {
                break;
            }
        }
        debug!("notification stream {mine} closed");
    });
    Ok(())
}

async fn reconnect(peripheral: &Peripheral, resubscribe: bool) -> Result<()> {
    let mut last = Error::Transport("reconnect not attempted".into());
    for attempt in 1..=RECONNECT_ATTEMPTS {
        tokio::time::sleep(RECONNECT_DELAY).await;
        let result = async {
            peripheral.connect().await?;
            peripheral.discover_services().await?;
            if resubscribe {
                peripheral.subscribe(&find_characteristic_by_uuid(peripheral, PARTIAL_FLASH)?).await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("reconnect attempt {attempt}/{RECONNECT_ATTEMPTS}: {e}");
                last = e;
            }
        }
    }
    Err(last)
}

#[async_trait]
impl DeviceLink for BleLink {
    fn has_partial_flash(&self) -> bool {
        self.partial_flash.is_some()
    }

    async fn listen(&self, inputs: mpsc::Sender<EngineInput>) -> Result<()> {
        if let Ok(mut slot) = self.inputs.lock() {
            *slot = Some(inputs.clone());
        }
        forward_notifications(self.peripheral.clone(), inputs.clone(), self.generation.clone()).await?;

        let mut events = self.central.events().await?;
        let peripheral = self.peripheral.clone();
        let id = peripheral.id();
        let reset_pending = self.reset_pending.clone();
        let subscribed = self.subscribed.clone();
        let generation = self.generation.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let state = match event {
                    CentralEvent::DeviceDisconnected(ref pid) if *pid == id => DeviceState::Disconnected,
                    CentralEvent::DeviceDiscovered(ref pid) if *pid == id => DeviceState::Discovered,
                    _ => continue,
                };
                if inputs.send(EngineInput::Lifecycle(state)).await.is_err() {
                    break;
                }
                if state != DeviceState::Disconnected || !reset_pending.swap(false, Ordering::SeqCst) {
                    continue;
                }

                info!("device is resetting, reconnecting");
                if let Err(e) = reconnect(&peripheral, subscribed.load(Ordering::SeqCst)).await {
                    warn!("could not reconnect after reset: {e}");
                    continue;
                }
                generation.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = forward_notifications(peripheral.clone(), inputs.clone(), generation.clone()).await {
                    warn!("could not restore notifications: {e}");
                    continue;
                }
                if inputs.send(EngineInput::Lifecycle(DeviceState::UsageReady)).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<()> {
        self.peripheral.subscribe(self.partial_flash()?).await?;
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.subscribed.store(false, Ordering::SeqCst);
        self.peripheral.unsubscribe(self.partial_flash()?).await?;
        Ok(())
    }

    async fn send(&self, frame: &[u8], require_ack: bool) -> Result<()> {
        let write_type = if require_ack {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        timeout(self.peripheral.write(self.partial_flash()?, frame, write_type)).await??;
        Ok(())
    }

    fn announce_reset(&self) {
        self.reset_pending.store(true, Ordering::SeqCst);
        if let Ok(slot) = self.inputs.lock() {
            if let Some(inputs) = slot.as_ref() {
                let _ = inputs.try_send(EngineInput::Lifecycle(DeviceState::WillReset));
            }
        }
    }

    async fn trigger_pairing(&self) -> Result<()> {
        self.peripheral.read(self.dfu_control()?).await?;
        Ok(())
    }

    async fn enter_bootloader(&self) -> Result<()> {
        self.peripheral
            .write(self.dfu_control()?, &[0x01], WriteType::WithResponse)
            .await?;
        Ok(())
    }
}

pub struct DfuTransportBtleplug {
    peripheral: Peripheral,
    control_point: Characteristic,
    data_point: Characteristic,
}

#[async_trait]
impl DfuTransport for DfuTransportBtleplug {
    async fn mtu(&self) -> usize {
        // TODO fix once btleplug supports MTU lookup
        244
    }
    async fn write_data(&self, bytes: &[u8]) -> Result<()> {
        self.write(&self.data_point, bytes, WriteType::WithoutResponse).await
    }
    async fn request_ctrl(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        self.request(&self.control_point, bytes, WriteType::WithResponse).await
    }
}

impl DfuTransportBtleplug {
    async fn write(&self, chr: &Characteristic, bytes: &[u8], write_type: WriteType) -> Result<()> {
        timeout(self.peripheral.write(chr, bytes, write_type)).await??;
        Ok(())
    }
    async fn request(&self, chr: &Characteristic, bytes: &[u8], write_type: WriteType) -> Result<Vec<u8>> {
        let mut notifications = self.peripheral.notifications().await?;
        timeout(self.peripheral.write(chr, bytes, write_type)).await??;
        loop {
            let ntf = timeout(notifications.next())
                .await?
                .ok_or_else(|| Error::Transport("notification stream ended".into()))?;
            if ntf.uuid == chr.uuid {
                return Ok(ntf.value);
            }
        }
    }
    pub async fn new(name: String, addr: Option<BDAddr>) -> Result<Self> {
        let central = first_adapter().await?;

        let peripheral: Peripheral = find_peripheral(&central, name.as_str(), addr).await?;
        peripheral.connect().await?;
        peripheral.discover_services().await?;

        if let Ok(buttonless) = find_characteristic_by_uuid(&peripheral, BTTNLSS) {
            peripheral.subscribe(&buttonless).await?;
            let mut notifications = peripheral.notifications().await?;
            peripheral.write(&buttonless, &[0x01], WriteType::WithResponse).await?;
            let res = timeout(notifications.next()).await?;
            if res.map(|n| n.value) != Some(vec![0x20, 0x01, 0x01]) {
                return Err(Error::Dfu("buttonless DFU trigger rejected".into()));
            }

            peripheral.connect().await?;
            peripheral.discover_services().await?;
        }

        let control_point = find_characteristic_by_uuid(&peripheral, CTRL_PT)?;
        let data_point = find_characteristic_by_uuid(&peripheral, DATA_PT)?;
        peripheral.subscribe(&control_point).await?;
        Ok(DfuTransportBtleplug {
            peripheral,
            control_point,
            data_point,
        })
    }
}
