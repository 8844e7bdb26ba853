//! Hand-off to a full DFU transfer when partial flashing is not possible.

use crate::engine::FallbackReason;
use crate::error::{Error, Result};
use crate::firmware::FirmwareImage;
use crate::package::DfuPackage;
use crate::protocol;
use crate::transport::DeviceLink;
use crate::transport_btleplug::DfuTransportBtleplug;
use crate::upload::{EventSender, UploadEvent};

use async_trait::async_trait;
use btleplug::api::BDAddr;
use log::{debug, info, warn};
use tokio::task::{AbortHandle, JoinHandle};

/// Full firmware update subsystem
#[async_trait]
pub trait FullUpdate: Send + Sync {
    /// Begin transferring `package`; progress and log lines go to `events`
    async fn start(&self, package: DfuPackage, events: EventSender) -> Result<FullUpdateHandle>;
}

/// A running full update.
pub struct FullUpdateHandle {
    task: JoinHandle<Result<()>>,
}

impl FullUpdateHandle {
    pub fn new(task: JoinHandle<Result<()>>) -> Self {
        Self { task }
    }

    pub fn aborter(&self) -> FullUpdateAbort {
        FullUpdateAbort(self.task.abort_handle())
    }

    /// Returns whether a running transfer was stopped.
    pub fn abort(&self) -> bool {
        self.aborter().abort()
    }

    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(Error::Dfu(format!("full update task failed: {e}"))),
        }
    }
}

/// Stops a full update from another task.
#[derive(Debug, Clone)]
pub struct FullUpdateAbort(AbortHandle);

impl FullUpdateAbort {
    pub fn abort(&self) -> bool {
        if self.0.is_finished() {
            return false;
        }
        self.0.abort();
        true
    }
}

/// Runs at most one full update for a failed partial flashing session.
pub struct FallbackCoordinator<'a, L: DeviceLink, F: FullUpdate> {
    link: &'a L,
    full_update: &'a F,
    events: EventSender,
    triggered: bool,
}

impl<'a, L: DeviceLink, F: FullUpdate> FallbackCoordinator<'a, L, F> {
    pub fn new(link: &'a L, full_update: &'a F, events: EventSender) -> Self {
        Self {
            link,
            full_update,
            events,
            triggered: false,
        }
    }

    pub async fn run(&mut self, image: &FirmwareImage, reason: &FallbackReason) -> Result<FullUpdateHandle> {
        if self.triggered {
            return Err(Error::FallbackUnavailable("full flashing already started".into()));
        }
        self.triggered = true;

        info!("partial flash failed ({reason}), resort to full flashing");
        let _ = self.events.send(UploadEvent::FallbackStarted(reason.clone()));

        let package = image
            .dfu_package()
            .ok_or_else(|| Error::FallbackUnavailable("no DFU package for this firmware".into()))?;

        // the DFU control point is only usable once the device is bonded
        if let Err(e) = self.link.trigger_pairing().await {
            debug!("pairing trigger: {e}");
        }
        self.link
            .enter_bootloader()
            .await
            .map_err(|e| Error::FallbackUnavailable(format!("could not enter bootloader: {e}")))?;

        self.full_update.start(package.clone(), self.events.clone()).await
    }
}

/// Nordic Secure DFU over btleplug, started once the bootloader advertises.
pub struct DfuFullUpdate {
    name: String,
    addr: Option<BDAddr>,
}

impl DfuFullUpdate {
    pub fn new(name: String, addr: Option<BDAddr>) -> Self {
        Self { name, addr }
    }
}

#[async_trait]
impl FullUpdate for DfuFullUpdate {
    async fn start(&self, package: DfuPackage, events: EventSender) -> Result<FullUpdateHandle> {
        let name = self.name.clone();
        let addr = self.addr;
        let task = tokio::spawn(async move {
            let transport = DfuTransportBtleplug::new(name, addr).await?;
            let result = protocol::dfu_run(&transport, &package.init_packet, &package.firmware, &events).await;
            if let Err(e) = &result {
                warn!("full flashing failed: {e}");
                let _ = events.send(UploadEvent::Log(format!("full flashing failed: {e}")));
            }
            result
        });
        Ok(FullUpdateHandle::new(task))
    }
}
