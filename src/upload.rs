//! One firmware upload: partial flashing first, full DFU if that fails.

use crate::config::FlashConfig;
use crate::engine::{CancelFlag, FallbackReason, Outcome, PartialFlashEngine, Phase};
use crate::error::{Error, Result};
use crate::fallback::{FallbackCoordinator, FullUpdate, FullUpdateAbort};
use crate::firmware::FirmwareImage;
use crate::transport::{DeviceLink, EngineInput};

use log::{info, warn};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Depth of the per-session input queue.
const INPUT_QUEUE: usize = 64;

/// Progress reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Phase(Phase),
    /// Bytes transferred by the active strategy.
    Progress { done: usize, total: usize },
    FallbackStarted(FallbackReason),
    Log(String),
}

pub type EventSender = mpsc::UnboundedSender<UploadEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    PartialFlashed,
    FullFlashed,
    Cancelled,
}

/// Cancels an upload from outside the uploading task.
#[derive(Clone)]
pub struct UploadControl {
    cancel: CancelFlag,
    inputs: mpsc::Sender<EngineInput>,
    full_update: Arc<Mutex<Option<FullUpdateAbort>>>,
}

impl UploadControl {
    /// Request cancellation; a running full update is aborted right away.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Ok(slot) = self.full_update.lock() {
            if let Some(abort) = slot.as_ref() {
                if abort.abort() {
                    info!("full flashing aborted");
                }
                return;
            }
        }
        // wakes the engine if it is waiting for the device
        let _ = self.inputs.try_send(EngineInput::Cancel);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn attach(&self, abort: FullUpdateAbort) {
        if let Ok(mut slot) = self.full_update.lock() {
            *slot = Some(abort);
        }
    }
}

/// Runs a single upload session against one connected device.
pub struct Uploader<'a, L: DeviceLink, F: FullUpdate> {
    link: &'a L,
    full_update: &'a F,
    config: FlashConfig,
    events: EventSender,
    control: UploadControl,
    inputs: mpsc::Receiver<EngineInput>,
}

impl<'a, L: DeviceLink, F: FullUpdate> Uploader<'a, L, F> {
    pub fn new(link: &'a L, full_update: &'a F, config: FlashConfig, events: EventSender) -> Self {
        let (tx, inputs) = mpsc::channel(INPUT_QUEUE);
        Self {
            link,
            full_update,
            config,
            events,
            control: UploadControl {
                cancel: CancelFlag::default(),
                inputs: tx,
                full_update: Arc::new(Mutex::new(None)),
            },
            inputs,
        }
    }

    pub fn control(&self) -> UploadControl {
        self.control.clone()
    }

    pub async fn upload(mut self, image: &FirmwareImage) -> Result<UploadOutcome> {
        let outcome = match self.link.listen(self.control.inputs.clone()).await {
            Ok(()) => {
                let engine = PartialFlashEngine::new(
                    self.link,
                    image,
                    self.config,
                    self.control.cancel.clone(),
                    self.events.clone(),
                );
                engine.run(&mut self.inputs).await
            }
            Err(e) => Outcome::Fallback(FallbackReason::Transport(e.to_string())),
        };

        let reason = match outcome {
            Outcome::Completed => return Ok(UploadOutcome::PartialFlashed),
            Outcome::Cancelled => return Ok(UploadOutcome::Cancelled),
            Outcome::Fallback(reason) => reason,
        };
        if self.control.is_cancelled() {
            return Ok(UploadOutcome::Cancelled);
        }

        let mut coordinator = FallbackCoordinator::new(self.link, self.full_update, self.events.clone());
        let handle = coordinator.run(image, &reason).await?;
        self.control.attach(handle.aborter());
        if self.control.is_cancelled() {
            handle.abort();
        }

        match handle.wait().await {
            Ok(()) => {
                info!("full flashing done");
                Ok(UploadOutcome::FullFlashed)
            }
            Err(Error::Cancelled) => {
                warn!("full flashing cancelled");
                Ok(UploadOutcome::Cancelled)
            }
            Err(e) => Err(e),
        }
    }
}
