//! Partial flashing state machine.
//!
//! The engine only rewrites the program region. It first compares the DAL
//! hash stored on the device with the one the image was built against,
//! reboots the device into BLE-only mode when an application is running, and
//! then streams the program in batches of [`BATCH_SIZE`] packets. Each full
//! batch is acknowledged by the device; a rejected batch is resent after a
//! resync frame. Anything unexpected ends the session in
//! [`Phase::FallbackTriggered`] so the caller can run a full DFU instead.
//!
//! All session state is mutated from the task that owns the engine. Link
//! callbacks reach it through the ordered [`EngineInput`] queue.

use crate::chunker::{Chunk, PacketChunker};
use crate::codec::{Command, DecodeError, DeviceMode, Region, Response};
use crate::config::{FlashConfig, BATCH_SIZE};
use crate::firmware::FirmwareImage;
use crate::transport::{DeviceLink, DeviceState, EngineInput};
use crate::upload::{EventSender, UploadEvent};

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Set from outside the session to request cancellation.
pub type CancelFlag = Arc<AtomicBool>;

/// Session phases
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    Idle,
    RequestingRegionHash,
    AwaitingRegionHash,
    RequestingStatus,
    AwaitingStatus,
    RequestingReboot,
    AwaitingReconnect,
    SkippingReboot,
    SendingBatch,
    AwaitingBatchAck,
    EndingTransmission,
    Completed,
    FallbackTriggered,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::FallbackTriggered | Phase::Cancelled)
    }
}

/// Why partial flashing was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FallbackReason {
    #[error("image has no partial flashing information")]
    NoMetadata,
    #[error("device has no partial flashing service")]
    ServiceUnavailable,
    #[error("DAL hash mismatch: device {device}, image {image}")]
    DalMismatch { device: String, image: String },
    #[error("unrecognized response: {0}")]
    Unrecognized(DecodeError),
    #[error("unknown write status {0:#04x}")]
    UnknownWriteAck(u8),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no response while {0:?}")]
    Timeout(Phase),
    #[error("batch rejected {0} times")]
    RetriesExhausted(u32),
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Fallback(FallbackReason),
    Cancelled,
}

/// The session has reached a terminal phase; stop issuing commands.
#[derive(Debug)]
struct Halted;

type Step = Result<(), Halted>;

/// State of one upload attempt.
struct ProtocolSession<'a> {
    file_hash: [u8; 8],
    device_dal_hash: Option<[u8; 8]>,
    /// Packet number of the first chunk in `pending`, or of the next chunk.
    sequence: u8,
    pending: Vec<Chunk>,
    chunks: PacketChunker<'a>,
    rejections: u32,
}

pub struct PartialFlashEngine<'a, L: DeviceLink> {
    link: &'a L,
    image: &'a FirmwareImage,
    config: FlashConfig,
    cancel: CancelFlag,
    events: EventSender,
    phase: Phase,
    /// When the current awaiting phase gives up, fixed on entry.
    expires_at: Option<Instant>,
    session: Option<ProtocolSession<'a>>,
    outcome: Option<Outcome>,
}

impl<'a, L: DeviceLink> PartialFlashEngine<'a, L> {
    pub fn new(
        link: &'a L,
        image: &'a FirmwareImage,
        config: FlashConfig,
        cancel: CancelFlag,
        events: EventSender,
    ) -> Self {
        Self {
            link,
            image,
            config,
            cancel,
            events,
            phase: Phase::Idle,
            expires_at: None,
            session: None,
            outcome: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Packet number the current (or next) batch starts with.
    #[cfg(test)]
    pub fn sequence(&self) -> Option<u8> {
        self.session.as_ref().map(|s| s.sequence)
    }

    #[cfg(test)]
    pub fn device_dal_hash(&self) -> Option<[u8; 8]> {
        self.session.as_ref().and_then(|s| s.device_dal_hash)
    }

    /// How long the current phase may wait for the device.
    fn phase_timeout(&self) -> Option<Duration> {
        match self.phase {
            Phase::AwaitingRegionHash | Phase::AwaitingStatus => Some(self.config.response_timeout),
            Phase::AwaitingReconnect => Some(self.config.reconnect_timeout),
            Phase::AwaitingBatchAck => Some(self.config.ack_timeout),
            _ => None,
        }
    }

    /// Drive the session until it ends.
    pub async fn run(mut self, inputs: &mut mpsc::Receiver<EngineInput>) -> Outcome {
        self.start().await;
        loop {
            if let Some(outcome) = self.outcome.take() {
                debug!("session ended in {:?}", self.phase());
                return outcome;
            }
            let next = match self.expires_at {
                Some(at) => match tokio::time::timeout_at(at, inputs.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.on_timeout();
                        continue;
                    }
                },
                None => inputs.recv().await,
            };
            match next {
                Some(input) => self.handle(input).await,
                None => {
                    let _ = self.fall_back(FallbackReason::Transport("link event queue closed".into()));
                }
            }
        }
    }

    pub async fn start(&mut self) {
        if self.phase != Phase::Idle {
            warn!("partial flashing already started ({:?})", self.phase);
            return;
        }
        let _ = self.begin().await;
    }

    pub async fn handle(&mut self, input: EngineInput) {
        if self.phase.is_terminal() {
            debug!("ignoring {input:?} in {:?}", self.phase);
            return;
        }
        let _ = match input {
            EngineInput::Cancel => self.cancel_session().await,
            EngineInput::Notification(bytes) => self.on_notification(&bytes).await,
            EngineInput::Lifecycle(state) => self.on_lifecycle(state).await,
        };
    }

    /// The current phase waited past its deadline.
    pub fn on_timeout(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        let _ = self.fall_back(FallbackReason::Timeout(self.phase));
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        self.arm_deadline();
        let _ = self.events.send(UploadEvent::Phase(phase));
    }

    /// Inputs that are ignored never move the deadline, only phase entry and resends do.
    fn arm_deadline(&mut self) {
        self.expires_at = self.phase_timeout().map(|limit| Instant::now() + limit);
    }

    fn progress(&self, done: usize, total: usize) {
        let size = self.config.chunk_size;
        let _ = self.events.send(UploadEvent::Progress {
            done: done * size,
            total: total * size,
        });
    }

    async fn begin(&mut self) -> Step {
        info!("start partial flashing");
        let image = self.image;
        let (Some(info), Some(chunks)) = (image.partial_flash(), image.chunks(self.config.chunk_size))
        else {
            return self.fall_back(FallbackReason::NoMetadata);
        };
        if !self.link.has_partial_flash() {
            return self.fall_back(FallbackReason::ServiceUnavailable);
        }
        info!(
            "hex file DAL hash {}, program hash {}, {} packets",
            hex::encode(&info.file_hash),
            hex::encode(&info.program_hash),
            chunks.len()
        );

        self.session = Some(ProtocolSession {
            file_hash: info.file_hash,
            device_dal_hash: None,
            sequence: 0,
            pending: Vec::with_capacity(BATCH_SIZE),
            chunks,
            rejections: 0,
        });
        self.set_phase(Phase::RequestingRegionHash);
        if let Err(e) = self.link.subscribe().await {
            return self.fall_back(FallbackReason::Transport(e.to_string()));
        }
        self.send(Command::RequestRegion(Region::Dal)).await?;
        self.set_phase(Phase::AwaitingRegionHash);
        Ok(())
    }

    async fn on_notification(&mut self, bytes: &[u8]) -> Step {
        debug!("received notification from partial flashing service: {}", hex::encode(bytes));
        let response = match Response::decode(bytes) {
            Ok(response) => response,
            Err(e) => return self.fall_back(FallbackReason::Unrecognized(e)),
        };

        match (self.phase, response) {
            (_, Response::WriteAckUnknown { code }) => self.fall_back(FallbackReason::UnknownWriteAck(code)),
            (Phase::AwaitingRegionHash, Response::RegionInfo { region: Region::Dal, start, end, hash }) => {
                debug!("DAL region from {start:#010x} to {end:#010x}");
                self.on_dal_hash(hash).await
            }
            (Phase::AwaitingStatus, Response::StatusInfo { mode }) => self.on_mode(mode).await,
            (Phase::AwaitingBatchAck, Response::WriteAck { ok: true }) => self.on_batch_accepted().await,
            (Phase::AwaitingBatchAck, Response::WriteAck { ok: false }) => self.on_batch_rejected().await,
            (phase, response) => {
                debug!("ignoring {response:?} in {phase:?}");
                Ok(())
            }
        }
    }

    async fn on_lifecycle(&mut self, state: DeviceState) -> Step {
        match (self.phase, state) {
            (Phase::AwaitingReconnect, DeviceState::UsageReady) => {
                info!("reboot into BLE-only mode done");
                self.begin_transfer().await
            }
            (Phase::AwaitingReconnect, state) => {
                debug!("device {state:?} while rebooting");
                Ok(())
            }
            (_, DeviceState::Disconnected) => {
                self.fall_back(FallbackReason::Transport("device disconnected".into()))
            }
            (phase, state) => {
                debug!("ignoring device {state:?} in {phase:?}");
                Ok(())
            }
        }
    }

    async fn on_dal_hash(&mut self, hash: [u8; 8]) -> Step {
        let session = self.session.as_mut().ok_or(Halted)?;
        session.device_dal_hash = Some(hash);
        let expected = session.file_hash;
        info!(
            "received DAL hash {}, hash in hex file is {}",
            hex::encode(&hash),
            hex::encode(&expected)
        );
        if hash != expected {
            return self.fall_back(FallbackReason::DalMismatch {
                device: hex::encode(&hash),
                image: hex::encode(&expected),
            });
        }
        self.set_phase(Phase::RequestingStatus);
        self.send(Command::RequestStatus).await?;
        self.set_phase(Phase::AwaitingStatus);
        Ok(())
    }

    async fn on_mode(&mut self, mode: DeviceMode) -> Step {
        match mode {
            DeviceMode::Application => {
                info!("application running, rebooting into BLE-only mode");
                self.set_phase(Phase::RequestingReboot);
                self.link.announce_reset();
                self.send(Command::Reboot(DeviceMode::BleOnly)).await?;
                self.set_phase(Phase::AwaitingReconnect);
                Ok(())
            }
            DeviceMode::BleOnly => {
                info!("device already in BLE-only mode");
                self.set_phase(Phase::SkippingReboot);
                self.begin_transfer().await
            }
        }
    }

    async fn begin_transfer(&mut self) -> Step {
        let session = self.session.as_mut().ok_or(Halted)?;
        session.sequence = 0;
        session.rejections = 0;
        session.pending.clear();
        session.chunks.reset();
        let total = session.chunks.len();
        self.progress(0, total);
        self.send_batch().await
    }

    async fn send_batch(&mut self) -> Step {
        self.set_phase(Phase::SendingBatch);
        let session = self.session.as_mut().ok_or(Halted)?;
        session.pending = session.chunks.take_batch(BATCH_SIZE);
        let is_final = session.pending.len() < BATCH_SIZE;

        self.write_pending().await?;
        if is_final {
            // no full batch left, the device does not acknowledge this one
            return self.end_transmission().await;
        }
        self.set_phase(Phase::AwaitingBatchAck);
        Ok(())
    }

    async fn write_pending(&mut self) -> Step {
        let session = self.session.as_ref().ok_or(Halted)?;
        let sequence = session.sequence;
        let packets: Vec<Command> = session
            .pending
            .iter()
            .enumerate()
            .map(|(index, chunk)| Command::WritePacket {
                address: chunk.address,
                seq: sequence.wrapping_add(index as u8),
                data: chunk.data.clone(),
            })
            .collect();

        debug!("sending {} packets beginning at {}", packets.len(), sequence);
        for packet in packets {
            self.send(packet).await?;
        }
        Ok(())
    }

    async fn on_batch_accepted(&mut self) -> Step {
        let session = self.session.as_mut().ok_or(Halted)?;
        session.sequence = session.sequence.wrapping_add(BATCH_SIZE as u8);
        session.rejections = 0;
        session.pending.clear();
        let (done, total) = (session.chunks.position(), session.chunks.len());
        let exhausted = session.chunks.is_exhausted();
        self.progress(done, total);

        if exhausted {
            self.end_transmission().await
        } else {
            self.send_batch().await
        }
    }

    async fn on_batch_rejected(&mut self) -> Step {
        let max = self.config.max_write_retries;
        let session = self.session.as_mut().ok_or(Halted)?;
        session.rejections += 1;
        let (rejections, sequence) = (session.rejections, session.sequence);
        if rejections > max {
            return self.fall_back(FallbackReason::RetriesExhausted(rejections));
        }

        warn!("batch {sequence} rejected, resending ({rejections}/{max})");
        // resync payload layout is not confirmed by the device firmware
        self.send(Command::Resync { seq: sequence }).await?;
        self.write_pending().await?;
        self.arm_deadline();
        Ok(())
    }

    async fn end_transmission(&mut self) -> Step {
        self.set_phase(Phase::EndingTransmission);
        self.send(Command::EndTransmission).await?;
        if let Some(session) = self.session.take() {
            self.progress(session.chunks.len(), session.chunks.len());
        }
        info!("partial flashing done!");
        self.finish(Phase::Completed, Outcome::Completed);
        Ok(())
    }

    async fn send(&mut self, command: Command) -> Step {
        if self.cancel.load(Ordering::SeqCst) {
            return self.cancel_session().await;
        }
        let frame = command.encode();
        debug!("send {}", hex::encode(&frame));
        match self.link.send(&frame, false).await {
            Ok(()) => Ok(()),
            Err(e) => self.fall_back(FallbackReason::Transport(e.to_string())),
        }
    }

    async fn cancel_session(&mut self) -> Step {
        if self.phase.is_terminal() {
            return Err(Halted);
        }
        info!("partial flashing cancelled in {:?}", self.phase);
        if self.session.take().is_some() {
            if let Err(e) = self.link.unsubscribe().await {
                warn!("could not unsubscribe from partial flashing notifications: {e}");
            }
        }
        self.finish(Phase::Cancelled, Outcome::Cancelled);
        Err(Halted)
    }

    fn fall_back(&mut self, reason: FallbackReason) -> Step {
        if self.phase.is_terminal() {
            return Err(Halted);
        }
        warn!("partial flashing failed in {:?}: {reason}", self.phase);
        self.session = None;
        self.finish(Phase::FallbackTriggered, Outcome::Fallback(reason));
        Err(Halted)
    }

    fn finish(&mut self, phase: Phase, outcome: Outcome) {
        self.set_phase(phase);
        self.outcome = Some(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::tests::{pxt_hex, DAL_HASH};
    use crate::testing::{ack_fail, ack_ok, region_info, status, MockLink};

    struct Harness {
        link: MockLink,
        image: FirmwareImage,
        cancel: CancelFlag,
        events_tx: EventSender,
        events_rx: mpsc::UnboundedReceiver<UploadEvent>,
    }

    impl Harness {
        /// Image with `packets` 16-byte packets in its program region.
        fn new(packets: usize) -> Self {
            // magic and hash records are part of the program region
            let image = FirmwareImage::from_hex(&pxt_hex(packets - 2)).unwrap();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Self {
                link: MockLink::default(),
                image,
                cancel: CancelFlag::default(),
                events_tx,
                events_rx,
            }
        }

        fn engine(&self) -> PartialFlashEngine<'_, MockLink> {
            self.engine_with(FlashConfig::default())
        }

        fn engine_with(&self, config: FlashConfig) -> PartialFlashEngine<'_, MockLink> {
            PartialFlashEngine::new(
                &self.link,
                &self.image,
                config,
                self.cancel.clone(),
                self.events_tx.clone(),
            )
        }

        fn phases(&mut self) -> Vec<Phase> {
            let mut phases = Vec::new();
            while let Ok(event) = self.events_rx.try_recv() {
                if let UploadEvent::Phase(phase) = event {
                    phases.push(phase);
                }
            }
            phases
        }
    }

    /// Start and answer the handshake for a device already in BLE-only mode.
    async fn handshake(engine: &mut PartialFlashEngine<'_, MockLink>) {
        engine.start().await;
        engine.handle(region_info(DAL_HASH)).await;
        engine.handle(status(DeviceMode::BleOnly)).await;
    }

    #[tokio::test]
    async fn test_start_requests_dal_region() {
        let h = Harness::new(8);
        let mut engine = h.engine();
        engine.start().await;
        assert_eq!(engine.phase(), Phase::AwaitingRegionHash);
        assert!(h.link.is_subscribed());
        assert_eq!(h.link.frames(), vec![vec![0x00, 0x01]]);
    }

    #[tokio::test]
    async fn test_missing_service_falls_back_immediately() {
        let mut h = Harness::new(8);
        h.link = MockLink::without_partial_flash();
        let mut engine = h.engine();
        engine.start().await;
        assert_eq!(
            engine.outcome(),
            Some(&Outcome::Fallback(FallbackReason::ServiceUnavailable))
        );
        assert!(h.link.frames().is_empty());
    }

    #[tokio::test]
    async fn test_image_without_metadata_falls_back() {
        let mut h = Harness::new(8);
        h.image = FirmwareImage::from_hex(":0100000000FF\n:00000001FF").unwrap();
        let mut engine = h.engine();
        engine.start().await;
        assert_eq!(engine.outcome(), Some(&Outcome::Fallback(FallbackReason::NoMetadata)));
    }

    #[tokio::test]
    async fn test_dal_mismatch_never_writes() {
        let h = Harness::new(8);
        let mut engine = h.engine();
        engine.start().await;
        engine.handle(region_info([0; 8])).await;
        assert_eq!(engine.phase(), Phase::FallbackTriggered);
        assert!(matches!(
            engine.outcome(),
            Some(Outcome::Fallback(FallbackReason::DalMismatch { .. }))
        ));
        assert_eq!(h.link.write_packets().len(), 0);
    }

    #[tokio::test]
    async fn test_application_mode_reboots_then_streams() {
        let h = Harness::new(4);
        let mut engine = h.engine();
        engine.start().await;
        engine.handle(region_info(DAL_HASH)).await;
        assert_eq!(engine.device_dal_hash(), Some(DAL_HASH));
        engine.handle(status(DeviceMode::Application)).await;
        assert_eq!(engine.phase(), Phase::AwaitingReconnect);
        assert_eq!(h.link.resets_announced(), 1);
        assert_eq!(h.link.frames().last(), Some(&vec![0xFF, 0x00]));

        engine.handle(EngineInput::Lifecycle(DeviceState::Disconnected)).await;
        assert_eq!(engine.phase(), Phase::AwaitingReconnect);
        engine.handle(EngineInput::Lifecycle(DeviceState::UsageReady)).await;
        assert_eq!(engine.phase(), Phase::AwaitingBatchAck);
        assert_eq!(h.link.write_packets().len(), 4);
    }

    #[tokio::test]
    async fn test_ble_only_mode_skips_reboot() {
        let mut h = Harness::new(8);
        let mut engine = h.engine();
        handshake(&mut engine).await;
        assert_eq!(engine.phase(), Phase::AwaitingBatchAck);
        let frames = h.link.frames();
        assert_eq!(frames[0], vec![0x00, 0x01]);
        assert_eq!(frames[1], vec![0xEE]);
        assert_eq!(frames[2][0], 0x01);
        drop(engine);
        let phases = h.phases();
        assert!(!phases.contains(&Phase::RequestingReboot));
        assert!(!phases.contains(&Phase::AwaitingReconnect));
        assert!(phases.contains(&Phase::SkippingReboot));
    }

    #[tokio::test]
    async fn test_nine_packets_go_out_as_4_4_1() {
        let h = Harness::new(9);
        let mut engine = h.engine();
        handshake(&mut engine).await;
        assert_eq!(h.link.write_packets().len(), 4);
        engine.handle(ack_ok()).await;
        assert_eq!(h.link.write_packets().len(), 8);
        assert_eq!(engine.sequence(), Some(4));
        engine.handle(ack_ok()).await;

        // final partial batch ends the transmission without waiting for its ack
        assert_eq!(engine.phase(), Phase::Completed);
        assert_eq!(engine.outcome(), Some(&Outcome::Completed));
        let packets = h.link.write_packets();
        assert_eq!(packets.len(), 9);
        assert_eq!(packets[8][3], 8);
        assert_eq!(h.link.frames().last(), Some(&vec![0x02]));
        assert_eq!(h.link.count(&[0x02]), 1);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_after_last_ack() {
        let h = Harness::new(8);
        let mut engine = h.engine();
        handshake(&mut engine).await;
        engine.handle(ack_ok()).await;
        assert_eq!(engine.phase(), Phase::AwaitingBatchAck);
        engine.handle(ack_ok()).await;
        assert_eq!(engine.phase(), Phase::Completed);
        assert_eq!(h.link.write_packets().len(), 8);
        assert_eq!(h.link.frames().last(), Some(&vec![0x02]));
    }

    #[tokio::test]
    async fn test_packet_layout() {
        let h = Harness::new(4);
        let mut engine = h.engine();
        handshake(&mut engine).await;
        let packets = h.link.write_packets();
        // region starts at 0x0003_1000 with the magic record
        assert_eq!(&packets[0][..4], &[0x01, 0x10, 0x00, 0x00]);
        assert_eq!(&packets[1][..4], &[0x01, 0x10, 0x10, 0x01]);
        assert_eq!(&packets[3][..4], &[0x01, 0x10, 0x30, 0x03]);
        assert_eq!(packets[3].len(), 4 + 16);
        assert_eq!(&packets[3][4..], &[1u8; 16]);
    }

    #[tokio::test]
    async fn test_rejected_batch_is_resent_unchanged() {
        let h = Harness::new(12);
        let mut engine = h.engine();
        handshake(&mut engine).await;
        engine.handle(ack_ok()).await;
        let before = h.link.frames().len();
        let batch: Vec<_> = h.link.write_packets()[4..8].to_vec();

        engine.handle(ack_fail()).await;
        assert_eq!(engine.phase(), Phase::AwaitingBatchAck);
        assert_eq!(engine.sequence(), Some(4));
        let frames = h.link.frames();
        assert_eq!(
            frames[before],
            vec![0x01, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0x12, 0x34, 0x04]
        );
        assert_eq!(&frames[before + 1..before + 5], &batch[..]);

        engine.handle(ack_ok()).await;
        assert_eq!(engine.sequence(), Some(8));
        let last = h.link.write_packets();
        assert_eq!(last[last.len() - 4][3], 8);
    }

    #[tokio::test]
    async fn test_retry_bound_falls_back() {
        let h = Harness::new(8);
        let config = FlashConfig {
            max_write_retries: 2,
            ..FlashConfig::default()
        };
        let mut engine = h.engine_with(config);
        handshake(&mut engine).await;
        engine.handle(ack_fail()).await;
        engine.handle(ack_fail()).await;
        assert_eq!(engine.phase(), Phase::AwaitingBatchAck);
        engine.handle(ack_fail()).await;
        assert_eq!(
            engine.outcome(),
            Some(&Outcome::Fallback(FallbackReason::RetriesExhausted(3)))
        );
    }

    #[tokio::test]
    async fn test_sequence_wraps_after_64_batches() {
        let h = Harness::new(4 * 65);
        let mut engine = h.engine();
        handshake(&mut engine).await;
        for _ in 0..64 {
            engine.handle(ack_ok()).await;
        }
        assert_eq!(engine.sequence(), Some(0));
        let packets = h.link.write_packets();
        assert_eq!(packets[255][3], 255);
        assert_eq!(packets[256][3], 0);
    }

    #[tokio::test]
    async fn test_unknown_ack_falls_back_once() {
        let mut h = Harness::new(8);
        let mut engine = h.engine();
        handshake(&mut engine).await;
        engine.handle(EngineInput::Notification(vec![0x01, 0x42])).await;
        engine.handle(EngineInput::Notification(vec![0x55])).await;
        engine.handle(ack_ok()).await;
        assert_eq!(
            engine.outcome(),
            Some(&Outcome::Fallback(FallbackReason::UnknownWriteAck(0x42)))
        );
        assert_eq!(h.link.write_packets().len(), 4);
        drop(engine);
        let fallbacks = h
            .phases()
            .into_iter()
            .filter(|p| *p == Phase::FallbackTriggered)
            .count();
        assert_eq!(fallbacks, 1);
    }

    #[tokio::test]
    async fn test_unrecognized_frame_while_awaiting_status() {
        let h = Harness::new(8);
        let mut engine = h.engine();
        engine.start().await;
        engine.handle(region_info(DAL_HASH)).await;
        engine.handle(EngineInput::Notification(vec![0x33, 0x00])).await;
        assert_eq!(
            engine.outcome(),
            Some(&Outcome::Fallback(FallbackReason::Unrecognized(DecodeError::UnrecognizedTag(0x33))))
        );
    }

    #[tokio::test]
    async fn test_send_failure_falls_back() {
        let h = Harness::new(8);
        h.link.fail_after(3);
        let mut engine = h.engine();
        handshake(&mut engine).await;
        assert!(matches!(
            engine.outcome(),
            Some(Outcome::Fallback(FallbackReason::Transport(_)))
        ));
        assert_eq!(h.link.write_packets().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_ack() {
        let h = Harness::new(12);
        let mut engine = h.engine();
        handshake(&mut engine).await;
        engine.handle(EngineInput::Cancel).await;
        assert_eq!(engine.phase(), Phase::Cancelled);
        assert!(!h.link.is_subscribed());
        engine.handle(ack_ok()).await;
        assert_eq!(h.link.write_packets().len(), 4);
        assert_eq!(engine.outcome(), Some(&Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_flag_checked_before_next_command() {
        let h = Harness::new(12);
        let mut engine = h.engine();
        handshake(&mut engine).await;
        h.cancel.store(true, Ordering::SeqCst);
        engine.handle(ack_ok()).await;
        assert_eq!(engine.phase(), Phase::Cancelled);
        assert_eq!(h.link.write_packets().len(), 4);
    }

    #[tokio::test]
    async fn test_disconnect_mid_transfer_falls_back() {
        let h = Harness::new(8);
        let mut engine = h.engine();
        handshake(&mut engine).await;
        engine.handle(EngineInput::Lifecycle(DeviceState::Disconnected)).await;
        assert!(matches!(
            engine.outcome(),
            Some(Outcome::Fallback(FallbackReason::Transport(_)))
        ));
    }

    #[tokio::test]
    async fn test_unrelated_region_is_ignored() {
        let h = Harness::new(8);
        let mut engine = h.engine();
        engine.start().await;
        let mut other = vec![0x00, 0x02];
        other.extend_from_slice(&[0u8; 16]);
        engine.handle(EngineInput::Notification(other)).await;
        assert_eq!(engine.phase(), Phase::AwaitingRegionHash);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_waiting_for_ack() {
        let h = Harness::new(8);
        let engine = h.engine();
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(region_info(DAL_HASH)).await.unwrap();
        tx.send(status(DeviceMode::BleOnly)).await.unwrap();
        let outcome = engine.run(&mut rx).await;
        assert_eq!(
            outcome,
            Outcome::Fallback(FallbackReason::Timeout(Phase::AwaitingBatchAck))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_waiting_for_region_hash() {
        let h = Harness::new(8);
        let engine = h.engine();
        let (_tx, mut rx) = mpsc::channel(16);
        let outcome = engine.run(&mut rx).await;
        assert_eq!(
            outcome,
            Outcome::Fallback(FallbackReason::Timeout(Phase::AwaitingRegionHash))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_waiting_for_reconnect() {
        let h = Harness::new(8);
        let engine = h.engine();
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(region_info(DAL_HASH)).await.unwrap();
        tx.send(status(DeviceMode::Application)).await.unwrap();
        tx.send(EngineInput::Lifecycle(DeviceState::WillReset)).await.unwrap();
        let started = Instant::now();
        let outcome = engine.run(&mut rx).await;
        assert_eq!(
            outcome,
            Outcome::Fallback(FallbackReason::Timeout(Phase::AwaitingReconnect))
        );
        assert!(started.elapsed() >= FlashConfig::default().reconnect_timeout);
        assert_eq!(h.link.resets_announced(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_frames_do_not_extend_ack_deadline() {
        let h = Harness::new(8);
        let engine = h.engine();
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(region_info(DAL_HASH)).await.unwrap();
        tx.send(status(DeviceMode::BleOnly)).await.unwrap();
        let feeder = tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(4)).await;
                let stray = [status(DeviceMode::BleOnly), EngineInput::Lifecycle(DeviceState::Discovered)];
                for input in stray {
                    if feeder.send(input).await.is_err() {
                        return;
                    }
                }
            }
        });

        let started = Instant::now();
        let outcome = engine.run(&mut rx).await;
        assert_eq!(
            outcome,
            Outcome::Fallback(FallbackReason::Timeout(Phase::AwaitingBatchAck))
        );
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(h.link.write_packets().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_rearms_ack_deadline() {
        let h = Harness::new(8);
        let engine = h.engine();
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(region_info(DAL_HASH)).await.unwrap();
        tx.send(status(DeviceMode::BleOnly)).await.unwrap();
        let feeder = tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            let _ = feeder.send(ack_fail()).await;
        });

        let started = Instant::now();
        let outcome = engine.run(&mut rx).await;
        assert_eq!(
            outcome,
            Outcome::Fallback(FallbackReason::Timeout(Phase::AwaitingBatchAck))
        );
        assert!(started.elapsed() >= Duration::from_secs(9));
        assert_eq!(h.link.write_packets().len(), 8);
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let h = Harness::new(9);
        let engine = h.engine();
        let (tx, mut rx) = mpsc::channel(16);
        for input in [
            region_info(DAL_HASH),
            status(DeviceMode::Application),
            EngineInput::Lifecycle(DeviceState::UsageReady),
            ack_ok(),
            ack_ok(),
        ] {
            tx.send(input).await.unwrap();
        }
        assert_eq!(engine.run(&mut rx).await, Outcome::Completed);
        assert_eq!(h.link.write_packets().len(), 9);
    }
}
