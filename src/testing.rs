//! Test doubles shared by the unit tests.

use crate::codec::DeviceMode;
use crate::error::{Error, Result};
use crate::transport::{DeviceLink, EngineInput};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Records every frame written to the partial flashing characteristic.
pub struct MockLink {
    partial_flash: bool,
    frames: Mutex<Vec<Vec<u8>>>,
    fail_after: Mutex<Option<usize>>,
    subscribed: AtomicBool,
    resets: AtomicUsize,
    pub pairing_requests: AtomicUsize,
    pub bootloader_requests: AtomicUsize,
    pub bootloader_fails: AtomicBool,
    pub listening: AtomicBool,
}

impl Default for MockLink {
    fn default() -> Self {
        Self {
            partial_flash: true,
            frames: Mutex::new(Vec::new()),
            fail_after: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            resets: AtomicUsize::new(0),
            pairing_requests: AtomicUsize::new(0),
            bootloader_requests: AtomicUsize::new(0),
            bootloader_fails: AtomicBool::new(false),
            listening: AtomicBool::new(false),
        }
    }
}

impl MockLink {
    pub fn without_partial_flash() -> Self {
        Self {
            partial_flash: false,
            ..Self::default()
        }
    }

    /// Let `n` more sends succeed, then fail every send.
    pub fn fail_after(&self, n: usize) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    /// WritePacket frames, resync frames excluded.
    pub fn write_packets(&self) -> Vec<Vec<u8>> {
        self.frames()
            .into_iter()
            .filter(|f| f[0] == 0x01 && !is_resync(f))
            .collect()
    }

    pub fn count(&self, frame: &[u8]) -> usize {
        self.frames().iter().filter(|f| f.as_slice() == frame).count()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn resets_announced(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

fn is_resync(frame: &[u8]) -> bool {
    frame.len() == 12 && frame[1..9] == [0xAA; 8] && frame[9..11] == [0x12, 0x34]
}

#[async_trait]
impl DeviceLink for MockLink {
    fn has_partial_flash(&self) -> bool {
        self.partial_flash
    }

    async fn listen(&self, _inputs: mpsc::Sender<EngineInput>) -> Result<()> {
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self) -> Result<()> {
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.subscribed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, frame: &[u8], _require_ack: bool) -> Result<()> {
        let mut budget = self.fail_after.lock().unwrap();
        match budget.as_mut() {
            Some(0) => return Err(Error::Transport("link down".into())),
            Some(n) => *n -= 1,
            None => {}
        }
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    fn announce_reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    async fn trigger_pairing(&self) -> Result<()> {
        self.pairing_requests.fetch_add(1, Ordering::SeqCst);
        Err(Error::Transport("pairing read rejected".into()))
    }

    async fn enter_bootloader(&self) -> Result<()> {
        self.bootloader_requests.fetch_add(1, Ordering::SeqCst);
        if self.bootloader_fails.load(Ordering::SeqCst) {
            return Err(Error::Transport("no DFU control point".into()));
        }
        Ok(())
    }
}

pub fn region_info(hash: [u8; 8]) -> EngineInput {
    let mut frame = vec![0x00, 0x01, 0x00, 0x01, 0x80, 0x00, 0x00, 0x03, 0x00, 0x00];
    frame.extend_from_slice(&hash);
    EngineInput::Notification(frame)
}

pub fn status(mode: DeviceMode) -> EngineInput {
    EngineInput::Notification(vec![0xEE, 0x00, mode.into()])
}

pub fn ack_ok() -> EngineInput {
    EngineInput::Notification(vec![0x01, 0xFF])
}

pub fn ack_fail() -> EngineInput {
    EngineInput::Notification(vec![0x01, 0xAA])
}
