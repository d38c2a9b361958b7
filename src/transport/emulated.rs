//! In-process programmer board.
//!
//! Runs the device state machine behind the `Transport` trait so the host can be
//! exercised without hardware. Replies can be dropped or corrupted on their way
//! back to inject faults.
use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use anyhow::Result;

use super::Transport;
use crate::target::{MemoryBackend, Target};

pub struct EmulatedTransport<B: MemoryBackend> {
    target: Target<B>,
    rx: VecDeque<u8>,
    replies: usize,
    dropped: BTreeSet<usize>,
    corrupted: BTreeSet<usize>,
}

impl<B: MemoryBackend> EmulatedTransport<B> {
    pub fn new(target: Target<B>) -> Self {
        EmulatedTransport {
            target,
            rx: VecDeque::new(),
            replies: 0,
            dropped: BTreeSet::new(),
            corrupted: BTreeSet::new(),
        }
    }

    /// Lose the `nth` frame sent by the device (0-based, counted over the session).
    pub fn drop_reply(&mut self, nth: usize) {
        self.dropped.insert(nth);
    }

    /// Flip the first payload byte (or the checksum) of the `nth` device frame.
    pub fn corrupt_reply(&mut self, nth: usize) {
        self.corrupted.insert(nth);
    }

    pub fn target(&self) -> &Target<B> {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut Target<B> {
        &mut self.target
    }

    /// Frames the device has sent so far, faulted ones included.
    pub fn replies(&self) -> usize {
        self.replies
    }

    fn collect_replies(&mut self) {
        while let Some(mut raw) = self.target.pop_output() {
            let nth = self.replies;
            self.replies += 1;
            if self.dropped.remove(&nth) {
                log::debug!("emulation: dropping reply #{}", nth);
                continue;
            }
            if self.corrupted.remove(&nth) {
                log::debug!("emulation: corrupting reply #{}", nth);
                // STX CMD [DATA] CRC CRC ETX
                let at = if raw.len() > 5 { 2 } else { raw.len() - 2 };
                raw[at] ^= 0xff;
            }
            self.rx.extend(raw);
        }
    }
}

impl<B: MemoryBackend> Transport for EmulatedTransport<B> {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        let now = Instant::now();
        self.target.poll(now);
        self.target.receive(raw, now);
        self.collect_replies();
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.target.poll(Instant::now());
        self.collect_replies();
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}
