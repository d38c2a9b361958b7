//! Device end of the link: the programmer board's command loop.
//!
//! The state machine is sans-IO. Bytes go in through [`Target::receive`], replies
//! collect in an outbox the caller drains onto its wire.
use std::collections::VecDeque;
use std::time::Instant;

use anyhow::Result;

use crate::config::TargetConfig;
use crate::constants::PKG_DATA_MAX;
use crate::framer::Framer;
use crate::memory::MemoryType;
use crate::protocol::{Command, ErrorCode, Frame};

/// Storage behind the programmer, usually an I2C EEPROM.
#[cfg_attr(test, mockall::automock)]
pub trait MemoryBackend {
    /// Prepare `memory` for access. Fails when that part isn't fitted.
    fn select(&mut self, memory: MemoryType) -> Result<()>;

    fn read_block(&mut self, offset: usize, buf: &mut [u8]) -> Result<()>;

    fn write_block(&mut self, offset: usize, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Disconnected,
    AwaitMemId,
    Idle,
    /// A chunk may be requested with READNEXT.
    AwaitReadNext,
    /// A chunk is out, waiting for the host's verdict.
    AwaitReadAck,
    Receiving,
}

pub struct Target<B: MemoryBackend> {
    backend: B,
    config: TargetConfig,
    framer: Framer,
    state: TargetState,
    memory: MemoryType,
    mem_idx: usize,
    retries: u32,
    last_rx: Option<Instant>,
    outbox: VecDeque<Vec<u8>>,
}

impl<B: MemoryBackend> Target<B> {
    pub fn new(backend: B, config: TargetConfig) -> Self {
        Target {
            backend,
            framer: Framer::new(config.checksum.strategy()),
            config,
            state: TargetState::Disconnected,
            memory: MemoryType::None,
            mem_idx: 0,
            retries: 0,
            last_rx: None,
            outbox: VecDeque::new(),
        }
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn memory(&self) -> MemoryType {
        self.memory
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Feed bytes from the wire.
    pub fn receive(&mut self, bytes: &[u8], now: Instant) {
        for frame in self.framer.decode(bytes) {
            self.last_rx = Some(now);
            self.handle(frame);
        }
    }

    /// Drop the session after a silent period.
    pub fn poll(&mut self, now: Instant) {
        if self.state == TargetState::Disconnected {
            return;
        }
        if let Some(last) = self.last_rx {
            if now.duration_since(last) >= self.config.idle_timeout() {
                log::warn!("No traffic for {:?}, dropping session", self.config.idle_timeout());
                self.reset();
            }
        }
    }

    /// Next encoded reply, one frame at a time.
    pub fn pop_output(&mut self) -> Option<Vec<u8>> {
        self.outbox.pop_front()
    }

    pub fn drain_output(&mut self) -> Vec<u8> {
        self.outbox.drain(..).flatten().collect()
    }

    fn reset(&mut self) {
        self.state = TargetState::Disconnected;
        self.memory = MemoryType::None;
        self.mem_idx = 0;
        self.retries = 0;
        self.framer.clear();
    }

    fn handle(&mut self, frame: Frame) {
        log::debug!("<= {:?}", frame);

        if !self.framer.validate(&frame) {
            self.on_corrupted(frame.command);
            return;
        }

        // INIT restarts the session whatever state we're in
        if frame.command == Command::Init {
            self.reset();
            self.send(Command::Init, Vec::new());
            self.state = TargetState::AwaitMemId;
            return;
        }
        if frame.command == Command::Disconnect {
            log::info!("Host disconnected");
            self.reset();
            return;
        }

        match self.state {
            TargetState::Disconnected => {
                log::debug!("Not connected, ignoring {}", frame.command);
            }
            TargetState::AwaitMemId => match frame.command {
                Command::MemId => self.select_memory(frame.payload[0]),
                _ => {
                    self.send_error(ErrorCode::Unknown);
                    self.reset();
                }
            },
            TargetState::Idle => self.on_idle(frame),
            TargetState::AwaitReadNext => match frame.command {
                Command::ReadNext => {
                    self.retries = 0;
                    self.send_chunk();
                }
                Command::Err => self.abort(&frame),
                _ => self.reject(frame.command),
            },
            TargetState::AwaitReadAck => match frame.command {
                Command::TxRxAck => {
                    self.mem_idx += PKG_DATA_MAX;
                    if self.mem_idx >= self.memory.capacity() {
                        self.send_error(ErrorCode::MemIdx);
                        self.state = TargetState::Idle;
                    } else {
                        self.state = TargetState::AwaitReadNext;
                    }
                }
                Command::TxRxDone => {
                    log::info!("Read of {} done", self.memory);
                    self.state = TargetState::Idle;
                }
                Command::TxRxErr => {
                    if self.retry() {
                        self.send_chunk();
                    }
                }
                Command::Err => self.abort(&frame),
                _ => self.reject(frame.command),
            },
            TargetState::Receiving => match frame.command {
                Command::MemData => self.store_chunk(&frame.payload),
                Command::Err => self.abort(&frame),
                _ => self.reject(frame.command),
            },
        }
    }

    fn on_idle(&mut self, frame: Frame) {
        match frame.command {
            Command::Ping => self.send(Command::TxRxAck, Vec::new()),
            Command::MemId => self.select_memory(frame.payload[0]),
            Command::ReadMem | Command::WriteMem => {
                if frame.payload[0] != self.memory.id() {
                    log::warn!(
                        "{} for memory id {} but {} is selected",
                        frame.command,
                        frame.payload[0],
                        self.memory
                    );
                    self.send_error(ErrorCode::MemId);
                    return;
                }
                self.mem_idx = 0;
                self.retries = 0;
                self.send(Command::Ok, Vec::new());
                self.state = if frame.command == Command::ReadMem {
                    TargetState::AwaitReadNext
                } else {
                    TargetState::Receiving
                };
            }
            Command::Err => log::debug!("Host reported {:?}", frame.error_code()),
            _ => self.send_error(ErrorCode::Unknown),
        }
    }

    fn select_memory(&mut self, id: u8) {
        let selected = MemoryType::from_id(id)
            .ok_or_else(|| anyhow::format_err!("unknown memory id {}", id))
            .and_then(|memory| self.backend.select(memory).map(|_| memory));
        match selected {
            Ok(memory) => {
                log::info!("Memory selected: {}", memory);
                self.memory = memory;
                self.send(Command::Ok, Vec::new());
                self.state = TargetState::Idle;
            }
            Err(e) => {
                log::warn!("Can't select memory: {}", e);
                self.send_error(ErrorCode::MemId);
                self.reset();
            }
        }
    }

    fn send_chunk(&mut self) {
        let mut chunk = vec![0u8; PKG_DATA_MAX];
        match self.backend.read_block(self.mem_idx, &mut chunk) {
            Ok(()) => {
                self.send(Command::MemData, chunk);
                self.state = TargetState::AwaitReadAck;
            }
            Err(e) => {
                log::error!("Read at 0x{:04x} failed: {}", self.mem_idx, e);
                self.send_error(ErrorCode::ReadMem);
                self.state = TargetState::Idle;
            }
        }
    }

    fn store_chunk(&mut self, data: &[u8]) {
        if self.mem_idx + data.len() > self.memory.capacity() {
            self.send_error(ErrorCode::MemIdx);
            self.state = TargetState::Idle;
            return;
        }
        if let Err(code) = self.write_verified(data) {
            self.send_error(code);
            self.state = TargetState::Idle;
            return;
        }
        self.mem_idx += data.len();
        self.retries = 0;
        if self.mem_idx >= self.memory.capacity() {
            log::info!("Write of {} done", self.memory);
            self.send(Command::TxRxDone, Vec::new());
            self.state = TargetState::Idle;
        } else {
            self.send(Command::TxRxAck, Vec::new());
        }
    }

    /// Write then read back the same range.
    fn write_verified(&mut self, data: &[u8]) -> std::result::Result<(), ErrorCode> {
        let offset = self.mem_idx;
        self.backend.write_block(offset, data).map_err(|e| {
            log::error!("Write at 0x{:04x} failed: {}", offset, e);
            ErrorCode::WriteMem
        })?;
        let mut readback = vec![0u8; data.len()];
        self.backend.read_block(offset, &mut readback).map_err(|e| {
            log::error!("Read back at 0x{:04x} failed: {}", offset, e);
            ErrorCode::WriteMem
        })?;
        if readback != data {
            log::error!("Verify failed at 0x{:04x}", offset);
            return Err(ErrorCode::WriteMem);
        }
        Ok(())
    }

    fn on_corrupted(&mut self, command: Command) {
        log::warn!("Checksum mismatch on {}", command);
        match (self.state, command) {
            (TargetState::Receiving, Command::MemData) => {
                if self.retry() {
                    self.send(Command::TxRxErr, Vec::new());
                }
            }
            _ => log::debug!("Dropping corrupted {}", command),
        }
    }

    /// Count one retry. Past the ceiling the transfer is abandoned.
    fn retry(&mut self) -> bool {
        self.retries += 1;
        if self.retries > self.config.retries {
            log::error!("Giving up after {} retries", self.config.retries);
            self.send_error(ErrorCode::MaxRetry);
            self.reset();
            return false;
        }
        true
    }

    fn abort(&mut self, frame: &Frame) {
        log::warn!("Host aborted transfer: {:?}", frame.error_code());
        self.state = TargetState::Idle;
    }

    fn reject(&mut self, command: Command) {
        log::warn!("Unexpected {} in {:?}", command, self.state);
        self.send_error(ErrorCode::Unknown);
        self.state = TargetState::Idle;
    }

    fn send_error(&mut self, code: ErrorCode) {
        self.send(Command::Err, vec![code.into()]);
    }

    fn send(&mut self, command: Command, payload: Vec<u8>) {
        let raw = Frame::new(command, payload)
            .map_err(anyhow::Error::from)
            .and_then(|frame| {
                log::debug!("=> {:?}", frame);
                self.framer.encode(&frame)
            });
        match raw {
            Ok(raw) => self.outbox.push_back(raw),
            Err(e) => log::error!("Can't send {}: {}", command, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mockall::Sequence;
    use mockall::predicate::eq;

    use super::*;
    use crate::checksum::ChecksumMode;
    use crate::framer::Decoder;

    fn frame(command: Command, payload: &[u8]) -> Vec<u8> {
        Framer::default()
            .encode(&Frame::new(command, payload.to_vec()).unwrap())
            .unwrap()
    }

    fn replies<B: MemoryBackend>(target: &mut Target<B>) -> Vec<Frame> {
        Decoder::new().feed(&target.drain_output())
    }

    fn commands<B: MemoryBackend>(target: &mut Target<B>) -> Vec<Command> {
        replies(target).into_iter().map(|f| f.command).collect()
    }

    fn connected(mut backend: MockMemoryBackend, now: Instant) -> Target<MockMemoryBackend> {
        backend
            .expect_select()
            .with(eq(MemoryType::Lc16))
            .returning(|_| Ok(()));
        let mut target = Target::new(backend, TargetConfig::default());
        target.receive(&frame(Command::Init, &[]), now);
        target.receive(&frame(Command::MemId, &[1]), now);
        assert_eq!(commands(&mut target), vec![Command::Init, Command::Ok]);
        target
    }

    #[test]
    fn handshake_selects_memory() {
        // Given
        let now = Instant::now();
        let mut backend = MockMemoryBackend::new();
        backend
            .expect_select()
            .with(eq(MemoryType::Lc64))
            .times(1)
            .returning(|_| Ok(()));
        let mut target = Target::new(backend, TargetConfig::default());

        // When
        target.receive(&frame(Command::Init, &[]), now);
        target.receive(&frame(Command::MemId, &[2]), now);

        // Then
        assert_eq!(commands(&mut target), vec![Command::Init, Command::Ok]);
        assert_eq!(target.state(), TargetState::Idle);
        assert_eq!(target.memory(), MemoryType::Lc64);
    }

    #[test]
    fn missing_memory_is_rejected() {
        // Given
        let now = Instant::now();
        let mut backend = MockMemoryBackend::new();
        backend
            .expect_select()
            .returning(|m| Err(anyhow::format_err!("no {} fitted", m)));
        let mut target = Target::new(backend, TargetConfig::default());

        // When
        target.receive(&frame(Command::Init, &[]), now);
        target.receive(&frame(Command::MemId, &[4]), now);

        // Then
        let replies = replies(&mut target);
        assert_eq!(replies[1].error_code(), Some(ErrorCode::MemId));
        assert_eq!(target.state(), TargetState::Disconnected);
    }

    #[test]
    fn unknown_memory_id_is_rejected_without_touching_backend() {
        let now = Instant::now();
        let mut target = Target::new(MockMemoryBackend::new(), TargetConfig::default());

        target.receive(&frame(Command::Init, &[]), now);
        target.receive(&frame(Command::MemId, &[0]), now);

        assert_eq!(replies(&mut target)[1].error_code(), Some(ErrorCode::MemId));
    }

    #[test]
    fn ping_is_acknowledged() {
        let now = Instant::now();
        let mut target = connected(MockMemoryBackend::new(), now);

        target.receive(&frame(Command::Ping, &[]), now);

        assert_eq!(commands(&mut target), vec![Command::TxRxAck]);
        assert_eq!(target.state(), TargetState::Idle);
    }

    #[test]
    fn frames_before_init_are_ignored() {
        let now = Instant::now();
        let mut target = Target::new(MockMemoryBackend::new(), TargetConfig::default());

        target.receive(&frame(Command::Ping, &[]), now);
        target.receive(&frame(Command::ReadMem, &[1]), now);

        assert!(target.drain_output().is_empty());
    }

    #[test]
    fn read_serves_chunks_in_order() {
        // Given
        let now = Instant::now();
        let mut backend = MockMemoryBackend::new();
        let mut seq = Sequence::new();
        backend
            .expect_read_block()
            .with(eq(0), mockall::predicate::always())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, buf| {
                buf.fill(0x11);
                Ok(())
            });
        backend
            .expect_read_block()
            .with(eq(256), mockall::predicate::always())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, buf| {
                buf.fill(0x22);
                Ok(())
            });
        let mut target = connected(backend, now);

        // When
        target.receive(&frame(Command::ReadMem, &[1]), now);
        target.receive(&frame(Command::ReadNext, &[]), now);
        target.receive(&frame(Command::TxRxAck, &[]), now);
        target.receive(&frame(Command::ReadNext, &[]), now);
        target.receive(&frame(Command::TxRxDone, &[]), now);

        // Then
        let replies = replies(&mut target);
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0].command, Command::Ok);
        assert_eq!(replies[1].payload, vec![0x11; 256]);
        assert_eq!(replies[2].payload, vec![0x22; 256]);
        assert_eq!(target.state(), TargetState::Idle);
    }

    #[test]
    fn read_of_wrong_memory_is_refused() {
        let now = Instant::now();
        let mut target = connected(MockMemoryBackend::new(), now);

        target.receive(&frame(Command::ReadMem, &[3]), now);

        assert_eq!(replies(&mut target)[0].error_code(), Some(ErrorCode::MemId));
        assert_eq!(target.state(), TargetState::Idle);
    }

    #[test]
    fn ack_past_the_end_is_an_index_error() {
        // Given
        let now = Instant::now();
        let mut backend = MockMemoryBackend::new();
        backend.expect_read_block().returning(|_, _| Ok(()));
        let mut target = connected(backend, now);
        target.receive(&frame(Command::ReadMem, &[1]), now);

        // When
        for _ in 0..MemoryType::Lc16.chunks() {
            target.receive(&frame(Command::ReadNext, &[]), now);
            target.receive(&frame(Command::TxRxAck, &[]), now);
        }

        // Then
        let replies = replies(&mut target);
        assert_eq!(replies.last().unwrap().error_code(), Some(ErrorCode::MemIdx));
        assert_eq!(target.state(), TargetState::Idle);
    }

    #[test]
    fn rejected_chunk_is_resent_until_ceiling() {
        // Given
        let now = Instant::now();
        let mut backend = MockMemoryBackend::new();
        backend
            .expect_read_block()
            .with(eq(0), mockall::predicate::always())
            .returning(|_, _| Ok(()));
        let config = TargetConfig {
            retries: 2,
            ..Default::default()
        };
        backend.expect_select().returning(|_| Ok(()));
        let mut target = Target::new(backend, config);
        target.receive(&frame(Command::Init, &[]), now);
        target.receive(&frame(Command::MemId, &[1]), now);
        target.receive(&frame(Command::ReadMem, &[1]), now);
        target.receive(&frame(Command::ReadNext, &[]), now);
        target.drain_output();

        // When
        target.receive(&frame(Command::TxRxErr, &[]), now);
        target.receive(&frame(Command::TxRxErr, &[]), now);
        target.receive(&frame(Command::TxRxErr, &[]), now);

        // Then
        let replies = replies(&mut target);
        assert_eq!(replies[0].command, Command::MemData);
        assert_eq!(replies[1].command, Command::MemData);
        assert_eq!(replies[2].error_code(), Some(ErrorCode::MaxRetry));
        assert_eq!(target.state(), TargetState::Disconnected);
    }

    #[test]
    fn write_verifies_each_block() {
        // Given
        let now = Instant::now();
        let mut backend = MockMemoryBackend::new();
        let mut seq = Sequence::new();
        let block = vec![0x5a; 256];
        let expected = block.clone();
        backend
            .expect_write_block()
            .withf(move |offset, data| *offset == 0 && data == expected.as_slice())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        backend
            .expect_read_block()
            .with(eq(0), mockall::predicate::always())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, buf| {
                buf.fill(0x5a);
                Ok(())
            });
        let mut target = connected(backend, now);

        // When
        target.receive(&frame(Command::WriteMem, &[1]), now);
        target.receive(&frame(Command::MemData, &block), now);

        // Then
        assert_eq!(commands(&mut target), vec![Command::Ok, Command::TxRxAck]);
        assert_eq!(target.state(), TargetState::Receiving);
    }

    #[test]
    fn readback_mismatch_fails_write() {
        // Given
        let now = Instant::now();
        let mut backend = MockMemoryBackend::new();
        backend.expect_write_block().returning(|_, _| Ok(()));
        backend.expect_read_block().returning(|_, buf| {
            buf.fill(0xff);
            Ok(())
        });
        let mut target = connected(backend, now);

        // When
        target.receive(&frame(Command::WriteMem, &[1]), now);
        target.receive(&frame(Command::MemData, &[0u8; 256]), now);

        // Then
        let replies = replies(&mut target);
        assert_eq!(replies[1].error_code(), Some(ErrorCode::WriteMem));
        assert_eq!(target.state(), TargetState::Idle);
    }

    #[test]
    fn last_block_is_answered_with_done() {
        // Given
        let now = Instant::now();
        let mut backend = MockMemoryBackend::new();
        backend.expect_write_block().returning(|_, _| Ok(()));
        backend.expect_read_block().returning(|_, buf| {
            buf.fill(0x00);
            Ok(())
        });
        let mut target = connected(backend, now);
        target.receive(&frame(Command::WriteMem, &[1]), now);

        // When
        for _ in 0..MemoryType::Lc16.chunks() {
            target.receive(&frame(Command::MemData, &[0u8; 256]), now);
        }

        // Then
        let cmds = commands(&mut target);
        assert_eq!(cmds.len(), 1 + MemoryType::Lc16.chunks());
        assert_eq!(cmds.iter().filter(|c| **c == Command::TxRxAck).count(), 7);
        assert_eq!(cmds.last(), Some(&Command::TxRxDone));
        assert_eq!(target.state(), TargetState::Idle);
    }

    #[test]
    fn corrupted_block_asks_for_resend() {
        // Given
        let now = Instant::now();
        let mut backend = MockMemoryBackend::new();
        backend.expect_select().returning(|_| Ok(()));
        let mut target = Target::new(
            backend,
            TargetConfig {
                checksum: ChecksumMode::Crc16,
                ..Default::default()
            },
        );
        let crc = Framer::new(ChecksumMode::Crc16.strategy());
        let encode = |cmd, payload: &[u8]| {
            crc.encode(&Frame::new(cmd, payload.to_vec()).unwrap())
                .unwrap()
        };
        target.receive(&encode(Command::Init, &[]), now);
        target.receive(&encode(Command::MemId, &[1]), now);
        target.receive(&encode(Command::WriteMem, &[1]), now);
        target.drain_output();

        // When
        let mut block = encode(Command::MemData, &[0x42; 256]);
        block[10] ^= 0xff;
        target.receive(&block, now);

        // Then
        let replies = Framer::new(ChecksumMode::Crc16.strategy()).decode(&target.drain_output());
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::TxRxErr);
        assert_eq!(target.state(), TargetState::Receiving);
    }

    #[test]
    fn init_restarts_from_any_state() {
        let now = Instant::now();
        let mut target = connected(MockMemoryBackend::new(), now);
        target.receive(&frame(Command::WriteMem, &[1]), now);
        target.drain_output();

        target.receive(&frame(Command::Init, &[]), now);

        assert_eq!(commands(&mut target), vec![Command::Init]);
        assert_eq!(target.state(), TargetState::AwaitMemId);
        assert_eq!(target.memory(), MemoryType::None);
    }

    #[test]
    fn unexpected_command_in_idle() {
        let now = Instant::now();
        let mut target = connected(MockMemoryBackend::new(), now);

        target.receive(&frame(Command::ReadNext, &[]), now);

        assert_eq!(replies(&mut target)[0].error_code(), Some(ErrorCode::Unknown));
        assert_eq!(target.state(), TargetState::Idle);
    }

    #[test]
    fn silence_drops_the_session() {
        let now = Instant::now();
        let mut target = connected(MockMemoryBackend::new(), now);

        target.poll(now + Duration::from_millis(4999));
        assert_eq!(target.state(), TargetState::Idle);
        target.poll(now + Duration::from_millis(5000));
        assert_eq!(target.state(), TargetState::Disconnected);
    }

    #[test]
    fn disconnect_returns_to_start() {
        let now = Instant::now();
        let mut target = connected(MockMemoryBackend::new(), now);

        target.receive(&frame(Command::Disconnect, &[]), now);

        assert!(target.drain_output().is_empty());
        assert_eq!(target.state(), TargetState::Disconnected);
    }
}
