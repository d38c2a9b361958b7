//! Host end of the link.
//!
//! [`CommManager`] owns the session: handshake, periodic liveness pings, chunked
//! reads and writes, retries and reconnects. It never blocks and never reads the
//! clock itself; every entry point takes `now`, and outcomes are reported as
//! [`Event`]s.
//!
//! All inputs (decoded frames, write completions, expired timers, new requests)
//! go through one queue and are handled strictly one at a time, so a handler never
//! runs while another is half way through.
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use anyhow::Result;

use crate::config::LinkConfig;
use crate::constants::PKG_DATA_MAX;
use crate::error::LinkError;
use crate::framer::Framer;
use crate::memory::MemoryType;
use crate::protocol::{Command, ErrorCode, Frame};
use crate::timer::Timer;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Disconnected,
    /// INIT sent, waiting for the echo.
    Init,
    /// MEMID sent, waiting for OK.
    MemId,
    Idle,
    WaitPing,
    WaitReadMemOk,
    WaitReadMemData,
    WaitWriteMemOk,
    WaitWriteAck,
    /// Gave up reconnecting. Only `start` leaves this state.
    Failed,
    /// Closed on request.
    Closed,
}

impl HostState {
    pub const fn name(self) -> &'static str {
        match self {
            HostState::Disconnected => "DISCONNECTED",
            HostState::Init => "INIT",
            HostState::MemId => "MEMID",
            HostState::Idle => "IDLE",
            HostState::WaitPing => "WAIT_PING",
            HostState::WaitReadMemOk => "WAIT_READMEM_OK",
            HostState::WaitReadMemData => "WAIT_READMEM_DATA",
            HostState::WaitWriteMemOk => "WAIT_WRITEMEM_OK",
            HostState::WaitWriteAck => "WAIT_WRITEMEM_ACK",
            HostState::Failed => "FAILED",
            HostState::Closed => "CLOSED",
        }
    }

    fn is_transfer(self) -> bool {
        matches!(
            self,
            HostState::WaitReadMemOk
                | HostState::WaitReadMemData
                | HostState::WaitWriteMemOk
                | HostState::WaitWriteAck
        )
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Work requested by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Read,
    /// Full image; must match the memory capacity exactly.
    Write(Vec<u8>),
    Ping,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Read => OperationKind::Read,
            Operation::Write(_) => OperationKind::Write,
            Operation::Ping => OperationKind::Ping,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    Ping,
}

/// Outcome notifications, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(MemoryType),
    Reconnecting { attempt: u32, reason: LinkError },
    /// `requested` is false for the periodic liveness ping.
    Pong { requested: bool },
    Progress { done: usize, total: usize },
    ReadComplete(Vec<u8>),
    WriteComplete,
    OperationFailed { op: OperationKind, error: LinkError },
    /// The session is dead; nothing else will happen until `start`.
    SessionFailed(LinkError),
}

#[derive(Debug)]
enum Input {
    Frame(Frame),
    SendComplete,
    Timeout,
    PingDue,
    Request(Operation),
}

pub struct CommManager<T: Transport> {
    transport: T,
    framer: Framer,
    config: LinkConfig,
    memory: MemoryType,
    state: HostState,
    connected: bool,

    inputs: VecDeque<Input>,
    events: VecDeque<Event>,

    tx_busy: bool,
    tx_queue: VecDeque<Frame>,
    last_tx: Command,
    last_rx: Command,

    current: Option<OperationKind>,
    pending: VecDeque<Operation>,
    buffer: Vec<u8>,
    index: usize,
    retries: u32,
    reconnects: u32,

    reply_timer: Timer,
    ping_timer: Timer,
}

impl<T: Transport> CommManager<T> {
    pub fn new(transport: T, memory: MemoryType, config: LinkConfig) -> Self {
        CommManager {
            transport,
            framer: Framer::new(config.checksum.strategy()),
            config,
            memory,
            state: HostState::Disconnected,
            connected: false,
            inputs: VecDeque::new(),
            events: VecDeque::new(),
            tx_busy: false,
            tx_queue: VecDeque::new(),
            last_tx: Command::None,
            last_rx: Command::None,
            current: None,
            pending: VecDeque::new(),
            buffer: Vec::new(),
            index: 0,
            retries: 0,
            reconnects: 0,
            reply_timer: Timer::default(),
            ping_timer: Timer::default(),
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn memory(&self) -> MemoryType {
        self.memory
    }

    /// True between the INIT echo and the next disconnect.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn current_operation(&self) -> Option<OperationKind> {
        self.current
    }

    pub fn last_sent(&self) -> Command {
        self.last_tx
    }

    pub fn last_received(&self) -> Command {
        self.last_rx
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Earliest moment `poll` has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.reply_timer.deadline(), self.ping_timer.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Begin the handshake.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        self.reconnects = 0;
        self.reset_session();
        self.connect(now)?;
        self.run(now)
    }

    /// Bytes from the transport.
    pub fn receive(&mut self, bytes: &[u8], now: Instant) -> Result<()> {
        for frame in self.framer.decode(bytes) {
            self.inputs.push_back(Input::Frame(frame));
        }
        self.run(now)
    }

    /// Fire expired timers.
    pub fn poll(&mut self, now: Instant) -> Result<()> {
        if self.reply_timer.expire(now) {
            self.inputs.push_back(Input::Timeout);
        }
        if self.ping_timer.expire(now) {
            self.inputs.push_back(Input::PingDue);
        }
        self.run(now)
    }

    /// Queue an operation. Runs as soon as the link is idle.
    ///
    /// A write image of the wrong size is refused here, before anything is sent.
    pub fn request(&mut self, op: Operation, now: Instant) -> Result<()> {
        if let Operation::Write(image) = &op {
            let expected = self.memory.capacity();
            if image.len() != expected {
                return Err(LinkError::SizeMismatch {
                    expected,
                    actual: image.len(),
                }
                .into());
            }
        }
        if matches!(self.state, HostState::Failed | HostState::Closed) {
            return Err(LinkError::Disconnected.into());
        }
        self.inputs.push_back(Input::Request(op));
        self.run(now)
    }

    /// Tell the device we're leaving and close the session.
    pub fn disconnect(&mut self, now: Instant) -> Result<()> {
        if self.connected {
            log::info!("Disconnecting from uC");
            let frame = Frame::bare(Command::Disconnect)?;
            self.write(frame, now)?;
        }
        self.abandon(LinkError::Disconnected);
        self.reset_session();
        self.state = HostState::Closed;
        Ok(())
    }

    fn run(&mut self, now: Instant) -> Result<()> {
        while let Some(input) = self.inputs.pop_front() {
            let before = self.state;
            match input {
                Input::Frame(frame) => self.on_frame(frame, now)?,
                Input::SendComplete => self.on_send_complete(now)?,
                Input::Timeout => self.on_timeout(now)?,
                Input::PingDue => self.on_ping_due(now)?,
                Input::Request(op) => {
                    self.pending.push_back(op);
                    self.service_pending(now)?;
                }
            }
            if self.state != before {
                log::debug!("{} -> {}", before, self.state);
            }
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) -> Result<()> {
        log::debug!("<= {:?}", frame);
        self.last_rx = frame.command;

        if !self.framer.validate(&frame) {
            return self.on_corrupted(frame.command, now);
        }

        match (self.state, frame.command) {
            (HostState::Disconnected | HostState::Failed | HostState::Closed, cmd) => {
                log::debug!("Not connected, ignoring {}", cmd);
            }

            (HostState::Init, Command::Init) => {
                log::info!("Connected to uC");
                self.connected = true;
                self.send(Frame::with_byte(Command::MemId, self.memory.id())?, now)?;
                self.state = HostState::MemId;
            }
            (HostState::MemId, Command::Ok) => {
                log::info!("Memory {} accepted", self.memory);
                self.reconnects = 0;
                self.events.push_back(Event::Connected(self.memory));
                self.enter_idle(now)?;
            }
            (HostState::MemId, Command::Err) => {
                let error = match frame.error_code() {
                    Some(ErrorCode::MemId) => LinkError::MemoryRejected(self.memory),
                    code => LinkError::Remote(code.unwrap_or(ErrorCode::Unknown)),
                };
                self.fail_session(error);
            }

            (HostState::WaitPing, Command::TxRxAck) => {
                let requested = self.current == Some(OperationKind::Ping);
                if requested {
                    self.current = None;
                }
                self.events.push_back(Event::Pong { requested });
                self.enter_idle(now)?;
            }

            (HostState::WaitReadMemOk, Command::Ok) => {
                self.send(Frame::bare(Command::ReadNext)?, now)?;
                self.state = HostState::WaitReadMemData;
            }
            (HostState::WaitReadMemData, Command::MemData) => {
                self.on_chunk(&frame.payload, now)?;
            }

            (HostState::WaitWriteMemOk, Command::Ok) => {
                self.send_block(now)?;
                self.state = HostState::WaitWriteAck;
            }
            (HostState::WaitWriteAck, Command::TxRxAck | Command::TxRxDone) => {
                self.on_block_accepted(frame.command, now)?;
            }
            (HostState::WaitWriteAck, Command::TxRxErr) => {
                self.retries += 1;
                if self.retries > self.config.write_retries {
                    return self.give_up(now);
                }
                log::warn!(
                    "Chunk at 0x{:04x} rejected, resending ({}/{})",
                    self.index,
                    self.retries,
                    self.config.write_retries
                );
                self.send_block(now)?;
            }

            (state, Command::Err) if state.is_transfer() => {
                let code = frame.error_code().unwrap_or(ErrorCode::Unknown);
                log::error!("uC error: {}", code);
                if code.ends_session() {
                    // the device has already dropped back to disconnected
                    self.reconnect(LinkError::Remote(code), now)?;
                } else {
                    self.finish_failed(LinkError::Remote(code));
                    self.enter_idle(now)?;
                }
            }

            (state, command) => {
                log::warn!("Unexpected {} in state {}", command, state);
                self.reconnect(
                    LinkError::UnexpectedCommand {
                        state: state.name(),
                        command,
                    },
                    now,
                )?;
            }
        }
        Ok(())
    }

    fn on_corrupted(&mut self, command: Command, now: Instant) -> Result<()> {
        log::warn!("Checksum mismatch on {}", command);
        if self.state == HostState::WaitReadMemData && command == Command::MemData {
            self.retries += 1;
            if self.retries > self.config.read_retries {
                return self.give_up(now);
            }
            return self.send(Frame::bare(Command::TxRxErr)?, now);
        }
        self.reconnect(LinkError::Checksum, now)
    }

    fn on_chunk(&mut self, payload: &[u8], now: Instant) -> Result<()> {
        let total = self.memory.capacity();
        let take = payload.len().min(total - self.buffer.len());
        self.buffer.extend_from_slice(&payload[..take]);
        self.retries = 0;
        self.events.push_back(Event::Progress {
            done: self.buffer.len(),
            total,
        });

        if self.buffer.len() < total {
            self.send(Frame::bare(Command::TxRxAck)?, now)?;
            self.send(Frame::bare(Command::ReadNext)?, now)?;
            return Ok(());
        }

        self.send(Frame::bare(Command::TxRxDone)?, now)?;
        log::info!("Read {} bytes from {}", total, self.memory);
        let data = std::mem::take(&mut self.buffer);
        self.current = None;
        self.events.push_back(Event::ReadComplete(data));
        self.enter_idle(now)
    }

    fn on_block_accepted(&mut self, reply: Command, now: Instant) -> Result<()> {
        let total = self.buffer.len();
        self.index = (self.index + PKG_DATA_MAX).min(total);
        self.retries = 0;
        self.events.push_back(Event::Progress {
            done: self.index,
            total,
        });

        match (reply, self.index >= total) {
            (Command::TxRxAck, false) => self.send_block(now),
            (Command::TxRxDone, true) => {
                log::info!("Wrote {} bytes to {}", total, self.memory);
                self.buffer.clear();
                self.current = None;
                self.events.push_back(Event::WriteComplete);
                self.enter_idle(now)
            }
            (command, _) => self.reconnect(
                LinkError::UnexpectedCommand {
                    state: self.state.name(),
                    command,
                },
                now,
            ),
        }
    }

    fn on_send_complete(&mut self, now: Instant) -> Result<()> {
        self.tx_busy = false;
        match self.tx_queue.pop_front() {
            Some(frame) => self.write(frame, now),
            None => Ok(()),
        }
    }

    fn on_timeout(&mut self, now: Instant) -> Result<()> {
        match self.state {
            HostState::Init | HostState::MemId | HostState::WaitPing => {
                log::warn!("No reply to {}", self.last_tx);
                self.reconnect(LinkError::Timeout(self.last_tx), now)
            }
            state if state.is_transfer() => {
                log::error!("Timeout in state {} after {}", state, self.last_tx);
                self.reconnect(LinkError::Timeout(self.last_tx), now)
            }
            _ => Ok(()),
        }
    }

    fn on_ping_due(&mut self, now: Instant) -> Result<()> {
        if self.state == HostState::Idle && self.current.is_none() && self.pending.is_empty() {
            self.send(Frame::bare(Command::Ping)?, now)?;
            self.state = HostState::WaitPing;
        }
        Ok(())
    }

    fn service_pending(&mut self, now: Instant) -> Result<()> {
        if self.state != HostState::Idle || self.current.is_some() {
            return Ok(());
        }
        let Some(op) = self.pending.pop_front() else {
            return Ok(());
        };
        self.ping_timer.cancel();
        self.current = Some(op.kind());
        self.index = 0;
        self.retries = 0;
        let id = self.memory.id();
        match op {
            Operation::Read => {
                log::info!("Reading {}", self.memory);
                self.buffer = Vec::with_capacity(self.memory.capacity());
                self.send(Frame::with_byte(Command::ReadMem, id)?, now)?;
                self.state = HostState::WaitReadMemOk;
            }
            Operation::Write(image) => {
                log::info!("Writing {}", self.memory);
                self.buffer = image;
                self.send(Frame::with_byte(Command::WriteMem, id)?, now)?;
                self.state = HostState::WaitWriteMemOk;
            }
            Operation::Ping => {
                self.send(Frame::bare(Command::Ping)?, now)?;
                self.state = HostState::WaitPing;
            }
        }
        Ok(())
    }

    fn send_block(&mut self, now: Instant) -> Result<()> {
        let end = (self.index + PKG_DATA_MAX).min(self.buffer.len());
        let block = self.buffer[self.index..end].to_vec();
        self.send(Frame::new(Command::MemData, block)?, now)
    }

    fn enter_idle(&mut self, now: Instant) -> Result<()> {
        self.state = HostState::Idle;
        self.reply_timer.cancel();
        self.ping_timer.arm(now, self.config.ping_interval());
        self.service_pending(now)
    }

    /// Send, or queue behind the frame still being written.
    fn send(&mut self, frame: Frame, now: Instant) -> Result<()> {
        if self.tx_busy {
            log::trace!("queued {:?}", frame);
            self.tx_queue.push_back(frame);
            return Ok(());
        }
        self.write(frame, now)
    }

    fn write(&mut self, frame: Frame, now: Instant) -> Result<()> {
        let raw = self.framer.encode(&frame)?;
        log::debug!("=> {:?}", frame);
        self.transport.send_raw(&raw)?;
        self.last_tx = frame.command;
        self.reply_timer
            .apply(now, self.config.timeouts.for_command(frame.command));
        self.tx_busy = true;
        self.inputs.push_back(Input::SendComplete);
        Ok(())
    }

    /// Abort the transfer, telling the device, then start over.
    ///
    /// The error bypasses the tx queue, which the reconnect is about to clear.
    fn give_up(&mut self, now: Instant) -> Result<()> {
        log::error!("Too many retries in state {}", self.state);
        self.write(Frame::error(ErrorCode::MaxRetry), now)?;
        self.reconnect(LinkError::MaxRetry, now)
    }

    fn connect(&mut self, now: Instant) -> Result<()> {
        log::info!("Connecting to uC, memory {}", self.memory);
        self.send(Frame::bare(Command::Init)?, now)?;
        self.state = HostState::Init;
        Ok(())
    }

    /// Fail the current operation and restart the handshake.
    fn reconnect(&mut self, reason: LinkError, now: Instant) -> Result<()> {
        self.finish_failed(reason.clone());
        self.reconnects += 1;
        if self.reconnects > self.config.reconnect_attempts {
            self.fail_session(LinkError::HandshakeFailed {
                attempts: self.reconnects,
            });
            return Ok(());
        }
        log::warn!(
            "Reconnecting ({}/{}): {}",
            self.reconnects,
            self.config.reconnect_attempts,
            reason
        );
        self.events.push_back(Event::Reconnecting {
            attempt: self.reconnects,
            reason,
        });
        self.reset_session();
        self.connect(now)
    }

    fn fail_session(&mut self, error: LinkError) {
        log::error!("{}", error);
        self.abandon(error.clone());
        self.reset_session();
        self.state = HostState::Failed;
        self.events.push_back(Event::SessionFailed(error));
    }

    fn finish_failed(&mut self, error: LinkError) {
        if let Some(op) = self.current.take() {
            self.events.push_back(Event::OperationFailed { op, error });
        }
        self.buffer.clear();
        self.index = 0;
        self.retries = 0;
    }

    /// Fail the current and every queued operation.
    fn abandon(&mut self, error: LinkError) {
        self.finish_failed(error.clone());
        for op in self.pending.drain(..) {
            self.events.push_back(Event::OperationFailed {
                op: op.kind(),
                error: error.clone(),
            });
        }
    }

    /// Drops everything in flight, including inputs not handled yet.
    fn reset_session(&mut self) {
        self.connected = false;
        self.state = HostState::Disconnected;
        self.framer.clear();
        self.inputs.clear();
        self.tx_busy = false;
        self.tx_queue.clear();
        self.reply_timer.cancel();
        self.ping_timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::checksum::ChecksumMode;
    use crate::framer::Decoder;

    /// Records every frame the host writes.
    #[derive(Default)]
    struct Wire {
        sent: Vec<u8>,
        fail: bool,
    }

    impl Transport for Wire {
        fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
            anyhow::ensure!(!self.fail, "port gone");
            self.sent.extend_from_slice(raw);
            Ok(())
        }

        fn recv_raw(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
    }

    fn reply(command: Command, payload: &[u8]) -> Vec<u8> {
        Framer::default()
            .encode(&Frame::new(command, payload.to_vec()).unwrap())
            .unwrap()
    }

    fn sent(host: &mut CommManager<Wire>) -> Vec<Frame> {
        let raw = std::mem::take(&mut host.transport_mut().sent);
        Decoder::new().feed(&raw)
    }

    fn sent_commands(host: &mut CommManager<Wire>) -> Vec<Command> {
        sent(host).into_iter().map(|f| f.command).collect()
    }

    fn events(host: &mut CommManager<Wire>) -> Vec<Event> {
        std::iter::from_fn(|| host.next_event()).collect()
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            reconnect_attempts: 2,
            ..Default::default()
        }
    }

    fn connected(memory: MemoryType, config: LinkConfig, now: Instant) -> CommManager<Wire> {
        let mut host = CommManager::new(Wire::default(), memory, config);
        host.start(now).unwrap();
        host.receive(&reply(Command::Init, &[]), now).unwrap();
        host.receive(&reply(Command::Ok, &[]), now).unwrap();
        sent(&mut host);
        assert_eq!(events(&mut host), vec![Event::Connected(memory)]);
        host
    }

    #[test]
    fn handshake() {
        // Given
        let now = Instant::now();
        let mut host = CommManager::new(Wire::default(), MemoryType::Lc64, LinkConfig::default());

        // When
        host.start(now).unwrap();
        let first = sent(&mut host);
        host.receive(&reply(Command::Init, &[]), now).unwrap();
        let second = sent(&mut host);
        host.receive(&reply(Command::Ok, &[]), now).unwrap();

        // Then
        assert_eq!(first, vec![Frame::bare(Command::Init).unwrap()]);
        assert_eq!(second, vec![Frame::with_byte(Command::MemId, 2).unwrap()]);
        assert_eq!(host.state(), HostState::Idle);
        assert!(host.is_connected());
        assert_eq!(events(&mut host), vec![Event::Connected(MemoryType::Lc64)]);
    }

    #[test]
    fn rejected_memory_is_fatal() {
        let now = Instant::now();
        let mut host = CommManager::new(Wire::default(), MemoryType::Lc256, fast_config());
        host.start(now).unwrap();
        host.receive(&reply(Command::Init, &[]), now).unwrap();

        host.receive(&reply(Command::Err, &[u8::from(ErrorCode::MemId)]), now)
            .unwrap();

        assert_eq!(host.state(), HostState::Failed);
        assert_eq!(
            events(&mut host),
            vec![Event::SessionFailed(LinkError::MemoryRejected(
                MemoryType::Lc256
            ))]
        );
    }

    #[test]
    fn silent_device_exhausts_reconnects() {
        // Given
        let t0 = Instant::now();
        let mut host = CommManager::new(Wire::default(), MemoryType::Lc16, fast_config());
        host.start(t0).unwrap();

        // When
        let mut now = t0;
        for _ in 0..3 {
            now += Duration::from_millis(2000);
            host.poll(now).unwrap();
        }

        // Then
        let inits = sent_commands(&mut host);
        assert_eq!(inits, vec![Command::Init; 3]);
        let events = events(&mut host);
        assert_eq!(
            events.last(),
            Some(&Event::SessionFailed(LinkError::HandshakeFailed { attempts: 3 }))
        );
        assert_eq!(
            events[0],
            Event::Reconnecting {
                attempt: 1,
                reason: LinkError::Timeout(Command::Init)
            }
        );
        assert_eq!(host.state(), HostState::Failed);
    }

    #[test]
    fn read_acks_each_chunk_and_finishes_with_done() {
        // Given
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);

        // When
        host.request(Operation::Read, now).unwrap();
        assert_eq!(
            sent(&mut host),
            vec![Frame::with_byte(Command::ReadMem, 1).unwrap()]
        );
        host.receive(&reply(Command::Ok, &[]), now).unwrap();
        assert_eq!(sent_commands(&mut host), vec![Command::ReadNext]);
        for chunk in 0..8u8 {
            host.receive(&reply(Command::MemData, &[chunk; 256]), now)
                .unwrap();
            let expected = if chunk < 7 {
                vec![Command::TxRxAck, Command::ReadNext]
            } else {
                vec![Command::TxRxDone]
            };
            assert_eq!(sent_commands(&mut host), expected);
        }

        // Then
        let events = events(&mut host);
        assert_eq!(events.len(), 9);
        assert_eq!(events[0], Event::Progress { done: 256, total: 2048 });
        let Event::ReadComplete(data) = &events[8] else {
            panic!("expected ReadComplete, got {:?}", events[8]);
        };
        assert_eq!(data.len(), 2048);
        assert_eq!(data[0x100], 1);
        assert_eq!(data[0x7ff], 7);
        assert_eq!(host.state(), HostState::Idle);
        assert_eq!(host.current_operation(), None);
    }

    #[test]
    fn write_size_mismatch_fails_before_sending() {
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);

        let err = host.request(Operation::Write(vec![0; 100]), now).unwrap_err();

        assert_eq!(
            err.downcast_ref::<LinkError>(),
            Some(&LinkError::SizeMismatch {
                expected: 2048,
                actual: 100
            })
        );
        assert!(sent(&mut host).is_empty());
        assert_eq!(host.state(), HostState::Idle);
    }

    #[test]
    fn write_sends_blocks_in_lockstep() {
        // Given
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);
        let image: Vec<u8> = (0..2048).map(|i| (i / 256) as u8).collect();

        // When
        host.request(Operation::Write(image), now).unwrap();
        assert_eq!(
            sent(&mut host),
            vec![Frame::with_byte(Command::WriteMem, 1).unwrap()]
        );
        host.receive(&reply(Command::Ok, &[]), now).unwrap();
        let mut blocks = sent(&mut host);
        for _ in 0..7 {
            host.receive(&reply(Command::TxRxAck, &[]), now).unwrap();
            blocks.extend(sent(&mut host));
        }
        host.receive(&reply(Command::TxRxDone, &[]), now).unwrap();

        // Then
        assert_eq!(blocks.len(), 8);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.command, Command::MemData);
            assert_eq!(block.payload, vec![i as u8; 256]);
        }
        assert!(sent(&mut host).is_empty());
        assert_eq!(events(&mut host).last(), Some(&Event::WriteComplete));
        assert_eq!(host.state(), HostState::Idle);
    }

    #[test]
    fn rejected_block_is_resent_then_gives_up() {
        // Given
        let now = Instant::now();
        let config = LinkConfig {
            write_retries: 2,
            ..Default::default()
        };
        let mut host = connected(MemoryType::Lc16, config, now);
        host.request(Operation::Write(vec![0xaa; 2048]), now).unwrap();
        host.receive(&reply(Command::Ok, &[]), now).unwrap();
        sent(&mut host);

        // When
        host.receive(&reply(Command::TxRxErr, &[]), now).unwrap();
        host.receive(&reply(Command::TxRxErr, &[]), now).unwrap();
        let resent = sent_commands(&mut host);
        host.receive(&reply(Command::TxRxErr, &[]), now).unwrap();

        // Then
        assert_eq!(resent, vec![Command::MemData, Command::MemData]);
        let aborted = sent(&mut host);
        assert_eq!(aborted[0], Frame::error(ErrorCode::MaxRetry));
        assert_eq!(aborted[1].command, Command::Init);
        assert_eq!(
            events(&mut host)[0],
            Event::OperationFailed {
                op: OperationKind::Write,
                error: LinkError::MaxRetry
            }
        );
        assert_eq!(host.state(), HostState::Init);
    }

    #[test]
    fn remote_error_aborts_only_the_operation() {
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);
        host.request(Operation::Write(vec![0; 2048]), now).unwrap();
        host.receive(&reply(Command::Ok, &[]), now).unwrap();

        host.receive(&reply(Command::Err, &[u8::from(ErrorCode::WriteMem)]), now)
            .unwrap();

        assert_eq!(
            events(&mut host)[0],
            Event::OperationFailed {
                op: OperationKind::Write,
                error: LinkError::Remote(ErrorCode::WriteMem)
            }
        );
        assert_eq!(host.state(), HostState::Idle);
        assert!(host.is_connected());
    }

    #[test]
    fn device_giving_up_forces_a_reconnect() {
        // Given
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);
        host.request(Operation::Read, now).unwrap();
        host.receive(&reply(Command::Ok, &[]), now).unwrap();
        sent(&mut host);

        // When
        host.receive(&reply(Command::Err, &[u8::from(ErrorCode::MaxRetry)]), now)
            .unwrap();

        // Then
        let reason = LinkError::Remote(ErrorCode::MaxRetry);
        assert_eq!(
            events(&mut host),
            vec![
                Event::OperationFailed {
                    op: OperationKind::Read,
                    error: reason.clone()
                },
                Event::Reconnecting { attempt: 1, reason },
            ]
        );
        assert_eq!(sent_commands(&mut host), vec![Command::Init]);
        assert_eq!(host.state(), HostState::Init);
        assert!(!host.is_connected());
    }

    #[test]
    fn back_to_back_rejections_still_tell_the_device() {
        // Given
        let now = Instant::now();
        let config = LinkConfig {
            write_retries: 1,
            ..Default::default()
        };
        let mut host = connected(MemoryType::Lc16, config, now);
        host.request(Operation::Write(vec![0x5a; 2048]), now).unwrap();
        host.receive(&reply(Command::Ok, &[]), now).unwrap();
        sent(&mut host);

        // When: both rejections decoded from one read of the port
        let mut batch = reply(Command::TxRxErr, &[]);
        batch.extend(reply(Command::TxRxErr, &[]));
        host.receive(&batch, now).unwrap();

        // Then
        let frames = sent(&mut host);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].command, Command::MemData);
        assert_eq!(frames[1], Frame::error(ErrorCode::MaxRetry));
        assert_eq!(frames[2].command, Command::Init);
        assert_eq!(host.state(), HostState::Init);
    }

    #[test]
    fn lost_chunk_times_out_and_reconnects() {
        // Given
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);
        host.request(Operation::Read, now).unwrap();
        host.receive(&reply(Command::Ok, &[]), now).unwrap();
        host.receive(&reply(Command::MemData, &[0; 256]), now).unwrap();
        sent(&mut host);
        events(&mut host);

        // When
        host.poll(now + Duration::from_millis(1499)).unwrap();
        assert_eq!(host.state(), HostState::WaitReadMemData);
        host.poll(now + Duration::from_millis(1500)).unwrap();

        // Then
        assert_eq!(
            events(&mut host),
            vec![
                Event::OperationFailed {
                    op: OperationKind::Read,
                    error: LinkError::Timeout(Command::ReadNext)
                },
                Event::Reconnecting {
                    attempt: 1,
                    reason: LinkError::Timeout(Command::ReadNext)
                },
            ]
        );
        assert_eq!(sent_commands(&mut host), vec![Command::Init]);
    }

    #[test]
    fn periodic_ping_only_when_idle() {
        // Given
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);

        // When
        host.poll(now + Duration::from_millis(499)).unwrap();
        assert!(sent(&mut host).is_empty());
        host.poll(now + Duration::from_millis(500)).unwrap();
        host.poll(now + Duration::from_millis(999)).unwrap();

        // Then
        assert_eq!(sent_commands(&mut host), vec![Command::Ping]);
        assert_eq!(host.state(), HostState::WaitPing);
        host.receive(&reply(Command::TxRxAck, &[]), now + Duration::from_millis(510))
            .unwrap();
        assert_eq!(
            events(&mut host),
            vec![Event::Pong { requested: false }]
        );
        assert_eq!(host.current_operation(), None);
        assert_eq!(host.state(), HostState::Idle);
    }

    #[test]
    fn request_during_ping_waits_for_ack() {
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);
        host.poll(now + Duration::from_millis(500)).unwrap();
        sent(&mut host);

        host.request(Operation::Read, now).unwrap();
        assert!(sent(&mut host).is_empty());
        host.receive(&reply(Command::TxRxAck, &[]), now).unwrap();

        assert_eq!(sent_commands(&mut host), vec![Command::ReadMem]);
        assert_eq!(host.current_operation(), Some(OperationKind::Read));
    }

    #[test]
    fn requested_ping_gets_its_own_pong() {
        // Given: a periodic ping is already in flight
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);
        let later = now + Duration::from_millis(500);
        host.poll(later).unwrap();
        host.request(Operation::Ping, later).unwrap();

        // When
        host.receive(&reply(Command::TxRxAck, &[]), later).unwrap();
        let first = events(&mut host);
        host.receive(&reply(Command::TxRxAck, &[]), later).unwrap();

        // Then
        assert_eq!(first, vec![Event::Pong { requested: false }]);
        assert_eq!(events(&mut host), vec![Event::Pong { requested: true }]);
        assert_eq!(sent_commands(&mut host), vec![Command::Ping, Command::Ping]);
        assert_eq!(host.current_operation(), None);
    }

    #[test]
    fn unanswered_ping_reconnects() {
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);
        host.poll(now + Duration::from_millis(500)).unwrap();

        host.poll(now + Duration::from_millis(1000)).unwrap();

        assert_eq!(
            events(&mut host),
            vec![Event::Reconnecting {
                attempt: 1,
                reason: LinkError::Timeout(Command::Ping)
            }]
        );
        assert_eq!(host.state(), HostState::Init);
        assert!(!host.is_connected());
    }

    #[test]
    fn unexpected_reply_reconnects() {
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);
        host.request(Operation::Read, now).unwrap();

        host.receive(&reply(Command::TxRxDone, &[]), now).unwrap();

        assert_eq!(
            events(&mut host)[0],
            Event::OperationFailed {
                op: OperationKind::Read,
                error: LinkError::UnexpectedCommand {
                    state: "WAIT_READMEM_OK",
                    command: Command::TxRxDone
                }
            }
        );
        assert_eq!(host.state(), HostState::Init);
    }

    #[test]
    fn corrupted_chunk_is_requested_again() {
        // Given
        let now = Instant::now();
        let config = LinkConfig {
            checksum: ChecksumMode::Crc16,
            ..Default::default()
        };
        let mut host = CommManager::new(Wire::default(), MemoryType::Lc16, config);
        let crc = Framer::new(ChecksumMode::Crc16.strategy());
        let reply = |cmd, payload: &[u8]| {
            crc.encode(&Frame::new(cmd, payload.to_vec()).unwrap())
                .unwrap()
        };
        host.start(now).unwrap();
        host.receive(&reply(Command::Init, &[]), now).unwrap();
        host.receive(&reply(Command::Ok, &[]), now).unwrap();
        host.request(Operation::Read, now).unwrap();
        host.receive(&reply(Command::Ok, &[]), now).unwrap();
        host.transport_mut().sent.clear();

        // When
        let mut chunk = reply(Command::MemData, &[0x33; 256]);
        chunk[2] ^= 0xff;
        host.receive(&chunk, now).unwrap();

        // Then
        let raw = std::mem::take(&mut host.transport_mut().sent);
        let frames = Framer::new(ChecksumMode::Crc16.strategy()).decode(&raw);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, Command::TxRxErr);
        assert_eq!(host.state(), HostState::WaitReadMemData);
    }

    #[test]
    fn corrupted_chunks_past_the_ceiling_abort_the_read() {
        // Given
        let now = Instant::now();
        let config = LinkConfig {
            checksum: ChecksumMode::Crc16,
            read_retries: 2,
            ..Default::default()
        };
        let crc = Framer::new(ChecksumMode::Crc16.strategy());
        let reply = |cmd, payload: &[u8]| {
            crc.encode(&Frame::new(cmd, payload.to_vec()).unwrap())
                .unwrap()
        };
        let mut host = CommManager::new(Wire::default(), MemoryType::Lc16, config);
        host.start(now).unwrap();
        host.receive(&reply(Command::Init, &[]), now).unwrap();
        host.receive(&reply(Command::Ok, &[]), now).unwrap();
        host.request(Operation::Read, now).unwrap();
        host.receive(&reply(Command::Ok, &[]), now).unwrap();
        host.transport_mut().sent.clear();
        events(&mut host);

        // When
        let mut chunk = reply(Command::MemData, &[0x33; 256]);
        chunk[2] ^= 0xff;
        for _ in 0..3 {
            host.receive(&chunk, now).unwrap();
        }

        // Then
        let raw = std::mem::take(&mut host.transport_mut().sent);
        let frames = Framer::new(ChecksumMode::Crc16.strategy()).decode(&raw);
        let commands: Vec<Command> = frames.iter().map(|f| f.command).collect();
        assert_eq!(
            commands,
            vec![Command::TxRxErr, Command::TxRxErr, Command::Err, Command::Init]
        );
        assert_eq!(frames[2].error_code(), Some(ErrorCode::MaxRetry));
        assert_eq!(
            events(&mut host),
            vec![
                Event::OperationFailed {
                    op: OperationKind::Read,
                    error: LinkError::MaxRetry
                },
                Event::Reconnecting {
                    attempt: 1,
                    reason: LinkError::MaxRetry
                },
            ]
        );
        assert_eq!(host.state(), HostState::Init);
    }

    #[test]
    fn disconnect_notifies_device_and_fails_pending() {
        let now = Instant::now();
        let mut host = connected(MemoryType::Lc16, LinkConfig::default(), now);
        host.request(Operation::Read, now).unwrap();
        sent(&mut host);

        host.disconnect(now).unwrap();

        assert_eq!(sent_commands(&mut host), vec![Command::Disconnect]);
        assert_eq!(
            events(&mut host),
            vec![Event::OperationFailed {
                op: OperationKind::Read,
                error: LinkError::Disconnected
            }]
        );
        assert_eq!(host.state(), HostState::Closed);
        assert!(host.request(Operation::Read, now).is_err());
    }

    #[test]
    fn transport_errors_propagate() {
        let now = Instant::now();
        let mut host = CommManager::new(
            Wire {
                fail: true,
                ..Default::default()
            },
            MemoryType::Lc16,
            LinkConfig::default(),
        );
        assert!(host.start(now).is_err());
    }
}
