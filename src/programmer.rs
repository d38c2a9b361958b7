//! Blocking front end over the link state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::LinkConfig;
use crate::constants::PKG_DATA_MAX;
use crate::error::LinkError;
use crate::host::{CommManager, Event, Operation, OperationKind};
use crate::memory::MemoryType;
use crate::transport::Transport;

const RX_BUF_SIZE: usize = 1024;
const IDLE_SLEEP: Duration = Duration::from_millis(1);

pub struct Programmer<T: Transport> {
    link: CommManager<T>,
    progress: ProgressBar,
    show_progress: bool,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<T: Transport> Programmer<T> {
    pub fn new(transport: T, memory: MemoryType, config: LinkConfig) -> Self {
        Programmer {
            link: CommManager::new(transport, memory, config),
            progress: ProgressBar::hidden(),
            show_progress: false,
            interrupt: None,
        }
    }

    /// Abort whatever is being waited on once `flag` is raised.
    ///
    /// The board is still sent DISCONNECT when the programmer is dropped.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn memory(&self) -> MemoryType {
        self.link.memory()
    }

    pub fn link(&self) -> &CommManager<T> {
        &self.link
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.link.transport_mut()
    }

    pub fn dump_info(&self) -> Result<()> {
        let memory = self.link.memory();
        log::info!(
            "Memory: {} ({} chunks of {} bytes)",
            memory,
            memory.chunks(),
            PKG_DATA_MAX
        );
        log::info!("Connected: {}", self.link.is_connected());
        Ok(())
    }

    /// Handshake with the board; retried internally up to the reconnect ceiling.
    pub fn connect(&mut self) -> Result<()> {
        self.link.start(Instant::now())?;
        self.wait_for(|event| match event {
            Event::Connected(memory) => {
                log::info!("Connected, memory {}", memory);
                Some(Ok(()))
            }
            _ => None,
        })
    }

    pub fn ping(&mut self) -> Result<()> {
        self.link.request(Operation::Ping, Instant::now())?;
        self.wait_for(|event| match event {
            Event::Pong { requested: true } => Some(Ok(())),
            Event::OperationFailed {
                op: OperationKind::Ping,
                error,
            } => Some(Err(error.into())),
            _ => None,
        })
    }

    pub fn read(&mut self) -> Result<Vec<u8>> {
        self.start_progress("Reading");
        self.link.request(Operation::Read, Instant::now())?;
        let data = self.wait_for(|event| match event {
            Event::ReadComplete(data) => Some(Ok(data)),
            Event::OperationFailed {
                op: OperationKind::Read,
                error,
            } => Some(Err(error.into())),
            _ => None,
        });
        self.progress.finish_and_clear();
        data
    }

    pub fn write(&mut self, image: &[u8]) -> Result<()> {
        self.link
            .request(Operation::Write(image.to_vec()), Instant::now())?;
        self.start_progress("Writing");
        let result = self.wait_for(|event| match event {
            Event::WriteComplete => Some(Ok(())),
            Event::OperationFailed {
                op: OperationKind::Write,
                error,
            } => Some(Err(error.into())),
            _ => None,
        });
        self.progress.finish_and_clear();
        result
    }

    /// Read the whole memory back and compare with `image`.
    pub fn verify(&mut self, image: &[u8]) -> Result<()> {
        let data = self.read()?;
        if let Some(offset) = data.iter().zip(image).position(|(a, b)| a != b) {
            anyhow::bail!(
                "verify failed at 0x{:04x}: expected 0x{:02x}, read 0x{:02x}",
                offset,
                image[offset],
                data[offset]
            );
        }
        anyhow::ensure!(data.len() == image.len(), "verify failed: length differs");
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.link.disconnect(Instant::now())
    }

    fn start_progress(&mut self, verb: &str) {
        if !self.show_progress {
            return;
        }
        let bar = ProgressBar::new(self.link.memory().capacity() as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(verb.to_string());
        self.progress = bar;
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Pump the transport until `f` accepts an event.
    fn wait_for<R>(&mut self, mut f: impl FnMut(Event) -> Option<Result<R>>) -> Result<R> {
        let mut buf = [0u8; RX_BUF_SIZE];
        loop {
            if self.interrupted() {
                log::warn!("Interrupted");
                return Err(LinkError::Interrupted.into());
            }

            while let Some(event) = self.link.next_event() {
                match event {
                    Event::Progress { done, .. } => self.progress.set_position(done as u64),
                    Event::Reconnecting { attempt, reason } => {
                        log::warn!("Link lost ({}), reconnect attempt {}", reason, attempt);
                    }
                    Event::SessionFailed(error) => return Err(error.into()),
                    other => {
                        if let Some(result) = f(other) {
                            return result;
                        }
                    }
                }
            }

            let n = self.link.transport_mut().recv_raw(&mut buf)?;
            let now = Instant::now();
            if n > 0 {
                self.link.receive(&buf[..n], now)?;
            }
            self.link.poll(now)?;

            if n == 0 {
                sleep(IDLE_SLEEP);
            }
        }
    }
}

impl<T: Transport> Drop for Programmer<T> {
    fn drop(&mut self) {
        if let Err(e) = self.link.disconnect(Instant::now()) {
            log::debug!("disconnect on drop: {}", e);
        }
    }
}
