//! ZMODEM file transfers tunnelled through the terminal byte stream.
//!
//! A remote `sz` announces itself with a ZRQINIT header. When the session
//! sees it, it reports the request; if the host then starts a transfer, the
//! pty output is routed to a local receiver program (`rz`) until it exits or
//! is cancelled, and the receiver's output is written back to the pty.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::SessionError;

/// Start of a hex ZRQINIT header: pad, pad, ZDLE, hex format, frame type 00.
pub const ZMODEM_TRIGGER: &[u8] = b"**\x18B00";

/// Four CANs abort a ZMODEM session on the remote side.
pub const ZMODEM_ABORT: &[u8] = b"\x18\x18\x18\x18";

/// Sent after an abort to get the remote shell's prompt back.
pub const PROMPT_RECOVERY: &[u8] = b"\x01\x0b\n";

/// Finds a byte signature in a stream delivered in arbitrary chunks.
#[derive(Debug)]
pub struct TriggerScanner {
    signature: &'static [u8],
    carry: Vec<u8>,
}

impl TriggerScanner {
    pub fn new(signature: &'static [u8]) -> Self {
        Self {
            signature,
            carry: Vec::with_capacity(signature.len()),
        }
    }

    /// Feed the next chunk. Returns true if the signature ends in it.
    pub fn feed(&mut self, data: &[u8]) -> bool {
        let len = self.signature.len();
        if len == 0 {
            return false;
        }

        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(data);
        let found = window.windows(len).any(|w| w == self.signature);

        if found {
            self.carry.clear();
        } else {
            let keep = (len - 1).min(window.len());
            self.carry = window[window.len() - keep..].to_vec();
        }
        found
    }

    pub fn reset(&mut self) {
        self.carry.clear();
    }
}

/// What to run for a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Receiver program, e.g. `rz`.
    pub command: String,
    /// Directory received files are written to.
    pub directory: PathBuf,
    pub files: Vec<String>,
}

/// Reports from a running transfer program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Protocol bytes for the remote side.
    Output(Vec<u8>),
    /// A progress line.
    Status(String),
    /// The program exited. Always the last event.
    Exited(Option<i32>),
}

/// A running transfer program.
pub trait TransferHandler: Send {
    /// Feed bytes received from the pty to the program.
    fn send(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// Stop the program. An `Exited` event still follows.
    fn cancel(&mut self);
}

/// Starts transfer programs.
pub trait TransferSpawner: Send {
    fn spawn(
        &mut self,
        request: &TransferRequest,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<Box<dyn TransferHandler>, SessionError>;
}

/// Runs `<command> -v <files…>` in the target directory with tokio.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSpawner;

struct ProcessTransfer {
    input: mpsc::UnboundedSender<Vec<u8>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl TransferHandler for ProcessTransfer {
    fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.input
            .send(data.to_vec())
            .map_err(|_| SessionError::Transfer("transfer program stopped reading".to_string()))
    }

    fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl TransferSpawner for ProcessSpawner {
    fn spawn(
        &mut self,
        request: &TransferRequest,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<Box<dyn TransferHandler>, SessionError> {
        let mut child = tokio::process::Command::new(&request.command)
            .arg("-v")
            .args(&request.files)
            .current_dir(&request.directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Transfer(format!("failed to spawn {}: {e}", request.command)))?;

        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(SessionError::Transfer("transfer program has no pipes".to_string()));
        };

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(chunk) = input_rx.recv().await {
                if stdin.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let output_events = events.clone();
        let output = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_events.send(TransferEvent::Output(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let status_events = events.clone();
        let status = tokio::spawn(async move {
            let mut splitter = StatusSplitter::default();
            let mut buf = vec![0u8; 1024];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for line in splitter.feed(&buf[..n]) {
                            let _ = status_events.send(TransferEvent::Status(line));
                        }
                    }
                }
            }
            if let Some(line) = splitter.finish() {
                let _ = status_events.send(TransferEvent::Status(line));
            }
        });

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let command = request.command.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => status.ok().and_then(|s| s.code()),
                _ = cancel_rx => {
                    log::debug!("cancelling {command}");
                    let _ = child.kill().await;
                    None
                }
            };
            // Everything the program wrote goes out before the exit report.
            let _ = output.await;
            let _ = status.await;
            let _ = events.send(TransferEvent::Exited(code));
        });

        Ok(Box::new(ProcessTransfer {
            input: input_tx,
            cancel: Some(cancel_tx),
        }))
    }
}

/// Splits a transfer program's progress output into lines. Carriage
/// returns discard the partial line before them, as a terminal would
/// overwrite it.
#[derive(Debug, Default)]
pub(crate) struct StatusSplitter {
    line: Vec<u8>,
}

impl StatusSplitter {
    pub(crate) fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            match byte {
                b'\r' => self.line.clear(),
                b'\n' => {
                    if !self.line.is_empty() {
                        lines.push(String::from_utf8_lossy(&self.line).into_owned());
                    }
                    self.line.clear();
                }
                _ => self.line.push(byte),
            }
        }
        lines
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.line);
        (!line.is_empty()).then(|| String::from_utf8_lossy(&line).into_owned())
    }
}

/// Where a session's transfer bridge stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Idle,
    /// A transfer request was seen and awaits a decision.
    Detected,
    Busy,
}

/// Tracks the single transfer a session may run.
pub struct FileTransferBridge {
    phase: TransferPhase,
    scanner: TriggerScanner,
    handler: Option<Box<dyn TransferHandler>>,
    bytes_received: u64,
    bytes_sent: u64,
}

impl FileTransferBridge {
    pub fn new() -> Self {
        Self {
            phase: TransferPhase::Idle,
            scanner: TriggerScanner::new(ZMODEM_TRIGGER),
            handler: None,
            bytes_received: 0,
            bytes_sent: 0,
        }
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.phase == TransferPhase::Busy
    }

    /// Bytes routed from the pty to the transfer program.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Bytes the transfer program sent towards the pty.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Scan terminal output. Returns true when a new request is detected;
    /// requests seen while one is pending or running are ignored.
    pub fn scan(&mut self, data: &[u8]) -> bool {
        if !self.scanner.feed(data) || self.phase != TransferPhase::Idle {
            return false;
        }
        log::debug!("zmodem transfer request detected");
        self.phase = TransferPhase::Detected;
        true
    }

    /// Forget a detected request the host chose not to act on.
    pub fn dismiss(&mut self) {
        if self.phase == TransferPhase::Detected {
            self.phase = TransferPhase::Idle;
        }
    }

    /// Start the transfer for a detected request.
    pub fn start(
        &mut self,
        spawner: &mut dyn TransferSpawner,
        request: &TransferRequest,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Result<(), SessionError> {
        match self.phase {
            TransferPhase::Detected => {}
            TransferPhase::Busy => {
                return Err(SessionError::TransferRejected(
                    "a transfer is already running".to_string(),
                ))
            }
            TransferPhase::Idle => {
                return Err(SessionError::TransferRejected(
                    "no transfer request was detected".to_string(),
                ))
            }
        }

        let handler = spawner.spawn(request, events).inspect_err(|_| {
            self.phase = TransferPhase::Idle;
        })?;
        self.handler = Some(handler);
        self.phase = TransferPhase::Busy;
        self.bytes_received = 0;
        self.bytes_sent = 0;
        self.scanner.reset();
        Ok(())
    }

    /// Route pty output to the running transfer program.
    pub fn receive(&mut self, data: &[u8]) {
        let Some(handler) = self.handler.as_mut() else {
            return;
        };
        match handler.send(data) {
            Ok(()) => self.bytes_received += data.len() as u64,
            Err(e) => log::warn!("{e}"),
        }
    }

    pub fn record_sent(&mut self, len: usize) {
        self.bytes_sent += len as u64;
    }

    /// Stop the running transfer. Returns true if one was running.
    pub fn cancel(&mut self) -> bool {
        if let Some(handler) = self.handler.as_mut() {
            handler.cancel();
        }
        self.finish()
    }

    /// The transfer program is gone. Returns true if one was running.
    pub fn finish(&mut self) -> bool {
        if self.phase != TransferPhase::Busy {
            return false;
        }
        self.handler = None;
        self.phase = TransferPhase::Idle;
        log::debug!(
            "zmodem transfer finished: {} bytes in, {} bytes out",
            self.bytes_received,
            self.bytes_sent
        );
        true
    }
}

impl Default for FileTransferBridge {
    fn default() -> Self {
        Self::new()
    }
}
