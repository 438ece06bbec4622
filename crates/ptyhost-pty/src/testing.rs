//! An in-memory [`PtyDevice`] that records every call.
//!
//! Enabled with the `testing` feature so that crates built on top of the
//! device can exercise their coordination logic without a real pty.

use tokio::sync::mpsc;

use crate::device::{
    DeviceState, ExitStatus, PtyDevice, PtyEvent, PtyEvents, Signal, SpawnRequest, WindowSize,
};
use crate::pty::PtyError;

/// A line-discipline attribute change requested on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    FlowControl(bool),
    Utf8(bool),
    Erase(u8),
}

/// Who a signal was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    Child,
    ForegroundGroup,
}

#[derive(Debug)]
pub struct ScriptedDevice {
    pub state: DeviceState,
    pub size: WindowSize,
    pub pid: u32,
    pub foreground_group: u32,
    pub spawned: Vec<SpawnRequest>,
    pub writes: Vec<Vec<u8>>,
    pub resizes: Vec<WindowSize>,
    pub attributes: Vec<Attribute>,
    pub signals: Vec<(SignalTarget, Signal)>,
    pub writeable: Option<bool>,
    pub locked: bool,
    /// Make `start` fail with a spawn error.
    pub fail_spawn: bool,
    /// Make `write` refuse jobs.
    pub fail_writes: bool,
    /// Make signal delivery fail.
    pub fail_signals: bool,
    exit: Option<ExitStatus>,
    events_tx: mpsc::UnboundedSender<PtyEvent>,
    events_rx: Option<PtyEvents>,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: DeviceState::NotStarted,
            size: WindowSize::default(),
            pid: 4242,
            foreground_group: 4242,
            spawned: Vec::new(),
            writes: Vec::new(),
            resizes: Vec::new(),
            attributes: Vec::new(),
            signals: Vec::new(),
            writeable: None,
            locked: false,
            fail_spawn: false,
            fail_writes: false,
            fail_signals: false,
            exit: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Queue an event as if the OS had produced it.
    pub fn emit(&self, event: PtyEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Queue child output.
    pub fn output(&self, data: &[u8]) {
        self.emit(PtyEvent::Data(data.to_vec()));
    }

    /// Acknowledge the in-flight write.
    pub fn complete_write(&self) {
        self.emit(PtyEvent::WriteReady);
    }

    /// Report that the in-flight write was not delivered.
    pub fn fail_write(&self) {
        self.emit(PtyEvent::WriteFailed);
    }

    /// Terminate the child with `status`.
    pub fn exit(&mut self, status: ExitStatus) {
        self.state = DeviceState::Exited;
        self.exit = Some(status.clone());
        self.emit(PtyEvent::Exited(status));
    }

    fn record_signal(&mut self, target: SignalTarget, signal: Signal) -> Result<(), PtyError> {
        if self.state != DeviceState::Running {
            return Err(PtyError::NotRunning);
        }
        if self.fail_signals {
            return Err(PtyError::Signal(nix::errno::Errno::ESRCH));
        }
        self.signals.push((target, signal));
        Ok(())
    }
}

impl Default for ScriptedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyDevice for ScriptedDevice {
    fn start(&mut self, request: SpawnRequest) -> Result<(), PtyError> {
        if self.state != DeviceState::NotStarted {
            return Err(PtyError::AlreadyStarted);
        }
        if self.fail_spawn {
            return Err(PtyError::Spawn(format!("failed to spawn {}", request.program)));
        }
        self.spawned.push(request);
        self.state = DeviceState::Running;
        Ok(())
    }

    fn take_events(&mut self) -> Option<PtyEvents> {
        self.events_rx.take()
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn process_id(&self) -> Option<u32> {
        (self.state != DeviceState::NotStarted).then_some(self.pid)
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.clone()
    }

    fn window_size(&self) -> WindowSize {
        self.size
    }

    fn set_window_size(&mut self, size: WindowSize) {
        self.size = size;
        self.resizes.push(size);
    }

    fn set_flow_control(&mut self, enabled: bool) {
        self.attributes.push(Attribute::FlowControl(enabled));
    }

    fn set_utf8_mode(&mut self, enabled: bool) {
        self.attributes.push(Attribute::Utf8(enabled));
    }

    fn set_erase_char(&mut self, erase: u8) {
        self.attributes.push(Attribute::Erase(erase));
    }

    fn set_writeable(&mut self, writeable: bool) {
        self.writeable = Some(writeable);
    }

    fn lock(&mut self, locked: bool) {
        self.locked = locked;
    }

    fn foreground_process_group(&self) -> u32 {
        if self.state == DeviceState::Running {
            self.foreground_group
        } else {
            0
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        if self.state != DeviceState::Running {
            return Err(PtyError::NotRunning);
        }
        if self.fail_writes {
            return Err(PtyError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "scripted write failure",
            )));
        }
        self.writes.push(data.to_vec());
        Ok(())
    }

    fn signal_child(&mut self, signal: Signal) -> Result<(), PtyError> {
        self.record_signal(SignalTarget::Child, signal)
    }

    fn signal_foreground(&mut self, signal: Signal) -> Result<(), PtyError> {
        self.record_signal(SignalTarget::ForegroundGroup, signal)
    }
}
