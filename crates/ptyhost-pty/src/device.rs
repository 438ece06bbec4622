//! The device seam between a session and the pseudo-terminal it drives.
//!
//! [`PtyDevice`] is implemented by [`crate::PtyHandle`] for real ptys and by
//! `testing::ScriptedDevice` for deterministic tests. Everything a device
//! reports back (output, write completion, exit) arrives as a [`PtyEvent`]
//! on the receiver handed out by [`PtyDevice::take_events`].

use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::pty::PtyError;

pub use nix::sys::signal::Signal;

/// Environment variable naming the window that hosts the session.
pub const ENV_WINDOW_ID: &str = "WINDOWID";
/// Environment variable carrying the host application's IPC service name.
pub const ENV_IPC_SERVICE: &str = "PTYHOST_IPC_SERVICE";
/// Environment variable carrying the session's IPC object path.
pub const ENV_IPC_SESSION: &str = "PTYHOST_IPC_SESSION";

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

impl From<WindowSize> for portable_pty::PtySize {
    fn from(size: WindowSize) -> Self {
        portable_pty::PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Lifecycle of a device. A device is started at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    NotStarted,
    Running,
    Exited,
}

/// How the child process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: u32,
    /// Name of the signal that terminated the child, if any.
    pub signal: Option<String>,
}

impl ExitStatus {
    pub fn with_code(code: u32) -> Self {
        Self { code, signal: None }
    }

    pub fn with_signal(signal: &str) -> Self {
        Self {
            code: 1,
            signal: Some(signal.to_string()),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }

    pub fn signalled(&self) -> bool {
        self.signal.is_some()
    }
}

impl From<portable_pty::ExitStatus> for ExitStatus {
    fn from(status: portable_pty::ExitStatus) -> Self {
        Self {
            code: status.exit_code(),
            signal: status.signal().map(str::to_string),
        }
    }
}

/// Events produced by a running device, in the order the OS reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Output from the child process.
    Data(Vec<u8>),
    /// The previously submitted write has been fully accepted.
    WriteReady,
    /// The previously submitted write could not be delivered. The job is
    /// still the owner's to retry.
    WriteFailed,
    /// The child terminated. Always the last event.
    Exited(ExitStatus),
}

/// Receiving half of a device's event stream.
pub type PtyEvents = mpsc::UnboundedReceiver<PtyEvent>;

/// Everything needed to start the child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    pub program: String,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Value for `TERM`; left unset when empty.
    pub term: String,
    pub window_id: u64,
    pub register_in_utmp: bool,
    pub working_dir: Option<PathBuf>,
    pub ipc_service: Option<String>,
    pub ipc_session: Option<String>,
    /// Applied after the standard variables, so callers may override them.
    pub extra_env: Vec<(String, String)>,
}

impl SpawnRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The variables set on the child, in the order they are applied.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(4 + self.extra_env.len());
        if !self.term.is_empty() {
            env.push(("TERM".to_string(), self.term.clone()));
        }
        if let Some(service) = self.ipc_service.as_deref().filter(|s| !s.is_empty()) {
            env.push((ENV_IPC_SERVICE.to_string(), service.to_string()));
        }
        if let Some(session) = self.ipc_session.as_deref().filter(|s| !s.is_empty()) {
            env.push((ENV_IPC_SESSION.to_string(), session.to_string()));
        }
        env.push((ENV_WINDOW_ID.to_string(), self.window_id.to_string()));
        env.extend(self.extra_env.iter().cloned());
        env
    }
}

/// A pseudo-terminal with one attached child process.
///
/// Control operations are synchronous and non-blocking. Writes are
/// submitted one at a time; completion is reported as
/// [`PtyEvent::WriteReady`].
pub trait PtyDevice {
    /// Spawn the child. Fails with [`PtyError::Spawn`] if the pty cannot be
    /// allocated or the program cannot be executed, and with
    /// [`PtyError::AlreadyStarted`] on a second call.
    fn start(&mut self, request: SpawnRequest) -> Result<(), PtyError>;

    /// Hand out the event receiver. Returns `None` after the first call.
    fn take_events(&mut self) -> Option<PtyEvents>;

    fn state(&self) -> DeviceState;

    fn process_id(&self) -> Option<u32>;

    fn exit_status(&self) -> Option<ExitStatus>;

    fn window_size(&self) -> WindowSize;

    /// Inform the kernel (and through SIGWINCH, the child) of a new size.
    /// Before `start` the size is remembered and used to open the pty.
    fn set_window_size(&mut self, size: WindowSize);

    /// XON/XOFF handshaking. Attribute failures are logged, not returned.
    fn set_flow_control(&mut self, enabled: bool);

    fn set_utf8_mode(&mut self, enabled: bool);

    fn set_erase_char(&mut self, erase: u8);

    /// Toggle group write permission on the tty node (`mesg y/n`).
    fn set_writeable(&mut self, writeable: bool);

    /// Suspend (`true`) or resume (`false`) reading child output.
    fn lock(&mut self, locked: bool);

    /// Foreground process group of the pty, or 0 when unknown.
    fn foreground_process_group(&self) -> u32;

    /// Submit one write job.
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError>;

    fn signal_child(&mut self, signal: Signal) -> Result<(), PtyError>;

    fn signal_foreground(&mut self, signal: Signal) -> Result<(), PtyError>;
}
