use std::os::unix::fs::PermissionsExt;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty};
use tokio::sync::mpsc;

use crate::device::{
    DeviceState, ExitStatus, PtyDevice, PtyEvent, PtyEvents, SpawnRequest, WindowSize,
};
use crate::io_thread::{start_reader_thread, start_writer_thread, ExitSlot, ReadGate};
use crate::termios;

/// Errors from PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("PTY spawn failed: {0}")]
    Spawn(String),
    #[error("PTY has already been started")]
    AlreadyStarted,
    #[error("PTY is not running")]
    NotRunning,
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PTY resize failed: {0}")]
    Resize(String),
    #[error("terminal attribute error: {0}")]
    Attribute(String),
    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),
}

/// Group write, the bit `mesg y` toggles.
const MODE_GROUP_WRITE: u32 = 0o020;
/// Group and other write.
const MODE_ANY_WRITE: u32 = 0o022;

/// The parts of a device that only exist once the child is running.
struct Running {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    jobs: std_mpsc::Sender<Vec<u8>>,
}

/// Owns a portable-pty master, the child attached to its slave, and the
/// threads that pump bytes between them.
pub struct PtyHandle {
    size: WindowSize,
    flow_control: bool,
    utf8_mode: Option<bool>,
    erase: Option<u8>,
    register_in_utmp: bool,
    running: Option<Running>,
    gate: Arc<ReadGate>,
    exit: ExitSlot,
    events_tx: mpsc::UnboundedSender<PtyEvent>,
    events_rx: Option<PtyEvents>,
}

impl PtyHandle {
    /// Create an unstarted device with the default 24x80 size.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            size: WindowSize::default(),
            flow_control: false,
            utf8_mode: None,
            erase: None,
            register_in_utmp: false,
            running: None,
            gate: Arc::new(ReadGate::default()),
            exit: Arc::new(Mutex::new(None)),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Whether the child was asked to be registered in utmp.
    pub fn registered_in_utmp(&self) -> bool {
        self.register_in_utmp
    }

    pub fn is_locked(&self) -> bool {
        self.gate.is_locked()
    }

    fn master_fd(&self) -> Option<std::os::fd::RawFd> {
        self.running.as_ref().and_then(|r| r.master.as_raw_fd())
    }

    /// Run an attribute change against the master, logging any failure.
    fn apply_attribute(
        &self,
        what: &str,
        apply: impl FnOnce(std::os::fd::RawFd) -> Result<(), PtyError>,
    ) {
        let Some(fd) = self.master_fd() else {
            log::debug!("{what}: pty not running, applied at start");
            return;
        };
        if let Err(e) = apply(fd) {
            log::warn!("{what}: {e}");
        }
    }

    fn apply_pending_attributes(&self) {
        let flow_control = self.flow_control;
        self.apply_attribute("flow control", |fd| {
            termios::set_flow_control(fd, flow_control)
        });
        if let Some(enabled) = self.utf8_mode {
            self.apply_attribute("utf8 mode", |fd| termios::set_utf8_mode(fd, enabled));
        }
        if let Some(erase) = self.erase {
            self.apply_attribute("erase character", |fd| termios::set_erase_char(fd, erase));
        }
    }
}

impl Default for PtyHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyDevice for PtyHandle {
    fn start(&mut self, request: SpawnRequest) -> Result<(), PtyError> {
        if self.state() != DeviceState::NotStarted {
            return Err(PtyError::AlreadyStarted);
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(self.size.into())
            .map_err(|e| PtyError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        for (key, value) in request.environment() {
            cmd.env(key, value);
        }
        if let Some(dir) = &request.working_dir {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(format!("failed to spawn {}: {e}", request.program)))?;
        // Only the child may hold the slave open, so the master sees EOF on exit.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(format!("failed to clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(format!("failed to take writer: {e}")))?;

        let tag = pid.map_or_else(|| "pty".to_string(), |p| format!("pty-{p}"));
        let jobs = start_writer_thread(format!("{tag}-write"), writer, self.events_tx.clone())?;
        start_reader_thread(
            format!("{tag}-read"),
            reader,
            child,
            Arc::clone(&self.gate),
            Arc::clone(&self.exit),
            self.events_tx.clone(),
        )?;

        self.register_in_utmp = request.register_in_utmp;
        if self.register_in_utmp {
            log::debug!(
                "utmp registration requested for {}; not supported by this backend",
                request.program
            );
        }

        self.running = Some(Running {
            master: pair.master,
            killer,
            pid,
            jobs,
        });
        self.apply_pending_attributes();

        log::debug!("started {} (pid {:?})", request.program, pid);
        Ok(())
    }

    fn take_events(&mut self) -> Option<PtyEvents> {
        self.events_rx.take()
    }

    fn state(&self) -> DeviceState {
        if self.running.is_none() {
            DeviceState::NotStarted
        } else if self.exit_status().is_some() {
            DeviceState::Exited
        } else {
            DeviceState::Running
        }
    }

    fn process_id(&self) -> Option<u32> {
        self.running.as_ref().and_then(|r| r.pid)
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn window_size(&self) -> WindowSize {
        self.size
    }

    fn set_window_size(&mut self, size: WindowSize) {
        self.size = size;
        if let Some(running) = &self.running {
            if let Err(e) = running.master.resize(size.into()) {
                log::warn!("{}", PtyError::Resize(e.to_string()));
            }
        }
    }

    fn set_flow_control(&mut self, enabled: bool) {
        self.flow_control = enabled;
        self.apply_attribute("flow control", |fd| termios::set_flow_control(fd, enabled));
    }

    fn set_utf8_mode(&mut self, enabled: bool) {
        self.utf8_mode = Some(enabled);
        self.apply_attribute("utf8 mode", |fd| termios::set_utf8_mode(fd, enabled));
    }

    fn set_erase_char(&mut self, erase: u8) {
        self.erase = Some(erase);
        self.apply_attribute("erase character", |fd| termios::set_erase_char(fd, erase));
    }

    fn set_writeable(&mut self, writeable: bool) {
        let Some(path) = self.running.as_ref().and_then(|r| r.master.tty_name()) else {
            log::debug!("set_writeable: no tty name available");
            return;
        };

        let result = std::fs::metadata(&path).and_then(|meta| {
            let mode = meta.permissions().mode();
            let mode = if writeable {
                mode | MODE_GROUP_WRITE
            } else {
                mode & !MODE_ANY_WRITE
            };
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
        });
        if let Err(e) = result {
            log::warn!("unable to change permissions of {}: {e}", path.display());
        }
    }

    fn lock(&mut self, locked: bool) {
        self.gate.set_locked(locked);
    }

    fn foreground_process_group(&self) -> u32 {
        self.running
            .as_ref()
            .and_then(|r| r.master.process_group_leader())
            .filter(|pgrp| *pgrp > 0)
            .map_or(0, |pgrp| pgrp as u32)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        if self.state() != DeviceState::Running {
            return Err(PtyError::NotRunning);
        }
        let running = self.running.as_ref().ok_or(PtyError::NotRunning)?;
        running.jobs.send(data.to_vec()).map_err(|_| {
            PtyError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "pty writer thread has stopped",
            ))
        })
    }

    fn signal_child(&mut self, sig: Signal) -> Result<(), PtyError> {
        if self.state() != DeviceState::Running {
            return Err(PtyError::NotRunning);
        }
        let pid = self.process_id().ok_or(PtyError::NotRunning)?;
        signal::kill(Pid::from_raw(pid as i32), sig)?;
        Ok(())
    }

    fn signal_foreground(&mut self, sig: Signal) -> Result<(), PtyError> {
        if self.state() != DeviceState::Running {
            return Err(PtyError::NotRunning);
        }
        match self.foreground_process_group() {
            0 => self.signal_child(sig),
            pgrp => {
                signal::killpg(Pid::from_raw(pgrp as i32), sig)?;
                Ok(())
            }
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if self.state() == DeviceState::Running {
            if let Some(running) = self.running.as_mut() {
                let _ = running.killer.kill();
            }
        }
    }
}
