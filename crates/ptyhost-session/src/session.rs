use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ptyhost_pty::{
    DeviceState, Drain, ExitStatus, PtyDevice, PtyEvent, PtyEvents, PtyHandle, Signal,
    SpawnRequest, WindowSize, WriteQueue,
};
use tokio::sync::mpsc;

use crate::config::{SessionConfig, DEFAULT_TERMINAL_TYPE};
use crate::emulation::Emulation;
use crate::error::SessionError;
use crate::monitor::{ActivityMonitor, ActivityState};
use crate::title::{expand_tab_title, expand_tilde, TabTitleContext, TitleRole, TitleVars, UserTitle};
use crate::view::{TerminalView, Utf8Decoder, ViewId, ViewSet};
use crate::zmodem::{
    FileTransferBridge, ProcessSpawner, TransferEvent, TransferPhase, TransferRequest,
    TransferSpawner, PROMPT_RECOVERY, ZMODEM_ABORT,
};

/// Unique identifier for a terminal session.
pub type SessionId = u64;

/// Shell used when neither the session nor `$SHELL` names a program.
const FALLBACK_SHELL: &str = "/bin/sh";

/// User title shown by sessions that stay open after their program ends.
const FINISHED_TITLE: &str = "<Finished>";

/// Hands out session ids. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct SessionIds {
    next: AtomicU64,
}

impl SessionIds {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> SessionId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SessionIds {
    fn default() -> Self {
        Self::new()
    }
}

static SESSION_IDS: SessionIds = SessionIds::new();

/// Allocate an id from the process-wide counter.
pub fn next_session_id() -> SessionId {
    SESSION_IDS.next()
}

/// Lifecycle of a session. Sessions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    /// Close was requested; waiting for the child to go away.
    Closing,
    Finished,
}

/// Why a session finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// The child exited.
    Exited(ExitStatus),
    /// The program could not be started.
    SpawnFailed(String),
    /// The session was closed without a running child to wait for.
    Closed,
}

/// Sent once when a session finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub reason: FinishReason,
    /// The session was asked to close.
    pub requested: bool,
    /// The child failed or was killed without being asked to close.
    pub unexpected: bool,
}

impl ExitReport {
    /// The child's exit code, if it ran and exited.
    pub fn exit_code(&self) -> Option<u32> {
        match &self.reason {
            FinishReason::Exited(status) => Some(status.code),
            _ => None,
        }
    }
}

/// Notifications delivered to every [`Session::subscribe`] receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started,
    /// Raw child output, after the emulation has seen it.
    Output(Vec<u8>),
    TitleChanged,
    ProfileChanged(String),
    StateChanged(ActivityState),
    /// The emulation asked for a new size.
    ResizeRequest(WindowSize),
    BackgroundColorRequest(String),
    OpenUrlRequest(String),
    /// All queued input has been written.
    BufferEmpty,
    /// A remote program offered a ZMODEM transfer.
    ZmodemDetected,
    TransferStatus(String),
    TransferFinished,
    Finished(ExitReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeOrigin {
    Host,
    Views,
    Emulation,
}

/// What woke [`Session::process_events`].
enum Wake {
    Pty(Option<PtyEvent>),
    Transfer(Option<TransferEvent>),
    Timeout,
}

/// A terminal session: one child program on a pty, the emulation that
/// interprets its output, and the views that display it.
///
/// The session is a single-owner reactor. Device events arrive through
/// [`Session::dispatch`] (or [`Session::process_events`], which waits for
/// them), and every mutation goes through `&mut self`.
pub struct Session<E, D = PtyHandle> {
    id: SessionId,
    state: SessionState,
    device: D,
    pty_events: Option<PtyEvents>,
    queue: WriteQueue,
    emulation: E,
    views: ViewSet,
    decoder: Utf8Decoder,
    monitor: ActivityMonitor,
    transfer: FileTransferBridge,
    transfer_spawner: Box<dyn TransferSpawner>,
    transfer_events: Option<mpsc::UnboundedReceiver<TransferEvent>>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
    report: Option<ExitReport>,
    size: WindowSize,

    profile_key: Option<String>,
    program: Option<String>,
    arguments: Vec<String>,
    terminal_type: String,
    working_directory: Option<PathBuf>,
    environment: Vec<(String, String)>,
    window_id: u64,
    ipc_service: Option<String>,
    add_to_utmp: bool,
    flow_control: bool,
    auto_close: bool,
    wanted_close: bool,
    key_bindings: String,

    local_tab_title_format: String,
    remote_tab_title_format: String,
    remote: bool,
    name: String,
    displayed_title: String,
    user_title: String,
    icon_name: String,
    icon_text: String,
}

impl<E: Emulation> Session<E, PtyHandle> {
    /// Create a session on a fresh pty with an id from the process-wide
    /// counter.
    pub fn new(emulation: E) -> Self {
        Self::with_device(next_session_id(), emulation, PtyHandle::new())
    }
}

impl<E: Emulation, D: PtyDevice> Session<E, D> {
    pub fn with_device(id: SessionId, emulation: E, mut device: D) -> Self {
        let pty_events = device.take_events();
        let size = device.window_size();
        let defaults = SessionConfig::default();

        Self {
            id,
            state: SessionState::Created,
            device,
            pty_events,
            queue: WriteQueue::new(),
            emulation,
            views: ViewSet::new(),
            decoder: Utf8Decoder::default(),
            monitor: ActivityMonitor::new(),
            transfer: FileTransferBridge::new(),
            transfer_spawner: Box::new(ProcessSpawner),
            transfer_events: None,
            subscribers: Vec::new(),
            report: None,
            size,
            profile_key: None,
            program: None,
            arguments: Vec::new(),
            terminal_type: defaults.terminal_type,
            working_directory: None,
            environment: Vec::new(),
            window_id: 0,
            ipc_service: None,
            add_to_utmp: false,
            flow_control: defaults.flow_control,
            auto_close: defaults.auto_close,
            wanted_close: false,
            key_bindings: defaults.key_bindings,
            local_tab_title_format: defaults.local_tab_title_format,
            remote_tab_title_format: defaults.remote_tab_title_format,
            remote: false,
            name: String::new(),
            displayed_title: String::new(),
            user_title: String::new(),
            icon_name: String::new(),
            icon_text: String::new(),
        }
    }

    /// Replace how ZMODEM receivers are started.
    pub fn set_transfer_spawner(&mut self, spawner: Box<dyn TransferSpawner>) {
        self.transfer_spawner = spawner;
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// The report sent with [`SessionEvent::Finished`], once finished.
    pub fn exit_report(&self) -> Option<&ExitReport> {
        self.report.as_ref()
    }

    pub fn emulation(&self) -> &E {
        &self.emulation
    }

    pub fn emulation_mut(&mut self) -> &mut E {
        &mut self.emulation
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Receive every notification this session emits from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    // ---- configuration ----

    /// Apply a whole profile. Only valid before the session runs.
    pub fn apply_config(&mut self, config: &SessionConfig) -> Result<(), SessionError> {
        self.expect_state(SessionState::Created)?;

        self.program = config.program.clone();
        self.arguments = config.arguments.clone();
        self.terminal_type = config.terminal_type.clone();
        self.working_directory = config.working_directory.clone();
        self.environment = config
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.window_id = config.window_id;
        self.ipc_service = config.ipc_service.clone();
        self.add_to_utmp = config.add_to_utmp;
        self.auto_close = config.auto_close;
        self.key_bindings = config.key_bindings.clone();
        self.local_tab_title_format = config.local_tab_title_format.clone();
        self.remote_tab_title_format = config.remote_tab_title_format.clone();

        self.set_flow_control(config.flow_control);
        self.device.set_utf8_mode(config.utf8);
        if let Some(erase) = config.erase_char {
            self.device.set_erase_char(erase);
        }

        let now = Instant::now();
        self.set_silence_seconds_at(config.silence_seconds, now);
        self.set_monitor_activity(config.monitor_activity);
        self.set_monitor_silence_at(config.monitor_silence, now);

        if let Some(key) = &config.profile_key {
            self.set_profile_key(key);
        }
        self.set_size(WindowSize::new(config.rows, config.cols));
        Ok(())
    }

    pub fn set_program(&mut self, program: impl Into<String>) -> Result<(), SessionError> {
        self.expect_state(SessionState::Created)?;
        self.program = Some(program.into());
        Ok(())
    }

    pub fn program(&self) -> Option<&str> {
        self.program.as_deref()
    }

    pub fn set_arguments<I, S>(&mut self, arguments: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expect_state(SessionState::Created)?;
        self.arguments = arguments.into_iter().map(Into::into).collect();
        Ok(())
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn set_terminal_type(&mut self, terminal_type: impl Into<String>) -> Result<(), SessionError> {
        self.expect_state(SessionState::Created)?;
        self.terminal_type = terminal_type.into();
        Ok(())
    }

    pub fn terminal_type(&self) -> &str {
        &self.terminal_type
    }

    pub fn set_initial_working_directory(&mut self, dir: impl Into<PathBuf>) -> Result<(), SessionError> {
        self.expect_state(SessionState::Created)?;
        self.working_directory = Some(dir.into());
        Ok(())
    }

    pub fn initial_working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    pub fn set_window_id(&mut self, window_id: u64) -> Result<(), SessionError> {
        self.expect_state(SessionState::Created)?;
        self.window_id = window_id;
        Ok(())
    }

    pub fn window_id(&self) -> u64 {
        self.window_id
    }

    /// Name of the IPC service the child can reach this session through.
    pub fn set_ipc_service(&mut self, service: impl Into<String>) -> Result<(), SessionError> {
        self.expect_state(SessionState::Created)?;
        self.ipc_service = Some(service.into());
        Ok(())
    }

    /// Add a variable to the child's environment.
    pub fn add_environment(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.expect_state(SessionState::Created)?;
        self.environment.push((key.into(), value.into()));
        Ok(())
    }

    pub fn set_add_to_utmp(&mut self, add: bool) -> Result<(), SessionError> {
        self.expect_state(SessionState::Created)?;
        self.add_to_utmp = add;
        Ok(())
    }

    pub fn set_flow_control(&mut self, enabled: bool) {
        self.flow_control = enabled;
        self.device.set_flow_control(enabled);
    }

    pub fn flow_control(&self) -> bool {
        self.flow_control
    }

    /// Whether the session finishes as soon as its program does. When off,
    /// the session stays visible with a `<Finished>` title.
    pub fn set_auto_close(&mut self, auto_close: bool) {
        self.auto_close = auto_close;
    }

    pub fn auto_close(&self) -> bool {
        self.auto_close
    }

    pub fn set_key_bindings(&mut self, name: impl Into<String>) {
        self.key_bindings = name.into();
    }

    pub fn key_bindings(&self) -> &str {
        &self.key_bindings
    }

    pub fn set_profile_key(&mut self, key: &str) {
        if self.profile_key.as_deref() == Some(key) {
            return;
        }
        self.profile_key = Some(key.to_string());
        self.emit(SessionEvent::ProfileChanged(key.to_string()));
    }

    pub fn profile_key(&self) -> Option<&str> {
        self.profile_key.as_deref()
    }

    // ---- lifecycle ----

    /// Start the program on the pty.
    pub fn run(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Created)?;

        let program = self
            .program
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| FALLBACK_SHELL.to_string());
        let term = if self.terminal_type.is_empty() {
            DEFAULT_TERMINAL_TYPE
        } else {
            self.terminal_type.as_str()
        };

        let mut request = SpawnRequest::new(program)
            .args(self.arguments.iter().cloned())
            .term(term);
        request.window_id = self.window_id;
        request.register_in_utmp = self.add_to_utmp;
        request.working_dir = self.working_directory.clone();
        request.extra_env = self.environment.clone();
        if let Some(service) = &self.ipc_service {
            request.ipc_service = Some(service.clone());
            request.ipc_session = Some(format!("/Sessions/{}", self.id));
        }

        self.device.set_flow_control(self.flow_control);

        log::debug!("session {} starting {}", self.id, request.program);
        if let Err(e) = self.device.start(request) {
            log::warn!("session {} could not start: {e}", self.id);
            self.finish(FinishReason::SpawnFailed(e.to_string()));
            return Err(e.into());
        }

        self.state = SessionState::Running;
        self.device.set_writeable(false);
        self.emit(SessionEvent::Started);
        Ok(())
    }

    /// Ask the program to go away. The session finishes when it exits, or
    /// straight away if there is nothing to wait for.
    pub fn close(&mut self) {
        match self.state {
            SessionState::Closing | SessionState::Finished => return,
            SessionState::Created => {
                self.wanted_close = true;
                self.finish(FinishReason::Closed);
                return;
            }
            SessionState::Running => {}
        }

        log::debug!("closing session {}", self.id);
        self.wanted_close = true;
        self.auto_close = true;
        self.queue.close();
        self.state = SessionState::Closing;
        if self.transfer.cancel() {
            self.transfer_events = None;
            self.emit(SessionEvent::TransferFinished);
        }

        if self.device.state() != DeviceState::Running {
            self.finish(FinishReason::Closed);
            return;
        }
        if let Err(e) = self.device.signal_child(Signal::SIGHUP) {
            log::warn!("session {}: could not hang up child: {e}", self.id);
            self.finish(FinishReason::Closed);
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        self.device.process_id()
    }

    /// Process group in the foreground of the terminal, if known.
    pub fn foreground_process_id(&self) -> Option<u32> {
        match self.device.foreground_process_group() {
            0 => None,
            pgid => Some(pgid),
        }
    }

    // ---- input ----

    pub fn send_text(&mut self, text: &str) {
        self.send_data(text.as_bytes());
    }

    /// Queue bytes for the program. Dropped unless the session is running.
    pub fn send_data(&mut self, data: &[u8]) {
        if self.state != SessionState::Running || data.is_empty() {
            return;
        }
        self.queue.enqueue(&mut self.device, data);
    }

    /// Signal the foreground process group. Returns false if nothing was
    /// signalled.
    pub fn send_signal(&mut self, signal: Signal) -> bool {
        if self.device.state() != DeviceState::Running {
            return false;
        }
        match self.device.signal_foreground(signal) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("session {}: could not send {signal:?}: {e}", self.id);
                false
            }
        }
    }

    /// Scroll lock. Unlocking also retries a stalled write.
    pub fn set_locked(&mut self, locked: bool) {
        self.device.lock(locked);
        if !locked && self.state == SessionState::Running {
            self.queue.resume(&mut self.device);
        }
    }

    // ---- size ----

    pub fn size(&self) -> WindowSize {
        self.size
    }

    /// Size requested by the host, e.g. a window being laid out.
    pub fn set_size(&mut self, size: WindowSize) {
        self.apply_size(size, SizeOrigin::Host);
    }

    /// A view was resized. The session takes the largest size every view
    /// can show.
    pub fn on_view_size_changed(&mut self, view: ViewId, size: WindowSize) {
        if !self.views.contains(view) {
            return;
        }
        if let Some(common) = self.views.common_size_with(Some((view, size))) {
            self.apply_size(common, SizeOrigin::Views);
        }
    }

    /// The program resized the terminal through the emulation. The new size
    /// is not echoed back to the emulation; hosts hear about it through
    /// [`SessionEvent::ResizeRequest`].
    pub fn on_emulation_size_changed(&mut self, size: WindowSize) {
        self.apply_size(size, SizeOrigin::Emulation);
    }

    fn apply_size(&mut self, size: WindowSize, origin: SizeOrigin) {
        if size.rows == 0 || size.cols == 0 || size == self.size {
            return;
        }
        log::debug!(
            "session {} resized to {}x{} ({origin:?})",
            self.id,
            size.cols,
            size.rows
        );
        self.size = size;
        self.device.set_window_size(size);
        match origin {
            SizeOrigin::Emulation => self.emit(SessionEvent::ResizeRequest(size)),
            SizeOrigin::Host | SizeOrigin::Views => self.emulation.set_image_size(size),
        }
    }

    // ---- views ----

    /// Attach a view. The session holds it weakly; dropping the last strong
    /// reference detaches it.
    pub fn add_view<V: TerminalView + 'static>(&mut self, view: &Arc<V>) -> ViewId {
        let id = self.views.add(view);
        self.update_size_from_views();
        id
    }

    pub fn remove_view(&mut self, view: ViewId) -> bool {
        let removed = self.views.remove(view);
        if removed {
            self.update_size_from_views();
        }
        removed
    }

    pub fn has_view(&self, view: ViewId) -> bool {
        self.views.contains(view)
    }

    /// Live views attached to the session.
    pub fn view_count(&mut self) -> usize {
        self.views.live().len()
    }

    fn update_size_from_views(&mut self) {
        if let Some(size) = self.views.common_size() {
            self.apply_size(size, SizeOrigin::Views);
        }
    }

    // ---- titles ----

    pub fn set_title(&mut self, role: TitleRole, title: &str) {
        let slot = match role {
            TitleRole::Name => &mut self.name,
            TitleRole::DisplayedTitle => &mut self.displayed_title,
        };
        if replace_if_changed(slot, title) {
            self.emit(SessionEvent::TitleChanged);
        }
    }

    pub fn title(&self, role: TitleRole) -> &str {
        match role {
            TitleRole::Name => &self.name,
            TitleRole::DisplayedTitle => &self.displayed_title,
        }
    }

    /// Handle a title request from the program (an OSC sequence decoded by
    /// the emulation).
    pub fn set_user_title(&mut self, what: UserTitle, caption: &str) {
        let changed = match what {
            UserTitle::WindowAndIcon => {
                let title = replace_if_changed(&mut self.user_title, caption);
                let icon = replace_if_changed(&mut self.icon_text, caption);
                title || icon
            }
            UserTitle::IconText => replace_if_changed(&mut self.icon_text, caption),
            UserTitle::WindowTitle => replace_if_changed(&mut self.user_title, caption),
            UserTitle::SessionName => replace_if_changed(&mut self.name, caption),
            UserTitle::IconName => replace_if_changed(&mut self.icon_name, caption),
            UserTitle::BackgroundColor => {
                self.emit(SessionEvent::BackgroundColorRequest(caption.to_string()));
                false
            }
            UserTitle::OpenUrl => {
                let home = std::env::var("HOME").ok();
                let url = expand_tilde(caption, home.as_deref());
                self.emit(SessionEvent::OpenUrlRequest(url));
                false
            }
        };
        if changed {
            self.emit(SessionEvent::TitleChanged);
        }
    }

    pub fn user_title(&self) -> &str {
        &self.user_title
    }

    pub fn icon_name(&self) -> &str {
        &self.icon_name
    }

    pub fn icon_text(&self) -> &str {
        &self.icon_text
    }

    /// What a tab should show: an explicit displayed title, else the
    /// program's own title, else the tab title format for the current
    /// context.
    pub fn displayed_title(&self) -> String {
        if !self.displayed_title.is_empty() {
            return self.displayed_title.clone();
        }
        if !self.user_title.is_empty() {
            return self.user_title.clone();
        }
        let context = if self.remote {
            TabTitleContext::Remote
        } else {
            TabTitleContext::Local
        };
        let directory = self
            .working_directory
            .as_deref()
            .and_then(Path::to_str)
            .unwrap_or_default();
        let vars = TitleVars {
            name: &self.name,
            user_title: &self.user_title,
            program: self.program.as_deref().unwrap_or_default(),
            directory,
            session_id: self.id,
        };
        expand_tab_title(self.tab_title_format(context), &vars)
    }

    pub fn tab_title_format(&self, context: TabTitleContext) -> &str {
        match context {
            TabTitleContext::Local => &self.local_tab_title_format,
            TabTitleContext::Remote => &self.remote_tab_title_format,
        }
    }

    pub fn set_tab_title_format(&mut self, context: TabTitleContext, format: &str) {
        let slot = match context {
            TabTitleContext::Local => &mut self.local_tab_title_format,
            TabTitleContext::Remote => &mut self.remote_tab_title_format,
        };
        if replace_if_changed(slot, format) {
            self.emit(SessionEvent::TitleChanged);
        }
    }

    /// Whether the program is connected to another host. Selects the tab
    /// title format.
    pub fn set_remote(&mut self, remote: bool) {
        if self.remote != remote {
            self.remote = remote;
            self.emit(SessionEvent::TitleChanged);
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    // ---- monitoring ----

    pub fn set_monitor_activity(&mut self, enabled: bool) {
        if let Some(state) = self.monitor.set_monitor_activity(enabled) {
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    pub fn is_monitoring_activity(&self) -> bool {
        self.monitor.is_monitoring_activity()
    }

    pub fn set_monitor_silence(&mut self, enabled: bool) {
        self.set_monitor_silence_at(enabled, Instant::now());
    }

    pub fn set_monitor_silence_at(&mut self, enabled: bool, now: Instant) {
        if let Some(state) = self.monitor.set_monitor_silence(enabled, now) {
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    pub fn is_monitoring_silence(&self) -> bool {
        self.monitor.is_monitoring_silence()
    }

    pub fn set_silence_seconds(&mut self, seconds: u64) {
        self.set_silence_seconds_at(seconds, Instant::now());
    }

    pub fn set_silence_seconds_at(&mut self, seconds: u64, now: Instant) {
        self.monitor
            .set_silence_threshold(Duration::from_secs(seconds), now);
    }

    pub fn silence_seconds(&self) -> u64 {
        self.monitor.silence_threshold().as_secs()
    }

    // ---- file transfer ----

    pub fn transfer_phase(&self) -> TransferPhase {
        self.transfer.phase()
    }

    pub fn is_zmodem_busy(&self) -> bool {
        self.transfer.is_busy()
    }

    /// Bytes (received from the pty, sent to the pty) by the current or
    /// last transfer.
    pub fn transfer_progress(&self) -> (u64, u64) {
        (self.transfer.bytes_received(), self.transfer.bytes_sent())
    }

    /// Accept a detected ZMODEM request and start the receiver.
    pub fn start_zmodem(&mut self, request: &TransferRequest) -> Result<(), SessionError> {
        if self.state != SessionState::Running {
            return Err(SessionError::TransferRejected(format!(
                "session {} is not running",
                self.id
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.transfer
            .start(self.transfer_spawner.as_mut(), request, tx)?;
        self.transfer_events = Some(rx);
        log::debug!(
            "session {}: receiving files into {}",
            self.id,
            request.directory.display()
        );
        Ok(())
    }

    /// Ignore a detected ZMODEM request.
    pub fn dismiss_zmodem(&mut self) {
        self.transfer.dismiss();
    }

    /// Abort the running transfer.
    pub fn cancel_zmodem(&mut self) {
        if self.transfer.cancel() {
            self.zmodem_done();
        }
    }

    /// Abort the remote sender and hand the terminal back to the emulation.
    fn zmodem_done(&mut self) {
        self.transfer_events = None;
        self.send_data(ZMODEM_ABORT);
        self.send_data(PROMPT_RECOVERY);
        self.emit(SessionEvent::TransferFinished);
    }

    fn handle_transfer_event(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Output(data) => {
                if self.transfer.is_busy() {
                    self.transfer.record_sent(data.len());
                    self.send_data(&data);
                }
            }
            TransferEvent::Status(line) => self.emit(SessionEvent::TransferStatus(line)),
            TransferEvent::Exited(code) => {
                log::debug!("session {}: transfer program exited ({code:?})", self.id);
                if self.transfer.finish() {
                    self.zmodem_done();
                }
            }
        }
    }

    // ---- event handling ----

    /// Handle one device event.
    pub fn dispatch(&mut self, event: PtyEvent) {
        self.dispatch_at(event, Instant::now());
    }

    /// Handle one device event that arrived at `now`.
    pub fn dispatch_at(&mut self, event: PtyEvent, now: Instant) {
        if self.state == SessionState::Finished {
            return;
        }
        match event {
            PtyEvent::Data(data) => self.receive_output(data, now),
            PtyEvent::WriteReady => {
                if self.queue.write_ready(&mut self.device) == Drain::Empty {
                    self.emit(SessionEvent::BufferEmpty);
                }
            }
            PtyEvent::WriteFailed => {
                // The job stays queued; unlocking the session retries it.
                self.queue.write_failed();
            }
            PtyEvent::Exited(status) => self.on_exited(status),
        }
    }

    /// Handle everything already waiting on the device and transfer
    /// channels without blocking. Returns how many events were handled.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self.pty_events.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.dispatch(event);
            handled += 1;
        }
        while let Some(event) = self
            .transfer_events
            .as_mut()
            .and_then(|rx| rx.try_recv().ok())
        {
            self.handle_transfer_event(event);
            handled += 1;
        }
        handled
    }

    /// The monitor timer fired.
    pub fn handle_timeout(&mut self, now: Instant) {
        if let Some(state) = self.monitor.on_timeout(now) {
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    /// When [`Session::handle_timeout`] should next be called.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.monitor.deadline()
    }

    /// Wait for the next device event, transfer event or monitor deadline
    /// and handle it. Returns false once the session has finished (or was
    /// never started).
    ///
    /// Cancel safe: dropping the future before it completes loses nothing.
    pub async fn process_events(&mut self) -> bool {
        if matches!(self.state, SessionState::Created | SessionState::Finished) {
            return false;
        }

        let deadline = self.monitor.deadline();
        let wake = tokio::select! {
            event = recv_or_pending(&mut self.pty_events) => Wake::Pty(event),
            event = recv_or_pending(&mut self.transfer_events) => Wake::Transfer(event),
            _ = sleep_until_deadline(deadline) => Wake::Timeout,
        };

        match wake {
            Wake::Pty(Some(event)) => self.dispatch(event),
            Wake::Pty(None) => {
                log::warn!("session {}: device event channel closed", self.id);
                self.pty_events = None;
                let status = self
                    .device
                    .exit_status()
                    .unwrap_or_else(|| ExitStatus::with_code(1));
                self.on_exited(status);
            }
            Wake::Transfer(Some(event)) => self.handle_transfer_event(event),
            Wake::Transfer(None) => {
                self.transfer_events = None;
                if self.transfer.finish() {
                    self.zmodem_done();
                }
            }
            Wake::Timeout => self.handle_timeout(Instant::now()),
        }

        self.state != SessionState::Finished
    }

    /// Drive the session until it finishes.
    pub async fn run_until_finished(&mut self) -> Option<ExitReport> {
        while self.process_events().await {}
        self.report.clone()
    }

    fn receive_output(&mut self, data: Vec<u8>, now: Instant) {
        if self.transfer.is_busy() {
            self.transfer.receive(&data);
            return;
        }

        self.emulation.receive_data(&data);
        let text = self.decoder.decode(&data);
        if !text.is_empty() {
            self.views.broadcast(&text);
        }
        if let Some(state) = self.monitor.on_output(now) {
            self.emit(SessionEvent::StateChanged(state));
        }
        if self.transfer.scan(&data) {
            self.emit(SessionEvent::ZmodemDetected);
        }
        self.emit(SessionEvent::Output(data));
    }

    fn on_exited(&mut self, status: ExitStatus) {
        if self.transfer.cancel() {
            self.transfer_events = None;
            self.emit(SessionEvent::TransferFinished);
        }
        self.finish(FinishReason::Exited(status));
    }

    /// Move to `Finished` and tell subscribers. Only the first call counts.
    fn finish(&mut self, reason: FinishReason) {
        if self.state == SessionState::Finished {
            return;
        }

        let requested = self.wanted_close;
        let unexpected = match &reason {
            FinishReason::Exited(status) => !requested && !status.success(),
            FinishReason::SpawnFailed(_) | FinishReason::Closed => false,
        };
        match &reason {
            FinishReason::Exited(status) if unexpected => match &status.signal {
                Some(signal) => log::warn!("session {}: program crashed ({signal})", self.id),
                None => log::warn!(
                    "session {}: program exited with status {}",
                    self.id,
                    status.code
                ),
            },
            _ => log::debug!("session {} finished: {reason:?}", self.id),
        }

        if !self.auto_close {
            self.user_title = FINISHED_TITLE.to_string();
            self.emit(SessionEvent::TitleChanged);
        }

        self.queue.close();
        self.state = SessionState::Finished;
        let report = ExitReport {
            reason,
            requested,
            unexpected,
        };
        self.report = Some(report.clone());
        self.emit(SessionEvent::Finished(report));
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                id: self.id,
                state: self.state,
                expected,
            })
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn replace_if_changed(slot: &mut String, value: &str) -> bool {
    if slot == value {
        return false;
    }
    value.clone_into(slot);
    true
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use ptyhost_pty::testing::{Attribute, ScriptedDevice, SignalTarget};

    use crate::zmodem::tests::RecordingSpawner;
    use crate::zmodem::ZMODEM_TRIGGER;

    #[derive(Default)]
    struct RecordingEmulation {
        data: Vec<u8>,
        sizes: Vec<WindowSize>,
        size: WindowSize,
    }

    impl Emulation for RecordingEmulation {
        fn receive_data(&mut self, data: &[u8]) {
            self.data.extend_from_slice(data);
        }

        fn set_image_size(&mut self, size: WindowSize) {
            self.size = size;
            self.sizes.push(size);
        }

        fn image_size(&self) -> WindowSize {
            self.size
        }
    }

    struct RecordingView {
        text: Mutex<String>,
        size: Mutex<WindowSize>,
    }

    impl RecordingView {
        fn new(rows: u16, cols: u16) -> Arc<Self> {
            Arc::new(Self {
                text: Mutex::new(String::new()),
                size: Mutex::new(WindowSize::new(rows, cols)),
            })
        }

        fn text(&self) -> String {
            self.text.lock().unwrap().clone()
        }
    }

    impl TerminalView for RecordingView {
        fn receive_text(&self, text: &str) {
            self.text.lock().unwrap().push_str(text);
        }

        fn size(&self) -> WindowSize {
            *self.size.lock().unwrap()
        }
    }

    type TestSession = Session<RecordingEmulation, ScriptedDevice>;

    fn session() -> TestSession {
        Session::with_device(7, RecordingEmulation::default(), ScriptedDevice::new())
    }

    fn running() -> (TestSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let mut session = session();
        session.set_program("/bin/sh").unwrap();
        let events = session.subscribe();
        session.run().unwrap();
        (session, events)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn finished_count(events: &[SessionEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Finished(_)))
            .count()
    }

    fn rz_request() -> TransferRequest {
        TransferRequest {
            command: "rz".to_string(),
            directory: PathBuf::from("/tmp"),
            files: Vec::new(),
        }
    }

    #[test]
    fn test_session_ids_increase() {
        let ids = SessionIds::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
        assert_ne!(next_session_id(), next_session_id());
    }

    #[test]
    fn test_run_builds_spawn_request() {
        let mut session = session();
        let mut config = SessionConfig::default();
        config.program = Some("/bin/bash".to_string());
        config.arguments = vec!["-l".to_string()];
        config.ipc_service = Some("org.ptyhost-99".to_string());
        config.window_id = 0x4400007;
        config.environment.insert("LANG".to_string(), "C.UTF-8".to_string());
        session.apply_config(&config).unwrap();
        let mut events = session.subscribe();

        session.run().unwrap();

        assert_eq!(session.state(), SessionState::Running);
        let device = session.device();
        let request = &device.spawned[0];
        assert_eq!(request.program, "/bin/bash");
        assert_eq!(request.args, vec!["-l"]);
        assert_eq!(request.term, "xterm");
        assert_eq!(request.window_id, 0x4400007);
        assert_eq!(request.ipc_service.as_deref(), Some("org.ptyhost-99"));
        assert_eq!(request.ipc_session.as_deref(), Some("/Sessions/7"));
        assert_eq!(
            request.extra_env,
            vec![("LANG".to_string(), "C.UTF-8".to_string())]
        );
        assert_eq!(device.writeable, Some(false));
        assert_eq!(drain(&mut events), vec![SessionEvent::Started]);
    }

    #[test]
    fn test_run_without_ipc_service_exports_no_session_path() {
        let (session, _events) = running();
        let request = &session.device().spawned[0];
        assert_eq!(request.ipc_service, None);
        assert_eq!(request.ipc_session, None);
    }

    #[test]
    fn test_run_falls_back_to_shell() {
        let mut session = session();
        session.set_terminal_type("").unwrap();
        session.run().unwrap();

        let expected = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| FALLBACK_SHELL.to_string());
        let request = &session.device().spawned[0];
        assert_eq!(request.program, expected);
        assert_eq!(request.term, "xterm");
    }

    #[test]
    fn test_spawn_failure_finishes_once() {
        let mut session = session();
        session.device_mut().fail_spawn = true;
        let mut events = session.subscribe();

        let err = session.run().unwrap_err();
        assert!(matches!(err, SessionError::Pty(_)));
        assert_eq!(session.state(), SessionState::Finished);

        let events = drain(&mut events);
        assert_eq!(finished_count(&events), 1);
        assert!(matches!(
            session.exit_report().map(|r| &r.reason),
            Some(FinishReason::SpawnFailed(_))
        ));
    }

    #[test]
    fn test_launch_settings_rejected_after_run() {
        let (mut session, _events) = running();
        assert!(matches!(
            session.set_program("/bin/zsh"),
            Err(SessionError::InvalidState {
                id: 7,
                state: SessionState::Running,
                expected: SessionState::Created,
            })
        ));
        assert!(session.apply_config(&SessionConfig::default()).is_err());
        assert!(session.run().is_err());
    }

    #[test]
    fn test_output_reaches_emulation_and_every_view() {
        let (mut session, mut events) = running();
        let first = RecordingView::new(24, 80);
        let second = RecordingView::new(24, 80);
        session.add_view(&first);
        session.add_view(&second);

        session.device().output("caf\u{e9} ".as_bytes());
        session.device().output(b"$ ");
        session.dispatch_pending();

        assert_eq!(first.text(), "caf\u{e9} $ ");
        assert_eq!(first.text(), second.text());
        assert_eq!(session.emulation().data, "caf\u{e9} $ ".as_bytes());

        let outputs: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Output(data) => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(outputs, vec!["caf\u{e9} ".as_bytes().to_vec(), b"$ ".to_vec()]);
    }

    #[test]
    fn test_dropped_view_is_pruned() {
        let (mut session, _events) = running();
        let kept = RecordingView::new(24, 80);
        let dropped = RecordingView::new(24, 80);
        session.add_view(&kept);
        let dropped_id = session.add_view(&dropped);
        drop(dropped);

        session.device().output(b"still here");
        session.dispatch_pending();

        assert_eq!(kept.text(), "still here");
        assert!(!session.has_view(dropped_id));
        assert_eq!(session.view_count(), 1);
    }

    #[test]
    fn test_removing_last_view_keeps_session_running() {
        let (mut session, _events) = running();
        let view = RecordingView::new(24, 80);
        let id = session.add_view(&view);
        assert!(session.remove_view(id));
        assert!(!session.remove_view(id));
        assert!(session.is_running());
    }

    #[test]
    fn test_set_size_is_idempotent() {
        let (mut session, _events) = running();
        let size = WindowSize::new(30, 100);

        session.set_size(size);
        session.set_size(size);

        assert_eq!(session.device().resizes, vec![size]);
        assert_eq!(session.emulation().sizes, vec![size]);
        assert_eq!(session.size(), size);
    }

    #[test]
    fn test_emulation_resize_is_not_echoed() {
        let (mut session, mut events) = running();
        drain(&mut events);
        let size = WindowSize::new(50, 132);

        session.on_emulation_size_changed(size);
        session.on_emulation_size_changed(size);

        assert_eq!(session.device().resizes, vec![size]);
        assert!(session.emulation().sizes.is_empty());
        assert_eq!(drain(&mut events), vec![SessionEvent::ResizeRequest(size)]);
    }

    #[test]
    fn test_view_resize_uses_smallest_view() {
        let (mut session, _events) = running();
        let big = RecordingView::new(40, 120);
        let small = RecordingView::new(30, 100);
        let tiny = RecordingView::new(1, 1);
        let big_id = session.add_view(&big);
        session.add_view(&small);
        session.add_view(&tiny);
        assert_eq!(session.size(), WindowSize::new(30, 100));

        session.on_view_size_changed(big_id, WindowSize::new(25, 110));
        assert_eq!(session.size(), WindowSize::new(25, 100));
        assert_eq!(
            session.device().resizes,
            vec![WindowSize::new(40, 120), WindowSize::new(30, 100), WindowSize::new(25, 100)]
        );
    }

    #[test]
    fn test_input_is_written_one_job_at_a_time() {
        let (mut session, mut events) = running();

        session.send_text("ls\r");
        session.send_text("pwd\r");
        assert_eq!(session.device().writes, vec![b"ls\r".to_vec()]);

        session.device().complete_write();
        session.dispatch_pending();
        assert_eq!(session.device().writes.len(), 2);
        assert!(!drain(&mut events).contains(&SessionEvent::BufferEmpty));

        session.device().complete_write();
        session.dispatch_pending();
        assert_eq!(drain(&mut events), vec![SessionEvent::BufferEmpty]);
    }

    #[test]
    fn test_unlock_resumes_stalled_write() {
        let (mut session, _events) = running();
        session.device_mut().fail_writes = true;
        session.send_text("echo hi\r");
        assert!(session.device().writes.is_empty());

        session.set_locked(true);
        assert!(session.device().locked);
        session.device_mut().fail_writes = false;
        session.set_locked(false);

        assert!(!session.device().locked);
        assert_eq!(session.device().writes, vec![b"echo hi\r".to_vec()]);
    }

    #[test]
    fn test_failed_delivery_is_retried_on_unlock() {
        let (mut session, mut events) = running();
        session.send_text("echo hi\r");
        session.send_text("pwd\r");
        assert_eq!(session.device().writes.len(), 1);

        session.device().fail_write();
        session.dispatch_pending();
        // Nothing is resubmitted until the terminal is resumed.
        assert_eq!(session.device().writes.len(), 1);

        session.set_locked(true);
        session.set_locked(false);
        assert_eq!(
            session.device().writes,
            vec![b"echo hi\r".to_vec(), b"echo hi\r".to_vec()]
        );

        session.device().complete_write();
        session.dispatch_pending();
        assert_eq!(session.device().writes.last().unwrap(), b"pwd\r");
        session.device().complete_write();
        session.dispatch_pending();
        assert!(drain(&mut events).contains(&SessionEvent::BufferEmpty));
    }

    #[test]
    fn test_nothing_written_after_close() {
        let (mut session, mut events) = running();

        session.close();
        session.send_text("exit\r");
        session.send_data(b"\x04");

        assert_eq!(session.state(), SessionState::Closing);
        assert!(session.device().writes.is_empty());
        assert_eq!(
            session.device().signals,
            vec![(SignalTarget::Child, Signal::SIGHUP)]
        );

        session.device_mut().exit(ExitStatus::with_signal("Hangup"));
        session.dispatch_pending();

        let events = drain(&mut events);
        assert_eq!(finished_count(&events), 1);
        let report = session.exit_report().unwrap();
        assert!(report.requested);
        assert!(!report.unexpected);
    }

    #[test]
    fn test_close_finishes_immediately_when_signal_fails() {
        let (mut session, mut events) = running();
        session.device_mut().fail_signals = true;

        session.close();

        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(
            session.exit_report().map(|r| &r.reason),
            Some(&FinishReason::Closed)
        );
        assert_eq!(finished_count(&drain(&mut events)), 1);
    }

    #[test]
    fn test_unexpected_exit_without_auto_close() {
        let (mut session, mut events) = running();
        session.set_auto_close(false);

        session.device_mut().exit(ExitStatus::with_code(2));
        session.dispatch_pending();

        assert_eq!(session.user_title(), "<Finished>");
        let events = drain(&mut events);
        assert!(events.contains(&SessionEvent::TitleChanged));
        let report = session.exit_report().unwrap();
        assert!(report.unexpected);
        assert_eq!(report.exit_code(), Some(2));
    }

    #[test]
    fn test_finished_is_emitted_exactly_once() {
        let (mut session, mut events) = running();

        session.device_mut().exit(ExitStatus::with_code(0));
        session.device().emit(PtyEvent::Exited(ExitStatus::with_code(0)));
        session.dispatch_pending();
        session.close();

        let events = drain(&mut events);
        assert_eq!(finished_count(&events), 1);
        assert!(!session.exit_report().unwrap().unexpected);
    }

    #[test]
    fn test_send_signal() {
        let mut session = session();
        assert!(!session.send_signal(Signal::SIGINT));

        session.run().unwrap();
        assert!(session.send_signal(Signal::SIGINT));
        assert_eq!(
            session.device().signals,
            vec![(SignalTarget::ForegroundGroup, Signal::SIGINT)]
        );
        assert_eq!(session.foreground_process_id(), Some(4242));

        session.device_mut().fail_signals = true;
        assert!(!session.send_signal(Signal::SIGTERM));
    }

    #[test]
    fn test_flow_control_toggles_twice() {
        let (mut session, _events) = running();
        assert_eq!(session.device().attributes, vec![Attribute::FlowControl(true)]);
        session.device_mut().attributes.clear();

        session.set_flow_control(true);
        session.set_flow_control(false);

        assert!(!session.flow_control());
        assert_eq!(
            session.device().attributes,
            vec![Attribute::FlowControl(true), Attribute::FlowControl(false)]
        );
    }

    #[test]
    fn test_user_title_requests() {
        let (mut session, mut events) = running();
        drain(&mut events);

        session.set_user_title(UserTitle::WindowAndIcon, "vim");
        assert_eq!(session.user_title(), "vim");
        assert_eq!(session.icon_text(), "vim");
        session.set_user_title(UserTitle::WindowTitle, "vim");
        session.set_user_title(UserTitle::IconName, "utilities-terminal");
        session.set_user_title(UserTitle::SessionName, "Editor");
        assert_eq!(session.title(TitleRole::Name), "Editor");
        session.set_user_title(UserTitle::BackgroundColor, "#000000");
        session.set_user_title(UserTitle::OpenUrl, "/srv/www");

        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::TitleChanged,
                SessionEvent::TitleChanged,
                SessionEvent::TitleChanged,
                SessionEvent::BackgroundColorRequest("#000000".to_string()),
                SessionEvent::OpenUrlRequest("/srv/www".to_string()),
            ]
        );
    }

    #[test]
    fn test_displayed_title_fallbacks() {
        let mut session = session();
        session.set_program("/usr/bin/zsh").unwrap();
        session.set_tab_title_format(TabTitleContext::Local, "%p (%#)");
        session.set_tab_title_format(TabTitleContext::Remote, "remote: %u");
        assert_eq!(session.displayed_title(), "zsh (7)");

        session.set_user_title(UserTitle::WindowTitle, "user@host");
        assert_eq!(session.displayed_title(), "user@host");

        session.set_title(TitleRole::DisplayedTitle, "Pinned");
        assert_eq!(session.displayed_title(), "Pinned");

        session.set_title(TitleRole::DisplayedTitle, "");
        session.set_user_title(UserTitle::WindowTitle, "");
        session.set_remote(true);
        assert_eq!(session.displayed_title(), "remote: ");
        assert_eq!(session.tab_title_format(TabTitleContext::Local), "%p (%#)");
    }

    #[test]
    fn test_set_title_only_notifies_on_change() {
        let mut session = session();
        let mut events = session.subscribe();
        session.set_title(TitleRole::Name, "Shell");
        session.set_title(TitleRole::Name, "Shell");
        assert_eq!(drain(&mut events), vec![SessionEvent::TitleChanged]);
    }

    #[test]
    fn test_profile_change_notifies_once() {
        let mut session = session();
        let mut events = session.subscribe();
        session.set_profile_key("Default.profile");
        session.set_profile_key("Default.profile");
        assert_eq!(session.profile_key(), Some("Default.profile"));
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::ProfileChanged("Default.profile".to_string())]
        );
    }

    #[test]
    fn test_activity_and_silence_notifications() {
        let (mut session, mut events) = running();
        let t0 = Instant::now();
        session.set_silence_seconds_at(5, t0);
        session.set_monitor_activity(true);
        session.set_monitor_silence_at(true, t0);
        drain(&mut events);

        for offset in [1, 2, 3] {
            session.dispatch_at(
                PtyEvent::Data(b"make\r\n".to_vec()),
                t0 + Duration::from_secs(offset),
            );
        }
        assert_eq!(session.next_deadline(), Some(t0 + Duration::from_secs(8)));
        session.handle_timeout(t0 + Duration::from_secs(8));
        session.handle_timeout(t0 + Duration::from_secs(30));

        let states: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![ActivityState::Activity, ActivityState::Silence]);
    }

    #[test]
    fn test_zmodem_transfer_round_trip() {
        let (mut session, mut events) = running();
        let spawner = RecordingSpawner::default();
        session.set_transfer_spawner(Box::new(spawner.clone()));

        assert!(matches!(
            session.start_zmodem(&rz_request()),
            Err(SessionError::TransferRejected(_))
        ));

        let (head, tail) = ZMODEM_TRIGGER.split_at(3);
        session.device().output(&[b"rz\r".as_slice(), head].concat());
        session.device().output(&[tail, b"0000000000\r\n".as_slice()].concat());
        session.dispatch_pending();
        let detected = drain(&mut events)
            .into_iter()
            .filter(|e| *e == SessionEvent::ZmodemDetected)
            .count();
        assert_eq!(detected, 1);
        assert_eq!(session.transfer_phase(), TransferPhase::Detected);

        session.start_zmodem(&rz_request()).unwrap();
        assert!(session.is_zmodem_busy());
        assert_eq!(*spawner.requests.lock().unwrap(), vec![rz_request()]);

        let emulated = session.emulation().data.len();
        session.device().output(b"zmodem frame");
        session.dispatch_pending();
        assert_eq!(*spawner.received.lock().unwrap(), b"zmodem frame");
        assert_eq!(session.emulation().data.len(), emulated);

        spawner.send(TransferEvent::Output(b"ack".to_vec()));
        spawner.send(TransferEvent::Status("Bytes received: 12".to_string()));
        spawner.send(TransferEvent::Exited(Some(0)));
        session.dispatch_pending();

        assert_eq!(session.transfer_phase(), TransferPhase::Idle);
        assert_eq!(session.transfer_progress(), (12, 3));
        assert_eq!(
            drain(&mut events),
            vec![
                SessionEvent::TransferStatus("Bytes received: 12".to_string()),
                SessionEvent::TransferFinished,
            ]
        );

        for _ in 0..2 {
            session.device().complete_write();
            session.dispatch_pending();
        }
        assert_eq!(
            session.device().writes,
            vec![b"ack".to_vec(), ZMODEM_ABORT.to_vec(), PROMPT_RECOVERY.to_vec()]
        );
    }

    #[test]
    fn test_zmodem_cancel_aborts_remote() {
        let (mut session, mut events) = running();
        let spawner = RecordingSpawner::default();
        session.set_transfer_spawner(Box::new(spawner.clone()));

        session.device().output(ZMODEM_TRIGGER);
        session.dispatch_pending();
        session.start_zmodem(&rz_request()).unwrap();
        drain(&mut events);

        session.cancel_zmodem();

        assert!(*spawner.cancelled.lock().unwrap());
        assert!(!session.is_zmodem_busy());
        assert_eq!(session.device().writes, vec![ZMODEM_ABORT.to_vec()]);
        assert_eq!(drain(&mut events), vec![SessionEvent::TransferFinished]);

        // The late exit report of the cancelled program changes nothing.
        spawner.send(TransferEvent::Exited(None));
        session.dispatch_pending();
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_process_events_until_exit() {
        let (mut session, mut events) = running();
        session.device().output(b"bye\r\n");
        session.device_mut().exit(ExitStatus::with_code(0));

        assert!(session.process_events().await);
        let report = session.run_until_finished().await.unwrap();

        assert_eq!(report.exit_code(), Some(0));
        assert!(!session.process_events().await);
        assert_eq!(session.emulation().data, b"bye\r\n");
        assert_eq!(finished_count(&drain(&mut events)), 1);
    }

    #[tokio::test]
    async fn test_close_while_locked_finishes() {
        let mut session = Session::new(RecordingEmulation::default());
        session.set_program("/bin/cat").unwrap();
        let mut events = session.subscribe();
        session.run().unwrap();

        session.set_locked(true);
        session.close();
        assert_eq!(session.state(), SessionState::Closing);

        let report = tokio::time::timeout(Duration::from_secs(10), session.run_until_finished())
            .await
            .expect("locked session never finished")
            .unwrap();

        assert!(report.requested);
        assert!(matches!(report.reason, FinishReason::Exited(_)));
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(finished_count(&drain(&mut events)), 1);
    }

    #[tokio::test]
    async fn test_echo_session() {
        let mut session = Session::new(RecordingEmulation::default());
        session.set_program("/bin/echo").unwrap();
        session.set_arguments(["hello"]).unwrap();
        let mut events = session.subscribe();
        session.run().unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), session.run_until_finished())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.exit_code(), Some(0));
        assert!(!report.unexpected);
        let output = String::from_utf8_lossy(&session.emulation().data).into_owned();
        assert_eq!(output.trim_end(), "hello");
        assert!(output.ends_with('\n'));
        assert_eq!(finished_count(&drain(&mut events)), 1);
    }
}
