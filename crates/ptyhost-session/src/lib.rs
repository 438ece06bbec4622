//! ptyhost-session: terminal session coordination.
//!
//! A [`Session`] owns one pty device, the [`Emulation`] that interprets the
//! child's output and a weak set of [`TerminalView`]s that display it. It
//! routes input through the device's write queue, keeps the pty size in step
//! with its views, watches output for activity and silence, and hands the
//! byte stream to a local receiver while a ZMODEM transfer runs.
//!
//! # Architecture
//!
//! - [`session`]: The coordinator and its notifications.
//! - [`monitor`]: Activity and silence detection.
//! - [`zmodem`]: ZMODEM trigger detection and transfer programs.
//! - [`view`] / [`emulation`]: The consumer contracts.
//! - [`title`]: Title requests and tab title formats.
//! - [`config`]: Profile settings, loaded from JSON.

pub mod config;
pub mod emulation;
pub mod error;
pub mod monitor;
pub mod session;
pub mod title;
pub mod view;
pub mod zmodem;

pub use config::SessionConfig;
pub use emulation::{Emulation, NullEmulation};
pub use error::SessionError;
pub use monitor::{ActivityMonitor, ActivityState};
pub use session::{
    next_session_id, ExitReport, FinishReason, Session, SessionEvent, SessionId, SessionIds,
    SessionState,
};
pub use title::{TabTitleContext, TitleRole, UserTitle};
pub use view::{TerminalView, ViewId};
pub use zmodem::{
    FileTransferBridge, ProcessSpawner, TransferEvent, TransferHandler, TransferPhase,
    TransferRequest, TransferSpawner,
};
