//! ptyhost-pty: pseudo-terminal transport for ptyhost sessions.
//!
//! This crate owns the OS side of a terminal session: it spawns a child on a
//! pty, pumps its output and our input on dedicated threads, and exposes the
//! control surface (resize, line-discipline attributes, signals, scroll lock)
//! a session needs.
//!
//! # Architecture
//!
//! - [`PtyDevice`]: The device contract sessions are written against.
//! - [`PtyHandle`]: Real device backed by `portable-pty`.
//! - [`WriteQueue`]: FIFO of writes with at most one job in flight.
//! - `testing::ScriptedDevice`: Recording device, behind the `testing` feature.

pub mod device;
mod io_thread;
pub mod pty;
mod termios;
pub mod write_queue;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use device::{
    DeviceState, ExitStatus, PtyDevice, PtyEvent, PtyEvents, Signal, SpawnRequest, WindowSize,
};
pub use pty::{PtyError, PtyHandle};
pub use write_queue::{Drain, WriteQueue};
