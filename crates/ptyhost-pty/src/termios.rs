//! Line-discipline attribute helpers for the pty master.
//!
//! On the platforms we support, attribute changes made through the master
//! descriptor apply to the slave side the child sees.

use std::os::fd::{BorrowedFd, RawFd};

use nix::sys::termios::{self, InputFlags, SetArg, SpecialCharacterIndices, Termios};

use crate::pty::PtyError;

/// Read, modify and write back the terminal attributes of `fd`.
fn modify(fd: RawFd, edit: impl FnOnce(&mut Termios)) -> Result<(), PtyError> {
    // SAFETY: callers pass the master descriptor of a pty they own, which
    // stays open for the duration of this call.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };

    let mut tios = termios::tcgetattr(fd)
        .map_err(|e| PtyError::Attribute(format!("unable to get terminal attributes: {e}")))?;
    edit(&mut tios);
    termios::tcsetattr(fd, SetArg::TCSANOW, &tios)
        .map_err(|e| PtyError::Attribute(format!("unable to set terminal attributes: {e}")))
}

pub fn set_flow_control(fd: RawFd, enabled: bool) -> Result<(), PtyError> {
    modify(fd, |tios| {
        tios.input_flags
            .set(InputFlags::IXON | InputFlags::IXOFF, enabled);
    })
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
))]
pub fn set_utf8_mode(fd: RawFd, enabled: bool) -> Result<(), PtyError> {
    modify(fd, |tios| {
        tios.input_flags.set(InputFlags::IUTF8, enabled);
    })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
pub fn set_utf8_mode(_fd: RawFd, _enabled: bool) -> Result<(), PtyError> {
    Err(PtyError::Attribute(
        "IUTF8 is not supported on this platform".to_string(),
    ))
}

pub fn set_erase_char(fd: RawFd, erase: u8) -> Result<(), PtyError> {
    modify(fd, |tios| {
        tios.control_chars[SpecialCharacterIndices::VERASE as usize] = erase;
    })
}

/// Current XON/XOFF state.
#[cfg(test)]
pub(crate) fn flow_control(fd: RawFd) -> Result<bool, PtyError> {
    // SAFETY: see `modify`.
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let tios = termios::tcgetattr(fd)
        .map_err(|e| PtyError::Attribute(format!("unable to get terminal attributes: {e}")))?;
    Ok(tios.input_flags.contains(InputFlags::IXON))
}
