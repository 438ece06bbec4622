//! Per-device I/O threads.
//!
//! PTY reads and writes are blocking, so each running device gets a reader
//! thread, a writer thread and a thread waiting on the child. None of them
//! touches session state: they only push [`PtyEvent`]s into the device's
//! channel, which keeps output ordering identical to what the OS delivered.

use std::io::{self, Read, Write};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use portable_pty::Child;
use tokio::sync::mpsc;

use crate::device::{ExitStatus, PtyEvent};
use crate::pty::PtyError;

#[derive(Default)]
struct GateState {
    locked: bool,
    released: bool,
}

/// Holds output back from the session while it is locked (scroll lock).
///
/// The reader thread keeps a chunk it has already read until the gate opens.
/// Once the child has exited the gate is released for good, so the remaining
/// output drains to EOF and the exit can be reported.
#[derive(Default)]
pub(crate) struct ReadGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl ReadGate {
    pub(crate) fn set_locked(&self, locked: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.locked = locked;
        self.cond.notify_all();
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .locked
    }

    /// Open the gate permanently, whatever the lock says.
    pub(crate) fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.released = true;
        self.cond.notify_all();
    }

    fn wait_unlocked(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.locked && !state.released {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Exit status written by the reader thread before it reports `Exited`.
pub(crate) type ExitSlot = Arc<Mutex<Option<ExitStatus>>>;

/// Start the read loop for a device on a dedicated OS thread.
///
/// A second thread owns the child and waits for it independently of the
/// gate; when it exits the gate is released. The reader drains the master
/// until EOF (or EIO, which is how Linux reports a closed slave), then
/// records the status and sends [`PtyEvent::Exited`] as the final event.
pub(crate) fn start_reader_thread(
    name: String,
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
    gate: Arc<ReadGate>,
    exit_slot: ExitSlot,
    events: mpsc::UnboundedSender<PtyEvent>,
) -> Result<(), PtyError> {
    let waiter = {
        let gate = Arc::clone(&gate);
        std::thread::Builder::new()
            .name(format!("{name}-wait"))
            .spawn(move || {
                let status = reap(child);
                gate.release();
                status
            })
            .map_err(|e| PtyError::Spawn(format!("failed to spawn child waiter thread: {e}")))?
    };

    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            read_loop(reader, &gate, &events);
            let status = waiter.join().unwrap_or_else(|_| {
                log::warn!("child waiter thread panicked");
                ExitStatus::with_code(1)
            });
            *exit_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(status.clone());
            let _ = events.send(PtyEvent::Exited(status));
        })
        .map(|_| ())
        .map_err(|e| PtyError::Spawn(format!("failed to spawn reader thread: {e}")))
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    gate: &ReadGate,
    events: &mpsc::UnboundedSender<PtyEvent>,
) {
    let mut buf = [0u8; 65536];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("pty read ended: {e}");
                return;
            }
        };

        // A read may have been in progress when the lock was set.
        gate.wait_unlocked();

        if events.send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
            // Nobody is listening any more; the waiter still reaps the child.
            return;
        }
    }
}

fn reap(mut child: Box<dyn Child + Send + Sync>) -> ExitStatus {
    match child.wait() {
        Ok(status) => ExitStatus::from(status),
        Err(e) => {
            log::warn!("failed to reap pty child: {e}");
            ExitStatus::with_code(1)
        }
    }
}

/// Start the write loop for a device and return the job submission channel.
///
/// Each job is written in full and acknowledged with
/// [`PtyEvent::WriteReady`]. A failed write is reported with
/// [`PtyEvent::WriteFailed`] instead, and the job is not retried here.
pub(crate) fn start_writer_thread(
    name: String,
    mut writer: Box<dyn Write + Send>,
    events: mpsc::UnboundedSender<PtyEvent>,
) -> Result<std_mpsc::Sender<Vec<u8>>, PtyError> {
    let (job_tx, job_rx) = std_mpsc::channel::<Vec<u8>>();

    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            while let Ok(job) = job_rx.recv() {
                let event = match writer.write_all(&job).and_then(|()| writer.flush()) {
                    Ok(()) => PtyEvent::WriteReady,
                    Err(e) => {
                        log::warn!("could not send input data to terminal process: {e}");
                        PtyEvent::WriteFailed
                    }
                };
                if events.send(event).is_err() {
                    return;
                }
            }
        })
        .map_err(|e| PtyError::Spawn(format!("failed to spawn writer thread: {e}")))?;

    Ok(job_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_gate_blocks_until_unlocked() {
        let gate = Arc::new(ReadGate::default());
        gate.set_locked(true);
        assert!(gate.is_locked());

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_unlocked())
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        gate.set_locked(false);
        waiter.join().unwrap();
        assert!(!gate.is_locked());
    }

    #[test]
    fn test_writer_thread_acknowledges_each_job() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Box<dyn Write + Send> = Box::new(Vec::new());
        let jobs = start_writer_thread("test-writer".to_string(), sink, tx).unwrap();

        jobs.send(b"one".to_vec()).unwrap();
        jobs.send(b"two".to_vec()).unwrap();

        assert_eq!(rx.blocking_recv(), Some(PtyEvent::WriteReady));
        assert_eq!(rx.blocking_recv(), Some(PtyEvent::WriteReady));
    }

    #[test]
    fn test_release_opens_a_locked_gate() {
        let gate = Arc::new(ReadGate::default());
        gate.set_locked(true);

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_unlocked())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        gate.release();
        waiter.join().unwrap();
        // The lock itself is untouched; the gate just stops honouring it.
        assert!(gate.is_locked());
    }

    /// Sink that rejects the first `failures` writes.
    struct FlakySink {
        failures: usize,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "pty buffer full"));
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_thread_reports_failed_job() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink: Box<dyn Write + Send> = Box::new(FlakySink {
            failures: 1,
            written: Arc::clone(&written),
        });
        let jobs = start_writer_thread("test-writer".to_string(), sink, tx).unwrap();

        jobs.send(b"lost".to_vec()).unwrap();
        assert_eq!(rx.blocking_recv(), Some(PtyEvent::WriteFailed));

        // The thread keeps serving jobs after a failure.
        jobs.send(b"again".to_vec()).unwrap();
        assert_eq!(rx.blocking_recv(), Some(PtyEvent::WriteReady));
        assert_eq!(written.lock().unwrap().as_slice(), b"again");
    }
}
