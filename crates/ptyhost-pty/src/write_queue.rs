//! Ordered, at-most-one-in-flight buffer of writes to a [`PtyDevice`].
//!
//! Producers can enqueue faster than the pty drains; the queue hands the
//! device one job at a time and only drops a job once the device has
//! acknowledged it with [`crate::PtyEvent::WriteReady`]. A job the device
//! reports as [`crate::PtyEvent::WriteFailed`] stays at the head.

use std::collections::VecDeque;

use crate::device::PtyDevice;

/// Outcome of an attempt to move the queue forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// The head job was handed to the device.
    Submitted,
    /// A job is already in flight; nothing was submitted.
    InFlight,
    /// There is nothing left to write.
    Empty,
    /// The device refused the head job. It stays queued until `resume`.
    Stalled,
    /// The queue no longer starts jobs.
    Closed,
}

#[derive(Debug, Default)]
pub struct WriteQueue {
    jobs: VecDeque<Vec<u8>>,
    buffer_full: bool,
    closed: bool,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job and, if nothing is in flight, submit the head.
    pub fn enqueue<D: PtyDevice + ?Sized>(&mut self, device: &mut D, data: &[u8]) -> Drain {
        if self.closed {
            log::debug!("dropping {} byte write: queue closed", data.len());
            return Drain::Closed;
        }
        self.jobs.push_back(data.to_vec());
        if self.buffer_full {
            Drain::InFlight
        } else {
            self.drain(device)
        }
    }

    /// The device finished the in-flight job: drop it and submit the next.
    ///
    /// Returns [`Drain::Empty`] when the queue has just become empty, which
    /// is the caller's cue that bulk writes may continue.
    pub fn write_ready<D: PtyDevice + ?Sized>(&mut self, device: &mut D) -> Drain {
        if !self.buffer_full {
            log::warn!("write completion without a job in flight");
            return if self.jobs.is_empty() {
                Drain::Empty
            } else {
                Drain::Stalled
            };
        }
        self.jobs.pop_front();
        self.buffer_full = false;
        self.drain(device)
    }

    /// The device could not deliver the in-flight job. It stays at the head
    /// and the queue stalls until [`WriteQueue::resume`].
    pub fn write_failed(&mut self) -> Drain {
        if !self.buffer_full {
            log::warn!("write failure without a job in flight");
        }
        self.buffer_full = false;
        if self.jobs.is_empty() {
            Drain::Empty
        } else {
            log::warn!("could not send input data to terminal process");
            Drain::Stalled
        }
    }

    /// Retry a stalled head job. There is no automatic retry; callers invoke
    /// this when the terminal is resumed after a lock.
    pub fn resume<D: PtyDevice + ?Sized>(&mut self, device: &mut D) -> Drain {
        if self.buffer_full {
            Drain::InFlight
        } else {
            self.drain(device)
        }
    }

    /// Stop starting new jobs. An in-flight job is not cancelled.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a job has been submitted and not yet acknowledged.
    pub fn is_buffer_full(&self) -> bool {
        self.buffer_full
    }

    /// Number of jobs not yet acknowledged, including the one in flight.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn drain<D: PtyDevice + ?Sized>(&mut self, device: &mut D) -> Drain {
        if self.closed {
            return Drain::Closed;
        }
        let Some(job) = self.jobs.front() else {
            return Drain::Empty;
        };
        match device.write(job) {
            Ok(()) => {
                self.buffer_full = true;
                Drain::Submitted
            }
            Err(e) => {
                log::warn!("could not send input data to terminal process: {e}");
                Drain::Stalled
            }
        }
    }
}
