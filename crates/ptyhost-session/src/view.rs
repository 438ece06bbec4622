//! Display consumers attached to a session.
//!
//! Views are never owned by the session. It keeps a [`Weak`] per view, so a
//! view dropped by its owner simply disappears from the set the next time
//! the session fans out output or recomputes its size.

use std::sync::{Arc, Weak};

use ptyhost_pty::WindowSize;

/// Views smaller than this in either dimension do not constrain the session.
const VIEW_MIN_LINES: u16 = 2;
const VIEW_MIN_COLUMNS: u16 = 2;

/// Identifies a view within one session.
pub type ViewId = u64;

/// Something that displays a session's output.
pub trait TerminalView: Send + Sync {
    /// Decoded output, in the order the child produced it.
    fn receive_text(&self, text: &str);

    /// Size the view can currently show.
    fn size(&self) -> WindowSize;
}

#[derive(Default)]
pub struct ViewSet {
    views: Vec<(ViewId, Weak<dyn TerminalView>)>,
    next_id: ViewId,
}

impl ViewSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `view`. Attaching the same view twice returns its existing id.
    pub fn add<V: TerminalView + 'static>(&mut self, view: &Arc<V>) -> ViewId {
        let weak: Weak<dyn TerminalView> = Arc::<V>::downgrade(view);
        if let Some((id, _)) = self.views.iter().find(|(_, w)| Weak::ptr_eq(w, &weak)) {
            return *id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.views.push((id, weak));
        id
    }

    pub fn remove(&mut self, id: ViewId) -> bool {
        let before = self.views.len();
        self.views.retain(|(view_id, _)| *view_id != id);
        self.views.len() != before
    }

    pub fn contains(&self, id: ViewId) -> bool {
        self.views.iter().any(|(view_id, _)| *view_id == id)
    }

    /// Live views, after dropping any whose owner has gone away.
    pub fn live(&mut self) -> Vec<(ViewId, Arc<dyn TerminalView>)> {
        let mut live = Vec::with_capacity(self.views.len());
        self.views.retain(|(id, weak)| match weak.upgrade() {
            Some(view) => {
                live.push((*id, view));
                true
            }
            None => {
                log::debug!("view {id} was destroyed, detaching");
                false
            }
        });
        live
    }

    /// Deliver `text` to every live view. Returns how many received it.
    pub fn broadcast(&mut self, text: &str) -> usize {
        let live = self.live();
        for (_, view) in &live {
            view.receive_text(text);
        }
        live.len()
    }

    /// The largest size every live view can show, ignoring degenerate views.
    pub fn common_size(&mut self) -> Option<WindowSize> {
        self.common_size_with(None)
    }

    /// Like [`ViewSet::common_size`], taking `changed` as the current size
    /// of that view instead of asking it.
    pub fn common_size_with(&mut self, changed: Option<(ViewId, WindowSize)>) -> Option<WindowSize> {
        self.live()
            .iter()
            .map(|(id, view)| match changed {
                Some((changed_id, size)) if changed_id == *id => size,
                _ => view.size(),
            })
            .filter(|size| size.rows >= VIEW_MIN_LINES && size.cols >= VIEW_MIN_COLUMNS)
            .reduce(|a, b| WindowSize::new(a.rows.min(b.rows), a.cols.min(b.cols)))
    }

    /// Number of attached views, including any not yet pruned.
    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// Incremental UTF-8 decoder that carries incomplete sequences across reads.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);

        let mut out = String::with_capacity(self.pending.len());
        let mut input: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    input = &[];
                    break;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            input = rest;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = input.to_vec();
        out
    }
}
