use ptyhost_pty::WindowSize;

/// The terminal emulation a session feeds.
///
/// The emulation turns child output into screen state. It talks back to the
/// session through [`crate::Session::send_data`] (encoded keystrokes and
/// replies) and [`crate::Session::on_emulation_size_changed`] (size changes
/// the program asked for).
pub trait Emulation {
    /// Raw bytes from the child, in order.
    fn receive_data(&mut self, data: &[u8]);

    /// The session's size changed for a reason other than the emulation.
    fn set_image_size(&mut self, size: WindowSize);

    fn image_size(&self) -> WindowSize;
}

/// An emulation that discards output, for headless sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmulation {
    size: WindowSize,
}

impl Emulation for NullEmulation {
    fn receive_data(&mut self, _data: &[u8]) {}

    fn set_image_size(&mut self, size: WindowSize) {
        self.size = size;
    }

    fn image_size(&self) -> WindowSize {
        self.size
    }
}
