/// Turns a byte stream into text lines.
///
/// A line ends at the first `\n` or `\r`. A `\n` directly after a `\r`
/// terminator belongs to that terminator, even when it shows up in a later
/// read, so `\r\n` never leaks into the next line or into a raw payload.
/// Lines are decoded lossily and trimmed; empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
    skip_lf: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every line completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.extend(bytes);
        std::iter::from_fn(|| self.next_line()).collect()
    }

    /// Appends `bytes` without extracting lines.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and returns the next complete, non-empty line.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            self.drop_pending_lf();
            let pos = self.buf.iter().position(|&b| b == b'\n' || b == b'\r')?;
            self.skip_lf = self.buf[pos] == b'\r';

            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..pos]);
            let text = text.trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }

    /// Removes exactly `len` bytes if that many are buffered.
    pub fn take_raw(&mut self, len: usize) -> Option<Vec<u8>> {
        self.drop_pending_lf();
        if self.buf.len() < len {
            return None;
        }
        Some(self.buf.drain(..len).collect())
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discards everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.skip_lf = false;
    }

    fn drop_pending_lf(&mut self) {
        if !self.skip_lf || self.buf.is_empty() {
            return;
        }
        if self.buf[0] == b'\n' {
            self.buf.remove(0);
        }
        self.skip_lf = false;
    }
}
