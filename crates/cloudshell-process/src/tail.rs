use std::collections::VecDeque;

/// Last `limit` bytes of the emulator's console, kept for exit diagnostics.
#[derive(Debug)]
pub struct OutputTail {
    bytes: VecDeque<u8>,
    limit: usize,
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(limit),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let keep = &chunk[chunk.len().saturating_sub(self.limit)..];
        let overflow = (self.bytes.len() + keep.len()).saturating_sub(self.limit);
        self.bytes.drain(..overflow);
        self.bytes.extend(keep);
    }

    /// Lossy UTF-8 rendering, suitable for a log field.
    pub fn render(&self) -> String {
        let (head, tail) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(self.bytes.len());
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        String::from_utf8_lossy(&out).into_owned()
    }
}
