use cloudshell_core::env::env_string_or;

pub const DEFAULT_BOOT_MARKER: &str = "login";

/// Marker configured via `CLOUDSHELL_BOOT_MARKER`, else [`DEFAULT_BOOT_MARKER`].
pub fn boot_marker() -> String {
    env_string_or("CLOUDSHELL_BOOT_MARKER", DEFAULT_BOOT_MARKER)
}

/// Streaming substring detector for the boot log.
///
/// Only the last `marker.len() - 1` bytes are carried between chunks, so
/// memory stays bounded no matter how much the emulator prints. Reports a
/// match once and then ignores all further input.
#[derive(Debug)]
pub struct ReadinessScanner {
    marker: Vec<u8>,
    carry: Vec<u8>,
    fired: bool,
}

impl ReadinessScanner {
    pub fn new(marker: impl Into<String>) -> Self {
        let marker = marker.into().into_bytes();
        Self {
            carry: Vec::with_capacity(marker.len()),
            marker,
            fired: false,
        }
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    /// Returns `true` exactly once: for the chunk that completes the first marker occurrence.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.fired || chunk.is_empty() {
            return false;
        }

        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(chunk);
        let found = self.marker.is_empty()
            || window
                .windows(self.marker.len())
                .any(|w| w == self.marker.as_slice());

        if found {
            self.fired = true;
        } else {
            let keep = self.marker.len() - 1;
            window.drain(..window.len().saturating_sub(keep));
            self.carry = window;
        }
        found
    }
}
