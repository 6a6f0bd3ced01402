//! Bounded per-session transcript.
//!
//! The transcript is the data interface handed to a terminal widget: raw
//! output bytes, oldest first. Memory is bounded at `capacity` bytes no
//! matter how chatty the remote shell is; the oldest bytes are evicted.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;

/// Default scrollback per session: 1 MiB.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 1024 * 1024;

/// Fixed-capacity byte ring holding a session's output.
#[derive(Debug, Clone)]
pub struct Transcript {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Total bytes ever appended, including evicted ones.
    written: u64,
}

impl Transcript {
    /// Create a transcript holding at most `capacity` bytes (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity.min(65_536)),
            capacity,
            written: 0,
        }
    }

    /// Append output, evicting the oldest bytes if needed.
    ///
    /// A single chunk larger than the capacity keeps only its tail.
    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.written += data.len() as u64;

        if data.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
            return;
        }

        let needed = self.buf.len() + data.len();
        if needed > self.capacity {
            self.buf.drain(..needed - self.capacity);
        }
        self.buf.extend(data);
    }

    /// Contiguous copy of the buffered bytes (oldest first).
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let (a, b) = self.buf.as_slices();
        let mut v = Vec::with_capacity(a.len() + b.len());
        v.extend_from_slice(a);
        v.extend_from_slice(b);
        v
    }

    /// Buffered bytes as text, replacing invalid UTF-8.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_vec()).into_owned()
    }

    /// Current number of buffered bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total bytes appended over the session's lifetime.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Configured capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_BYTES)
    }
}
