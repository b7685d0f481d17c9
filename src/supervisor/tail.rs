use std::collections::VecDeque;

/// Byte budget for retained gateway stderr.
pub const TAIL_CAPACITY_BYTES: usize = 64 * 1024;

/// Ring buffer holding the most recent bytes of a stream. When full, the
/// oldest bytes are evicted first.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl Default for TailBuffer {
    fn default() -> Self {
        Self::with_capacity(TAIL_CAPACITY_BYTES)
    }
}

impl TailBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(TAIL_CAPACITY_BYTES)),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let chunk = if chunk.len() > self.capacity {
            &chunk[chunk.len() - self.capacity..]
        } else {
            chunk
        };
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
        self.bytes.drain(..overflow);
        self.bytes.extend(chunk.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Contents as text; a multi-byte character cut by eviction becomes U+FFFD.
    pub fn snapshot(&self) -> String {
        let (front, back) = self.bytes.as_slices();
        let mut joined = Vec::with_capacity(self.bytes.len());
        joined.extend_from_slice(front);
        joined.extend_from_slice(back);
        String::from_utf8_lossy(&joined).into_owned()
    }
}
