//! Bounded replay buffer with `tokio::sync::Notify` for subscriber wakeup.
//!
//! [`ReplayBuffer`] keeps a contiguous suffix of the bytes a session's pty has
//! emitted, stored as a deque of chunks with a byte-size cap. Positions are
//! absolute offsets from session start, so readers keep a cursor and ask for
//! "everything since offset N" — reconnecting clients replay the whole buffer
//! (cursor 0) and then keep streaming with no duplication and no gap. When
//! the cap is exceeded the oldest bytes are evicted exactly; a reader whose
//! cursor has fallen behind the head learns how many bytes it lost.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Notify;

/// Byte-bounded ordered log of recent pty output.
pub struct ReplayBuffer {
    blocks: VecDeque<Vec<u8>>,
    /// Absolute offset of the first buffered byte.
    head: u64,
    /// Absolute offset one past the last buffered byte.
    end: u64,
    capacity: usize,
    notify: Arc<Notify>,
}

impl ReplayBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::new(),
            head: 0,
            end: 0,
            capacity,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append a chunk, evicting from the head byte-exactly if the cap is
    /// exceeded, and wake all waiters.
    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.end += chunk.len() as u64;
        self.blocks.push_back(chunk);

        while self.len() > self.capacity {
            let overflow = self.len() - self.capacity;
            let Some(front) = self.blocks.front_mut() else {
                break;
            };
            if front.len() <= overflow {
                self.head += front.len() as u64;
                self.blocks.pop_front();
            } else {
                front.drain(..overflow);
                self.head += overflow as u64;
            }
        }

        self.notify.notify_waiters();
    }

    /// Buffered byte count.
    pub fn len(&self) -> usize {
        (self.end - self.head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.head
    }

    /// Absolute offset of the oldest buffered byte.
    pub fn head_offset(&self) -> u64 {
        self.head
    }

    /// Absolute offset one past the newest buffered byte.
    pub fn end_offset(&self) -> u64 {
        self.end
    }

    /// Are there bytes beyond `from`?
    pub fn has_since(&self, from: u64) -> bool {
        self.end > from
    }

    /// All buffered bytes at or after absolute offset `from`.
    ///
    /// Returns `(bytes, next, dropped)`: `next` is the cursor for the
    /// follow-up call, `dropped` counts bytes between `from` and the current
    /// head that were evicted before the reader got to them.
    pub fn read_since(&self, from: u64) -> (Vec<u8>, u64, u64) {
        let start = from.max(self.head);
        let dropped = start - from;
        if start >= self.end {
            return (Vec::new(), self.end, dropped);
        }

        let mut out = Vec::with_capacity((self.end - start) as usize);
        let mut offset = self.head;
        for block in &self.blocks {
            let block_end = offset + block.len() as u64;
            if block_end > start {
                let skip = (start.saturating_sub(offset)) as usize;
                out.extend_from_slice(&block[skip..]);
            }
            offset = block_end;
        }
        (out, self.end, dropped)
    }

    /// The full current contents — what a reconnecting client replays.
    pub fn snapshot(&self) -> Vec<u8> {
        self.read_since(self.head).0
    }

    /// Handle for waiting on new output.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_push_preserves_order() {
        let mut buf = ReplayBuffer::new(1024);
        buf.push(b"abc".to_vec());
        buf.push(b"def".to_vec());
        assert_eq!(buf.snapshot(), b"abcdef");
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_eviction_is_byte_exact() {
        let mut buf = ReplayBuffer::new(8);
        buf.push(b"12345678".to_vec());
        assert_eq!(buf.len(), 8);
        // One more byte loses exactly the oldest byte
        buf.push(b"9".to_vec());
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.snapshot(), b"23456789");
        assert_eq!(buf.head_offset(), 1);
    }

    #[test]
    fn test_eviction_across_blocks() {
        let mut buf = ReplayBuffer::new(5);
        buf.push(b"abc".to_vec());
        buf.push(b"def".to_vec());
        // 6 bytes in a 5-byte buffer: 'a' is gone, 'b' survives mid-block
        assert_eq!(buf.snapshot(), b"bcdef");
        buf.push(b"ghij".to_vec());
        assert_eq!(buf.snapshot(), b"fghij");
    }

    #[test]
    fn test_oversized_chunk_keeps_suffix() {
        let mut buf = ReplayBuffer::new(4);
        buf.push(b"0123456789".to_vec());
        assert_eq!(buf.snapshot(), b"6789");
        assert_eq!(buf.head_offset(), 6);
    }

    #[test]
    fn test_read_since_cursor() {
        let mut buf = ReplayBuffer::new(1024);
        buf.push(b"hello ".to_vec());
        let (bytes, next, dropped) = buf.read_since(0);
        assert_eq!(bytes, b"hello ");
        assert_eq!(dropped, 0);

        buf.push(b"world".to_vec());
        let (bytes, next2, dropped) = buf.read_since(next);
        assert_eq!(bytes, b"world");
        assert_eq!(dropped, 0);
        assert_eq!(next2, 11);

        // Nothing new: empty read, cursor unchanged
        let (bytes, next3, _) = buf.read_since(next2);
        assert!(bytes.is_empty());
        assert_eq!(next3, next2);
    }

    #[test]
    fn test_read_since_reports_lost_prefix() {
        let mut buf = ReplayBuffer::new(4);
        buf.push(b"abcdefgh".to_vec());
        // A reader that was at offset 0 lost the first four bytes
        let (bytes, _, dropped) = buf.read_since(0);
        assert_eq!(bytes, b"efgh");
        assert_eq!(dropped, 4);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let mut buf = ReplayBuffer::new(16);
        buf.push(b"one ".to_vec());
        buf.push(b"two ".to_vec());
        assert_eq!(buf.snapshot(), buf.snapshot());
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut buf = ReplayBuffer::new(16);
        buf.push(Vec::new());
        assert!(buf.is_empty());
        assert_eq!(buf.end_offset(), 0);
    }

    #[tokio::test]
    async fn test_push_wakes_waiters() {
        let mut buf = ReplayBuffer::new(16);
        let notify = buf.notifier();
        let mut notified = std::pin::pin!(notify.notified());
        notified.as_mut().enable();

        buf.push(b"x".to_vec());
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("waiter should wake on push");
    }
}
