// src/io/tcp/write_queue.rs
//
// FIFO of pending outbound buffers. Each `write` call becomes one node; the
// head node is flushed on write readiness and a short write leaves the
// unwritten tail at the front.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    nodes: VecDeque<Vec<u8>>,
    /// Bytes of the head node already written
    head_offset: usize,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        self.nodes.push_back(data.to_vec());
    }

    /// Unwritten bytes of the head node
    pub(crate) fn front(&self) -> Option<&[u8]> {
        self.nodes.front().map(|node| &node[self.head_offset..])
    }

    /// Mark `n` bytes of the head node as written, popping it once complete.
    pub(crate) fn consume_front(&mut self, n: usize) {
        let Some(node) = self.nodes.front() else {
            return;
        };
        self.head_offset += n;
        if self.head_offset >= node.len() {
            self.nodes.pop_front();
            self.head_offset = 0;
        }
    }

    /// Drop every queued node, returning how many bytes were discarded.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.pending_bytes();
        self.nodes.clear();
        self.head_offset = 0;
        dropped
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.nodes.iter().map(Vec::len).sum::<usize>() - self.head_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = WriteQueue::new();
        queue.push(b"first");
        queue.push(b"second");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.front(), Some(&b"first"[..]));
        queue.consume_front(5);
        assert_eq!(queue.front(), Some(&b"second"[..]));
        queue.consume_front(6);
        assert!(queue.is_empty());
        assert_eq!(queue.front(), None);
    }

    #[test]
    fn test_short_write_keeps_remainder_at_head() {
        let mut queue = WriteQueue::new();
        queue.push(b"abcdef");
        queue.push(b"gh");

        queue.consume_front(4);
        assert_eq!(queue.front(), Some(&b"ef"[..]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending_bytes(), 4);

        queue.consume_front(2);
        assert_eq!(queue.front(), Some(&b"gh"[..]));
    }

    #[test]
    fn test_clear_reports_dropped_bytes() {
        let mut queue = WriteQueue::new();
        queue.push(b"12345");
        queue.push(b"678");
        queue.consume_front(2);

        assert_eq!(queue.clear(), 6);
        assert!(queue.is_empty());
        assert_eq!(queue.pending_bytes(), 0);
    }

    #[test]
    fn test_consume_on_empty_queue_is_noop() {
        let mut queue = WriteQueue::new();
        queue.consume_front(3);
        assert!(queue.is_empty());
    }
}
