// src/io/framer.rs
//
// Stream framer shared by the serial and TCP backends.
//
// Bytes are read straight into the spare tail of a fixed-capacity buffer.
// Chunk mode (no marker) hands every read back verbatim and keeps nothing.
// Line mode splits on every marker occurrence, drops the marker, and keeps
// the unterminated tail buffered for the next read.

// =============================================================================
// Types
// =============================================================================

/// How reads are turned into messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// Each read is one message
    Chunk,
    /// Messages are separated by the end-of-message marker
    Line,
}

/// Fixed-capacity read buffer plus optional end-of-message marker
pub struct StreamFramer {
    buffer: Box<[u8]>,
    /// Valid prefix of `buffer`
    len: usize,
    marker: Option<Vec<u8>>,
    /// Bytes dropped because a line outgrew the buffer
    overflowed: u64,
}

impl StreamFramer {
    /// An empty marker is treated as no marker.
    pub fn new(capacity: usize, marker: Option<&[u8]>) -> Self {
        StreamFramer {
            buffer: vec![0u8; capacity.max(1)].into_boxed_slice(),
            len: 0,
            marker: marker.filter(|m| !m.is_empty()).map(|m| m.to_vec()),
            overflowed: 0,
        }
    }

    pub fn mode(&self) -> FramingMode {
        if self.marker.is_some() {
            FramingMode::Line
        } else {
            FramingMode::Chunk
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes held over from previous reads
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    /// Free space to read into. Never empty: a full buffer that holds no
    /// marker is discarded first, so a zero-length read always means the
    /// peer closed.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.len == self.buffer.len() {
            tlog!(
                "[framer] {} buffered bytes without an end-of-message marker, discarding",
                self.len
            );
            self.overflowed += self.len as u64;
            self.len = 0;
        }
        &mut self.buffer[self.len..]
    }

    /// Account for `n` bytes just read into `spare_mut()` and return the
    /// complete messages they produced, in arrival order.
    pub fn commit(&mut self, n: usize) -> Vec<Vec<u8>> {
        let start = self.len;
        self.len = (self.len + n).min(self.buffer.len());

        let Some(marker) = self.marker.as_deref() else {
            let chunk = self.buffer[start..self.len].to_vec();
            self.len = 0;
            return vec![chunk];
        };

        let mut messages = Vec::new();
        while let Some(pos) = find_marker(&self.buffer[..self.len], marker) {
            messages.push(self.buffer[..pos].to_vec());

            // Shift the unconsumed tail to the front
            let consumed = pos + marker.len();
            self.buffer.copy_within(consumed..self.len, 0);
            self.len -= consumed;
        }
        messages
    }

    /// Drop everything buffered (no reader attached)
    pub fn discard(&mut self) {
        self.len = 0;
    }
}

/// Offset of the first occurrence of `marker` in `haystack`
fn find_marker(haystack: &[u8], marker: &[u8]) -> Option<usize> {
    if marker.is_empty() || haystack.len() < marker.len() {
        return None;
    }
    haystack.windows(marker.len()).position(|w| w == marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Simulate one readiness event delivering `data`
    fn read_event(framer: &mut StreamFramer, data: &[u8]) -> Vec<Vec<u8>> {
        let spare = framer.spare_mut();
        let n = data.len().min(spare.len());
        spare[..n].copy_from_slice(&data[..n]);
        framer.commit(n)
    }

    #[test]
    fn test_line_mode_carries_partial_line() {
        let mut framer = StreamFramer::new(4096, Some(b"\n"));

        assert_eq!(read_event(&mut framer, b"AB\nCD"), vec![b"AB".to_vec()]);
        assert_eq!(framer.buffered(), b"CD");

        assert_eq!(read_event(&mut framer, b"EF\n"), vec![b"CDEF".to_vec()]);
        assert!(framer.buffered().is_empty());
    }

    #[test]
    fn test_chunk_mode_has_no_carry_over() {
        let mut framer = StreamFramer::new(4096, None);
        assert_eq!(framer.mode(), FramingMode::Chunk);

        assert_eq!(read_event(&mut framer, b"XY"), vec![b"XY".to_vec()]);
        assert_eq!(read_event(&mut framer, b"Z"), vec![b"Z".to_vec()]);
        assert!(framer.buffered().is_empty());
    }

    #[test]
    fn test_empty_marker_means_chunk_mode() {
        let framer = StreamFramer::new(16, Some(b""));
        assert_eq!(framer.mode(), FramingMode::Chunk);
    }

    #[test]
    fn test_multiple_lines_in_one_read() {
        let mut framer = StreamFramer::new(64, Some(b"\n"));
        let msgs = read_event(&mut framer, b"one\ntwo\n\nthree");
        assert_eq!(msgs, vec![b"one".to_vec(), b"two".to_vec(), b"".to_vec()]);
        assert_eq!(framer.buffered(), b"three");
    }

    #[test]
    fn test_multi_byte_marker_split_across_reads() {
        let mut framer = StreamFramer::new(64, Some(b"\r\n"));
        assert!(read_event(&mut framer, b"OK\r").is_empty());
        assert_eq!(read_event(&mut framer, b"\nREADY\r\n"), vec![
            b"OK".to_vec(),
            b"READY".to_vec()
        ]);
        assert!(framer.buffered().is_empty());
    }

    #[test]
    fn test_line_mode_preserves_all_bytes_except_markers() {
        let stream: &[u8] = b"alpha\nbeta\n\ngamma delta\nepsilon\nzeta";
        for chunk_size in 1..=stream.len() {
            let mut framer = StreamFramer::new(4096, Some(b"\n"));
            let mut delivered = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                for msg in read_event(&mut framer, chunk) {
                    delivered.extend_from_slice(&msg);
                }
                // No complete line is ever left behind
                assert!(find_marker(framer.buffered(), b"\n").is_none());
                assert!(framer.buffered().len() <= framer.capacity());
            }
            delivered.extend_from_slice(framer.buffered());

            let expected: Vec<u8> = stream.iter().copied().filter(|&b| b != b'\n').collect();
            assert_eq!(delivered, expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_overflow_discards_unterminated_line() {
        let mut framer = StreamFramer::new(4, Some(b"\n"));
        assert!(read_event(&mut framer, b"ABCD").is_empty());
        assert_eq!(framer.buffered().len(), 4);

        // Buffer full: next read starts over instead of reading zero bytes
        assert_eq!(read_event(&mut framer, b"E\n"), vec![b"E".to_vec()]);
        assert_eq!(framer.overflowed(), 4);
    }

    #[test]
    fn test_discard_clears_buffer() {
        let mut framer = StreamFramer::new(16, Some(b"\n"));
        read_event(&mut framer, b"partial");
        framer.discard();
        assert!(framer.buffered().is_empty());
    }
}
