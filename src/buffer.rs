use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Segments smaller than this are split by copy: below that size the
/// bookkeeping of a shared view costs more than the memcpy it avoids.
pub const DEFAULT_MIN_VIEW_SIZE: usize = 4096;

/// Outbound buffer optimized for draining by max-sized chunks.
///
/// Built on a deque of [`Bytes`] segments so that appends, prepends and
/// whole-buffer merges move references instead of copying payloads.
/// Large segments are split with zero-copy views; only segments below
/// `min_view_size` get copied when a split is unavoidable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBuffer {
    deque: VecDeque<Bytes>,
    total_length: usize,
    min_view_size: usize,
}

impl WriteBuffer {
    pub fn new() -> WriteBuffer {
        WriteBuffer::with_min_view_size(DEFAULT_MIN_VIEW_SIZE)
    }

    pub fn with_min_view_size(min_view_size: usize) -> WriteBuffer {
        WriteBuffer {
            deque: VecDeque::new(),
            total_length: 0,
            min_view_size,
        }
    }

    pub fn len(&self) -> usize {
        self.total_length
    }

    pub fn is_empty(&self) -> bool {
        self.total_length == 0
    }

    pub fn clear(&mut self) {
        self.deque.clear();
        self.total_length = 0;
    }

    /// Appends a segment at the end of the buffer. Zero-length segments
    /// are dropped so the deque never carries empty entries.
    pub fn append(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.total_length += data.len();
        self.deque.push_back(data);
    }

    /// Moves every segment of `other` to the end of this buffer.
    pub fn append_buffer(&mut self, mut other: WriteBuffer) {
        self.total_length += other.total_length;
        self.deque.append(&mut other.deque);
        other.total_length = 0;
    }

    /// Puts a segment back at the front (unsent remainder of a chunk).
    pub fn prepend(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.total_length += data.len();
        self.deque.push_front(data);
    }

    /// Serializes the whole buffer into one contiguous byte string.
    pub fn to_bytes(&self) -> Bytes {
        match self.deque.len() {
            0 => Bytes::new(),
            // single segment, no copy
            1 => self.deque[0].clone(),
            _ => {
                let mut out = BytesMut::with_capacity(self.total_length);
                for segment in &self.deque {
                    out.extend_from_slice(segment);
                }
                out.freeze()
            }
        }
    }

    fn split_segment(&self, segment: Bytes, at: usize) -> (Bytes, Bytes) {
        if segment.len() >= self.min_view_size {
            // big segment: both halves are views on the same allocation
            let mut rest = segment;
            let head = rest.split_to(at);
            (head, rest)
        } else {
            let head = Bytes::copy_from_slice(&segment[..at]);
            let rest = Bytes::copy_from_slice(&segment[at..]);
            (head, rest)
        }
    }

    /// Pops a chunk of at most `chunk_max_size` bytes off the front.
    ///
    /// Whole segments are returned without copy whenever they line up
    /// with the requested size; a segment crossing the boundary is split,
    /// with its remainder prepended back.
    pub fn pop_chunk(&mut self, chunk_max_size: usize) -> Bytes {
        if self.total_length < chunk_max_size {
            // fastpath: the whole buffer fits in a single chunk
            let res = self.to_bytes();
            self.clear();
            return res;
        }
        let mut acc: Option<BytesMut> = None;
        while let Some(data) = self.deque.pop_front() {
            let data_length = data.len();
            self.total_length -= data_length;
            match acc {
                None => {
                    if data_length == chunk_max_size {
                        return data;
                    } else if data_length > chunk_max_size {
                        let (head, rest) = self.split_segment(data, chunk_max_size);
                        self.prepend(rest);
                        return head;
                    }
                    let mut chunk = BytesMut::with_capacity(chunk_max_size);
                    chunk.extend_from_slice(&data);
                    acc = Some(chunk);
                }
                Some(ref mut chunk) => {
                    if chunk.len() + data_length > chunk_max_size {
                        let take = chunk_max_size - chunk.len();
                        let (head, rest) = self.split_segment(data, take);
                        self.prepend(rest);
                        chunk.extend_from_slice(&head);
                    } else {
                        chunk.extend_from_slice(&data);
                    }
                    if chunk.len() >= chunk_max_size {
                        break;
                    }
                }
            }
        }
        acc.map(BytesMut::freeze).unwrap_or_else(Bytes::new)
    }
}
