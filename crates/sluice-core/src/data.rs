//! Rope-style byte buffer.
//!
//! [`Data`] is a deque of immutable [`Bytes`] chunks plus a cached total
//! length. Appending moves chunks, splitting re-slices them, and cloning
//! only bumps chunk reference counts; no operation copies chunk bytes
//! except an explicit linearization.

use std::collections::VecDeque;

use bytes::Bytes;

/// A cheaply clonable, chunked byte buffer.
#[derive(Clone, Default)]
pub struct Data {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl Data {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer holding a copy of `slice`.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Self {
        let mut data = Self::new();
        if !slice.is_empty() {
            data.len = slice.len();
            data.chunks.push_back(Bytes::copy_from_slice(slice));
        }
        data
    }

    /// Total byte length across all chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the buffer holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `other`, taking ownership. O(chunks), never copies bytes.
    pub fn push(&mut self, other: Data) {
        self.len += other.len;
        self.chunks.extend(other.chunks);
    }

    /// Appends a single chunk without copying.
    pub fn push_chunk(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.len += chunk.len();
            self.chunks.push_back(chunk);
        }
    }

    /// Splits off and returns the first `n` bytes (or everything if the
    /// buffer is shorter). Chunk storage is shared, not copied: a chunk
    /// straddling the boundary is re-sliced in place.
    pub fn shift(&mut self, n: usize) -> Data {
        let mut out = Data::new();
        let mut remaining = n;
        while remaining > 0 {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            if chunk.len() <= remaining {
                remaining -= chunk.len();
                self.len -= chunk.len();
                out.len += chunk.len();
                out.chunks.push_back(chunk);
            } else {
                let head = chunk.split_to(remaining);
                self.len -= head.len();
                out.len += head.len();
                out.chunks.push_back(head);
                self.chunks.push_front(chunk);
                remaining = 0;
            }
        }
        out
    }

    /// Visits each chunk in order.
    pub fn iterate(&self, mut f: impl FnMut(&Bytes)) {
        for chunk in &self.chunks {
            f(chunk);
        }
    }

    /// Number of chunks currently held.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Linearizes into one contiguous `Bytes`. Zero-copy when the buffer
    /// holds at most one chunk.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.len() {
            0 => Bytes::new(),
            1 => self.chunks[0].clone(),
            _ => {
                let mut out = Vec::with_capacity(self.len);
                for chunk in &self.chunks {
                    out.extend_from_slice(chunk);
                }
                Bytes::from(out)
            }
        }
    }

    /// Copies the contents into a `Vec<u8>`.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Drops all chunks.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

impl From<Bytes> for Data {
    fn from(chunk: Bytes) -> Self {
        let mut data = Data::new();
        data.push_chunk(chunk);
        data
    }
}

impl From<&[u8]> for Data {
    fn from(slice: &[u8]) -> Self {
        Data::from_slice(slice)
    }
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Data({} bytes, {} chunks)", self.len, self.chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_slice_roundtrip() {
        let d = Data::from_slice(b"hello");
        assert_eq!(d.len(), 5);
        assert_eq!(d.to_vec(), b"hello");
    }

    #[test]
    fn test_push_moves_chunks() {
        let mut a = Data::from_slice(b"foo");
        let b = Data::from_slice(b"bar");
        a.push(b);
        assert_eq!(a.len(), 6);
        assert_eq!(a.chunk_count(), 2);
        assert_eq!(a.to_vec(), b"foobar");
    }

    #[test]
    fn test_shift_within_chunk() {
        let mut d = Data::from_slice(b"abcdef");
        let head = d.shift(2);
        assert_eq!(head.to_vec(), b"ab");
        assert_eq!(d.to_vec(), b"cdef");
        assert_eq!(d.len(), 4);
    }

    #[test]
    fn test_shift_across_chunks() {
        let mut d = Data::from_slice(b"abc");
        d.push(Data::from_slice(b"def"));
        let head = d.shift(4);
        assert_eq!(head.to_vec(), b"abcd");
        assert_eq!(d.to_vec(), b"ef");
    }

    #[test]
    fn test_shift_more_than_len() {
        let mut d = Data::from_slice(b"ab");
        let head = d.shift(10);
        assert_eq!(head.to_vec(), b"ab");
        assert!(d.is_empty());
    }

    #[test]
    fn test_clone_shares_storage() {
        let d = Data::from_slice(b"shared");
        let c = d.clone();
        // Same underlying chunk pointer.
        let mut ptrs = Vec::new();
        d.iterate(|b| ptrs.push(b.as_ptr()));
        let mut ptrs2 = Vec::new();
        c.iterate(|b| ptrs2.push(b.as_ptr()));
        assert_eq!(ptrs, ptrs2);
    }

    #[test]
    fn test_split_does_not_copy() {
        let mut d = Data::from_slice(b"abcdef");
        let base_ptr = {
            let mut p = None;
            d.iterate(|b| p = Some(b.as_ptr()));
            p.unwrap()
        };
        let head = d.shift(3);
        let mut head_ptr = None;
        head.iterate(|b| head_ptr = Some(b.as_ptr()));
        assert_eq!(head_ptr.unwrap(), base_ptr);
    }

    #[test]
    fn test_to_bytes_single_chunk_zero_copy() {
        let d = Data::from_slice(b"xyz");
        let b1 = d.to_bytes();
        let b2 = d.to_bytes();
        assert_eq!(b1.as_ptr(), b2.as_ptr());
    }

    #[test]
    fn test_empty_chunks_skipped() {
        let mut d = Data::new();
        d.push_chunk(Bytes::new());
        assert!(d.is_empty());
        assert_eq!(d.chunk_count(), 0);
    }
}
